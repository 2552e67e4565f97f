//! Configuration file parser for ~/.config/ratewatch/config.toml.
//!
//! The config file is optional: a missing or blank file yields
//! `Config::default()`. Unknown keys are accepted but logged as warnings so
//! typos do not go unnoticed.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::{MissingDate, ParseOptions};
use crate::util::{validate_feed_url, UrlValidationError};

pub const DEFAULT_FEED_URL: &str = "https://www.fx-exchange.com/gbp/rss.xml";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid feed_url: {0}")]
    InvalidUrl(#[from] UrlValidationError),
}

// ============================================================================
// Configuration
// ============================================================================

/// All fields use `#[serde(default)]` so any subset of keys can be given.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// GBP rate feed to fetch.
    pub feed_url: String,

    /// Background refresh cadence in minutes. 0 = no periodic refresh.
    pub refresh_interval_minutes: u64,

    /// Quiet period before a typed query is applied.
    pub debounce_ms: u64,

    /// Per-request HTTP timeout.
    pub request_timeout_secs: u64,

    /// Retry budget for both the HTTP client and the periodic scheduler.
    pub max_retries: u32,

    /// `last_updated` policy when the feed carries no date.
    pub missing_date: MissingDate,

    /// Where the last fetched feed text is kept. Defaults to
    /// `feed_cache.json` next to the config file.
    pub cache_path: Option<PathBuf>,

    /// Permit loopback/private feed hosts (local mirrors).
    pub allow_private_hosts: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feed_url: DEFAULT_FEED_URL.to_string(),
            refresh_interval_minutes: 15,
            debounce_ms: 200,
            request_timeout_secs: 10,
            max_retries: 3,
            missing_date: MissingDate::Now,
            cache_path: None,
            allow_private_hosts: false,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 8] = [
        "feed_url",
        "refresh_interval_minutes",
        "debounce_ms",
        "request_timeout_secs",
        "max_retries",
        "missing_date",
        "cache_path",
        "allow_private_hosts",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML or wrong value types → `Err(ConfigError::Parse)`
    /// - Rejected `feed_url` → `Err(ConfigError::InvalidUrl)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        validate_feed_url(&config.feed_url, config.allow_private_hosts)?;

        tracing::info!(
            path = %path.display(),
            feed_url = %config.feed_url,
            refresh_interval_minutes = config.refresh_interval_minutes,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// `None` when periodic refresh is disabled.
    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_minutes > 0)
            .then(|| Duration::from_secs(self.refresh_interval_minutes.saturating_mul(60)))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            missing_date: self.missing_date,
        }
    }

    /// Configured cache path, or `feed_cache.json` inside `config_dir`.
    pub fn cache_path_in(&self, config_dir: &Path) -> PathBuf {
        self.cache_path
            .clone()
            .unwrap_or_else(|| config_dir.join("feed_cache.json"))
    }
}

// ============================================================================
// Tests
// ============================================================================
