use chrono::{DateTime, Utc};

// ============================================================================
// Rate Types
// ============================================================================

/// One currency entry recovered from the feed.
///
/// `rate` is always expressed as GBP -> `code` (1 GBP buys `rate` units).
/// Items are only constructed once both a code and a positive rate are known;
/// anything less is dropped by the parser.
#[derive(Debug, Clone, PartialEq)]
pub struct RateItem {
    /// Upper-case ISO-4217 style code, e.g. `AED`
    pub code: String,
    /// Display name, falls back to the code when the feed gives none
    pub name: String,
    /// The feed carries no separate country field, so this is usually empty
    pub country: String,
    pub rate: f64,
}

impl RateItem {
    /// Builds an item, applying the name fallback and rejecting unusable rates.
    ///
    /// Returns `None` if `code` is blank or `rate` is not a positive finite number.
    pub fn new(code: &str, name: Option<&str>, country: &str, rate: f64) -> Option<Self> {
        let code = code.trim().to_ascii_uppercase();
        if code.is_empty() || !rate.is_finite() || rate <= 0.0 {
            return None;
        }

        let name = match name.map(str::trim) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => code.clone(),
        };

        Some(Self {
            code,
            name,
            country: country.trim().to_string(),
            rate,
        })
    }

    /// Case-insensitive substring match over code, name and country.
    ///
    /// `needle` must already be lower-cased.
    pub fn matches(&self, needle: &str) -> bool {
        self.code.to_lowercase().contains(needle)
            || self.name.to_lowercase().contains(needle)
            || self.country.to_lowercase().contains(needle)
    }
}

/// Everything extracted from one feed document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseResult {
    /// Channel-level title, may be empty
    pub title: String,
    /// Channel publish date as written in the feed, or the substituted fallback
    pub last_updated: String,
    /// Items in feed order; codes are not deduplicated
    pub items: Vec<RateItem>,
}

// ============================================================================
// Parse Options
// ============================================================================

/// What to put in `last_updated` when the feed carries neither `pubDate`
/// nor `lastBuildDate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingDate {
    /// Substitute the current wall-clock time (UTC)
    #[default]
    Now,
    /// Leave the field empty
    Blank,
}

/// Tunables for [`crate::feed::parse_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    pub missing_date: MissingDate,
}

/// RFC-822 style UTC timestamp used when the feed has no date element.
pub fn format_fallback_timestamp(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S UTC").to_string()
}
