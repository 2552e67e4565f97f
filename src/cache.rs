//! Persistence of the most recently fetched raw feed text.
//!
//! The refresh path only needs `get`/`put`, so the storage mechanism is an
//! injected [`FeedCache`]. [`FileCache`] survives restarts; [`MemoryCache`]
//! is for tests and one-shot runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache entry is not valid JSON: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Raw feed text plus the moment it was fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFeed {
    pub text: String,
    pub fetched_at: DateTime<Utc>,
}

impl CachedFeed {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            fetched_at: Utc::now(),
        }
    }
}

pub trait FeedCache: Send + Sync + 'static {
    /// Returns the last stored entry, or `None` if nothing was ever stored.
    fn get(&self) -> Result<Option<CachedFeed>, CacheError>;

    /// Replaces the stored entry.
    fn put(&self, entry: &CachedFeed) -> Result<(), CacheError>;
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entry: Mutex<Option<CachedFeed>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FeedCache for MemoryCache {
    fn get(&self) -> Result<Option<CachedFeed>, CacheError> {
        let guard = self.entry.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.clone())
    }

    fn put(&self, entry: &CachedFeed) -> Result<(), CacheError> {
        let mut guard = self.entry.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(entry.clone());
        Ok(())
    }
}

/// JSON file cache, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct FileCache {
    path: PathBuf,
}

impl FileCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FeedCache for FileCache {
    fn get(&self) -> Result<Option<CachedFeed>, CacheError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::Io(e)),
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        let entry: CachedFeed = serde_json::from_str(&content)?;
        tracing::debug!(
            path = %self.path.display(),
            bytes = entry.text.len(),
            fetched_at = %entry.fetched_at,
            "Read cached feed"
        );
        Ok(Some(entry))
    }

    fn put(&self, entry: &CachedFeed) -> Result<(), CacheError> {
        let json = serde_json::to_vec(entry)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        write_atomic(&self.path, &json)?;
        tracing::debug!(path = %self.path.display(), bytes = json.len(), "Wrote feed cache");
        Ok(())
    }
}

/// Writes `content` to a fresh temp file next to `dst`, syncs it, then
/// renames it over `dst`. Readers see either the old or the new file.
fn write_atomic(dst: &Path, content: &[u8]) -> std::io::Result<()> {
    use std::time::{SystemTime, UNIX_EPOCH};
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = dst.with_extension(format!("tmp.{:016x}", suffix));

    let result = (|| {
        let mut temp_file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        temp_file.write_all(content)?;
        temp_file.sync_all()?;
        std::fs::rename(&temp_path, dst)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ratewatch_cache_test_{}", name));
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn entry(text: &str) -> CachedFeed {
        CachedFeed {
            text: text.to_string(),
            fetched_at: Utc.with_ymd_and_hms(2025, 10, 14, 6, 0, 55).unwrap(),
        }
    }

    #[test]
    fn test_memory_cache_roundtrip() {
        let cache = MemoryCache::new();
        assert_eq!(cache.get().unwrap(), None);

        cache.put(&entry("<rss/>")).unwrap();
        assert_eq!(cache.get().unwrap(), Some(entry("<rss/>")));

        cache.put(&entry("<rss></rss>")).unwrap();
        assert_eq!(cache.get().unwrap().unwrap().text, "<rss></rss>");
    }

    #[test]
    fn test_file_cache_missing_file_is_empty() {
        let dir = temp_dir("missing");
        let cache = FileCache::new(dir.join("feed_cache.json"));
        assert_eq!(cache.get().unwrap(), None);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_file_cache_persists_across_instances() {
        let dir = temp_dir("persist");
        let path = dir.join("nested").join("feed_cache.json");

        FileCache::new(&path).put(&entry("<rss>one</rss>")).unwrap();
        let reader = FileCache::new(&path);
        assert_eq!(reader.path(), path.as_path());
        let reread = reader.get().unwrap();
        assert_eq!(reread, Some(entry("<rss>one</rss>")));

        // No temp files left behind after the rename
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_file_cache_corrupt_file_is_error() {
        let dir = temp_dir("corrupt");
        let path = dir.join("feed_cache.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = FileCache::new(&path).get().unwrap_err();
        assert!(matches!(err, CacheError::Serialize(_)));

        std::fs::remove_dir_all(&dir).ok();
    }
}
