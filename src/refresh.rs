//! Reconciles foreground fetches, background fetches and the cache with the
//! rate store.
//!
//! Every candidate feed text goes through [`RefreshCoordinator::observe`],
//! which compares it to the text that was last handed to the parser. Only a
//! genuine difference is parsed, so a background fetch returning the same
//! document does not republish the store (and does not disturb the current
//! search results).
//!
//! Parsing runs on a single [`ParseWorker`]: one task draining a bounded
//! queue, each parse on the blocking pool. Parses are therefore never
//! concurrent and results reach the store in submission order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::{CachedFeed, FeedCache};
use crate::feed::{parse_with, FeedSource, FetchError, ParseOptions};
use crate::store::RateStore;

/// Shown when a foreground fetch returns nothing usable.
pub const NO_DATA_MESSAGE: &str = "No data received. Check connection or try again.";

const PARSE_QUEUE_CAPACITY: usize = 8;

/// Result of one background fetch attempt, as reported to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Success,
    Retry,
}

// ============================================================================
// Loading Tracker
// ============================================================================

/// Keeps the store's loading flag on while any unit of work is outstanding.
///
/// The count and the flag change under one lock, so a finishing parse can
/// never publish `false` over a text that was queued a moment earlier.
#[derive(Clone)]
struct Busy {
    store: RateStore,
    active: Arc<Mutex<usize>>,
}

impl Busy {
    fn new(store: RateStore) -> Self {
        Self {
            store,
            active: Arc::new(Mutex::new(0)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, usize> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin(&self) {
        let mut active = self.lock();
        *active += 1;
        self.store.set_loading(true);
    }

    /// Ends one unit; `apply` runs under the lock and is told whether other
    /// work is still outstanding.
    fn end_with(&self, apply: impl FnOnce(&RateStore, bool)) {
        let mut active = self.lock();
        *active = active.saturating_sub(1);
        apply(&self.store, *active > 0);
    }

    fn end(&self) {
        self.end_with(|store, busy| store.set_loading(busy));
    }

    fn active(&self) -> usize {
        *self.lock()
    }
}

// ============================================================================
// Parse Worker
// ============================================================================

/// Serialized parse queue feeding one [`RateStore`].
pub struct ParseWorker {
    tx: Mutex<Option<mpsc::Sender<String>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    parsed: Arc<AtomicU64>,
    busy: Busy,
}

impl ParseWorker {
    pub fn spawn(store: RateStore, options: ParseOptions) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(PARSE_QUEUE_CAPACITY);
        let parsed = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&parsed);
        let busy = Busy::new(store);
        let worker_busy = busy.clone();

        let handle = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                let bytes = text.len();
                let outcome = tokio::task::spawn_blocking(move || parse_with(&text, &options)).await;
                counter.fetch_add(1, Ordering::Relaxed);

                match outcome {
                    Ok(Ok(result)) => {
                        tracing::debug!(bytes, items = result.items.len(), "Parse complete");
                        worker_busy.end_with(|store, busy| store.apply_parsed_with(Some(result), busy));
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(bytes, error = %e, "Feed document could not be parsed");
                        worker_busy.end_with(|store, busy| {
                            store.set_error(Some(format!("Parse error: {}", e)));
                            store.set_loading(busy);
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Parse task failed");
                        worker_busy.end_with(|store, busy| store.apply_parsed_with(None, busy));
                    }
                }
            }
            tracing::debug!("Parse queue closed, worker exiting");
        });

        Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            parsed,
            busy,
        }
    }

    /// Queues `text` for parsing, waiting if the queue is full.
    ///
    /// Loading is on from here until the last queued text has been applied.
    /// Returns false once the worker has been shut down.
    pub async fn submit(&self, text: String) -> bool {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .cloned();
        let Some(tx) = tx else {
            return false;
        };

        self.busy.begin();
        if tx.send(text).await.is_ok() {
            return true;
        }
        self.busy.end();
        false
    }

    /// Number of parses finished so far.
    pub fn parsed_count(&self) -> u64 {
        self.parsed.load(Ordering::Relaxed)
    }

    /// Texts queued or being parsed, plus in-flight foreground fetches.
    pub fn pending(&self) -> usize {
        self.busy.active()
    }

    /// Closes the queue and waits for already-queued parses to finish.
    pub async fn shutdown(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Parse worker ended abnormally");
            }
        }
    }
}

// ============================================================================
// Refresh Coordinator
// ============================================================================

pub struct RefreshCoordinator<S, C> {
    source: S,
    cache: C,
    store: RateStore,
    worker: ParseWorker,
    last_applied: Mutex<Option<String>>,
    /// The visible error came from a foreground fetch
    fetch_failed: AtomicBool,
}

impl<S: FeedSource, C: FeedCache> RefreshCoordinator<S, C> {
    /// Must be called inside a tokio runtime (spawns the parse worker).
    pub fn new(source: S, cache: C, store: RateStore, options: ParseOptions) -> Self {
        let worker = ParseWorker::spawn(store.clone(), options);
        Self {
            source,
            cache,
            store,
            worker,
            last_applied: Mutex::new(None),
            fetch_failed: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &RateStore {
        &self.store
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn parsed_count(&self) -> u64 {
        self.worker.parsed_count()
    }

    /// Offers a newly seen feed text.
    ///
    /// Blank text, or text identical to what was last applied, is ignored and
    /// returns false. Anything else becomes the last-applied text and is
    /// queued for parsing.
    pub async fn observe(&self, text: String) -> bool {
        if text.trim().is_empty() {
            tracing::debug!("Ignoring blank feed text");
            return false;
        }
        {
            let mut last = self.last_applied.lock().unwrap_or_else(|e| e.into_inner());
            if last.as_deref() == Some(text.as_str()) {
                tracing::debug!(bytes = text.len(), "Feed unchanged, skipping parse");
                return false;
            }
            *last = Some(text.clone());
        }
        self.enqueue(text).await
    }

    /// Applies `text` even if it equals the last-applied text.
    pub async fn load_text(&self, text: String) -> bool {
        *self.last_applied.lock().unwrap_or_else(|e| e.into_inner()) = Some(text.clone());
        self.enqueue(text).await
    }

    /// Fetches immediately on behalf of the user.
    ///
    /// Failures become a visible store error; the items on screen stay.
    /// Successful fetches are also written to the cache and clear an error
    /// left by an earlier failed fetch, even when the text is unchanged.
    pub async fn foreground_refresh(&self) -> Result<bool, FetchError> {
        self.worker.busy.begin();

        let text = match self.source.fetch().await {
            Ok(text) if text.trim().is_empty() => Err(FetchError::Empty),
            other => other,
        };

        match text {
            Ok(text) => {
                if let Err(e) = self.cache.put(&CachedFeed::new(text.as_str())) {
                    tracing::warn!(error = %e, "Failed to cache foreground fetch");
                }
                if self.fetch_failed.swap(false, Ordering::Relaxed) {
                    self.store.set_error(None);
                }
                let queued = self.observe(text).await;
                self.worker.busy.end();
                Ok(queued)
            }
            Err(e) => {
                let message = match &e {
                    FetchError::Empty => NO_DATA_MESSAGE.to_string(),
                    other => format!("Network error: {}", other),
                };
                tracing::warn!(error = %e, "Foreground refresh failed");
                self.store.set_error(Some(message));
                self.fetch_failed.store(true, Ordering::Relaxed);
                self.worker.busy.end();
                Err(e)
            }
        }
    }

    /// Fetches and writes the cache only. The store is never touched, so
    /// failures stay invisible and are left to the caller to retry.
    pub async fn background_fetch(&self) -> FetchOutcome {
        let text = match self.source.fetch().await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                tracing::debug!("Background fetch returned no data");
                return FetchOutcome::Retry;
            }
            Err(e) => {
                tracing::debug!(error = %e, retryable = e.is_retryable(), "Background fetch failed");
                return FetchOutcome::Retry;
            }
        };

        match self.cache.put(&CachedFeed::new(text)) {
            Ok(()) => FetchOutcome::Success,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to write feed cache");
                FetchOutcome::Retry
            }
        }
    }

    /// Reads the cache and offers its text to [`Self::observe`].
    pub async fn sync_from_cache(&self) -> bool {
        match self.cache.get() {
            Ok(Some(entry)) => {
                tracing::debug!(fetched_at = %entry.fetched_at, "Syncing from cache");
                self.observe(entry.text).await
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read feed cache");
                false
            }
        }
    }

    /// Stops accepting work and waits for queued parses to land in the store.
    pub async fn shutdown(&self) {
        self.worker.shutdown().await;
    }

    async fn enqueue(&self, text: String) -> bool {
        let queued = self.worker.submit(text).await;
        if !queued {
            tracing::warn!("Parse worker is shut down, dropping feed text");
        }
        queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use std::collections::VecDeque;
    use std::future::Future;

    const FEED_A: &str = r#"<rss><channel><title>Rates</title>
        <item><title>GBP/AED</title><description>1 GBP = 4.9471 AED</description></item>
    </channel></rss>"#;

    const FEED_B: &str = r#"<rss><channel><title>Rates</title>
        <item><title>GBP/JPY</title><description>1 GBP = 183.42 JPY</description></item>
    </channel></rss>"#;

    #[derive(Default)]
    struct StubSource {
        responses: Mutex<VecDeque<Result<String, FetchError>>>,
    }

    impl StubSource {
        fn with(responses: Vec<Result<String, FetchError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    impl FeedSource for StubSource {
        fn fetch(&self) -> impl Future<Output = Result<String, FetchError>> + Send {
            let next = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(FetchError::Timeout));
            async move { next }
        }
    }

    fn coordinator(
        responses: Vec<Result<String, FetchError>>,
    ) -> RefreshCoordinator<StubSource, MemoryCache> {
        RefreshCoordinator::new(
            StubSource::with(responses),
            MemoryCache::new(),
            RateStore::new(),
            ParseOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_observe_skips_identical_text() {
        let coord = coordinator(vec![]);
        assert!(coord.observe(FEED_A.to_string()).await);
        assert!(!coord.observe(FEED_A.to_string()).await);
        assert!(!coord.observe("   ".to_string()).await);
        assert!(coord.observe(FEED_B.to_string()).await);
        coord.shutdown().await;

        assert_eq!(coord.parsed_count(), 2);
        let state = coord.store().snapshot();
        assert_eq!(state.feed.items[0].code, "JPY");
        assert!(!state.loading);
    }

    #[tokio::test]
    async fn test_load_text_applies_unconditionally() {
        let coord = coordinator(vec![]);
        assert!(coord.observe(FEED_A.to_string()).await);
        assert!(coord.load_text(FEED_A.to_string()).await);
        coord.shutdown().await;
        assert_eq!(coord.parsed_count(), 2);
    }

    #[tokio::test]
    async fn test_foreground_success_applies_and_caches() {
        let coord = coordinator(vec![Ok(FEED_A.to_string())]);
        assert!(coord.foreground_refresh().await.unwrap());
        coord.shutdown().await;

        let state = coord.store().snapshot();
        assert_eq!(state.feed.items[0].code, "AED");
        assert_eq!(state.error, None);
        assert_eq!(coord.cache().get().unwrap().unwrap().text, FEED_A);
    }

    #[tokio::test]
    async fn test_foreground_failure_keeps_items() {
        let coord = coordinator(vec![
            Ok(FEED_A.to_string()),
            Err(FetchError::HttpStatus(503)),
        ]);
        let mut feed = coord.store().subscribe_feed();
        coord.foreground_refresh().await.unwrap();
        feed.next().await.unwrap();

        assert!(coord.foreground_refresh().await.is_err());
        let state = coord.store().snapshot();
        assert_eq!(state.feed.items.len(), 1);
        assert_eq!(
            state.error.as_deref(),
            Some("Network error: HTTP error: status 503")
        );
        assert!(!state.loading);
    }

    #[tokio::test]
    async fn test_foreground_recovers_after_failure_with_same_feed() {
        let coord = coordinator(vec![
            Ok(FEED_A.to_string()),
            Err(FetchError::HttpStatus(503)),
            Ok(FEED_A.to_string()),
        ]);
        let mut feed = coord.store().subscribe_feed();
        assert!(coord.foreground_refresh().await.unwrap());
        feed.next().await.unwrap();

        assert!(coord.foreground_refresh().await.is_err());
        assert!(coord.store().snapshot().error.is_some());

        // Same document again: nothing to parse, but the fetch worked
        assert!(!coord.foreground_refresh().await.unwrap());
        let state = coord.store().snapshot();
        assert_eq!(state.error, None);
        assert!(!state.loading);
        assert_eq!(state.feed.items.len(), 1);
        coord.shutdown().await;
        assert_eq!(coord.parsed_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_loading_while_parse_queued() {
        let coord = coordinator(vec![Err(FetchError::HttpStatus(503))]);
        // Nothing yields to the worker until shutdown, so the text stays queued
        assert!(coord.observe(FEED_A.to_string()).await);
        assert!(coord.foreground_refresh().await.is_err());
        assert_eq!(coord.worker.pending(), 1);
        assert!(coord.store().snapshot().loading);

        coord.shutdown().await;
        assert_eq!(coord.worker.pending(), 0);
        let state = coord.store().snapshot();
        assert!(!state.loading);
        assert_eq!(state.feed.items[0].code, "AED");
    }

    #[test]
    fn test_parse_result_keeps_loading_while_more_queued() {
        let store = RateStore::new();
        let busy = Busy::new(store.clone());
        busy.begin();
        busy.begin();

        let first = parse_with(FEED_A, &ParseOptions::default()).unwrap();
        busy.end_with(|store, busy| store.apply_parsed_with(Some(first), busy));
        assert_eq!(store.feed().items[0].code, "AED");
        assert!(store.snapshot().loading);

        let second = parse_with(FEED_B, &ParseOptions::default()).unwrap();
        busy.end_with(|store, busy| store.apply_parsed_with(Some(second), busy));
        assert_eq!(store.feed().items[0].code, "JPY");
        assert!(!store.snapshot().loading);
        assert_eq!(busy.active(), 0);
    }

    #[tokio::test]
    async fn test_foreground_empty_body_message() {
        let coord = coordinator(vec![Ok("  \n".to_string())]);
        assert!(matches!(
            coord.foreground_refresh().await,
            Err(FetchError::Empty)
        ));
        assert_eq!(
            coord.store().snapshot().error.as_deref(),
            Some(NO_DATA_MESSAGE)
        );
    }

    #[tokio::test]
    async fn test_background_fetch_never_touches_store() {
        let coord = coordinator(vec![Err(FetchError::Timeout), Ok(FEED_A.to_string())]);
        let error = coord.store().subscribe_error();
        let loading = coord.store().subscribe_loading();

        assert_eq!(coord.background_fetch().await, FetchOutcome::Retry);
        assert_eq!(coord.background_fetch().await, FetchOutcome::Success);

        assert!(!error.has_changed());
        assert!(!loading.has_changed());
        assert_eq!(coord.cache().get().unwrap().unwrap().text, FEED_A);
        assert!(coord.store().feed().items.is_empty());

        // Applying happens on the next cache sync
        assert!(coord.sync_from_cache().await);
        assert!(!coord.sync_from_cache().await);
        coord.shutdown().await;
        assert_eq!(coord.store().feed().items[0].code, "AED");
    }

    #[tokio::test]
    async fn test_broken_document_sets_parse_error() {
        let coord = coordinator(vec![]);
        coord.observe(FEED_A.to_string()).await;
        coord.observe("<rss><channel><item>".to_string()).await;
        coord.shutdown().await;

        let state = coord.store().snapshot();
        assert_eq!(state.feed.items[0].code, "AED");
        assert!(state.error.unwrap().starts_with("Parse error:"));
        assert!(!state.loading);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let coord = coordinator(vec![]);
        coord.shutdown().await;
        assert!(!coord.observe(FEED_A.to_string()).await);
        assert!(!coord.store().snapshot().loading);
    }
}
