//! Debounced, case-insensitive search over the current rate list.
//!
//! A [`QueryFilter`] owns one background task that re-applies the current
//! query whenever the store publishes a new feed, plus at most one pending
//! debounce timer. Every recompute publishes a fresh [`FilteredRates`] with a
//! bumped generation, so consumers see a change event even when the visible
//! contents are identical.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::feed::RateItem;
use crate::store::{Channel, RateStore, Subscription};

/// Default quiet period before a debounced query is applied.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

/// Output of one recompute.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredRates {
    /// The query as last set (not normalized)
    pub query: String,
    pub items: Arc<[RateItem]>,
    /// Incremented on every recompute
    pub generation: u64,
}

/// Filters `items` by a trimmed, lower-cased `query`.
///
/// An empty query returns every item in a newly allocated sequence.
pub fn filter_items(items: &[RateItem], query: &str) -> Arc<[RateItem]> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return items.iter().cloned().collect();
    }
    items
        .iter()
        .filter(|item| item.matches(&needle))
        .cloned()
        .collect()
}

struct FilterState {
    query: String,
    generation: u64,
    pending: Option<JoinHandle<()>>,
    /// Bumped by every debounced call; only the latest may apply
    debounce_token: u64,
}

struct FilterInner {
    store: RateStore,
    debounce: Duration,
    state: Mutex<FilterState>,
    output: Channel<Arc<FilteredRates>>,
}

impl FilterInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, FilterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_query(&self, query: Option<&str>) {
        let mut state = self.lock();
        self.set_query_locked(&mut state, query);
    }

    /// Applies a debounced query unless a newer call has superseded it.
    ///
    /// An aborted timer may already be waiting on the lock, so the token is
    /// checked here rather than relying on the abort.
    fn apply_debounced(&self, token: u64, query: Option<&str>) {
        let mut state = self.lock();
        if state.debounce_token != token {
            tracing::trace!(token, "Dropping superseded debounced query");
            return;
        }
        state.pending = None;
        self.set_query_locked(&mut state, query);
    }

    fn set_query_locked(&self, state: &mut FilterState, query: Option<&str>) {
        let query = query.unwrap_or_default();
        if state.query == query {
            tracing::trace!(query, "Query unchanged, skipping recompute");
            return;
        }
        state.query = query.to_string();
        self.recompute_locked(state);
    }

    fn recompute(&self) {
        let mut state = self.lock();
        self.recompute_locked(&mut state);
    }

    /// Publishing under the lock keeps generation order equal to publish order.
    fn recompute_locked(&self, state: &mut FilterState) {
        let feed = self.store.feed();
        let items = filter_items(&feed.items, &state.query);
        state.generation = state.generation.wrapping_add(1);

        tracing::debug!(
            query = %state.query,
            matched = items.len(),
            total = feed.items.len(),
            generation = state.generation,
            "Recomputed filtered rates"
        );

        self.output.publish(Arc::new(FilteredRates {
            query: state.query.clone(),
            items,
            generation: state.generation,
        }));
    }
}

/// Search state bound to one [`RateStore`].
///
/// Must be created inside a tokio runtime. Dropping the filter cancels the
/// pending debounce timer and stops the store watcher.
pub struct QueryFilter {
    inner: Arc<FilterInner>,
    watcher: Option<JoinHandle<()>>,
}

impl QueryFilter {
    /// Starts filtering `store` with an empty query.
    pub fn spawn(store: RateStore, debounce: Duration) -> Self {
        let initial = FilteredRates {
            query: String::new(),
            items: filter_items(&store.feed().items, ""),
            generation: 0,
        };
        let mut feed_updates = store.subscribe_feed();

        let inner = Arc::new(FilterInner {
            store,
            debounce,
            state: Mutex::new(FilterState {
                query: String::new(),
                generation: 0,
                pending: None,
                debounce_token: 0,
            }),
            output: Channel::new("filtered", Arc::new(initial)),
        });

        let task_inner = Arc::clone(&inner);
        let watcher = tokio::spawn(async move {
            while feed_updates.next().await.is_some() {
                task_inner.recompute();
            }
            tracing::debug!("Store feed channel closed, filter watcher exiting");
        });

        Self {
            inner,
            watcher: Some(watcher),
        }
    }

    /// Sets the query immediately. `None` means empty.
    ///
    /// Does nothing if the query is unchanged; otherwise recomputes and
    /// publishes. Any pending debounced query is left alone.
    pub fn set_query(&self, query: Option<&str>) {
        self.inner.set_query(query);
    }

    /// Sets the query after the debounce period.
    ///
    /// A second call before the timer fires cancels the first, so only the
    /// latest value is ever applied.
    pub fn set_query_debounced(&self, query: Option<&str>) {
        let query = query.map(str::to_string);
        let task_inner = Arc::clone(&self.inner);
        let delay = self.inner.debounce;

        let mut state = self.inner.lock();
        if let Some(handle) = state.pending.take() {
            handle.abort();
            tracing::trace!("Reset pending debounced query");
        }
        state.debounce_token = state.debounce_token.wrapping_add(1);
        let token = state.debounce_token;
        state.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task_inner.apply_debounced(token, query.as_deref());
        }));
    }

    pub fn query(&self) -> String {
        self.inner.lock().query.clone()
    }

    pub fn current(&self) -> Arc<FilteredRates> {
        self.inner.output.current()
    }

    pub fn subscribe(&self) -> Subscription<Arc<FilteredRates>> {
        self.inner.output.subscribe()
    }

    /// Cancels the pending timer and stops watching the store.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.inner.lock();
            state.debounce_token = state.debounce_token.wrapping_add(1);
            if let Some(handle) = state.pending.take() {
                handle.abort();
            }
        }
        if let Some(handle) = self.watcher.take() {
            handle.abort();
            tracing::debug!("Query filter shut down");
        }
    }
}

impl Drop for QueryFilter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
