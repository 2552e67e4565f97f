//! Reactive holder of the latest parsed rates.
//!
//! The store publishes on three independent channels:
//!
//! - **feed**: title, timestamp and items as one [`FeedSnapshot`], so readers
//!   never see items from one parse next to the title of another
//! - **loading**: whether a parse is in flight
//! - **error**: the current user-visible error, if any
//!
//! Errors never clear the feed; the last good data stays visible.

mod channel;

pub use channel::{Channel, Subscription};

use std::sync::Arc;

use crate::feed::{ParseResult, RateItem};

/// Title shown before the first successful parse.
pub const DEFAULT_TITLE: &str = "British Pound Sterling(GBP) Currency Exchange Rates";

/// Message used when a parse hands the store nothing at all.
pub const NO_PARSE_RESULT: &str = "no parse result";

/// One applied parse result, published as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedSnapshot {
    pub title: String,
    pub last_updated: String,
    pub items: Arc<[RateItem]>,
}

impl Default for FeedSnapshot {
    fn default() -> Self {
        Self {
            title: DEFAULT_TITLE.to_string(),
            last_updated: String::new(),
            items: Arc::from(Vec::new()),
        }
    }
}

impl From<ParseResult> for FeedSnapshot {
    fn from(result: ParseResult) -> Self {
        Self {
            title: result.title,
            last_updated: result.last_updated,
            items: Arc::from(result.items),
        }
    }
}

/// Point-in-time copy of every channel.
#[derive(Debug, Clone)]
pub struct StoreState {
    pub feed: Arc<FeedSnapshot>,
    pub loading: bool,
    pub error: Option<String>,
}

struct StoreChannels {
    feed: Channel<Arc<FeedSnapshot>>,
    loading: Channel<bool>,
    error: Channel<Option<String>>,
}

/// Cheaply cloneable handle; all clones share the same channels.
#[derive(Clone)]
pub struct RateStore {
    inner: Arc<StoreChannels>,
}

impl Default for RateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.snapshot();
        f.debug_struct("RateStore")
            .field("items", &state.feed.items.len())
            .field("loading", &state.loading)
            .field("error", &state.error)
            .finish()
    }
}

impl RateStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreChannels {
                feed: Channel::new("feed", Arc::new(FeedSnapshot::default())),
                loading: Channel::new("loading", false),
                error: Channel::new("error", None),
            }),
        }
    }

    /// Applies a parse outcome.
    ///
    /// `Some` replaces the feed snapshot wholesale and clears the error;
    /// `None` records [`NO_PARSE_RESULT`] and leaves the items alone. Either
    /// way loading ends.
    pub fn apply_parsed(&self, result: Option<ParseResult>) {
        self.apply_parsed_with(result, false);
    }

    /// Like [`RateStore::apply_parsed`], but loading is left at
    /// `still_loading` (true while more texts wait to be parsed).
    pub fn apply_parsed_with(&self, result: Option<ParseResult>, still_loading: bool) {
        match result {
            Some(result) => {
                let snapshot = FeedSnapshot::from(result);
                tracing::debug!(
                    items = snapshot.items.len(),
                    title = %snapshot.title,
                    "Applying parsed feed"
                );
                self.inner.feed.publish(Arc::new(snapshot));
                self.inner.error.publish(None);
            }
            None => {
                tracing::warn!("Parse produced no result, keeping previous rates");
                self.inner.error.publish(Some(NO_PARSE_RESULT.to_string()));
            }
        }
        self.inner.loading.publish(still_loading);
    }

    pub fn set_loading(&self, loading: bool) {
        self.inner.loading.publish(loading);
    }

    /// Sets or clears the visible error. Items are never touched.
    pub fn set_error(&self, message: Option<String>) {
        if let Some(msg) = &message {
            tracing::warn!(error = %msg, "Store error set");
        }
        self.inner.error.publish(message);
    }

    pub fn snapshot(&self) -> StoreState {
        StoreState {
            feed: self.inner.feed.current(),
            loading: self.inner.loading.current(),
            error: self.inner.error.current(),
        }
    }

    pub fn feed(&self) -> Arc<FeedSnapshot> {
        self.inner.feed.current()
    }

    /// Case-insensitive lookup of the first item with `code`.
    pub fn find_by_code(&self, code: &str) -> Option<RateItem> {
        let code = code.trim();
        self.inner
            .feed
            .current()
            .items
            .iter()
            .find(|item| item.code.eq_ignore_ascii_case(code))
            .cloned()
    }

    pub fn subscribe_feed(&self) -> Subscription<Arc<FeedSnapshot>> {
        self.inner.feed.subscribe()
    }

    pub fn subscribe_loading(&self) -> Subscription<bool> {
        self.inner.loading.subscribe()
    }

    pub fn subscribe_error(&self) -> Subscription<Option<String>> {
        self.inner.error.subscribe()
    }
}
