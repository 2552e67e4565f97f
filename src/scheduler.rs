//! Periodic background refresh.
//!
//! Each tick runs a cache-only background fetch, retrying with exponential
//! backoff up to a fixed budget, and then syncs the store from the cache.
//! A failed tick is logged and left for the next one.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::cache::FeedCache;
use crate::feed::FeedSource;
use crate::refresh::{FetchOutcome, RefreshCoordinator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// First backoff delay; doubled after each failed attempt
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(retry))
    }
}

/// Handle to a running periodic loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct PeriodicHandle {
    handle: Option<JoinHandle<()>>,
}

impl PeriodicHandle {
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            tracing::debug!("Periodic refresh stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for PeriodicHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs one background fetch with bounded retries.
pub async fn fetch_with_retry<S, C>(
    coordinator: &RefreshCoordinator<S, C>,
    policy: RetryPolicy,
) -> FetchOutcome
where
    S: FeedSource,
    C: FeedCache,
{
    let mut retry = 0;
    loop {
        match coordinator.background_fetch().await {
            FetchOutcome::Success => return FetchOutcome::Success,
            FetchOutcome::Retry if retry < policy.max_retries => {
                let delay = policy.delay_for(retry);
                tracing::debug!(
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    "Background fetch failed, backing off"
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            FetchOutcome::Retry => {
                tracing::warn!(attempts = retry + 1, "Background fetch gave up until next tick");
                return FetchOutcome::Retry;
            }
        }
    }
}

/// Starts the periodic loop. The first tick fires after one full `interval`.
pub fn spawn_periodic<S, C>(
    coordinator: Arc<RefreshCoordinator<S, C>>,
    interval: Duration,
    policy: RetryPolicy,
) -> PeriodicHandle
where
    S: FeedSource,
    C: FeedCache,
{
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            tracing::debug!("Periodic refresh tick");
            if fetch_with_retry(&coordinator, policy).await == FetchOutcome::Success {
                coordinator.sync_from_cache().await;
            }
        }
    });

    tracing::info!(interval_secs = interval.as_secs(), "Periodic refresh started");
    PeriodicHandle {
        handle: Some(handle),
    }
}
