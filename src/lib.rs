//! GBP exchange-rate feed core.
//!
//! Raw feed text flows one way: a fetch (or the cache) hands text to the
//! [`refresh::RefreshCoordinator`], which parses it with [`feed::parse_with`]
//! and applies the result to a [`store::RateStore`]. A [`filter::QueryFilter`]
//! republishes the store's items through the current search query.
//! Conversions in [`convert`] work on a single rate and never touch the store.

pub mod cache;
pub mod config;
pub mod convert;
pub mod feed;
pub mod filter;
pub mod refresh;
pub mod scheduler;
pub mod store;
pub mod util;
