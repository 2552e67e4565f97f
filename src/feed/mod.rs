//! Rate feed handling: fetching raw feed text and turning it into rate items.
//!
//! - **Parsing**: walk the feed markup and collect per-item title/description text
//! - **Extraction**: heuristically recover code, name and rate from that text
//! - **Fetching**: HTTP retrieval with bounded retry and document trimming
//!
//! # Example
//!
//! ```ignore
//! use ratewatch::feed::parse;
//!
//! let result = parse(&xml)?;
//! for item in &result.items {
//!     println!("{} {}", item.code, item.rate);
//! }
//! ```

mod extract;
mod fetcher;
mod parser;
mod types;

pub use extract::{build_item, derive_name, normalize_decimal, pick_code, pick_rate};
pub use fetcher::{trim_to_document, FeedSource, FetchError, HttpFeedSource};
pub use parser::{parse, parse_with, FeedParseError};
pub use types::{format_fallback_timestamp, MissingDate, ParseOptions, ParseResult, RateItem};
