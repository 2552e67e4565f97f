//! Small helpers shared by the binary and the config loader.
//!
//! - **Text**: width-aware truncation/padding and control-character stripping
//!   for printing feed-supplied strings to a terminal
//! - **URL validation**: scheme and host checks for the configured feed URL

mod text;
mod url_validator;

pub use text::{display_width, pad_to_width, strip_control_chars, truncate_to_width};
pub use url_validator::{validate_feed_url, UrlValidationError};
