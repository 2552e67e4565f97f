//! Heuristics for pulling a currency code, display name and rate out of the
//! free-form `title` / `description` text of a single feed item.
//!
//! Every function here is best-effort: a fragment that cannot be understood
//! yields `None` and the caller drops the item.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

use super::types::RateItem;

/// `... (AED)` at the very end of the title
static CODE_IN_PARENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([A-Z]{3})\)\s*$").expect("valid regex"));
/// `GBP/AED`, `GBP / AED`
static CODE_AFTER_SLASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"GBP\s*/\s*([A-Z]{3})").expect("valid regex"));
static ANY_TRIPLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z]{3})\b").expect("valid regex"));
static PAREN_GROUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(.*?\)").expect("valid regex"));
static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));
static MARKUP_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));
/// `1 British Pound Sterling = 4.9471 United Arab Emirates Dirham` style
/// descriptions are preceded by the canonical `1 GBP = 4.9471 AED` form,
/// which is what we look for first.
static FEED_RATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"GBP\s*=\s*([0-9]+(?:[.,][0-9]+)?)\s*[A-Z]{3}").expect("valid regex")
});
static ANY_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]+(?:[.,][0-9]+)?)").expect("valid regex"));

const BASE_CODE: &str = "GBP";

/// Builds a [`RateItem`] from an item's accumulated title and description.
///
/// Returns `None` when no code or no usable rate can be recovered.
pub fn build_item(title: &str, description: &str) -> Option<RateItem> {
    let code = pick_code(title)?;
    let name = derive_name(title, &code);
    let rate = pick_rate(description)?;
    RateItem::new(&code, name.as_deref(), "", rate)
}

/// Finds the quoted currency code in an item title.
///
/// First match wins:
/// 1. trailing `(XXX)`
/// 2. `GBP/XXX`
/// 3. the last standalone three-letter upper-case token that is not `GBP`
pub fn pick_code(title: &str) -> Option<String> {
    let title = title.trim();

    if let Some(caps) = CODE_IN_PARENS.captures(title) {
        return Some(caps[1].to_string());
    }

    if let Some(caps) = CODE_AFTER_SLASH.captures(title) {
        return Some(caps[1].to_string());
    }

    ANY_TRIPLE
        .captures_iter(title)
        .map(|caps| caps[1].to_string())
        .filter(|c| c != BASE_CODE)
        .last()
}

/// Derives a human-readable currency name from the title.
///
/// `British Pound Sterling(GBP)/United Arab Emirates Dirham(AED)` becomes
/// `United Arab Emirates Dirham`. Returns `None` when nothing better than the
/// code itself is left.
pub fn derive_name(title: &str, code: &str) -> Option<String> {
    if let Some((_, rhs)) = title.split_once('/') {
        let rhs = PAREN_GROUP.replace_all(rhs.trim(), "");
        let rhs = rhs.trim();
        if !rhs.is_empty() {
            return Some(rhs.to_string());
        }
    }

    let stripped = PAREN_GROUP.replace_all(title, "");
    let tail = match stripped.split_once('/') {
        Some((_, after)) => after,
        None => &stripped,
    };
    let without_base = tail.replace(BASE_CODE, "");
    let collapsed = WHITESPACE_RUN.replace_all(&without_base, " ");
    let name = collapsed.trim();

    if name.is_empty() || name.eq_ignore_ascii_case(code) {
        None
    } else {
        Some(name.to_string())
    }
}

/// Extracts the GBP -> code rate from an item description.
///
/// Markup and `&nbsp;` are removed first. The `GBP = <n> XXX` form is
/// preferred; otherwise the last number in the text is used.
pub fn pick_rate(description: &str) -> Option<f64> {
    let plain = strip_markup(description);

    let token = match FEED_RATE.captures(&plain) {
        Some(caps) => caps.get(1).map(|m| m.as_str()),
        None => ANY_NUMBER
            .captures_iter(&plain)
            .last()
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str()),
    }?;

    match normalize_decimal(token).parse::<f64>() {
        Ok(rate) => Some(rate),
        Err(e) => {
            tracing::trace!(token = %token, error = %e, "Unparsable rate token");
            None
        }
    }
}

/// Treats `,` as the decimal separator only when no `.` is present.
///
/// `12,34` becomes `12.34`; `1,234.5` is returned untouched.
pub fn normalize_decimal(token: &str) -> Cow<'_, str> {
    if token.contains(',') && !token.contains('.') {
        Cow::Owned(token.replace(',', "."))
    } else {
        Cow::Borrowed(token)
    }
}

fn strip_markup(text: &str) -> String {
    MARKUP_TAG
        .replace_all(text, " ")
        .replace("&nbsp;", " ")
        .replace('\u{a0}', " ")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // ========================================================================
    // Code extraction
    // ========================================================================

    #[test]
    fn test_code_trailing_parens_wins() {
        assert_eq!(
            pick_code("British Pound Sterling(GBP)/United Arab Emirates Dirham(AED)").as_deref(),
            Some("AED")
        );
        assert_eq!(pick_code("Something (USD)  ").as_deref(), Some("USD"));
    }

    #[test]
    fn test_code_after_gbp_slash() {
        assert_eq!(pick_code("GBP/AED").as_deref(), Some("AED"));
        assert_eq!(pick_code("GBP / JPY rate").as_deref(), Some("JPY"));
    }

    #[test]
    fn test_code_last_standalone_non_gbp() {
        assert_eq!(pick_code("AED - United Arab Emirates Dirham").as_deref(), Some("AED"));
        assert_eq!(pick_code("USD EUR GBP").as_deref(), Some("EUR"));
    }

    #[test]
    fn test_code_none_when_only_gbp_or_nothing() {
        assert_eq!(pick_code("GBP"), None);
        assert_eq!(pick_code("pound rates"), None);
        assert_eq!(pick_code(""), None);
    }

    // ========================================================================
    // Name extraction
    // ========================================================================

    #[test]
    fn test_name_from_slash_rhs() {
        assert_eq!(
            derive_name(
                "British Pound Sterling(GBP)/United Arab Emirates Dirham(AED)",
                "AED"
            )
            .as_deref(),
            Some("United Arab Emirates Dirham")
        );
    }

    #[test]
    fn test_name_without_slash_strips_parens_and_base() {
        assert_eq!(
            derive_name("GBP Japanese   Yen (JPY)", "JPY").as_deref(),
            Some("Japanese Yen")
        );
    }

    #[test]
    fn test_name_absent_when_only_code_left() {
        assert_eq!(derive_name("(AED) aed", "AED"), None);
        assert_eq!(derive_name("GBP", "AED"), None);
    }

    // ========================================================================
    // Rate extraction
    // ========================================================================

    #[test]
    fn test_rate_prefers_canonical_pattern() {
        let desc = "1 British Pound Sterling = 4.9471 United Arab Emirates Dirham 1 GBP = 4.9471 AED";
        assert_eq!(pick_rate(desc), Some(4.9471));
        assert_eq!(pick_rate("2 GBP = 183.42 JPY and 7"), Some(183.42));
    }

    #[test]
    fn test_rate_falls_back_to_last_number() {
        assert_eq!(pick_rate("4.9471"), Some(4.9471));
        assert_eq!(pick_rate("between 1 and 2.5 units"), Some(2.5));
    }

    #[test]
    fn test_rate_strips_markup_and_nbsp() {
        assert_eq!(pick_rate("<p>1&nbsp;GBP&nbsp;=&nbsp;<b>1.1652</b>&nbsp;EUR</p>"), Some(1.1652));
        assert_eq!(pick_rate("1\u{a0}GBP =\u{a0}1.3 USD"), Some(1.3));
    }

    #[test]
    fn test_rate_comma_decimal() {
        assert_eq!(pick_rate("1 GBP = 12,34 XXX"), Some(12.34));
    }

    #[test]
    fn test_rate_none_without_number() {
        assert_eq!(pick_rate(""), None);
        assert_eq!(pick_rate("no figures here"), None);
    }

    #[test]
    fn test_normalize_decimal() {
        assert_eq!(normalize_decimal("12,34"), "12.34");
        assert_eq!(normalize_decimal("1,234.5"), "1,234.5");
        assert_eq!(normalize_decimal("183.42"), "183.42");
        assert!(matches!(normalize_decimal("7"), Cow::Borrowed(_)));
    }

    // ========================================================================
    // Item construction
    // ========================================================================

    #[test]
    fn test_build_item_full() {
        let item = build_item(
            "British Pound Sterling(GBP)/Japanese Yen(JPY)",
            "1 British Pound Sterling = 183.42 Japanese Yen",
        )
        .unwrap();
        assert_eq!(item.code, "JPY");
        assert_eq!(item.name, "Japanese Yen");
        assert_eq!(item.country, "");
        assert_eq!(item.rate, 183.42);
    }

    #[test]
    fn test_build_item_drops_zero_rate() {
        assert!(build_item("GBP/AED", "1 GBP = 0 AED").is_none());
    }

    #[test]
    fn test_build_item_drops_missing_code() {
        assert!(build_item("pounds", "1 GBP = 4.9 AED").is_none());
    }

    proptest! {
        #[test]
        fn prop_extraction_never_panics(title in ".{0,64}", desc in ".{0,128}") {
            let _ = build_item(&title, &desc);
        }

        #[test]
        fn prop_built_items_are_valid(title in "[A-Za-z()/ ]{0,40}", desc in "[0-9.,A-Z =]{0,40}") {
            if let Some(item) = build_item(&title, &desc) {
                prop_assert_eq!(item.code.len(), 3);
                prop_assert!(item.rate.is_finite() && item.rate > 0.0);
                prop_assert!(!item.name.is_empty());
            }
        }
    }
}
