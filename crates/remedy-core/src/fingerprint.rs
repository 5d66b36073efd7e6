//! Failure fingerprints used as decision-cache keys.
//!
//! A fingerprint hashes the normalized step text, the original locator and
//! a coarse URL pattern. Structurally similar pages (`/orders/17` and
//! `/orders/42`) share a fingerprint; unrelated pages do not.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::types::{FailureContext, Locator};

lazy_static! {
    static ref SCHEME: Regex = Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://").unwrap();

    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();

    static ref LEADING_KEYWORD: Regex =
        Regex::new(r"^(?i)(given|when|then|and|but)\s+").unwrap();

    static ref NUMERIC_SEGMENT: Regex = Regex::new(r"^\d+$").unwrap();

    static ref UUID_SEGMENT: Regex = Regex::new(
        r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$"
    ).unwrap();

    static ref HEX_SEGMENT: Regex = Regex::new(r"^[0-9a-fA-F]{12,}$").unwrap();

    // Long tokens mixing letters and digits (slugs with ids, opaque keys)
    static ref OPAQUE_SEGMENT: Regex = Regex::new(r"^[A-Za-z0-9_-]{16,}$").unwrap();
}

const ID_PLACEHOLDER: &str = ":id";

/// Deterministic cache key for one kind of failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Derive a fingerprint from its three components.
    pub fn derive(step_text: &str, locator: &Locator, page_url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalize_step_text(step_text).as_bytes());
        hasher.update([0u8]);
        hasher.update(locator.strategy.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(locator.value.trim().as_bytes());
        hasher.update([0u8]);
        hasher.update(url_pattern(page_url).as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn for_failure(failure: &FailureContext, page_url: &str) -> Self {
        Self::derive(&failure.step_text, &failure.original_locator, page_url)
    }

    /// Wrap an already-derived fingerprint (e.g. loaded from disk).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for logs.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        &self.0[..end]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase, collapse whitespace, drop the Gherkin keyword.
pub fn normalize_step_text(step_text: &str) -> String {
    let collapsed = WHITESPACE.replace_all(step_text.trim(), " ");
    let stripped = LEADING_KEYWORD.replace(&collapsed, "");
    stripped.to_lowercase()
}

/// Reduce a URL to `host/path` with identifier segments replaced by `:id`.
///
/// Scheme, credentials, port, query string and fragment are dropped.
pub fn url_pattern(url: &str) -> String {
    let without_scheme = SCHEME.replace(url.trim(), "");
    let without_query = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or_default();

    let (authority, path) = match without_query.find('/') {
        Some(idx) => (&without_query[..idx], &without_query[idx..]),
        None => (without_query, ""),
    };

    let host = authority
        .rsplit('@')
        .next()
        .unwrap_or_default()
        .split(':')
        .next()
        .unwrap_or_default()
        .to_lowercase();

    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(normalize_segment)
        .collect();

    if segments.is_empty() {
        host
    } else {
        format!("{}/{}", host, segments.join("/"))
    }
}

fn normalize_segment(segment: &str) -> &str {
    let is_identifier = NUMERIC_SEGMENT.is_match(segment)
        || UUID_SEGMENT.is_match(segment)
        || HEX_SEGMENT.is_match(segment)
        || (OPAQUE_SEGMENT.is_match(segment) && segment.chars().any(|c| c.is_ascii_digit()));

    if is_identifier {
        ID_PLACEHOLDER
    } else {
        segment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_url_pattern_normalizes_ids() {
        assert_eq!(
            url_pattern("https://shop.test/orders/1234/items?page=2#top"),
            "shop.test/orders/:id/items"
        );
        assert_eq!(
            url_pattern("http://user:pw@Shop.Test:8080/u/550e8400-e29b-41d4-a716-446655440000"),
            "shop.test/u/:id"
        );
        assert_eq!(
            url_pattern("https://shop.test/c/5f2b9c1e8a7d4b3c"),
            "shop.test/c/:id"
        );
        assert_eq!(url_pattern("https://shop.test"), "shop.test");
        assert_eq!(url_pattern("https://shop.test/checkout/"), "shop.test/checkout");
    }

    #[test]
    fn test_url_pattern_keeps_words() {
        assert_eq!(
            url_pattern("https://shop.test/account/settings"),
            "shop.test/account/settings"
        );
        // Long all-letter slugs are kept
        assert_eq!(
            url_pattern("https://shop.test/blog/understanding-locators"),
            "shop.test/blog/understanding-locators"
        );
    }

    #[test]
    fn test_normalize_step_text() {
        assert_eq!(
            normalize_step_text("  When   I click   the Buy button "),
            "i click the buy button"
        );
        assert_eq!(normalize_step_text("Then I see it"), "i see it");
    }

    #[test]
    fn test_similar_pages_share_fingerprint() {
        let locator = Locator::css("button.buy");
        let a = Fingerprint::derive("When I click buy", &locator, "https://shop.test/p/17");
        let b = Fingerprint::derive("when i click  buy", &locator, "https://shop.test/p/42?ref=x");
        assert_eq!(a, b);
    }

    #[test]
    fn test_unrelated_pages_do_not_collide() {
        let locator = Locator::css("button.buy");
        let a = Fingerprint::derive("When I click buy", &locator, "https://shop.test/p/17");
        let b = Fingerprint::derive("When I click buy", &locator, "https://shop.test/cart");
        assert_ne!(a, b);

        let c = Fingerprint::derive("When I click buy", &Locator::id("buy"), "https://shop.test/p/17");
        assert_ne!(a, c);
    }

    #[test]
    fn test_short_prefix() {
        let fp = Fingerprint::derive("x", &Locator::id("y"), "https://a.test");
        assert_eq!(fp.as_str().len(), 64);
        assert_eq!(fp.short().len(), 12);
    }

    proptest! {
        #[test]
        fn prop_fingerprint_is_deterministic(step in ".{0,40}", value in "[a-z#.]{1,20}", id in 0u64..1_000_000) {
            let locator = Locator::css(value);
            let url = format!("https://app.test/items/{}", id);
            prop_assert_eq!(
                Fingerprint::derive(&step, &locator, &url),
                Fingerprint::derive(&step, &locator, &url)
            );
        }

        #[test]
        fn prop_numeric_segments_collapse(a in 0u64..u64::MAX, b in 0u64..u64::MAX) {
            prop_assert_eq!(
                url_pattern(&format!("https://app.test/items/{}", a)),
                url_pattern(&format!("https://app.test/items/{}", b))
            );
        }
    }
}
