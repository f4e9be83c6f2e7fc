//! Cache validators and cache-control directives
//!
//! Two cache layers sit in front of every response this crate produces:
//! - the browser, governed by `Cache-Control`
//! - the CDN/edge, governed by its own header (`CDN-Cache-Control` by default)
//!
//! The two directive sets are configured independently through
//! [`CachePolicy`]. Validators are content-derived (SHA-256 of the exact
//! body), never time-derived, so identical bodies always produce identical
//! ETags and conditional requests can be answered with `304 Not Modified`.

use http::header::{CACHE_CONTROL, ETAG};
use http::response::Builder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Content-derived entity tag. Always stored in its quoted (strong) form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Validator(String);

impl Validator {
    /// The quoted header value, e.g. `"9f86d0..."`
    pub fn as_header(&self) -> &str {
        &self.0
    }

    /// The opaque tag without quotes
    pub fn opaque(&self) -> &str {
        self.0.trim_matches('"')
    }
}

impl fmt::Display for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn hex_digest(hasher: Sha256) -> String {
    hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

/// Compute the validator of a serialized response body
pub fn compute_validator(body: &[u8]) -> Validator {
    let mut hasher = Sha256::new();
    hasher.update(body);
    Validator(format!("\"{}\"", hex_digest(hasher)))
}

/// Compute a validator over several inputs.
///
/// Each part is length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn derive_validator(parts: &[&[u8]]) -> Validator {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    Validator(format!("\"{}\"", hex_digest(hasher)))
}

/// Evaluate an `If-None-Match` header against the current validator.
///
/// Weak prefixes (`W/`) are ignored, quoted and unquoted tags are accepted,
/// and comma-separated lists and `*` are honoured.
pub fn is_not_modified(if_none_match: Option<&str>, current: &Validator) -> bool {
    let header = match if_none_match {
        Some(h) => h.trim(),
        None => return false,
    };
    if header.is_empty() {
        return false;
    }
    if header == "*" {
        return true;
    }

    header.split(',').any(|candidate| {
        let candidate = candidate.trim();
        let candidate = candidate.strip_prefix("W/").unwrap_or(candidate);
        candidate.trim_matches('"') == current.opaque()
    })
}

/// Browser and CDN cache-control directives for one class of response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Browser freshness window in seconds (`max-age`)
    #[serde(default = "default_browser_max_age")]
    pub browser_max_age: u64,

    /// Browser stale-while-revalidate allowance in seconds
    #[serde(default = "default_swr")]
    pub browser_stale_while_revalidate: u64,

    /// Shared (CDN) freshness window in seconds (`s-maxage`)
    #[serde(default = "default_cdn_max_age")]
    pub cdn_max_age: u64,

    /// CDN stale-while-revalidate allowance in seconds
    #[serde(default = "default_swr")]
    pub cdn_stale_while_revalidate: u64,

    /// Header the CDN reads its directives from
    #[serde(default = "default_cdn_header")]
    pub cdn_header: String,
}

fn default_browser_max_age() -> u64 {
    60
}

fn default_cdn_max_age() -> u64 {
    300
}

fn default_swr() -> u64 {
    86400
}

fn default_cdn_header() -> String {
    "CDN-Cache-Control".to_string()
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::data()
    }
}

impl CachePolicy {
    /// Policy for the record-listing data endpoint
    pub fn data() -> Self {
        CachePolicy {
            browser_max_age: default_browser_max_age(),
            browser_stale_while_revalidate: default_swr(),
            cdn_max_age: default_cdn_max_age(),
            cdn_stale_while_revalidate: default_swr(),
            cdn_header: default_cdn_header(),
        }
    }

    /// Policy for rewritten pages. The CDN window is shorter than for data
    /// because the page embeds a live record count.
    pub fn page() -> Self {
        CachePolicy {
            browser_max_age: 60,
            browser_stale_while_revalidate: default_swr(),
            cdn_max_age: 60,
            cdn_stale_while_revalidate: default_swr(),
            cdn_header: default_cdn_header(),
        }
    }

    /// `Cache-Control` value for browsers
    pub fn browser_directive(&self) -> String {
        format!(
            "public, max-age={}, stale-while-revalidate={}",
            self.browser_max_age, self.browser_stale_while_revalidate
        )
    }

    /// Value of the CDN-facing header
    pub fn cdn_directive(&self) -> String {
        format!(
            "public, s-maxage={}, stale-while-revalidate={}",
            self.cdn_max_age, self.cdn_stale_while_revalidate
        )
    }

    /// Both directive headers as `(name, value)` pairs
    pub fn header_pairs(&self) -> [(String, String); 2] {
        [
            (CACHE_CONTROL.as_str().to_string(), self.browser_directive()),
            (self.cdn_header.clone(), self.cdn_directive()),
        ]
    }

    /// Stamp both directive headers and the validator onto a response builder
    pub fn stamp(&self, builder: Builder, validator: Option<&Validator>) -> Builder {
        let mut builder = builder
            .header(CACHE_CONTROL, self.browser_directive())
            .header(self.cdn_header.as_str(), self.cdn_directive());
        if let Some(v) = validator {
            builder = builder.header(ETAG, v.as_header());
        }
        builder
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.browser_max_age == 0 {
            return Err("browser_max_age must be greater than 0".to_string());
        }
        if http::HeaderName::from_bytes(self.cdn_header.as_bytes()).is_err() {
            return Err(format!("invalid cdn_header '{}'", self.cdn_header));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validator_is_content_derived() {
        let a = compute_validator(b"{\"records\":[]}");
        let b = compute_validator(b"{\"records\":[]}");
        let c = compute_validator(b"{\"records\":[1]}");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_header().starts_with('"') && a.as_header().ends_with('"'));
        assert_eq!(a.opaque().len(), 64);
    }

    #[test]
    fn test_not_modified_matching() {
        let v = compute_validator(b"body");
        let quoted = v.as_header().to_string();
        let bare = v.opaque().to_string();

        assert!(is_not_modified(Some(&quoted), &v));
        assert!(is_not_modified(Some(&bare), &v));
        assert!(is_not_modified(Some(&format!("W/{}", quoted)), &v));
        assert!(is_not_modified(Some(&format!("\"other\", {}", quoted)), &v));
        assert!(is_not_modified(Some("*"), &v));

        assert!(!is_not_modified(None, &v));
        assert!(!is_not_modified(Some(""), &v));
        assert!(!is_not_modified(Some("\"stale\""), &v));
    }

    #[test]
    fn test_derive_validator_is_length_prefixed() {
        let a = derive_validator(&[b"ab", b"c"]);
        let b = derive_validator(&[b"a", b"bc"]);
        assert_ne!(a, b);
        assert_eq!(a, derive_validator(&[b"ab", b"c"]));
    }

    #[test]
    fn test_directives() {
        let data = CachePolicy::data();
        assert_eq!(
            data.browser_directive(),
            "public, max-age=60, stale-while-revalidate=86400"
        );
        assert_eq!(
            data.cdn_directive(),
            "public, s-maxage=300, stale-while-revalidate=86400"
        );
    }

    #[test]
    fn test_policies_are_independent() {
        let mut policy = CachePolicy::data();
        policy.cdn_max_age = 900;
        assert_eq!(
            policy.browser_directive(),
            CachePolicy::data().browser_directive()
        );
        assert!(policy.cdn_directive().contains("s-maxage=900"));
    }

    #[test]
    fn test_stamp_headers() {
        let v = compute_validator(b"x");
        let response = CachePolicy::page()
            .stamp(http::Response::builder(), Some(&v))
            .body(())
            .unwrap();
        assert_eq!(
            response.headers().get("cache-control").unwrap(),
            "public, max-age=60, stale-while-revalidate=86400"
        );
        assert!(response.headers().get("cdn-cache-control").is_some());
        assert_eq!(response.headers().get("etag").unwrap(), v.as_header());
    }

    #[test]
    fn test_validate_policy() {
        let mut policy = CachePolicy::data();
        assert!(policy.validate().is_ok());
        policy.cdn_header = "bad header".into();
        assert!(policy.validate().is_err());
        policy = CachePolicy::data();
        policy.browser_max_age = 0;
        assert!(policy.validate().is_err());
    }
}
