//! Resource metadata: entity tags, modification times, and conditional
//! request evaluation.
//!
//! Entity tags are the lowercase hex SHA-256 of the canonical resource
//! body. Comparison is weak (RFC 9110 §8.8.3.2): a `W/` prefix on either
//! side is ignored.

use axum::http::header::{self, HeaderMap, HeaderValue};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// ETag and Last-Modified carried by every cacheable resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMetadata {
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

impl ResourceMetadata {
    /// Builds metadata for a body, stamped now.
    pub fn for_body(body: &[u8]) -> Self {
        Self {
            etag: sha256_hex(body),
            last_modified: Utc::now(),
        }
    }

    pub fn with_time(body: &[u8], last_modified: DateTime<Utc>) -> Self {
        Self {
            etag: sha256_hex(body),
            last_modified,
        }
    }

    /// Quoted form for the `ETag` response header.
    pub fn etag_header_value(&self) -> String {
        format!("\"{}\"", self.etag)
    }

    /// HTTP-date form for the `Last-Modified` response header.
    pub fn last_modified_header_value(&self) -> String {
        http_date(&self.last_modified)
    }

    /// Applies ETag, Last-Modified, and optionally Cache-Control to a
    /// response header map.
    pub fn apply(&self, headers: &mut HeaderMap, max_age: Option<u32>) {
        if let Ok(v) = HeaderValue::from_str(&self.etag_header_value()) {
            headers.insert(header::ETAG, v);
        }
        if let Ok(v) = HeaderValue::from_str(&self.last_modified_header_value()) {
            headers.insert(header::LAST_MODIFIED, v);
        }
        if let Some(secs) = max_age {
            if let Ok(v) = HeaderValue::from_str(&format!("max-age={secs}")) {
                headers.insert(header::CACHE_CONTROL, v);
            }
        }
    }
}

/// Lowercase hex SHA-256 of a byte string.
pub fn sha256_hex(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// RFC 9110 HTTP-date (IMF-fixdate), e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(t: &DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Strips the weak prefix and surrounding quotes from an entity tag.
fn opaque_tag(raw: &str) -> &str {
    let raw = raw.trim();
    let raw = raw.strip_prefix("W/").unwrap_or(raw);
    raw.trim_matches('"')
}

/// Weak entity tag comparison.
pub fn etag_weak_eq(a: &str, b: &str) -> bool {
    opaque_tag(a) == opaque_tag(b)
}

/// Evaluates `If-None-Match` against the current tag.
/// Returns true when the request should short-circuit with 304.
pub fn if_none_match_satisfied(headers: &HeaderMap, current: &ResourceMetadata) -> bool {
    let Some(value) = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    if value.trim() == "*" {
        return true;
    }
    value
        .split(',')
        .any(|candidate| etag_weak_eq(candidate, &current.etag))
}

/// Evaluates `If-Match` against the current tag.
/// Returns false when the precondition fails (caller responds 412).
pub fn if_match_satisfied(headers: &HeaderMap, current: &ResourceMetadata) -> bool {
    let Some(value) = headers.get(header::IF_MATCH).and_then(|v| v.to_str().ok()) else {
        return true;
    };
    if value.trim() == "*" {
        return true;
    }
    value
        .split(',')
        .any(|candidate| etag_weak_eq(candidate, &current.etag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn http_date_is_imf_fixdate() {
        let t = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        assert_eq!(http_date(&t), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn etag_comparison_is_weak() {
        assert!(etag_weak_eq("\"abc\"", "W/\"abc\""));
        assert!(etag_weak_eq("abc", "\"abc\""));
        assert!(!etag_weak_eq("\"abc\"", "\"abd\""));
    }

    #[test]
    fn if_none_match_matches_current_tag() {
        let meta = ResourceMetadata::for_body(b"body");
        let mut headers = HeaderMap::new();
        headers.insert(
            header::IF_NONE_MATCH,
            HeaderValue::from_str(&meta.etag_header_value()).unwrap(),
        );
        assert!(if_none_match_satisfied(&headers, &meta));
    }

    #[test]
    fn if_none_match_stale_tag_misses() {
        let meta = ResourceMetadata::for_body(b"body");
        let mut headers = HeaderMap::new();
        headers.insert(header::IF_NONE_MATCH, HeaderValue::from_static("\"stale\""));
        assert!(!if_none_match_satisfied(&headers, &meta));
    }

    #[test]
    fn if_none_match_star_always_matches() {
        let meta = ResourceMetadata::for_body(b"body");
        let mut headers = HeaderMap::new();
        headers.insert(header::IF_NONE_MATCH, HeaderValue::from_static("*"));
        assert!(if_none_match_satisfied(&headers, &meta));
    }

    #[test]
    fn if_match_absent_is_satisfied() {
        let meta = ResourceMetadata::for_body(b"body");
        assert!(if_match_satisfied(&HeaderMap::new(), &meta));
    }

    #[test]
    fn if_match_mismatch_fails() {
        let meta = ResourceMetadata::for_body(b"body");
        let mut headers = HeaderMap::new();
        headers.insert(header::IF_MATCH, HeaderValue::from_static("\"other\""));
        assert!(!if_match_satisfied(&headers, &meta));
    }

    #[test]
    fn if_match_list_matches_any_member() {
        let meta = ResourceMetadata::for_body(b"body");
        let list = format!("\"zzz\", {}", meta.etag_header_value());
        let mut headers = HeaderMap::new();
        headers.insert(header::IF_MATCH, HeaderValue::from_str(&list).unwrap());
        assert!(if_match_satisfied(&headers, &meta));
    }

    #[test]
    fn apply_sets_cache_control_when_requested() {
        let meta = ResourceMetadata::for_body(b"body");
        let mut headers = HeaderMap::new();
        meta.apply(&mut headers, Some(60));
        assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), "max-age=60");
        assert!(headers.contains_key(header::ETAG));
        assert!(headers.contains_key(header::LAST_MODIFIED));
    }
}
