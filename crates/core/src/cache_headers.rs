//! Cache header normalization for edge-managed endpoints.

use axum::http::{HeaderMap, HeaderValue, header};

/// `Cache-Control` sent for every edge-managed endpoint.
///
/// Clients always revalidate, while the edge may serve stale content for a
/// minute during revalidation and for a day while the origin is failing.
pub const EDGE_CACHE_CONTROL: &str =
    "max-age=0, must-revalidate, stale-while-revalidate=60, stale-if-error=86400, public";

/// Legacy cache header emitted by LiteSpeed origins.
pub const LITESPEED_CACHE_CONTROL: &str = "x-litespeed-cache-control";

/// Force the edge caching contract onto a set of response headers.
///
/// `ETag`, `Vary` and body-describing headers are left as the origin sent them.
pub fn normalize(headers: &mut HeaderMap) {
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(EDGE_CACHE_CONTROL),
    );
    headers.remove(header::PRAGMA);
    headers.remove(header::EXPIRES);
    headers.remove(LITESPEED_CACHE_CONTROL);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_overwrites_and_strips() {
        let mut headers = HeaderMap::new();
        headers.append(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        headers.append(header::CACHE_CONTROL, HeaderValue::from_static("private"));
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        headers.insert(
            header::EXPIRES,
            HeaderValue::from_static("Thu, 01 Jan 1970 00:00:00 GMT"),
        );
        headers.insert(
            LITESPEED_CACHE_CONTROL,
            HeaderValue::from_static("public,max-age=3600"),
        );
        headers.insert(header::ETAG, HeaderValue::from_static(r#"W/"v1""#));
        headers.insert(header::VARY, HeaderValue::from_static("Accept-Encoding"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));

        normalize(&mut headers);

        let cache_control: Vec<_> = headers.get_all(header::CACHE_CONTROL).iter().collect();
        assert_eq!(cache_control, vec![EDGE_CACHE_CONTROL]);
        assert!(headers.get(header::PRAGMA).is_none());
        assert!(headers.get(header::EXPIRES).is_none());
        assert!(headers.get("X-LiteSpeed-Cache-Control").is_none());
        assert_eq!(headers.get(header::ETAG).unwrap(), r#"W/"v1""#);
        assert_eq!(headers.get(header::VARY).unwrap(), "Accept-Encoding");
        assert_eq!(headers.get(header::CONTENT_LENGTH).unwrap(), "42");
    }

    #[test]
    fn test_normalize_adds_cache_control_when_missing() {
        let mut headers = HeaderMap::new();
        normalize(&mut headers);
        assert_eq!(
            headers.get(header::CACHE_CONTROL).unwrap(),
            EDGE_CACHE_CONTROL
        );
        assert_eq!(headers.len(), 1);
    }
}
