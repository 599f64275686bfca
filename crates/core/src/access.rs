//! API key access guard for LLM endpoints.

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use std::collections::HashSet;
use subtle::{Choice, ConstantTimeEq};

/// Request header carrying an API key when no bearer token is sent.
pub const API_KEY_HEADER: &str = "x-api-key";

const BEARER_PREFIX: &str = "bearer ";
const WWW_AUTHENTICATE_CHALLENGE: &str = r#"Bearer realm="tct""#;

/// How requests to LLM endpoints are authorized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthMode {
    /// Every request is let through.
    #[default]
    Open,
    /// Requests must present a key from the configured allow-list.
    ApiKey,
}

impl AuthMode {
    /// Interpret the raw `AUTH_MODE` setting.
    ///
    /// Only the exact value `api_key` turns the guard on, anything else leaves it off.
    pub fn from_setting(value: Option<&str>) -> Self {
        match value {
            Some("api_key") => Self::ApiKey,
            _ => Self::Open,
        }
    }
}

/// Set of API keys that are allowed to access LLM endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiKeys(HashSet<String>);

impl ApiKeys {
    /// Parse a comma separated list of keys, trimming each entry and dropping empty ones.
    pub fn parse(list: &str) -> Self {
        list.split(',').collect()
    }

    /// Whether the trimmed credential is exactly one of the allowed keys.
    ///
    /// Every key is compared in constant time and the scan never stops early.
    pub fn contains(&self, credential: &str) -> bool {
        let credential = credential.trim().as_bytes();
        self.0
            .iter()
            .fold(Choice::from(0), |found, key| {
                found | key.as_bytes().ct_eq(credential)
            })
            .into()
    }

    /// Number of allowed keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no key is allowed at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for ApiKeys {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|key| key.as_ref().trim().to_owned())
                .filter(|key| !key.is_empty())
                .collect(),
        )
    }
}

/// Check the credentials on a request against the allow-list.
///
/// A bearer token from `Authorization` is tried first, then `X-API-Key`.
pub fn is_authorized(headers: &HeaderMap, keys: &ApiKeys) -> bool {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);
    let api_key = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());

    [bearer, api_key]
        .into_iter()
        .flatten()
        .any(|credential| keys.contains(credential))
}

fn bearer_token(authorization: &str) -> Option<&str> {
    let prefix = authorization.get(..BEARER_PREFIX.len())?;
    prefix
        .eq_ignore_ascii_case(BEARER_PREFIX)
        .then(|| &authorization[BEARER_PREFIX.len()..])
}

/// The response sent in place of the origin's when a request is not authorized.
pub fn unauthorized_response() -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static(WWW_AUTHENTICATE_CHALLENGE),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(*name, HeaderValue::from_static(*value));
        }
        headers
    }

    #[test]
    fn test_auth_mode_from_setting() {
        assert_eq!(AuthMode::from_setting(Some("api_key")), AuthMode::ApiKey);
        assert_eq!(AuthMode::from_setting(Some("API_KEY")), AuthMode::Open);
        assert_eq!(AuthMode::from_setting(Some("")), AuthMode::Open);
        assert_eq!(AuthMode::from_setting(None), AuthMode::Open);
    }

    #[test]
    fn test_api_keys_parse() {
        let keys = ApiKeys::parse(" alpha, beta ,,gamma,  ");
        assert_eq!(keys.len(), 3);
        assert!(keys.contains("alpha"));
        assert!(keys.contains("beta"));
        assert!(keys.contains("gamma"));
        assert!(!keys.contains(""));
        assert!(ApiKeys::parse(" , ,").is_empty());
    }

    #[test]
    fn test_api_keys_contains_exact_matches_only() {
        let keys = ApiKeys::parse("alpha-key,beta-key");
        assert!(keys.contains("alpha-key"));
        assert!(keys.contains(" beta-key "));
        assert!(!keys.contains("alpha"));
        assert!(!keys.contains("alpha-key-2"));
        assert!(!keys.contains("ALPHA-KEY"));
        assert!(!ApiKeys::default().contains("alpha-key"));
    }

    #[test]
    fn test_bearer_token() {
        let keys = ApiKeys::parse("secret");
        assert!(is_authorized(
            &headers(&[("authorization", "Bearer secret")]),
            &keys
        ));
        assert!(is_authorized(
            &headers(&[("authorization", "bearer secret")]),
            &keys
        ));
        assert!(is_authorized(
            &headers(&[("authorization", "BEARER  secret ")]),
            &keys
        ));
        assert!(!is_authorized(
            &headers(&[("authorization", "Basic secret")]),
            &keys
        ));
        assert!(!is_authorized(&headers(&[("authorization", "secret")]), &keys));
        assert!(!is_authorized(
            &headers(&[("authorization", "Bearer SECRET")]),
            &keys
        ));
    }

    #[test]
    fn test_api_key_header_fallback() {
        let keys = ApiKeys::parse("secret");
        assert!(is_authorized(&headers(&[("x-api-key", " secret")]), &keys));
        assert!(is_authorized(
            &headers(&[("authorization", "Bearer wrong"), ("x-api-key", "secret")]),
            &keys
        ));
        assert!(!is_authorized(&headers(&[("x-api-key", "other")]), &keys));
        assert!(!is_authorized(&HeaderMap::new(), &keys));
    }

    #[test]
    fn test_unauthorized_response() {
        let response = unauthorized_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            r#"Bearer realm="tct""#
        );
    }
}
