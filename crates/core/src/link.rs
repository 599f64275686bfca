//! Parsing and injection of `Link` response header relations (RFC 8288).

use crate::routing;
use axum::http::{HeaderMap, HeaderValue, Uri, header};
use core::fmt;
use tracing::{debug, warn};

/// Relation type of the canonical, human-facing resource.
pub const REL_CANONICAL: &str = "canonical";
/// Relation type used for the terms of service link.
pub const REL_TERMS_OF_SERVICE: &str = "terms-of-service";
/// Relation type used for the pricing link.
pub const REL_PAYMENT: &str = "payment";

const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// A single entry of a `Link` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEntry {
    raw: String,
    target: String,
    relations: Vec<String>,
}

impl LinkEntry {
    /// Create an entry with a single relation.
    pub fn new(target: &str, relation: &str) -> Self {
        Self {
            raw: format!(r#"<{target}>; rel="{relation}""#),
            target: target.to_owned(),
            relations: vec![relation.to_ascii_lowercase()],
        }
    }

    fn parse(raw: &str) -> Self {
        let mut params = split_unquoted(raw, ';').into_iter();
        let target = params
            .next()
            .map(|t| t.trim().trim_start_matches('<').trim_end_matches('>'))
            .unwrap_or_default()
            .to_owned();
        let relations = params
            .filter_map(|param| {
                let (name, value) = param.split_once('=')?;
                name.trim()
                    .eq_ignore_ascii_case("rel")
                    .then(|| value.trim().trim_matches('"'))
            })
            .flat_map(str::split_whitespace)
            .map(str::to_ascii_lowercase)
            .collect();
        Self {
            raw: raw.to_owned(),
            target,
            relations,
        }
    }

    /// The URI reference between the angle brackets.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Lowercased relation types carried by this entry.
    pub fn relations(&self) -> &[String] {
        &self.relations
    }
}

impl fmt::Display for LinkEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// The full set of entries carried by the `Link` headers of a response.
///
/// Entries read from the origin keep their exact original text when
/// serialized again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkHeader {
    entries: Vec<LinkEntry>,
}

impl LinkHeader {
    /// Parse a `Link` header value.
    pub fn parse(value: &str) -> Self {
        Self {
            entries: split_unquoted(value, ',')
                .into_iter()
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(LinkEntry::parse)
                .collect(),
        }
    }

    /// Read every `Link` header line from a header map as one list.
    ///
    /// Lines carrying non-ASCII bytes are decoded lossily, which is enough to
    /// detect their relations.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let joined = headers
            .get_all(header::LINK)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()))
            .collect::<Vec<_>>()
            .join(", ");
        Self::parse(&joined)
    }

    /// All entries in header order.
    pub fn entries(&self) -> &[LinkEntry] {
        &self.entries
    }

    /// Whether any entry has a relation type accepted by `matches`.
    pub fn has_relation(&self, matches: impl Fn(&str) -> bool) -> bool {
        self.entries
            .iter()
            .flat_map(|entry| entry.relations.iter())
            .any(|rel| matches(rel.as_str()))
    }

    /// Append an entry to the end of the list.
    pub fn push(&mut self, entry: LinkEntry) {
        self.entries.push(entry);
    }
}

impl fmt::Display for LinkHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            entry.fmt(f)?;
        }
        Ok(())
    }
}

/// Split on `separator` where it is outside of `<...>` and double quotes.
fn split_unquoted(value: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut in_target = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' if !in_target => in_quotes = !in_quotes,
            '<' if !in_quotes => in_target = true,
            '>' if !in_quotes => in_target = false,
            c if c == separator && !in_quotes && !in_target => {
                parts.push(&value[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts
}

/// Policy links advertised on every LLM endpoint response.
#[derive(Debug, Clone, Default)]
pub struct PolicyLinks {
    /// Target of the `terms-of-service` relation.
    pub terms_url: Option<String>,
    /// Target of the `payment` relation.
    pub pricing_url: Option<String>,
}

/// Add the canonical and policy relations that are not already present.
///
/// `canonical` is the canonical URI of the requested resource, if one could be
/// derived. New entries go out as one extra `Link` line after the origin's
/// lines, which are never rewritten. Returns whether a line was added.
pub fn inject(headers: &mut HeaderMap, canonical: Option<&str>, policy: &PolicyLinks) -> bool {
    let mut links = LinkHeader::from_headers(headers);
    let original_len = links.entries().len();

    if let Some(canonical) = canonical
        && !links.has_relation(|rel| rel == REL_CANONICAL)
    {
        links.push(LinkEntry::new(canonical, REL_CANONICAL));
    }
    if let Some(terms_url) = &policy.terms_url
        && !links.has_relation(|rel| rel.starts_with("terms"))
    {
        links.push(LinkEntry::new(terms_url, REL_TERMS_OF_SERVICE));
    }
    if let Some(pricing_url) = &policy.pricing_url
        && !links.has_relation(|rel| rel.starts_with("pricing") || rel.starts_with("payment"))
    {
        links.push(LinkEntry::new(pricing_url, REL_PAYMENT));
    }

    let added = LinkHeader {
        entries: links.entries.split_off(original_len),
    };
    if added.entries().is_empty() {
        return false;
    }
    match HeaderValue::from_str(&added.to_string()) {
        Ok(value) => {
            headers.append(header::LINK, value);
            true
        }
        Err(err) => {
            warn!("Unable to encode Link header, leaving it untouched: {err:?}");
            false
        }
    }
}

/// Work out the canonical URI for an LLM endpoint request.
///
/// The scheme comes from the request URI, then `X-Forwarded-Proto`, then
/// `default_scheme`. The host comes from the request URI, then
/// `X-Forwarded-Host`, then `Host`.
pub fn canonical_uri(uri: &Uri, headers: &HeaderMap, default_scheme: &str) -> Option<String> {
    let path = routing::canonical_path(uri.path())?;
    let scheme = uri
        .scheme_str()
        .or_else(|| first_header_token(headers, X_FORWARDED_PROTO))
        .unwrap_or(default_scheme);
    let Some(host) = uri
        .authority()
        .map(|a| a.as_str())
        .or_else(|| first_header_token(headers, X_FORWARDED_HOST))
        .or_else(|| first_header_token(headers, header::HOST.as_str()))
    else {
        debug!("No host available for request to {path}, skipping canonical link");
        return None;
    };
    Some(format!("{scheme}://{host}{path}"))
}

fn first_header_token<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
