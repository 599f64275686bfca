//! Signed usage receipts attached to LLM endpoint responses.
//!
//! A receipt looks like
//! `contract=pilotX; status=200; bytes=100; etag="abc"; ts=2026-10-19T08:30:00.123Z; sig=<base64>`.
//! The signature is an HMAC-SHA256 over the exact text before `; sig=`, encoded
//! with standard padded base64.

use axum::http::{HeaderMap, StatusCode, header};
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, SecondsFormat, Utc};
use core::fmt;
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Response header the receipt is written to.
pub const RECEIPT_HEADER: &str = "ai-usage-receipt";

/// Request header naming the usage contract of the caller.
pub const CONTRACT_HEADER: &str = "x-ai-contract";

const SIGNATURE_SEPARATOR: &str = "; sig=";

type HmacSha256 = Hmac<Sha256>;

/// Errors raised while creating or checking receipts.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReceiptError {
    /// The signing key has no key material.
    #[error("receipt signing key must not be empty")]
    EmptyKey,
    /// The receipt text does not follow the receipt format.
    #[error("malformed receipt: {0}")]
    Malformed(&'static str),
    /// The signature is not valid base64.
    #[error("receipt signature is not valid base64")]
    SignatureEncoding,
    /// The signature does not match the payload.
    #[error("receipt signature does not match its payload")]
    SignatureMismatch,
}

/// Computes receipt signatures with a key loaded once at start-up.
#[derive(Clone)]
pub struct ReceiptSigner {
    mac: HmacSha256,
}

impl fmt::Debug for ReceiptSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiptSigner").finish_non_exhaustive()
    }
}

impl ReceiptSigner {
    /// Create a signer from raw key material.
    pub fn new(key: &[u8]) -> Result<Self, ReceiptError> {
        Ok(Self { mac: new_mac(key)? })
    }

    /// Sign a payload, returning the base64 encoded MAC.
    pub fn sign(&self, payload: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    /// Build the full receipt header value for a set of fields.
    pub fn receipt(&self, fields: &ReceiptFields) -> String {
        let payload = fields.payload();
        let signature = self.sign(&payload);
        format!("{payload}{SIGNATURE_SEPARATOR}{signature}")
    }
}

fn new_mac(key: &[u8]) -> Result<HmacSha256, ReceiptError> {
    if key.is_empty() {
        return Err(ReceiptError::EmptyKey);
    }
    HmacSha256::new_from_slice(key).map_err(|_| ReceiptError::EmptyKey)
}

/// Check a base64 signature against a payload and key.
pub fn verify(signature: &str, payload: &str, key: &[u8]) -> Result<(), ReceiptError> {
    let signature = general_purpose::STANDARD
        .decode(signature)
        .map_err(|_| ReceiptError::SignatureEncoding)?;
    let mut mac = new_mac(key)?;
    mac.update(payload.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| ReceiptError::SignatureMismatch)
}

/// The signed fields of a receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptFields {
    /// Value of the caller's `X-AI-Contract` header.
    pub contract: String,
    /// Status code returned to the caller.
    pub status: u16,
    /// Number of body bytes delivered.
    pub bytes: u64,
    /// Origin `ETag` with quotes and line breaks removed.
    pub etag: String,
    /// Signing time as an ISO-8601 UTC timestamp.
    pub ts: String,
}

impl ReceiptFields {
    /// Gather the fields for a response, stamping them with `now`.
    pub fn collect(
        contract: String,
        status: StatusCode,
        response_headers: &HeaderMap,
        bytes: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            contract,
            status: status.as_u16(),
            bytes,
            etag: response_headers
                .get(header::ETAG)
                .and_then(|v| v.to_str().ok())
                .map(sanitize_etag)
                .unwrap_or_default(),
            ts: timestamp(now),
        }
    }

    /// The exact text covered by the signature.
    pub fn payload(&self) -> String {
        format!(
            r#"contract={}; status={}; bytes={}; etag="{}"; ts={}"#,
            self.contract, self.status, self.bytes, self.etag, self.ts
        )
    }
}

/// The usage contract named by a request, empty when none is given.
pub fn contract(request_headers: &HeaderMap) -> String {
    request_headers
        .get(CONTRACT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}

/// Remove quotes and line breaks from an `ETag` value.
pub fn sanitize_etag(etag: &str) -> String {
    etag.chars()
        .filter(|c| !matches!(c, '"' | '\r' | '\n'))
        .collect()
}

/// Format an instant the way receipts carry it, e.g. `2026-10-19T08:30:00.123Z`.
pub fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// How many bytes a response reports without reading its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclaredLength {
    /// The count is known from the status code or headers.
    Known(u64),
    /// The body has to be measured.
    Unknown,
}

/// Work out the receipt byte count from status and headers alone.
///
/// `304` always counts zero bytes. `200` uses `Content-Length` when it parses,
/// other statuses count zero.
pub fn declared_length(status: StatusCode, headers: &HeaderMap) -> DeclaredLength {
    match status {
        StatusCode::OK => headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .map_or(DeclaredLength::Unknown, DeclaredLength::Known),
        _ => DeclaredLength::Known(0),
    }
}

/// A receipt read back from an `AI-Usage-Receipt` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageReceipt {
    /// The decoded fields.
    pub fields: ReceiptFields,
    /// The signed text, exactly as it appeared in the header.
    pub payload: String,
    /// The base64 signature.
    pub signature: String,
}

impl UsageReceipt {
    /// Parse a receipt header value.
    pub fn parse(value: &str) -> Result<Self, ReceiptError> {
        let (payload, signature) = value
            .rsplit_once(SIGNATURE_SEPARATOR)
            .ok_or(ReceiptError::Malformed("missing sig field"))?;

        // Every field after `contract` has a fixed shape, so parse from the right.
        let (rest, ts) = payload
            .rsplit_once("; ts=")
            .ok_or(ReceiptError::Malformed("missing ts field"))?;
        let (rest, etag) = rest
            .rsplit_once("; etag=")
            .ok_or(ReceiptError::Malformed("missing etag field"))?;
        let (rest, bytes) = rest
            .rsplit_once("; bytes=")
            .ok_or(ReceiptError::Malformed("missing bytes field"))?;
        let (rest, status) = rest
            .rsplit_once("; status=")
            .ok_or(ReceiptError::Malformed("missing status field"))?;
        let contract = rest
            .strip_prefix("contract=")
            .ok_or(ReceiptError::Malformed("missing contract field"))?;
        let etag = etag
            .strip_prefix('"')
            .and_then(|e| e.strip_suffix('"'))
            .ok_or(ReceiptError::Malformed("etag is not quoted"))?;

        Ok(Self {
            fields: ReceiptFields {
                contract: contract.to_owned(),
                status: status
                    .parse()
                    .map_err(|_| ReceiptError::Malformed("status is not a number"))?,
                bytes: bytes
                    .parse()
                    .map_err(|_| ReceiptError::Malformed("bytes is not a number"))?,
                etag: etag.to_owned(),
                ts: ts.to_owned(),
            },
            payload: payload.to_owned(),
            signature: signature.trim().to_owned(),
        })
    }

    /// Check the receipt's signature with the given key.
    pub fn verify(&self, key: &[u8]) -> Result<(), ReceiptError> {
        verify(&self.signature, &self.payload, key)
    }
}
