//! Process-wide edge configuration and its start-up validation.

use crate::{
    access::{ApiKeys, AuthMode},
    link::PolicyLinks,
    receipt::ReceiptSigner,
    routing::{DEFAULT_MANIFEST_PATH, DEFAULT_SITEMAP_PATH},
};
use anyhow::{Result, bail};
use axum::http::HeaderValue;
use tracing::warn;
use url::Url;

/// Behaviour of the edge pipeline, shared read-only by every request.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    /// Whether LLM endpoints require an API key.
    pub auth_mode: AuthMode,

    /// Keys accepted when [`AuthMode::ApiKey`] is active.
    pub api_keys: ApiKeys,

    /// Terms and pricing links added to LLM endpoint responses.
    pub policy_links: PolicyLinks,

    /// Signs usage receipts. Receipts are skipped when this is [`None`].
    pub receipt_signer: Option<ReceiptSigner>,

    /// Exact path of the sitemap endpoint.
    pub sitemap_path: String,

    /// Exact path of the manifest endpoint.
    pub manifest_path: String,

    /// Scheme used for canonical links when the request does not say which one the client used.
    pub default_scheme: String,

    /// The most body bytes buffered to count the size of a response without a `Content-Length`.
    ///
    /// Larger responses are still delivered but go out without a receipt.
    pub receipt_max_buffer: u64,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            auth_mode: AuthMode::Open,
            api_keys: ApiKeys::default(),
            policy_links: PolicyLinks::default(),
            receipt_signer: None,
            sitemap_path: DEFAULT_SITEMAP_PATH.to_owned(),
            manifest_path: DEFAULT_MANIFEST_PATH.to_owned(),
            default_scheme: "https".to_owned(),
            receipt_max_buffer: 20_000_000,
        }
    }
}

impl EdgeConfig {
    /// Reject configurations that can never behave sensibly.
    pub fn validate(&self) -> Result<()> {
        for (name, path) in [
            ("sitemap", &self.sitemap_path),
            ("manifest", &self.manifest_path),
        ] {
            if !path.starts_with('/') {
                bail!("The {name} path '{path}' must start with '/'");
            }
        }
        if self.sitemap_path == self.manifest_path {
            bail!(
                "The sitemap and manifest paths must differ, both are '{}'",
                self.sitemap_path
            );
        }
        if self.auth_mode == AuthMode::ApiKey && self.api_keys.is_empty() {
            bail!("API key authentication is enabled but no API keys are configured");
        }
        for (name, link) in [
            ("terms", &self.policy_links.terms_url),
            ("pricing", &self.policy_links.pricing_url),
        ] {
            if let Some(link) = link {
                if Url::parse(link).is_err() {
                    bail!("The {name} URL '{link}' is not an absolute URL");
                }
                if HeaderValue::from_str(link).is_err() || link.contains(['<', '>']) {
                    bail!("The {name} URL '{link}' cannot be sent in a Link header");
                }
            }
        }
        if !matches!(self.default_scheme.as_str(), "http" | "https") {
            bail!(
                "The default scheme must be 'http' or 'https', got '{}'",
                self.default_scheme
            );
        }
        Ok(())
    }
}

/// Build a receipt signer from the raw key setting.
///
/// A missing or empty key turns receipts off.
pub fn receipt_signer_from_key(key: Option<&str>) -> Result<Option<ReceiptSigner>> {
    match key {
        None => Ok(None),
        Some("") => {
            warn!("Receipt signing key is set but empty, usage receipts are disabled");
            Ok(None)
        }
        Some(key) => Ok(Some(ReceiptSigner::new(key.as_bytes())?)),
    }
}
