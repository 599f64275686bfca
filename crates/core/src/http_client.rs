use anyhow::Result;
use reqwest::redirect::Policy;
use std::time::Duration;

pub type HttpClient = reqwest::Client;

pub struct BuildHttpClientArgs {
    pub allow_invalid_certs: bool,
    pub request_timeout: Duration,
}

/// Create a new [`HttpClient`] for talking to the origin.
///
/// Redirects are handed back to the caller untouched and response bodies are
/// never decompressed, so the client sees exactly what the origin sent.
pub fn build_http_client(args: BuildHttpClientArgs) -> Result<HttpClient> {
    Ok(reqwest::ClientBuilder::default()
        .redirect(Policy::none())
        .danger_accept_invalid_certs(args.allow_invalid_certs)
        .connect_timeout(Duration::from_secs(5))
        .timeout(args.request_timeout)
        .build()?)
}
