use anyhow::{Context, Result};
use bytesize::ByteSize;
use clap::{
    Parser, Subcommand,
    builder::{
        Styles,
        styling::{AnsiColor, Effects},
    },
};
use core::{net::SocketAddr, time::Duration};
use dotenvy::dotenv;
use tct_edge::{
    EdgeConfig, EdgeServer, EdgeServerSettings, OriginSettings,
    access::{ApiKeys, AuthMode},
    config::receipt_signer_from_key,
    link::PolicyLinks,
    receipt::UsageReceipt,
    routing::{DEFAULT_MANIFEST_PATH, DEFAULT_SITEMAP_PATH},
    url::Url,
};
use tracing_subscriber::EnvFilter;

fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::BrightMagenta.on_default() | Effects::BOLD)
        .usage(AnsiColor::BrightMagenta.on_default() | Effects::BOLD)
        .literal(AnsiColor::BrightGreen.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default())
}

#[derive(Parser)]
#[command(
    author,
    version,
    about,
    long_about,
    styles = styles(),
    subcommand_negates_reqs = true
)]
struct Arguments {
    #[command(subcommand)]
    command: Option<Command>,

    /// Internet socket address that the server should be ran on.
    #[arg(long = "address", env = "TCT_ADDRESS", default_value = "127.0.0.1:3600")]
    address: SocketAddr,

    /// Base URL of the origin server that requests are forwarded to.
    #[arg(long = "origin-url", env = "TCT_ORIGIN_URL", required = true)]
    origin_url: Option<Url>,

    /// The maximum lifetime of an incoming request before it is forcefully terminated (in seconds).
    #[arg(
        long = "request-timeout",
        env = "TCT_REQUEST_TIMEOUT",
        default_value_t = 60
    )]
    request_timeout: u64,

    /// The maximum lifetime of an origin request before it is forcefully terminated (in seconds).
    #[arg(
        long = "origin-request-timeout",
        env = "TCT_ORIGIN_REQUEST_TIMEOUT",
        default_value_t = 30
    )]
    origin_request_timeout: u64,

    /// Allow invalid TLS certificates when making origin requests (DANGEROUS).
    #[arg(
        long = "origin-allow-invalid-certs",
        env = "TCT_ORIGIN_ALLOW_INVALID_CERTS",
        default_value_t = false
    )]
    origin_allow_invalid_certs: bool,

    /// Authentication mode for LLM endpoints. `api_key` requires a key from `--api-keys`,
    /// any other value leaves the endpoints open.
    #[arg(long = "auth-mode", env = "AUTH_MODE")]
    auth_mode: Option<String>,

    /// API keys accepted as a bearer token or through the `X-API-Key` header.
    #[arg(long = "api-keys", env = "API_KEYS", value_delimiter = ',')]
    api_keys: Vec<String>,

    /// Terms of service URL advertised on LLM endpoint responses.
    #[arg(long = "terms-url", env = "TERMS_URL")]
    terms_url: Option<String>,

    /// Pricing URL advertised on LLM endpoint responses.
    #[arg(long = "pricing-url", env = "PRICING_URL")]
    pricing_url: Option<String>,

    /// Secret used to sign usage receipts. Receipts are not sent when this is unset or empty.
    #[arg(long = "receipt-hmac-key", env = "RECEIPT_HMAC_KEY", hide_env_values = true)]
    receipt_hmac_key: Option<String>,

    /// Maximum amount of a response body that is buffered to count its size when the
    /// origin does not send a Content-Length.
    ///
    /// Responses larger than this are still sent, but without a usage receipt.
    #[arg(
        long = "receipt-max-buffer",
        env = "TCT_RECEIPT_MAX_BUFFER",
        default_value = "20MB"
    )]
    receipt_max_buffer: ByteSize,

    /// Path of the sitemap endpoint.
    #[arg(long = "sitemap-path", env = "SITEMAP_PATH", default_value = DEFAULT_SITEMAP_PATH)]
    sitemap_path: String,

    /// Path of the manifest endpoint.
    #[arg(long = "manifest-path", env = "MANIFEST_PATH", default_value = DEFAULT_MANIFEST_PATH)]
    manifest_path: String,

    /// Scheme used in canonical links when the request does not carry one.
    #[arg(
        long = "default-scheme",
        env = "TCT_DEFAULT_SCHEME",
        default_value = "https"
    )]
    default_scheme: String,
}

#[derive(Subcommand)]
enum Command {
    /// Check the signature of an `AI-Usage-Receipt` header value and print its fields.
    VerifyReceipt {
        /// Secret the receipt was signed with.
        #[arg(long = "key", env = "RECEIPT_HMAC_KEY", hide_env_values = true)]
        key: String,

        /// The full header value, including the trailing `sig=` field.
        receipt: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("info")))
        .with_thread_ids(true)
        .init();
    let args = Arguments::parse();

    if let Some(Command::VerifyReceipt { key, receipt }) = args.command {
        return verify_receipt(&key, &receipt);
    }

    if args.origin_allow_invalid_certs {
        println!(
            "WARNING: Running with 'origin_allow_invalid_certs' will allow origins with Invalid/Forged/No TLS certificates to be proxied, be careful."
        );
    }

    let auth_mode = AuthMode::from_setting(args.auth_mode.as_deref());
    if let Some(mode) = args.auth_mode.as_deref()
        && auth_mode == AuthMode::Open
        && !mode.is_empty()
    {
        println!("WARNING: Unknown auth mode '{mode}', LLM endpoints will not require an API key.");
    }

    EdgeServer::new(EdgeServerSettings {
        request_timeout: Duration::from_secs(args.request_timeout),
        origin_settings: OriginSettings {
            url: args.origin_url.context("An origin URL is required")?,
            allow_invalid_certs: args.origin_allow_invalid_certs,
            request_timeout: Duration::from_secs(args.origin_request_timeout),
        },
        edge_config: EdgeConfig {
            auth_mode,
            api_keys: args.api_keys.iter().collect::<ApiKeys>(),
            policy_links: PolicyLinks {
                terms_url: args.terms_url.filter(|u| !u.trim().is_empty()),
                pricing_url: args.pricing_url.filter(|u| !u.trim().is_empty()),
            },
            receipt_signer: receipt_signer_from_key(args.receipt_hmac_key.as_deref())?,
            sitemap_path: args.sitemap_path,
            manifest_path: args.manifest_path,
            default_scheme: args.default_scheme,
            receipt_max_buffer: args.receipt_max_buffer.as_u64(),
        },
    })?
    .start(&args.address)
    .await
}

fn verify_receipt(key: &str, receipt: &str) -> Result<()> {
    let receipt = UsageReceipt::parse(receipt.trim())?;
    receipt
        .verify(key.as_bytes())
        .context("Usage receipt failed verification")?;

    let fields = &receipt.fields;
    println!("Usage receipt signature is valid.");
    println!("  contract: {}", fields.contract);
    println!("  status:   {}", fields.status);
    println!("  bytes:    {}", fields.bytes);
    println!("  etag:     {}", fields.etag);
    println!("  ts:       {}", fields.ts);
    Ok(())
}
