//! Crate for tct-edge, an edge proxy that sits in front of an origin serving
//! machine-readable LLM endpoints.
//!
//! Every request runs through a single pass [`pipeline`]: LLM endpoints can be
//! gated behind API keys, caching headers are normalized for the sitemap,
//! manifest and LLM endpoints, discovery links are added and a signed usage
//! receipt is attached to LLM endpoint responses.

#[cfg(feature = "rustls-tls")]
#[cfg(feature = "native-tls")]
compile_error!("You can only enable one TLS backend");

pub extern crate url;

pub mod access;
pub mod cache_headers;
pub mod config;
mod http_client;
pub mod link;
pub mod origin;
pub mod pipeline;
pub mod receipt;
pub mod routing;

pub use config::EdgeConfig;

use anyhow::{Result, bail};
use axum::{
    Router,
    extract::{Request, State},
    http::StatusCode,
    response::Response,
};
use core::{net::SocketAddr, time::Duration};
use http_client::{BuildHttpClientArgs, build_http_client};
use origin::{HttpOrigin, Origin};
use std::sync::Arc;
use tokio::{net::TcpListener, signal};
use tower_http::{
    catch_panic::CatchPanicLayer,
    timeout::TimeoutLayer,
    trace::{self, TraceLayer},
};
use tracing::{Level, info};
use url::Url;

/// # Example
/// ```rust,no_run
/// use std::time::Duration;
/// use tct_edge::{EdgeConfig, EdgeServer, EdgeServerSettings, OriginSettings, url::Url};
///
/// # #[tokio::main]
/// # async fn main() {
/// let server = EdgeServer::new(EdgeServerSettings {
///     request_timeout: Duration::from_secs(60),
///     origin_settings: OriginSettings::new(Url::parse("http://127.0.0.1:8080").unwrap()),
///     edge_config: EdgeConfig::default(),
/// })
/// .unwrap();
/// server.start(&"127.0.0.1:3600".parse().unwrap()).await.unwrap();
/// # }
/// ```
#[derive(Debug)]
pub struct EdgeServer {
    router_inner: Router,
}

/// Settings to run the edge server with.
#[derive(Debug, Clone)]
pub struct EdgeServerSettings {
    /// How long a request may take in total before it is abandoned with a `504`.
    ///
    /// Must not be shorter than [`OriginSettings::request_timeout`].
    pub request_timeout: Duration,

    /// See [`OriginSettings`].
    pub origin_settings: OriginSettings,

    /// See [`EdgeConfig`].
    pub edge_config: EdgeConfig,
}

/// Configuration options used when forwarding requests to the origin.
#[derive(Debug, Clone)]
pub struct OriginSettings {
    /// Base URL of the origin. Request paths are appended to its path.
    pub url: Url,

    /// Whether to allow invalid/expired/forged TLS certificates when making origin requests.
    ///
    /// **Enabling this is dangerous and is usually not necessary.**
    pub allow_invalid_certs: bool,

    /// How long to wait for the origin to respond before the request is considered failed.
    pub request_timeout: Duration,
}

impl OriginSettings {
    /// Settings for an origin at `url` with default timeouts.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            allow_invalid_certs: false,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Error body sent for failures generated by the edge itself.
#[derive(serde::Serialize)]
pub(crate) struct ErrorResponse {
    pub(crate) message: &'static str,
}

#[derive(Debug)]
struct AppState<O> {
    origin: O,
    config: EdgeConfig,
}

impl EdgeServer {
    /// Create a new server with the provided settings.
    pub fn new(settings: EdgeServerSettings) -> Result<Self> {
        settings.edge_config.validate()?;
        if settings.request_timeout < settings.origin_settings.request_timeout {
            bail!(
                "The request timeout ({:?}) must not be shorter than the origin request timeout ({:?})",
                settings.request_timeout,
                settings.origin_settings.request_timeout
            );
        }
        let client = build_http_client(BuildHttpClientArgs {
            allow_invalid_certs: settings.origin_settings.allow_invalid_certs,
            request_timeout: settings.origin_settings.request_timeout,
        })?;
        let origin = HttpOrigin::new(client, settings.origin_settings.url);

        Ok(Self {
            router_inner: router(settings.edge_config, settings.request_timeout, origin),
        })
    }

    /// Start the server and expose it locally on the provided [`SocketAddr`].
    pub async fn start(self, address: &SocketAddr) -> Result<()> {
        let tcp_listener = TcpListener::bind(&address).await?;
        info!("Listening on http://{}", tcp_listener.local_addr()?);
        axum::serve(tcp_listener, self.router_inner)
            .with_graceful_shutdown(Self::shutdown_signal())
            .await?;
        Ok(())
    }

    // https://github.com/tokio-rs/axum/blob/15917c6dbcb4a48707a20e9cfd021992a279a662/examples/graceful-shutdown/src/main.rs#L55
    async fn shutdown_signal() {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }
}

/// Build the router that sends every request, whatever its method or path,
/// through the edge pipeline in front of `origin`.
pub fn router<O: Origin>(config: EdgeConfig, request_timeout: Duration, origin: O) -> Router {
    Router::new()
        .fallback(edge_handler::<O>)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::with_status_code(
            StatusCode::GATEWAY_TIMEOUT,
            request_timeout,
        ))
        .layer(CatchPanicLayer::new())
        .with_state(Arc::new(AppState { origin, config }))
}

async fn edge_handler<O: Origin>(
    State(state): State<Arc<AppState<O>>>,
    request: Request,
) -> Response {
    pipeline::handle(request, &state.config, &state.origin).await
}
