//! Forwarding requests to the origin server.

use crate::{ErrorResponse, http_client::HttpClient};
use axum::{
    Json,
    body::{Body, HttpBody},
    extract::Request,
    http::{HeaderMap, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};
use url::Url;

/// Headers that only apply to a single connection and are never forwarded.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Failures talking to the origin.
#[derive(Debug, thiserror::Error)]
pub enum OriginError {
    /// The origin did not answer before the deadline.
    #[error("origin did not respond in time")]
    Timeout,
    /// The request could not be sent or the response could not be read.
    #[error("origin request failed: {0}")]
    Transport(String),
}

impl IntoResponse for OriginError {
    fn into_response(self) -> Response {
        match self {
            Self::Timeout => (
                StatusCode::GATEWAY_TIMEOUT,
                Json(ErrorResponse {
                    message: "Origin server failed to respond in time.",
                }),
            )
                .into_response(),
            Self::Transport(_) => (
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse {
                    message: "Failed to send request to origin server.",
                }),
            )
                .into_response(),
        }
    }
}

/// The server that produces the actual content behind the edge.
pub trait Origin: Send + Sync + 'static {
    /// Send a request to the origin exactly once and hand back its response as-is.
    fn forward(
        &self,
        request: Request,
    ) -> impl Future<Output = Result<Response, OriginError>> + Send;
}

/// [`Origin`] reached over HTTP(S) at a fixed base URL.
#[derive(Debug, Clone)]
pub struct HttpOrigin {
    client: HttpClient,
    base_url: Url,
}

impl HttpOrigin {
    /// Create an origin that sends requests to `base_url` using `client`.
    pub fn new(client: HttpClient, base_url: Url) -> Self {
        Self { client, base_url }
    }

    fn target_url(&self, uri: &Uri) -> Url {
        let mut url = self.base_url.clone();
        let path = format!("{}{}", url.path().trim_end_matches('/'), uri.path());
        url.set_path(&path);
        url.set_query(uri.query());
        url
    }
}

impl Origin for HttpOrigin {
    async fn forward(&self, request: Request) -> Result<Response, OriginError> {
        let (parts, body) = request.into_parts();
        let url = self.target_url(&parts.uri);
        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);

        debug!("Forwarding {} request to origin at {url}", parts.method);
        let mut request_builder = self.client.request(parts.method, url).headers(headers);
        if !body.is_end_stream() {
            request_builder =
                request_builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let origin_response = request_builder.send().await.map_err(|err| {
            warn!("Failed to make request to origin server: {err:?}");
            if err.is_timeout() {
                OriginError::Timeout
            } else {
                OriginError::Transport(err.to_string())
            }
        })?;

        let status = origin_response.status();
        let mut headers = origin_response.headers().clone();
        strip_hop_by_hop(&mut headers);

        let mut response = Response::new(Body::from_stream(origin_response.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect();
    for name in named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::{BuildHttpClientArgs, build_http_client};
    use axum::{
        Router,
        http::{self, HeaderValue},
        routing::any,
    };
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn spawn_origin(router: Router) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        Url::parse(&format!("http://{address}/base/")).unwrap()
    }

    fn origin(base_url: Url, request_timeout: Duration) -> HttpOrigin {
        let client = build_http_client(BuildHttpClientArgs {
            allow_invalid_certs: false,
            request_timeout,
        })
        .unwrap();
        HttpOrigin::new(client, base_url)
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close, X-Trace"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::ETAG, HeaderValue::from_static(r#""abc""#));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get(header::ETAG).unwrap(), r#""abc""#);
    }

    #[test]
    fn test_target_url() {
        let origin = origin(
            Url::parse("https://origin.example.com/site/").unwrap(),
            Duration::from_secs(1),
        );
        let uri: Uri = "/blog/llm/?a=1&b=2".parse().unwrap();
        assert_eq!(
            origin.target_url(&uri).as_str(),
            "https://origin.example.com/site/blog/llm/?a=1&b=2"
        );

        let origin = HttpOrigin::new(
            origin.client.clone(),
            Url::parse("http://127.0.0.1:8080").unwrap(),
        );
        let uri: Uri = "/llms.txt".parse().unwrap();
        assert_eq!(
            origin.target_url(&uri).as_str(),
            "http://127.0.0.1:8080/llms.txt"
        );
    }

    #[tokio::test]
    async fn test_forward_passes_request_and_response_through() {
        let base_url = spawn_origin(Router::new().route(
            "/base/post/llm/",
            any(|request: Request| async move {
                let headers = request.headers();
                assert_eq!(request.uri().query(), Some("format=md"));
                assert_eq!(headers.get(header::IF_NONE_MATCH).unwrap(), r#""v1""#);
                assert_eq!(headers.get("x-ai-contract").unwrap(), "pilotX");
                (
                    StatusCode::NOT_MODIFIED,
                    [
                        (header::ETAG, r#""v1""#),
                        (header::CACHE_CONTROL, "no-cache"),
                    ],
                )
            }),
        ))
        .await;

        let request = http::Request::builder()
            .uri("/post/llm/?format=md")
            .header(header::HOST, "edge.example.com")
            .header(header::IF_NONE_MATCH, r#""v1""#)
            .header("x-ai-contract", "pilotX")
            .body(Body::empty())
            .unwrap();
        let response = origin(base_url, Duration::from_secs(5))
            .forward(request)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(response.headers().get(header::ETAG).unwrap(), r#""v1""#);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-cache"
        );
    }

    #[tokio::test]
    async fn test_forward_streams_request_body() {
        let base_url = spawn_origin(Router::new().route(
            "/base/echo",
            any(|body: String| async move { body }),
        ))
        .await;

        let request = http::Request::builder()
            .method("POST")
            .uri("/echo")
            .body(Body::from("hello origin"))
            .unwrap();
        let response = origin(base_url, Duration::from_secs(5))
            .forward(request)
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body, "hello origin");
    }

    #[tokio::test]
    async fn test_forward_timeout() {
        let base_url = spawn_origin(Router::new().route(
            "/base/slow",
            any(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "too late"
            }),
        ))
        .await;

        let request = http::Request::builder()
            .uri("/slow")
            .body(Body::empty())
            .unwrap();
        let err = origin(base_url, Duration::from_millis(100))
            .forward(request)
            .await
            .unwrap_err();
        assert!(matches!(err, OriginError::Timeout));
        assert_eq!(err.into_response().status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_forward_connection_failure() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let request = http::Request::builder()
            .uri("/llm")
            .body(Body::empty())
            .unwrap();
        let err = origin(
            Url::parse(&format!("http://{address}")).unwrap(),
            Duration::from_secs(5),
        )
        .forward(request)
        .await
        .unwrap_err();
        assert!(matches!(err, OriginError::Transport(_)));
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    }
}
