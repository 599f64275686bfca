//! The per-request edge pipeline.

use crate::{
    ErrorResponse,
    access::{self, AuthMode},
    cache_headers,
    config::EdgeConfig,
    link,
    origin::Origin,
    receipt::{self, DeclaredLength, RECEIPT_HEADER, ReceiptFields},
    routing::RouteClass,
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::Request,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::BytesMut;
use chrono::Utc;
use futures::{StreamExt, stream};
use tracing::{debug, warn};

/// Run one request through the edge: authorize, forward to the origin and
/// rewrite the response headers for the endpoint families the edge manages.
pub async fn handle<O: Origin>(request: Request, config: &EdgeConfig, origin: &O) -> Response {
    let path = request.uri().path().to_owned();
    let class = RouteClass::classify(&path, &config.sitemap_path, &config.manifest_path);

    if class.llm_endpoint
        && config.auth_mode == AuthMode::ApiKey
        && !access::is_authorized(request.headers(), &config.api_keys)
    {
        debug!("Rejecting request to {path} without a valid API key");
        return access::unauthorized_response();
    }

    // The origin consumes the request, so keep what the response stages need.
    let (canonical, contract) = if class.llm_endpoint {
        (
            link::canonical_uri(request.uri(), request.headers(), &config.default_scheme),
            receipt::contract(request.headers()),
        )
    } else {
        (None, String::new())
    };

    let response = match origin.forward(request).await {
        Ok(response) => response,
        Err(err) => return err.into_response(),
    };
    if !class.is_classified() {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    cache_headers::normalize(&mut parts.headers);
    if !class.llm_endpoint {
        return Response::from_parts(parts, body);
    }

    link::inject(&mut parts.headers, canonical.as_deref(), &config.policy_links);

    let Some(signer) = &config.receipt_signer else {
        return Response::from_parts(parts, body);
    };
    let (bytes, body) = match receipt::declared_length(parts.status, &parts.headers) {
        DeclaredLength::Known(bytes) => (Some(bytes), body),
        DeclaredLength::Unknown => match buffer_body(body, config.receipt_max_buffer).await {
            Ok(BufferedBody::Complete(buffer)) => {
                // Any Content-Length left here failed to parse, the body now carries its own length.
                parts.headers.remove(header::CONTENT_LENGTH);
                (Some(buffer.len() as u64), Body::from(buffer))
            }
            Ok(BufferedBody::TooLarge(body)) => {
                warn!(
                    "Response for {path} exceeds {} bytes without a Content-Length, sending it without a usage receipt",
                    config.receipt_max_buffer
                );
                (None, body)
            }
            Err(err) => {
                warn!("Failed to read response body from origin server: {err:?}");
                return (
                    StatusCode::BAD_GATEWAY,
                    Json(ErrorResponse {
                        message: "Something went wrong whilst obtaining the content from origin.",
                    }),
                )
                    .into_response();
            }
        },
    };

    if let Some(bytes) = bytes {
        let fields =
            ReceiptFields::collect(contract, parts.status, &parts.headers, bytes, Utc::now());
        match HeaderValue::from_str(&signer.receipt(&fields)) {
            Ok(value) => {
                parts.headers.insert(RECEIPT_HEADER, value);
            }
            Err(err) => warn!("Unable to encode usage receipt header: {err:?}"),
        }
    }

    Response::from_parts(parts, body)
}

enum BufferedBody {
    /// The whole body, read into memory.
    Complete(Bytes),
    /// The body went over the limit, what was read is chained back in front of the rest.
    TooLarge(Body),
}

/// Read a body into memory unless it grows past `limit` bytes.
async fn buffer_body(body: Body, limit: u64) -> Result<BufferedBody, axum::Error> {
    let mut stream = body.into_data_stream();
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if buffer.len() as u64 + chunk.len() as u64 > limit {
            let read = stream::iter([Ok::<_, axum::Error>(buffer.freeze()), Ok(chunk)]);
            return Ok(BufferedBody::TooLarge(Body::from_stream(read.chain(stream))));
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(BufferedBody::Complete(buffer.freeze()))
}
