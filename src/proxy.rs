//! Reverse proxies everything not handled otherwise to the discovery
//! service, so its single-page frontend can be served through the capture
//! service's port. Flag-enabled.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::config::CAPTURE_ENABLE_HEADER;
use crate::state::AppState;

/// Forwards an unmatched request to the discovery service, scheme `http`,
/// host rewritten, path preserved except for the legacy rewrite of
/// `/discover/mobyshark`. The `Enable-Monolith` request header signals the
/// discovery frontend to expose its capture action. Bodies stream through
/// in both directions, whatever their size.
pub async fn discovery_proxy(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    // The old plugin discovery API path is still around in the wild.
    let path = match parts.uri.path() {
        "/discover/mobyshark" => "/mobyshark",
        path => path,
    };
    let mut url = format!("{}{}", state.config.discovery_url(), path);
    if let Some(query) = parts.uri.query() {
        url.push('?');
        url.push_str(query);
    }
    tracing::debug!(path = %parts.uri.path(), url = %url, "reverse proxying to discovery service");

    let mut headers = parts.headers;
    headers.remove(header::HOST);
    if !headers.contains_key(header::USER_AGENT) {
        // Keep the upstream from inventing a user agent of its own.
        headers.insert(header::USER_AGENT, header::HeaderValue::from_static(""));
    }

    let upstream = state
        .http
        .request(parts.method, &url)
        .headers(headers)
        .header(CAPTURE_ENABLE_HEADER, "Affirmative, Dave")
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await;
    let upstream = match upstream {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(url = %url, error = %err, "discovery service unreachable");
            return (StatusCode::BAD_GATEWAY, format!("discovery service unreachable: {err}"))
                .into_response();
        }
    };

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    // The response body gets reframed on its way through; drop the framing
    // headers of the upstream exchange.
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::CONNECTION);
    headers.remove(header::CONTENT_LENGTH);

    let mut response = Response::builder().status(status);
    for (name, value) in &headers {
        response = response.header(name, value);
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}
