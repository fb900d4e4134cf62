use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::capture::capture_handler;
use crate::proxy::discovery_proxy;
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/capture", get(capture_handler))
        .route("/version", get(version));
    if state.config.proxy_discovery {
        // Everything not handled otherwise ends up at the discovery service
        // and its single-page frontend.
        router = router.fallback(discovery_proxy);
    }
    let log_requests = state.config.log_requests || state.config.log_headers;
    let mut router = router.with_state(Arc::clone(&state));
    if log_requests {
        router = router.layer(axum::middleware::from_fn_with_state(state, access_log));
    }
    router.layer(TraceLayer::new_for_http())
}

/// `/version`: service identity and semantic version.
async fn version() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Frontend request logging, sitting in front of all routes when enabled.
async fn access_log(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "-".into());
    let referer = header_str(&req, "referer");
    let user_agent = header_str(&req, "user-agent");
    tracing::info!(
        client = %addr,
        method = %req.method(),
        path = %req.uri().path(),
        referer = %referer,
        user_agent = %user_agent,
        "frontend request"
    );
    if state.config.log_headers {
        for (name, value) in req.headers() {
            tracing::info!(client = %addr, header = %name, value = ?value, "frontend request header");
        }
    }
    next.run(req).await
}

fn header_str(req: &Request, name: &str) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}
