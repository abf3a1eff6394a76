//! Per-service HTTP surface: `/health`, `/metrics`, `/shutdown`.
//!
//! Operator access only — the bus is the system's primary interface.

use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};

use alicia_domain::config::HttpConfig;

use crate::service::ServiceHandle;

#[derive(Clone)]
struct HttpState {
    handle: ServiceHandle,
    /// SHA-256 of the shutdown bearer token; `None` disables `/shutdown`.
    shutdown_token_hash: Option<[u8; 32]>,
    shutdown: CancellationToken,
}

/// Serve the operator surface until the shutdown token fires.
///
/// `extension` carries service-specific routes (already stated); they
/// are merged beside the common `/health`, `/metrics`, `/shutdown`.
pub async fn serve(
    config: HttpConfig,
    handle: ServiceHandle,
    extension: Option<Router>,
    shutdown: CancellationToken,
) {
    let shutdown_token_hash = std::env::var(&config.shutdown_token_env)
        .ok()
        .filter(|t| !t.is_empty())
        .map(|t| Sha256::digest(t.as_bytes()).into());

    let state = HttpState {
        handle,
        shutdown_token_hash,
        shutdown: shutdown.clone(),
    };

    let allowed = config.allowed_origins.clone();
    let cors = CorsLayer::new().allow_origin(AllowOrigin::predicate(
        move |origin: &HeaderValue, _| {
            origin
                .to_str()
                .map(|o| origin_allowed(&allowed, o))
                .unwrap_or(false)
        },
    ));

    let mut app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/shutdown", post(shutdown_service))
        .with_state(state);
    if let Some(extension) = extension {
        app = app.merge(extension);
    }
    let app = app.layer(cors);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            // Port bind failure is fatal for the operator surface but the
            // bus side keeps running; surface it loudly.
            tracing::error!(addr = %addr, error = %e, "http listener bind failed");
            return;
        }
    };
    tracing::info!(addr = %addr, "http surface listening");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if let Err(e) = result {
        tracing::error!(error = %e, "http surface exited with error");
    }
}

/// Match an Origin header against the configured allowlist.
/// `*` allows everything; a trailing `:*` allows any port on that host.
fn origin_allowed(allowed: &[String], origin: &str) -> bool {
    allowed.iter().any(|pattern| {
        if pattern == "*" {
            return true;
        }
        if let Some(host) = pattern.strip_suffix(":*") {
            return origin == host
                || origin
                    .strip_prefix(host)
                    .is_some_and(|rest| rest.starts_with(':'));
        }
        pattern == origin
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /health — health snapshot (public, no auth)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn health(State(state): State<HttpState>) -> impl IntoResponse {
    let lifecycle_state = state.handle.state();
    let snapshot = state.handle.health().snapshot(lifecycle_state);
    let status = if lifecycle_state.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(snapshot))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /metrics — Prometheus-style counter dump
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn metrics(State(state): State<HttpState>) -> impl IntoResponse {
    let text = state.handle.health().render_prometheus(state.handle.state());
    ([("content-type", "text/plain; version=0.0.4")], text)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /shutdown — authenticated graceful stop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn shutdown_service(
    State(state): State<HttpState>,
    headers: axum::http::HeaderMap,
) -> impl IntoResponse {
    let Some(expected_hash) = state.shutdown_token_hash else {
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "error": "shutdown endpoint disabled" })),
        );
    };

    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    // Hash to fixed length, compare in constant time: no token length
    // or prefix leaks through timing.
    let provided_hash = Sha256::digest(provided.as_bytes());
    if !bool::from(provided_hash.as_slice().ct_eq(expected_hash.as_slice())) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "invalid shutdown token" })),
        );
    }

    tracing::info!("shutdown requested via http");
    state.shutdown.cancel();
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "stopping" })),
    )
}
