//! Operator HTTP mirror of the session contracts. Read-only.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use uuid::Uuid;

use crate::sessions::SessionStore;

#[derive(Clone)]
struct HttpState {
    store: Arc<SessionStore>,
}

pub fn routes(store: Arc<SessionStore>) -> Router {
    Router::new()
        .route("/sessions/:session_id", get(get_session))
        .with_state(HttpState { store })
}

async fn get_session(
    State(state): State<HttpState>,
    Path(session_id): Path<Uuid>,
) -> impl IntoResponse {
    match state.store.get(session_id) {
        Some(slot) => (
            StatusCode::OK,
            Json(serde_json::to_value(slot.snapshot()).unwrap_or_default()),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("session {session_id} not found") })),
        ),
    }
}
