//! Operator HTTP mirror of the registry and command-plane contracts.
//! Read-only; mutations go over the bus.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use uuid::Uuid;

use crate::plane::CommandPlane;
use crate::registry::{DeviceFilter, DeviceRegistry};

#[derive(Clone)]
struct HttpState {
    registry: Arc<DeviceRegistry>,
    plane: Arc<CommandPlane>,
}

pub fn routes(registry: Arc<DeviceRegistry>, plane: Arc<CommandPlane>) -> Router {
    Router::new()
        .route("/devices", get(list_devices))
        .route("/devices/:device_id", get(get_device))
        .route("/commands/:command_id", get(get_command))
        .with_state(HttpState { registry, plane })
}

#[derive(Debug, Default, serde::Deserialize)]
struct ListQuery {
    device_type: Option<String>,
    room: Option<String>,
    capability: Option<String>,
}

async fn list_devices(
    State(state): State<HttpState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let devices = state.registry.list(&DeviceFilter {
        device_type: query.device_type,
        room: query.room,
        capability: query.capability,
    });
    Json(devices)
}

async fn get_device(
    State(state): State<HttpState>,
    Path(device_id): Path<String>,
) -> impl IntoResponse {
    match state.registry.get(&device_id) {
        Some(device) => (StatusCode::OK, Json(serde_json::to_value(device).unwrap_or_default())),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("device {device_id} not found") })),
        ),
    }
}

async fn get_command(
    State(state): State<HttpState>,
    Path(command_id): Path<Uuid>,
) -> impl IntoResponse {
    match state.plane.get_command(command_id) {
        Some(ticket) => (StatusCode::OK, Json(serde_json::to_value(ticket).unwrap_or_default())),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("command {command_id} not found") })),
        ),
    }
}
