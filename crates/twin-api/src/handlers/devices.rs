//! Typed device handlers

use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use serde_json::{Map, Value};
use twin_core::{DeviceCommand, DeviceFilter, DeviceList, DeviceState, Entity};

use super::relay;
use crate::error::ApiError;
use crate::state::AppState;

/// GET /api/devices
/// List devices, optionally filtered by namespace, company or location
pub async fn list_devices(
    State(state): State<AppState>,
    Query(filter): Query<DeviceFilter>,
) -> Result<Json<DeviceList>, ApiError> {
    let items = state.client.list_entities(&filter).await?;
    Ok(Json(DeviceList::new(items)))
}

/// GET /api/devices/{id}
pub async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<Entity>, ApiError> {
    Ok(Json(state.client.get_entity(&device_id).await?))
}

/// PUT /api/devices/{id}
/// Create or replace a device. The path id always wins over the body.
///
/// When auto-policy is enabled and the body names no policy, a policy with
/// the device id is written first and the device is bound to it.
pub async fn create_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(mut entity): Json<Entity>,
) -> Result<Response, ApiError> {
    entity.thing_id = device_id.clone();

    if state.auto_create_policy && entity.policy_id.is_empty() {
        state.client.create_policy(&device_id).await?;
        entity.policy_id = device_id.clone();
    }

    let reply = state.client.create_entity(&device_id, &entity).await?;
    tracing::info!(device = %device_id, status = %reply.status, "Device written");
    Ok(relay(reply))
}

/// PATCH /api/devices/{id}
pub async fn update_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(mut entity): Json<Entity>,
) -> Result<Response, ApiError> {
    entity.thing_id = device_id.clone();
    let reply = state.client.update_entity(&device_id, &entity).await?;
    Ok(relay(reply))
}

/// DELETE /api/devices/{id}
pub async fn delete_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Response, ApiError> {
    let reply = state.client.delete_entity(&device_id).await?;
    tracing::info!(device = %device_id, "Device deleted");
    Ok(relay(reply))
}

/// GET /api/devices/{id}/state
/// Current feature values only
pub async fn get_device_state(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceState>, ApiError> {
    let entity = state.client.get_entity(&device_id).await?;
    Ok(Json(DeviceState::from(entity)))
}

/// PUT|POST /api/devices/{id}/features/{feature}/command
/// Deliver a command to the device inbox and relay whatever the backend says
pub async fn send_command(
    State(state): State<AppState>,
    Path((device_id, feature)): Path<(String, String)>,
    Json(command): Json<DeviceCommand>,
) -> Result<Response, ApiError> {
    if command.command.is_empty() {
        return Err(ApiError::BadRequest("command must not be empty".to_string()));
    }
    let params: Map<String, Value> = command.params;
    let reply = state
        .client
        .send_command(&device_id, &feature, &command.command, &params)
        .await?;
    Ok(relay(reply))
}
