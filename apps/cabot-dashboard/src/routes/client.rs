//! Agent-facing long-poll protocol.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cabot_proto::{PollRequest, StatusReport, SystemStatus};
use serde::Deserialize;

use super::{map_state_err, ApiError, ApiResult, StatusBody};
use crate::{queue::QueueError, state::AppState, state::StateError};

#[derive(Debug, Default, Deserialize)]
pub struct PollQuery {
    #[serde(default)]
    pub system_status: Option<SystemStatus>,
}

pub async fn connect_client(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> ApiResult<StatusBody> {
    state.connect(&client_id);
    Ok(StatusBody::new("Connected"))
}

/// Holds the request open until a command arrives (200), the poll times out (204), or a newer
/// poll from the same client supersedes it (409).
pub async fn poll_command(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Query(query): Query<PollQuery>,
    body: Option<Json<PollRequest>>,
) -> Result<Response, ApiError> {
    let system_status = match body {
        Some(Json(request)) => request.system_status,
        None => query.system_status.unwrap_or_default(),
    };
    match state.poll(&client_id, system_status).await {
        Ok(command) => Ok(Json(command).into_response()),
        Err(StateError::Queue(QueueError::Timeout)) => Ok(StatusCode::NO_CONTENT.into_response()),
        Err(err) => Err(map_state_err(err)),
    }
}

pub async fn send_status(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Json(report): Json<StatusReport>,
) -> ApiResult<StatusBody> {
    state.report(&client_id, report).map_err(map_state_err)?;
    Ok(StatusBody::new("success"))
}

pub async fn remove_client(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> ApiResult<StatusBody> {
    state.remove(&client_id).map_err(map_state_err)?;
    Ok(StatusBody::new("removed"))
}
