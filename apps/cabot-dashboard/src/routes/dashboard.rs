//! Operator-facing HTTP endpoints. The websocket at `/ws` is the primary dashboard channel;
//! these cover scripted dispatch and non-websocket dashboards.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use cabot_proto::{Command, LogEntry, RobotMessage, RobotStateFrame};
use serde::Deserialize;
use serde_json::Value;

use super::{map_state_err, ApiError, ApiResult, StatusBody};
use crate::state::AppState;

const DEFAULT_MESSAGE_LIMIT: usize = 100;

#[derive(Debug, Default, Deserialize)]
pub struct MessagesQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn send_command(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<StatusBody> {
    let command =
        Command::from_value(&body).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    state
        .dispatch(&client_id, command)
        .map_err(map_state_err)?;
    Ok(StatusBody::new("success"))
}

pub async fn list_robots(State(state): State<AppState>) -> Json<RobotStateFrame> {
    Json(state.store().snapshot())
}

pub async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
) -> Json<Vec<LogEntry>> {
    let limit = query.limit.unwrap_or(DEFAULT_MESSAGE_LIMIT);
    Json(state.store().messages(limit))
}

pub async fn robot_messages(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> ApiResult<Vec<RobotMessage>> {
    state
        .store()
        .robot_messages(&client_id)
        .map(Json)
        .map_err(|err| map_state_err(err.into()))
}
