mod client;
mod dashboard;
mod ws;

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::{metrics, queue::QueueError, state::AppState, state::StateError, store::StoreError};

pub use client::*;
pub use dashboard::*;
pub use ws::observer_socket;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/metrics", get(export_metrics))
        .route("/api/client/connect/:client_id", post(connect_client))
        .route("/api/client/poll/:client_id", get(poll_command))
        .route("/api/client/send/:client_id", post(send_status))
        .route("/api/client/:client_id", delete(remove_client))
        .route(
            "/api/dashboard/send_command/:client_id",
            post(send_command),
        )
        .route("/api/dashboard/robots", get(list_robots))
        .route(
            "/api/dashboard/robots/:client_id/messages",
            get(robot_messages),
        )
        .route("/api/dashboard/messages", get(list_messages))
        .route("/ws", get(observer_socket))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

async fn export_metrics() -> Response {
    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        metrics::export_prometheus(),
    )
        .into_response()
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Superseded,
    Internal,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusBody {
    pub status: &'static str,
}

impl StatusBody {
    pub fn new(status: &'static str) -> Json<Self> {
        Json(Self { status })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                Json(ApiErrorBody {
                    error: "not_found",
                    message: Some(msg),
                }),
            )
                .into_response(),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                Json(ApiErrorBody {
                    error: "bad_request",
                    message: Some(msg),
                }),
            )
                .into_response(),
            // the stale long-poll connection is torn down
            ApiError::Superseded => (
                StatusCode::CONFLICT,
                [(header::CONNECTION, "close")],
                Json(ApiErrorBody {
                    error: "superseded",
                    message: Some("a newer poll for this client is active".into()),
                }),
            )
                .into_response(),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiErrorBody {
                    error: "internal",
                    message: None,
                }),
            )
                .into_response(),
        }
    }
}

fn map_state_err(err: StateError) -> ApiError {
    match err {
        StateError::Store(StoreError::ClientNotFound(id)) => {
            ApiError::NotFound(format!("client {id} is not connected"))
        }
        StateError::Store(StoreError::NotConnected(id)) => {
            ApiError::NotFound(format!("client {id} is not connected"))
        }
        StateError::Queue(QueueError::ClientRemoved) => {
            ApiError::NotFound("client was removed".into())
        }
        StateError::Queue(QueueError::Superseded) => ApiError::Superseded,
        StateError::Malformed(err) => ApiError::BadRequest(err.to_string()),
        other @ (StateError::Queue(QueueError::Timeout) | StateError::HttpClient(_)) => {
            error!(error = %other, "unexpected failure handling request");
            ApiError::Internal
        }
    }
}
