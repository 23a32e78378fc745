use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::db::Database;
use crate::error::QueueError;
use crate::jobs::Scanner;
use crate::review::Navigator;

pub mod queue;
pub mod records;
pub mod review;
pub mod scan;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub scanner: Arc<Scanner>,
    pub navigator: Arc<Navigator>,
    /// Root lifetime signal; on-demand scans run under a child of it.
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/scan", scan::router(state.clone()))
        .nest("/queue", queue::router(state.db.clone()))
        .nest("/records", records::router(state.db.clone()))
        .nest("/review", review::router(state.navigator.clone()))
}

/// JSON error body with a stable `error` kind.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    pub fn bad_request(kind: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            kind,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": self.kind, "message": self.message })),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        error!(error = %e, "request failed");
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message: "internal error".to_string(),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        let status = match &e {
            QueueError::InvalidFilename => StatusCode::BAD_REQUEST,
            QueueError::NotFound(_) => StatusCode::NOT_FOUND,
            QueueError::Conflict(..) => StatusCode::CONFLICT,
            QueueError::Store(inner) => {
                error!(error = %inner, "queue store failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError {
            status,
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}
