use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::ApiError;
use crate::db::Database;
use crate::jobs::queue::{self, RecordStatus};

#[derive(Deserialize)]
pub struct QueueRequest {
    #[serde(default)]
    filename: String,
}

#[derive(Serialize)]
pub struct QueueResponse {
    id: i64,
}

pub fn router(db: Arc<Database>) -> Router {
    Router::new()
        .route("/archive", post(mark_archived))
        .route("/delete", post(mark_for_deletion))
        .route("/restore", post(restore))
        .route("/:filename", get(status_by_filename))
        .with_state(db)
}

async fn mark_archived(
    State(db): State<Arc<Database>>,
    Json(req): Json<QueueRequest>,
) -> Result<Json<QueueResponse>, ApiError> {
    let id = queue::mark_archived(&db, &req.filename)?;
    Ok(Json(QueueResponse { id }))
}

async fn mark_for_deletion(
    State(db): State<Arc<Database>>,
    Json(req): Json<QueueRequest>,
) -> Result<Json<QueueResponse>, ApiError> {
    let id = queue::mark_for_deletion(&db, &req.filename)?;
    Ok(Json(QueueResponse { id }))
}

async fn restore(
    State(db): State<Arc<Database>>,
    Json(req): Json<QueueRequest>,
) -> Result<Json<QueueResponse>, ApiError> {
    let id = queue::restore(&db, &req.filename)?;
    Ok(Json(QueueResponse { id }))
}

async fn status_by_filename(
    State(db): State<Arc<Database>>,
    Path(filename): Path<String>,
) -> Result<Json<RecordStatus>, ApiError> {
    Ok(Json(queue::status_by_filename(&db, &filename)?))
}
