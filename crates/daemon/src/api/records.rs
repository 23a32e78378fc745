use axum::{
    extract::{Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use engine::MediaStatus;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::ApiError;
use crate::db::{Database, MediaRecord, StoreStats};

#[derive(Deserialize)]
pub struct ListQuery {
    status: Option<String>,
}

#[derive(Serialize)]
pub struct ResetViewedResponse {
    reset: usize,
}

pub fn router(db: Arc<Database>) -> Router {
    Router::new()
        .route("/", get(list_records))
        .route("/stats", get(stats))
        .route("/reset_viewed", post(reset_viewed))
        .with_state(db)
}

async fn list_records(
    State(db): State<Arc<Database>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<MediaRecord>>, ApiError> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<MediaStatus>().map_err(|e| {
            ApiError::bad_request("invalid_status", e.to_string())
        })?),
    };
    Ok(Json(db.list(status)?))
}

async fn stats(State(db): State<Arc<Database>>) -> Result<Json<StoreStats>, ApiError> {
    Ok(Json(db.stats()?))
}

async fn reset_viewed(State(db): State<Arc<Database>>) -> Result<Json<ResetViewedResponse>, ApiError> {
    let reset = db.reset_viewed()?;
    Ok(Json(ResetViewedResponse { reset }))
}
