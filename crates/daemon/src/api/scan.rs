use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;

use crate::api::AppState;
use crate::jobs::ScanReport;

#[derive(Serialize)]
pub struct StartScanResponse {
    started: bool,
    running: bool,
}

#[derive(Serialize)]
pub struct ScanStatusResponse {
    running: bool,
    last: Option<ScanReport>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(start_scan))
        .route("/status", get(scan_status))
        .with_state(state)
}

/// Kick off a background scan. A scan already in flight is not an error; the
/// response just reports `started: false`.
async fn start_scan(State(state): State<AppState>) -> Json<StartScanResponse> {
    let started = state.scanner.spawn_scan(state.shutdown.child_token());
    Json(StartScanResponse {
        started,
        running: state.scanner.is_running(),
    })
}

async fn scan_status(State(state): State<AppState>) -> Json<ScanStatusResponse> {
    Json(ScanStatusResponse {
        running: state.scanner.is_running(),
        last: state.scanner.last_report(),
    })
}

#[cfg(test)]
mod tests {
    use crate::api::tests::{app, call};
    use crate::jobs::scanner::tests::Fixture;
    use axum::http::StatusCode;
    use std::time::Duration;

    #[tokio::test]
    async fn scan_endpoint_starts_and_reports() {
        let fx = Fixture::new();
        fx.add_source("a.mp4", b"a");
        let (app, state) = app(&fx);

        let (status, body) = call(&app, "POST", "/api/scan", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["started"], true);

        for _ in 0..100 {
            if !state.scanner.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let (status, body) = call(&app, "GET", "/api/scan/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["running"], false);
        assert_eq!(body["last"]["summary"]["processed"], 1);
    }
}
