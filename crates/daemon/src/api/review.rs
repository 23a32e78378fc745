use axum::{extract::State, response::Json, routing::post, Router};
use serde::Deserialize;
use std::sync::Arc;

use crate::api::ApiError;
use crate::review::{Navigator, ReviewView};

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct ReviewRequest {
    token: Option<String>,
}

type ReviewResult = Result<Json<ReviewView>, ApiError>;

pub fn router(navigator: Arc<Navigator>) -> Router {
    Router::new()
        .route("/new", post(new_session))
        .route("/current", post(current))
        .route("/keep", post(keep))
        .route("/delete", post(delete))
        .route("/undo", post(undo))
        .route("/finish", post(finish))
        .with_state(navigator)
}

fn token(body: &Option<Json<ReviewRequest>>) -> Option<&str> {
    body.as_ref().and_then(|Json(req)| req.token.as_deref())
}

async fn new_session(State(nav): State<Arc<Navigator>>) -> ReviewResult {
    Ok(Json(nav.new_session()?))
}

async fn current(State(nav): State<Arc<Navigator>>, body: Option<Json<ReviewRequest>>) -> ReviewResult {
    Ok(Json(nav.current(token(&body))?))
}

async fn keep(State(nav): State<Arc<Navigator>>, body: Option<Json<ReviewRequest>>) -> ReviewResult {
    Ok(Json(nav.keep(token(&body))?))
}

async fn delete(State(nav): State<Arc<Navigator>>, body: Option<Json<ReviewRequest>>) -> ReviewResult {
    Ok(Json(nav.delete(token(&body))?))
}

async fn undo(State(nav): State<Arc<Navigator>>, body: Option<Json<ReviewRequest>>) -> ReviewResult {
    Ok(Json(nav.undo(token(&body))?))
}

async fn finish(State(nav): State<Arc<Navigator>>, body: Option<Json<ReviewRequest>>) -> ReviewResult {
    Ok(Json(nav.finish(token(&body))?))
}

#[cfg(test)]
mod tests {
    use crate::api::tests::{app, call};
    use crate::jobs::scanner::tests::Fixture;
    use crate::media::testing::FakeGenerator;
    use axum::http::StatusCode;
    use engine::MediaStatus;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn review_flow_over_http() {
        let fx = Fixture::new();
        fx.add_source("a.mp4", b"a");
        fx.add_source("b.mp4", b"b");
        fx.scanner(Arc::new(FakeGenerator::default()))
            .scan(CancellationToken::new())
            .await
            .unwrap();
        let (app, _) = app(&fx);

        let (status, view) = call(&app, "POST", "/api/review/current", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["session"]["total_unreviewed"], 2);
        assert_eq!(view["is_last"], false);
        let first = view["record"]["id"].as_i64().unwrap();

        let (_, view) = call(&app, "POST", "/api/review/delete", Some(json!({"token": view["token"]}))).await;
        assert_eq!(view["session"]["pending_delete_id"], first);
        assert_eq!(view["is_last"], true);

        let (_, view) = call(&app, "POST", "/api/review/finish", Some(json!({"token": view["token"]}))).await;
        assert_eq!(view["done"], true);
        let record = fx.db.get_by_id(first).unwrap().unwrap();
        assert_eq!(record.status, MediaStatus::Deleted);
    }

    #[tokio::test]
    async fn corrupt_token_is_tolerated() {
        let fx = Fixture::new();
        let (app, _) = app(&fx);
        let (status, view) =
            call(&app, "POST", "/api/review/keep", Some(json!({"token": "definitely-not-a-token"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["done"], true);
        assert!(view["record"].is_null());
    }
}
