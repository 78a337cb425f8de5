use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::routes::auth::CronAuth;
use crate::routes::extract::{ApiJson, ApiQuery};
use crate::services::channels::{ChannelManager, ChannelStatus};
use crate::services::sync::{EventError, SyncProcessor};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/setup-watch", get(watch_status).post(setup_watch))
        .route("/resync/:therapist_id", get(resync))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SetupWatchRequest {
    pub therapist_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WatchStatusQuery {
    pub therapist_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChannelInfo {
    pub id: String,
    pub resource_id: String,
    pub expiration: NaiveDateTime,
}

#[derive(Debug, Serialize)]
pub struct SetupWatchResponse {
    pub success: bool,
    pub message: String,
    pub channel: ChannelInfo,
}

#[derive(Debug, Deserialize)]
pub struct ResyncQuery {
    pub days_back: Option<i64>,
    pub days_forward: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ResyncResponse {
    pub success: bool,
    pub message: String,
    pub processed: usize,
    pub ignored: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<EventError>,
}

fn required_therapist_id(value: Option<String>) -> Result<String, AppError> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::BadRequest("therapist_id is required".to_string()))
}

// ============================================================================
// Handlers
// ============================================================================

/// Register (or replace) the push channel for one therapist's calendar.
async fn setup_watch(
    State(state): State<Arc<AppState>>,
    _auth: CronAuth,
    ApiJson(body): ApiJson<SetupWatchRequest>,
) -> Result<Json<SetupWatchResponse>, AppError> {
    let therapist_id = required_therapist_id(body.therapist_id)?;

    let channel = ChannelManager::setup(&state, &therapist_id).await?;

    Ok(Json(SetupWatchResponse {
        success: true,
        message: format!("Watch configured for calendar {}", channel.calendar_id),
        channel: ChannelInfo {
            id: channel.channel_id,
            resource_id: channel.resource_id,
            expiration: channel.expiration,
        },
    }))
}

async fn watch_status(
    State(state): State<Arc<AppState>>,
    _auth: CronAuth,
    ApiQuery(query): ApiQuery<WatchStatusQuery>,
) -> Result<Json<ChannelStatus>, AppError> {
    let therapist_id = required_therapist_id(query.therapist_id)?;
    let status = ChannelManager::channel_status(&state, &therapist_id).await?;
    Ok(Json(status))
}

async fn resync(
    State(state): State<Arc<AppState>>,
    _auth: CronAuth,
    Path(therapist_id): Path<String>,
    ApiQuery(query): ApiQuery<ResyncQuery>,
) -> Result<Json<ResyncResponse>, AppError> {
    let days_back = query.days_back.unwrap_or(state.config.sync.resync_days_back);
    let days_forward = query
        .days_forward
        .unwrap_or(state.config.sync.resync_days_forward);

    let report = SyncProcessor::resync(&state, &therapist_id, days_back, days_forward).await?;

    Ok(Json(ResyncResponse {
        success: true,
        message: format!(
            "Resync completed: {} processed, {} ignored",
            report.processed, report.ignored
        ),
        processed: report.processed,
        ignored: report.ignored,
        errors: report.errors,
    }))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::db::{ChannelRepository, SyncStateRepository};
    use crate::testing::{seed_therapist, test_pool, test_state, FakeCalendar, CRON_SECRET};

    fn app(state: Arc<AppState>) -> Router {
        Router::new().nest("/api/gcal", router()).with_state(state)
    }

    fn authed(method: &str, uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {}", CRON_SECRET))
            .header("content-type", "application/json")
            .body(body)
            .unwrap()
    }

    async fn json_body(resp: axum::response::Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn setup_watch_requires_secret() {
        let state = test_state(test_pool().await, Arc::new(FakeCalendar::default()));
        let req = Request::builder()
            .method("POST")
            .uri("/api/gcal/setup-watch")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"therapist_id":"t1"}"#))
            .unwrap();

        let resp = app(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn setup_watch_registers_channel_and_reports_status() {
        let pool = test_pool().await;
        seed_therapist(&pool, "t1", Some("cal-1")).await;
        let fake = Arc::new(FakeCalendar::default());
        let state = test_state(pool.clone(), fake.clone());

        let resp = app(state.clone())
            .oneshot(authed(
                "POST",
                "/api/gcal/setup-watch",
                Body::from(r#"{"therapist_id":"t1"}"#),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["channel"]["resource_id"], "resource-1");

        let watches = fake.watches();
        assert_eq!(watches.len(), 1);
        assert_eq!(watches[0].3, "https://clinic.test/api/gcal/webhook");

        let channels = ChannelRepository::list_for_therapist(&pool, "t1").await.unwrap();
        assert_eq!(channels.len(), 1);
        let sync_state = SyncStateRepository::find(&pool, "cal-1").await.unwrap().unwrap();
        assert!(sync_state.sync_token.is_none());

        let resp = app(state)
            .oneshot(authed(
                "GET",
                "/api/gcal/setup-watch?therapist_id=t1",
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["calendar_id"], "cal-1");
        assert_eq!(body["channels"].as_array().unwrap().len(), 1);
        assert!(body["channels"][0].get("channel_token").is_none());
    }

    #[tokio::test]
    async fn setup_watch_validates_input() {
        let pool = test_pool().await;
        seed_therapist(&pool, "no-cal", None).await;
        let fake = Arc::new(FakeCalendar::default());
        let state = test_state(pool, fake);

        let resp = app(state.clone())
            .oneshot(authed("POST", "/api/gcal/setup-watch", Body::from("{}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app(state)
            .oneshot(authed(
                "POST",
                "/api/gcal/setup-watch",
                Body::from(r#"{"therapist_id":"no-cal"}"#),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_input_gets_json_error_body() {
        let pool = test_pool().await;
        seed_therapist(&pool, "t1", Some("cal-1")).await;
        let fake = Arc::new(FakeCalendar::default());
        let state = test_state(pool, fake.clone());

        let resp = app(state.clone())
            .oneshot(authed(
                "POST",
                "/api/gcal/setup-watch",
                Body::from("{not json"),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(resp.headers()["content-type"], "application/json");
        let body = json_body(resp).await;
        assert_eq!(body["error"]["code"], "BAD_REQUEST");
        assert!(body["error"]["message"].as_str().is_some());

        let resp = app(state)
            .oneshot(authed("GET", "/api/gcal/resync/t1?days_back=abc", Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = json_body(resp).await;
        assert_eq!(body["error"]["code"], "BAD_REQUEST");
        assert!(fake.list_queries().is_empty());
        assert!(fake.watches().is_empty());
    }

    #[tokio::test]
    async fn setup_watch_maps_provider_failure_to_bad_gateway() {
        let pool = test_pool().await;
        seed_therapist(&pool, "t1", Some("cal-1")).await;
        let fake = Arc::new(FakeCalendar::default());
        fake.fail_watch_for("cal-1");
        let state = test_state(pool, fake);

        let resp = app(state)
            .oneshot(authed(
                "POST",
                "/api/gcal/setup-watch",
                Body::from(r#"{"therapist_id":"t1"}"#),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn resync_uses_query_window_and_validates_bounds() {
        let pool = test_pool().await;
        seed_therapist(&pool, "t1", Some("cal-1")).await;
        let fake = Arc::new(FakeCalendar::default());
        let state = test_state(pool.clone(), fake.clone());

        let resp = app(state.clone())
            .oneshot(authed(
                "GET",
                "/api/gcal/resync/t1?days_back=7&days_forward=14",
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["processed"], 0);

        assert_eq!(fake.list_queries().len(), 1);
        let sync_state = SyncStateRepository::find(&pool, "cal-1").await.unwrap().unwrap();
        assert_eq!(sync_state.sync_token.as_deref(), Some("fresh-token"));

        let resp = app(state.clone())
            .oneshot(authed("GET", "/api/gcal/resync/t1?days_back=-1", Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app(state)
            .oneshot(authed("GET", "/api/gcal/resync/ghost", Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
