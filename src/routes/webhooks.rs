use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use serde::Serialize;

use crate::db::ChannelRepository;
use crate::error::{AppError, AppResult};
use crate::services::sync::{EventError, SyncProcessor};
use crate::AppState;

const CHANNEL_ID_HEADER: &str = "x-goog-channel-id";
const RESOURCE_ID_HEADER: &str = "x-goog-resource-id";
const RESOURCE_STATE_HEADER: &str = "x-goog-resource-state";
const CHANNEL_TOKEN_HEADER: &str = "x-goog-channel-token";

/// Google push notifications. Mounted with its own rate limiter.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route(
        "/api/gcal/webhook",
        post(handle_google_webhook).get(webhook_ready),
    )
}

/// Headers Google attaches to every channel notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushHeaders {
    pub channel_id: String,
    pub resource_id: String,
    /// `sync` for the handshake right after a watch, `exists` / `not_exists` afterwards.
    pub resource_state: String,
    pub channel_token: String,
}

impl PushHeaders {
    pub fn extract(headers: &HeaderMap) -> AppResult<Self> {
        Ok(PushHeaders {
            channel_id: get_header(headers, CHANNEL_ID_HEADER)?,
            resource_id: get_header(headers, RESOURCE_ID_HEADER)?,
            resource_state: get_header(headers, RESOURCE_STATE_HEADER)?,
            channel_token: get_header(headers, CHANNEL_TOKEN_HEADER)?,
        })
    }
}

fn get_header(headers: &HeaderMap, name: &str) -> AppResult<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| AppError::BadRequest(format!("Missing header: {}", name)))
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub success: bool,
    pub processed: usize,
    pub ignored: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<EventError>,
}

async fn handle_google_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<WebhookResponse>, AppError> {
    let push = PushHeaders::extract(&headers)?;

    tracing::info!(
        channel_id = %push.channel_id,
        resource_state = %push.resource_state,
        "Received Google Calendar notification"
    );

    let channel = ChannelRepository::find_active_by_notification(
        &state.db,
        &push.channel_id,
        &push.resource_id,
        &push.channel_token,
    )
    .await?
    .ok_or_else(|| {
        tracing::warn!(channel_id = %push.channel_id, "Channel not found or inactive");
        AppError::Unauthorized
    })?;

    let report = SyncProcessor::handle_notification(&state, &channel).await?;

    Ok(Json(WebhookResponse {
        success: true,
        processed: report.processed,
        ignored: report.ignored,
        errors: report.errors,
    }))
}

async fn webhook_ready() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "webhook_ready",
            "message": "POST Google Calendar push notifications here",
        })),
    )
}
