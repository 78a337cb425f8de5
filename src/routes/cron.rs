use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::db::models::QueueStats;
use crate::db::SyncQueueRepository;
use crate::error::AppError;
use crate::routes::auth::CronAuth;
use crate::services::channels::{ChannelManager, RenewalReport, SetupSweepReport};
use crate::services::outbound::{OutboundSync, QueueReport};
use crate::AppState;

/// Endpoints hit by the external scheduler. All of them require the cron secret.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/renew-gcal-channels",
            get(renewal_status).post(renew_channels),
        )
        .route(
            "/setup-all-gcal-webhooks",
            get(webhook_status).post(setup_all_webhooks),
        )
        .route("/process-gcal-sync", get(queue_status).post(process_queue))
}

#[derive(Debug, Serialize)]
pub struct SweepResponse<T> {
    pub success: bool,
    #[serde(flatten)]
    pub report: T,
}

impl<T> SweepResponse<T> {
    fn ok(report: T) -> Json<Self> {
        Json(SweepResponse {
            success: true,
            report,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct RenewalStatus {
    pub status: &'static str,
    pub active_channels: i64,
    pub expiring_soon: i64,
}

#[derive(Debug, Serialize)]
pub struct WebhookStatus {
    pub status: &'static str,
    pub active: i64,
    pub expiring_in_24h: i64,
    pub expired: i64,
    pub total: i64,
}

#[derive(Debug, Serialize)]
pub struct QueueStatus {
    pub status: &'static str,
    pub queue_stats: QueueStats,
    pub batch_size: i64,
}

// ============================================================================
// Channel renewal
// ============================================================================

async fn renew_channels(
    State(state): State<Arc<AppState>>,
    _auth: CronAuth,
) -> Result<Json<SweepResponse<RenewalReport>>, AppError> {
    let report = ChannelManager::renew_expiring(&state).await?;
    tracing::info!(
        renewed = report.renewed,
        failed = report.failed,
        "Channel renewal requested by cron"
    );
    Ok(SweepResponse::ok(report))
}

async fn renewal_status(
    State(state): State<Arc<AppState>>,
    _auth: CronAuth,
) -> Result<Json<RenewalStatus>, AppError> {
    let counts = ChannelManager::counts(&state).await?;
    Ok(Json(RenewalStatus {
        status: "healthy",
        active_channels: counts.active,
        expiring_soon: counts.expiring_soon,
    }))
}

// ============================================================================
// Bulk webhook setup
// ============================================================================

async fn setup_all_webhooks(
    State(state): State<Arc<AppState>>,
    _auth: CronAuth,
) -> Result<Json<SweepResponse<SetupSweepReport>>, AppError> {
    let report = ChannelManager::setup_all(&state).await?;
    Ok(SweepResponse::ok(report))
}

async fn webhook_status(
    State(state): State<Arc<AppState>>,
    _auth: CronAuth,
) -> Result<Json<WebhookStatus>, AppError> {
    let counts = ChannelManager::counts(&state).await?;
    Ok(Json(WebhookStatus {
        status: "healthy",
        active: counts.active,
        expiring_in_24h: counts.expiring_soon,
        expired: counts.expired,
        total: counts.total,
    }))
}

// ============================================================================
// Outbound queue
// ============================================================================

async fn process_queue(
    State(state): State<Arc<AppState>>,
    _auth: CronAuth,
) -> Result<Json<SweepResponse<QueueReport>>, AppError> {
    let report = OutboundSync::process_queue(&state).await?;
    Ok(SweepResponse::ok(report))
}

async fn queue_status(
    State(state): State<Arc<AppState>>,
    _auth: CronAuth,
) -> Result<Json<QueueStatus>, AppError> {
    let queue_stats = SyncQueueRepository::stats(&state.db).await?;
    Ok(Json(QueueStatus {
        status: "healthy",
        queue_stats,
        batch_size: state.config.sync.queue_batch_size,
    }))
}
