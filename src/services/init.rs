//! Initialization helpers for the application:
//! - database connection + migrations
//! - optional in-process workers for the channel and queue sweeps
//!
//! The sweeps are normally driven by an external cron calling the
//! `/api/cron/*` endpoints; the workers run the same code on a timer.

use std::future::Future;
use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::services::channels::ChannelManager;
use crate::services::outbound::OutboundSync;
use crate::AppState;

/// Redact potentially sensitive information from a database URL before logging.
///
/// Attempts to parse the URL and remove userinfo (username:password) components.
/// Falls back to removing everything before '@' or returning "(redacted)".
pub fn redact_db_url(db_url: &str) -> String {
    if let Ok(url) = url::Url::parse(db_url) {
        let scheme = url.scheme();
        let host = url.host_str().unwrap_or("");
        let port_part = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
        let path = url.path();
        format!("{}://{}{}{}", scheme, host, port_part, path)
    } else {
        if let Some(at_pos) = db_url.find('@') {
            let without_creds = &db_url[at_pos + 1..];
            return format!("(redacted){}", without_creds);
        }
        "(redacted)".to_string()
    }
}

/// Open the SQLite pool (creating the file and its directory if needed) and
/// run migrations.
pub async fn init_db(config: &Config) -> Result<sqlx::SqlitePool> {
    let db_url = &config.database.url;
    tracing::info!("Connecting to database: {}", redact_db_url(db_url));

    let db_path = db_url.strip_prefix("sqlite://").unwrap_or(db_url);
    let db_file_path = Path::new(db_path);

    if let Some(parent) = db_file_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                )
            })?;
        }
    }

    let connect_options = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect_with(connect_options)
        .await?;

    tracing::info!("Connected to database file: {}", db_file_path.display());

    tracing::info!("Running database migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Spawn the periodic sweeps when `GCAL_WORKERS_ENABLED` is set:
/// - channel renewal followed by bulk webhook setup every `worker_interval_seconds`
/// - outbound queue draining every `queue_worker_interval_seconds`
///
/// Returns the task handles so callers can await shutdown. Each worker exits
/// when the broadcast sender fires.
pub fn spawn_background_workers(
    state: Arc<AppState>,
    shutdown: broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    let sync = &state.config.sync;
    if !sync.workers_enabled {
        tracing::info!("Background sync workers disabled; relying on cron endpoints");
        return Vec::new();
    }

    let channel_every = Duration::from_secs(sync.worker_interval_seconds.max(1));
    let queue_every = Duration::from_secs(sync.queue_worker_interval_seconds.max(1));

    vec![
        spawn_worker(
            "channel maintenance",
            channel_every,
            state.clone(),
            shutdown.subscribe(),
            |state| async move { channel_maintenance(&state).await },
        ),
        spawn_worker(
            "sync queue",
            queue_every,
            state.clone(),
            shutdown.subscribe(),
            |state| async move {
                if let Err(e) = OutboundSync::process_queue(&state).await {
                    tracing::warn!("Sync queue processing failed: {:?}", e);
                }
            },
        ),
    ]
}

/// Renewal then bulk setup, one after the other. Both sweeps write the same
/// channel rows, so they must never overlap.
async fn channel_maintenance(state: &AppState) {
    match ChannelManager::renew_expiring(state).await {
        Ok(report) => tracing::info!(
            renewed = report.renewed,
            failed = report.failed,
            "Channel renewal sweep finished"
        ),
        Err(e) => tracing::warn!("Channel renewal sweep failed: {:?}", e),
    }

    if let Err(e) = ChannelManager::setup_all(state).await {
        tracing::warn!("Bulk webhook setup failed: {:?}", e);
    }
}

fn spawn_worker<F, Fut>(
    name: &'static str,
    every: Duration,
    state: Arc<AppState>,
    mut shutdown_rx: broadcast::Receiver<()>,
    run: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<AppState>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tracing::info!("Starting {} worker (every {}s)", name, every.as_secs());
        loop {
            run(state.clone()).await;

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("{} worker shutting down", name);
                    break;
                }
                _ = tokio::time::sleep(every) => {}
            }
        }
    })
}
