use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateSyncLogEntry, SyncLogEntry};
use crate::error::{AppError, AppResult};

/// Audit trail of sync operations (`calendar_sync_log` table).
pub struct SyncLogRepository;

impl SyncLogRepository {
    pub async fn create(
        pool: &SqlitePool,
        status: &str,
        entry: CreateSyncLogEntry,
    ) -> AppResult<SyncLogEntry> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();
        let payload = entry.payload.map(|p| p.to_string());

        let row = sqlx::query_as::<_, SyncLogEntry>(
            r#"
            INSERT INTO calendar_sync_log (
                id, event_id, calendar_id, action, direction, status,
                error_message, payload, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id, event_id, calendar_id, action, direction, status,
                      error_message, payload, created_at
            "#,
        )
        .bind(id)
        .bind(entry.event_id)
        .bind(entry.calendar_id)
        .bind(entry.action)
        .bind(entry.direction.as_str())
        .bind(status)
        .bind(entry.error_message)
        .bind(payload)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Write a log row without letting a logging failure escape.
    pub async fn record(pool: &SqlitePool, status: &str, entry: CreateSyncLogEntry) {
        if let Err(e) = Self::create(pool, status, entry).await {
            tracing::warn!("Failed to write calendar sync log: {:?}", e);
        }
    }

    pub async fn list_recent(
        pool: &SqlitePool,
        calendar_id: &str,
        limit: i64,
    ) -> AppResult<Vec<SyncLogEntry>> {
        let rows = sqlx::query_as::<_, SyncLogEntry>(
            r#"
            SELECT id, event_id, calendar_id, action, direction, status,
                   error_message, payload, created_at
            FROM calendar_sync_log
            WHERE calendar_id = ?
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(calendar_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }
}
