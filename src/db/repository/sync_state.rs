use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::models::CalendarSyncState;
use crate::error::{AppError, AppResult};

/// Repository for per-calendar sync cursors (`google_calendar_sync_state` table).
///
/// Tokens only ever come from Google: they are stored as returned, carried
/// forward, or cleared. Nothing here invents one.
pub struct SyncStateRepository;

impl SyncStateRepository {
    pub async fn find(pool: &SqlitePool, calendar_id: &str) -> AppResult<Option<CalendarSyncState>> {
        let row = sqlx::query_as::<_, CalendarSyncState>(
            r#"
            SELECT calendar_id, sync_token, last_sync_at, created_at, updated_at
            FROM google_calendar_sync_state
            WHERE calendar_id = ?
            "#,
        )
        .bind(calendar_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Create the row for `calendar_id`, or null out its token if it exists.
    pub async fn reset(pool: &SqlitePool, calendar_id: &str) -> AppResult<CalendarSyncState> {
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, CalendarSyncState>(
            r#"
            INSERT INTO google_calendar_sync_state (calendar_id, sync_token, last_sync_at, created_at, updated_at)
            VALUES (?, NULL, NULL, ?, ?)
            ON CONFLICT(calendar_id) DO UPDATE SET
                sync_token = NULL,
                updated_at = excluded.updated_at
            RETURNING calendar_id, sync_token, last_sync_at, created_at, updated_at
            "#,
        )
        .bind(calendar_id)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Record a completed pull. `next_sync_token` replaces the stored token when
    /// present; otherwise the stored token is kept. `last_sync_at` always moves.
    pub async fn record_sync(
        pool: &SqlitePool,
        calendar_id: &str,
        next_sync_token: Option<&str>,
    ) -> AppResult<CalendarSyncState> {
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, CalendarSyncState>(
            r#"
            INSERT INTO google_calendar_sync_state (calendar_id, sync_token, last_sync_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(calendar_id) DO UPDATE SET
                sync_token = COALESCE(excluded.sync_token, google_calendar_sync_state.sync_token),
                last_sync_at = excluded.last_sync_at,
                updated_at = excluded.updated_at
            RETURNING calendar_id, sync_token, last_sync_at, created_at, updated_at
            "#,
        )
        .bind(calendar_id)
        .bind(next_sync_token)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Forget a token Google reported as gone (HTTP 410).
    pub async fn clear_token(pool: &SqlitePool, calendar_id: &str) -> AppResult<()> {
        let now = Utc::now().naive_utc();

        sqlx::query(
            "UPDATE google_calendar_sync_state SET sync_token = NULL, updated_at = ? WHERE calendar_id = ?",
        )
        .bind(now)
        .bind(calendar_id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }
}
