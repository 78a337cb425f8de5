use chrono::{NaiveDateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CalendarChannel, ChannelCounts, UpsertCalendarChannel};
use crate::error::{AppError, AppResult};

const CHANNEL_COLUMNS: &str = "id, therapist_id, calendar_id, channel_id, resource_id, \
     channel_token, expiration, is_active, created_at, updated_at";

/// Repository for Google push channels (`google_calendar_channels` table).
///
/// A (therapist, calendar) pair owns at most one row. Setup replaces the row in
/// place through `upsert`; renewal rewrites the registration fields through
/// `update_registration`.
pub struct ChannelRepository;

impl ChannelRepository {
    /// Insert or replace the channel for (therapist_id, calendar_id) and mark it active.
    pub async fn upsert(
        pool: &SqlitePool,
        channel: UpsertCalendarChannel,
    ) -> AppResult<CalendarChannel> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, CalendarChannel>(&format!(
            r#"
            INSERT INTO google_calendar_channels (
                id, therapist_id, calendar_id, channel_id, resource_id,
                channel_token, expiration, is_active, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT(therapist_id, calendar_id) DO UPDATE SET
                channel_id = excluded.channel_id,
                resource_id = excluded.resource_id,
                channel_token = excluded.channel_token,
                expiration = excluded.expiration,
                is_active = 1,
                updated_at = excluded.updated_at
            RETURNING {CHANNEL_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(channel.therapist_id)
        .bind(channel.calendar_id)
        .bind(channel.channel_id)
        .bind(channel.resource_id)
        .bind(channel.channel_token)
        .bind(channel.expiration)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_for_therapist_calendar(
        pool: &SqlitePool,
        therapist_id: &str,
        calendar_id: &str,
    ) -> AppResult<Option<CalendarChannel>> {
        let row = sqlx::query_as::<_, CalendarChannel>(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM google_calendar_channels \
             WHERE therapist_id = ? AND calendar_id = ?"
        ))
        .bind(therapist_id)
        .bind(calendar_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Look up the active channel a push notification claims to come from.
    ///
    /// All three identifiers must match; a stale or forged token yields `None`.
    pub async fn find_active_by_notification(
        pool: &SqlitePool,
        channel_id: &str,
        resource_id: &str,
        channel_token: &str,
    ) -> AppResult<Option<CalendarChannel>> {
        let row = sqlx::query_as::<_, CalendarChannel>(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM google_calendar_channels \
             WHERE channel_id = ? AND resource_id = ? AND channel_token = ? AND is_active = 1"
        ))
        .bind(channel_id)
        .bind(resource_id)
        .bind(channel_token)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Active channels expiring before `threshold`, soonest first.
    pub async fn list_active_expiring_before(
        pool: &SqlitePool,
        threshold: NaiveDateTime,
    ) -> AppResult<Vec<CalendarChannel>> {
        let rows = sqlx::query_as::<_, CalendarChannel>(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM google_calendar_channels \
             WHERE is_active = 1 AND expiration < ? \
             ORDER BY expiration ASC"
        ))
        .bind(threshold)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    pub async fn list_for_therapist(
        pool: &SqlitePool,
        therapist_id: &str,
    ) -> AppResult<Vec<CalendarChannel>> {
        let rows = sqlx::query_as::<_, CalendarChannel>(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM google_calendar_channels \
             WHERE therapist_id = ? \
             ORDER BY created_at ASC"
        ))
        .bind(therapist_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    /// Point an existing channel row at a fresh registration. The row id, owner
    /// and calendar are kept.
    pub async fn update_registration(
        pool: &SqlitePool,
        id: &str,
        channel_id: &str,
        resource_id: &str,
        channel_token: &str,
        expiration: NaiveDateTime,
    ) -> AppResult<CalendarChannel> {
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, CalendarChannel>(&format!(
            r#"
            UPDATE google_calendar_channels
            SET channel_id = ?, resource_id = ?, channel_token = ?, expiration = ?,
                is_active = 1, updated_at = ?
            WHERE id = ?
            RETURNING {CHANNEL_COLUMNS}
            "#
        ))
        .bind(channel_id)
        .bind(resource_id)
        .bind(channel_token)
        .bind(expiration)
        .bind(now)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?
        .ok_or_else(|| AppError::NotFound(format!("Channel {} not found", id)))?;

        Ok(row)
    }

    pub async fn mark_inactive(pool: &SqlitePool, id: &str) -> AppResult<()> {
        let now = Utc::now().naive_utc();

        sqlx::query("UPDATE google_calendar_channels SET is_active = 0, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(())
    }

    /// Counts used by the cron status endpoints. `soon` bounds the
    /// "expiring soon" bucket; `now` separates it from already expired channels.
    pub async fn counts(
        pool: &SqlitePool,
        now: NaiveDateTime,
        soon: NaiveDateTime,
    ) -> AppResult<ChannelCounts> {
        let (total, active, expiring_soon, expired): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN is_active = 1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN is_active = 1 AND expiration >= ? AND expiration < ? THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN is_active = 1 AND expiration < ? THEN 1 ELSE 0 END), 0)
            FROM google_calendar_channels
            "#,
        )
        .bind(now)
        .bind(soon)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(ChannelCounts {
            total,
            active,
            expiring_soon,
            expired,
        })
    }
}
