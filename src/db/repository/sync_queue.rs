use chrono::{Duration, Utc};
use sqlx::SqlitePool;

use crate::db::models::{QueueStats, SyncJob};
use crate::error::{AppError, AppResult};

const JOB_COLUMNS: &str = "id, appointment_id, action, status, retry_count, max_retries, \
     last_error, created_at, claimed_at, processed_at";

/// Repository for the outbound sync queue (`gcal_sync_queue` table).
///
/// Jobs are inserted by triggers on `appointments`. Claiming uses the same
/// single-statement `UPDATE ... WHERE id = (SELECT ... LIMIT 1) RETURNING`
/// pattern as the other queues so no transaction is held open.
pub struct SyncQueueRepository;

impl SyncQueueRepository {
    /// Claim up to `limit` pending jobs, oldest first, moving them to `processing`.
    ///
    /// Jobs left in `processing` for longer than `stale_after` belong to a run
    /// that died or lost its bookkeeping writes; they are put back to
    /// `pending` first so this run can pick them up.
    pub async fn claim_pending(
        pool: &SqlitePool,
        limit: i64,
        stale_after: Duration,
    ) -> AppResult<Vec<SyncJob>> {
        let mut jobs = Vec::new();
        if limit <= 0 {
            return Ok(jobs);
        }

        let reclaimed = Self::release_stale(pool, stale_after).await?;
        if reclaimed > 0 {
            tracing::warn!("Requeued {} stale sync job(s) stuck in processing", reclaimed);
        }

        for _ in 0..limit {
            let now = Utc::now().naive_utc();
            let job = sqlx::query_as::<_, SyncJob>(&format!(
                r#"
                UPDATE gcal_sync_queue
                SET status = 'processing', claimed_at = ?
                WHERE id = (
                    SELECT id FROM gcal_sync_queue
                    WHERE status = 'pending'
                    ORDER BY created_at ASC, rowid ASC
                    LIMIT 1
                )
                RETURNING {JOB_COLUMNS}
                "#
            ))
            .bind(now)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

            match job {
                Some(job) => jobs.push(job),
                None => break,
            }
        }

        Ok(jobs)
    }

    /// Move `processing` jobs claimed before `now - stale_after` back to `pending`.
    /// A job with no claim time is treated as stale.
    pub async fn release_stale(pool: &SqlitePool, stale_after: Duration) -> AppResult<u64> {
        let cutoff = Utc::now().naive_utc() - stale_after;

        let result = sqlx::query(
            r#"
            UPDATE gcal_sync_queue
            SET status = 'pending', claimed_at = NULL
            WHERE status = 'processing'
              AND (claimed_at IS NULL OR claimed_at < ?)
            "#,
        )
        .bind(cutoff)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    pub async fn mark_completed(pool: &SqlitePool, id: &str) -> AppResult<()> {
        let now = Utc::now().naive_utc();

        sqlx::query(
            "UPDATE gcal_sync_queue SET status = 'completed', last_error = NULL, processed_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    /// Record a failed attempt. The job goes back to `pending` with its retry
    /// count bumped while retries remain, and to `failed` once they run out.
    /// Returns the updated row so callers can tell which happened.
    pub async fn register_failure(
        pool: &SqlitePool,
        id: &str,
        error: &str,
    ) -> AppResult<SyncJob> {
        let now = Utc::now().naive_utc();

        let job = sqlx::query_as::<_, SyncJob>(&format!(
            r#"
            UPDATE gcal_sync_queue
            SET status = CASE WHEN retry_count < max_retries THEN 'pending' ELSE 'failed' END,
                retry_count = CASE WHEN retry_count < max_retries THEN retry_count + 1 ELSE retry_count END,
                last_error = ?,
                processed_at = ?
            WHERE id = ?
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(error)
        .bind(now)
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(job)
    }

    pub async fn stats(pool: &SqlitePool) -> AppResult<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM gcal_sync_queue GROUP BY status")
                .fetch_all(pool)
                .await
                .map_err(AppError::Database)?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status.as_str() {
                "pending" => stats.pending = count,
                "processing" => stats.processing = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                _ => {}
            }
        }

        Ok(stats)
    }
}
