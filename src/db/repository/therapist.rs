use sqlx::SqlitePool;

use crate::db::models::Therapist;
use crate::error::{AppError, AppResult};

pub struct TherapistRepository;

impl TherapistRepository {
    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Therapist>> {
        let therapist = sqlx::query_as::<_, Therapist>(
            r#"
            SELECT id, email, role, google_calendar_id, created_at, updated_at
            FROM users
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(therapist)
    }

    /// Therapists that have a Google calendar configured, oldest first.
    pub async fn list_with_calendar(pool: &SqlitePool) -> AppResult<Vec<Therapist>> {
        let therapists = sqlx::query_as::<_, Therapist>(
            r#"
            SELECT id, email, role, google_calendar_id, created_at, updated_at
            FROM users
            WHERE role = 'therapist'
              AND google_calendar_id IS NOT NULL
              AND google_calendar_id != ''
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(therapists)
    }
}
