use chrono::{NaiveDateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{Appointment, AppointmentFromEvent, AppointmentOrigin, ExternalEventLink};
use crate::error::{AppError, AppResult};

const APPOINTMENT_COLUMNS: &str = "id, therapist_id, patient_id, summary, notes, start_at, end_at, \
     status, origin, external_event_id, external_calendar_id, recurring_event_id, ical_uid, \
     html_link, gcal_etag, source_updated_at, created_at, updated_at";

/// Repository for the calendar-facing side of `appointments`.
///
/// Rows are matched to Google events by the (external_event_id,
/// external_calendar_id) pair. Updates coming from Google never touch the
/// row id, patient link, therapist or origin.
pub struct AppointmentRepository;

impl AppointmentRepository {
    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Appointment>> {
        let row = sqlx::query_as::<_, Appointment>(&format!(
            "SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_external(
        pool: &SqlitePool,
        external_event_id: &str,
        calendar_id: &str,
    ) -> AppResult<Option<Appointment>> {
        let row = sqlx::query_as::<_, Appointment>(&format!(
            "SELECT {APPOINTMENT_COLUMNS} FROM appointments \
             WHERE external_event_id = ? AND external_calendar_id = ?"
        ))
        .bind(external_event_id)
        .bind(calendar_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Mark the appointment(s) linked to a cancelled Google event as cancelled.
    /// Returns the number of rows touched; zero when the event was never imported.
    pub async fn cancel_by_external(
        pool: &SqlitePool,
        external_event_id: &str,
        calendar_id: &str,
        source_updated_at: Option<NaiveDateTime>,
    ) -> AppResult<u64> {
        let now = Utc::now().naive_utc();

        let result = sqlx::query(
            r#"
            UPDATE appointments
            SET status = 'cancelled', source_updated_at = ?, updated_at = ?
            WHERE external_event_id = ? AND external_calendar_id = ?
            "#,
        )
        .bind(source_updated_at.unwrap_or(now))
        .bind(now)
        .bind(external_event_id)
        .bind(calendar_id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    /// Overwrite the Google-owned fields of an existing appointment.
    ///
    /// A locally `completed` appointment keeps its status.
    pub async fn update_from_event(
        pool: &SqlitePool,
        id: &str,
        event: &AppointmentFromEvent,
    ) -> AppResult<Appointment> {
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, Appointment>(&format!(
            r#"
            UPDATE appointments
            SET summary = ?,
                notes = ?,
                start_at = ?,
                end_at = ?,
                status = CASE WHEN status = 'completed' THEN status ELSE ? END,
                recurring_event_id = ?,
                ical_uid = ?,
                html_link = ?,
                gcal_etag = ?,
                source_updated_at = ?,
                updated_at = ?
            WHERE id = ?
            RETURNING {APPOINTMENT_COLUMNS}
            "#
        ))
        .bind(&event.summary)
        .bind(&event.notes)
        .bind(event.start_at)
        .bind(event.end_at)
        .bind(event.status.as_str())
        .bind(&event.recurring_event_id)
        .bind(&event.ical_uid)
        .bind(&event.html_link)
        .bind(&event.gcal_etag)
        .bind(event.source_updated_at.unwrap_or(now))
        .bind(now)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?
        .ok_or_else(|| AppError::NotFound(format!("Appointment {} not found", id)))?;

        Ok(row)
    }

    /// Attach a locally created appointment to the Google event that mirrors it,
    /// refreshing its fields from the event. Returns `None` when `id` does not
    /// exist or is already linked to a different event.
    pub async fn link_from_event(
        pool: &SqlitePool,
        id: &str,
        calendar_id: &str,
        event: &AppointmentFromEvent,
    ) -> AppResult<Option<Appointment>> {
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, Appointment>(&format!(
            r#"
            UPDATE appointments
            SET external_event_id = ?,
                external_calendar_id = ?,
                summary = ?,
                notes = ?,
                start_at = ?,
                end_at = ?,
                status = CASE WHEN status = 'completed' THEN status ELSE ? END,
                recurring_event_id = ?,
                ical_uid = ?,
                html_link = ?,
                gcal_etag = ?,
                source_updated_at = ?,
                updated_at = ?
            WHERE id = ?
              AND (external_event_id IS NULL
                   OR (external_event_id = ? AND external_calendar_id = ?))
            RETURNING {APPOINTMENT_COLUMNS}
            "#
        ))
        .bind(&event.external_event_id)
        .bind(calendar_id)
        .bind(&event.summary)
        .bind(&event.notes)
        .bind(event.start_at)
        .bind(event.end_at)
        .bind(event.status.as_str())
        .bind(&event.recurring_event_id)
        .bind(&event.ical_uid)
        .bind(&event.html_link)
        .bind(&event.gcal_etag)
        .bind(event.source_updated_at.unwrap_or(now))
        .bind(now)
        .bind(id)
        .bind(&event.external_event_id)
        .bind(calendar_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Import a Google event as a new appointment owned by `therapist_id`.
    ///
    /// The insert is an upsert on the external pair, so a row created
    /// concurrently for the same event is updated instead of duplicated. The
    /// boolean is `true` when a new row was created.
    pub async fn insert_from_event(
        pool: &SqlitePool,
        therapist_id: &str,
        calendar_id: &str,
        event: &AppointmentFromEvent,
    ) -> AppResult<(Appointment, bool)> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, Appointment>(&format!(
            r#"
            INSERT INTO appointments (
                id, therapist_id, patient_id, summary, notes, start_at, end_at,
                status, origin, external_event_id, external_calendar_id,
                recurring_event_id, ical_uid, html_link, gcal_etag,
                source_updated_at, created_at, updated_at
            )
            VALUES (?, ?, NULL, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(external_event_id, external_calendar_id) DO UPDATE SET
                summary = excluded.summary,
                notes = excluded.notes,
                start_at = excluded.start_at,
                end_at = excluded.end_at,
                status = CASE WHEN appointments.status = 'completed'
                              THEN appointments.status ELSE excluded.status END,
                recurring_event_id = excluded.recurring_event_id,
                ical_uid = excluded.ical_uid,
                html_link = excluded.html_link,
                gcal_etag = excluded.gcal_etag,
                source_updated_at = excluded.source_updated_at,
                updated_at = excluded.updated_at
            RETURNING {APPOINTMENT_COLUMNS}
            "#
        ))
        .bind(&id)
        .bind(therapist_id)
        .bind(&event.summary)
        .bind(&event.notes)
        .bind(event.start_at)
        .bind(event.end_at)
        .bind(event.status.as_str())
        .bind(AppointmentOrigin::Google.as_str())
        .bind(&event.external_event_id)
        .bind(calendar_id)
        .bind(&event.recurring_event_id)
        .bind(&event.ical_uid)
        .bind(&event.html_link)
        .bind(&event.gcal_etag)
        .bind(event.source_updated_at.unwrap_or(now))
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        let created = row.id == id;
        Ok((row, created))
    }

    /// Store the identifiers Google assigned after an outbound insert or patch.
    pub async fn set_external_link(
        pool: &SqlitePool,
        id: &str,
        link: &ExternalEventLink,
    ) -> AppResult<()> {
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            UPDATE appointments
            SET external_event_id = ?,
                external_calendar_id = ?,
                html_link = COALESCE(?, html_link),
                gcal_etag = COALESCE(?, gcal_etag),
                ical_uid = COALESCE(?, ical_uid),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&link.external_event_id)
        .bind(&link.external_calendar_id)
        .bind(&link.html_link)
        .bind(&link.gcal_etag)
        .bind(&link.ical_uid)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }
}
