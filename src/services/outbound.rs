use std::collections::HashMap;

use chrono::Duration;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::db::models::{
    Appointment, CreateSyncLogEntry, ExternalEventLink, SyncAction, SyncDirection, SyncJob,
};
use crate::db::{AppointmentRepository, SyncLogRepository, SyncQueueRepository, TherapistRepository};
use crate::error::{AppError, AppResult};
use crate::services::google_calendar::{
    EventDateTime, EventWrite, ExtendedProperties, GoogleEvent, LOCAL_APPOINTMENT_PROPERTY,
};
use crate::AppState;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobError {
    pub job_id: String,
    pub appointment_id: String,
    pub action: String,
    pub message: String,
}

impl JobError {
    fn new(job: &SyncJob, message: String) -> Self {
        JobError {
            job_id: job.id.clone(),
            appointment_id: job.appointment_id.clone(),
            action: job.action.clone(),
            message,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct QueueReport {
    pub processed: usize,
    pub succeeded: usize,
    /// Jobs put back to `pending` for another attempt.
    pub retried: usize,
    /// Jobs that ran out of retries.
    pub failed: usize,
    /// Final failures plus jobs whose queue bookkeeping could not be written.
    pub errors: Vec<JobError>,
}

/// Outbound half of the sync: mirrors local appointment changes queued in
/// `gcal_sync_queue` into Google Calendar.
pub struct OutboundSync;

impl OutboundSync {
    /// Drain one batch of pending jobs, oldest first.
    ///
    /// Only the claim itself can fail the run. A job whose bookkeeping write
    /// fails is reported in `errors` and left in `processing`; the claim
    /// timeout hands it to a later run.
    pub async fn process_queue(state: &AppState) -> AppResult<QueueReport> {
        let sync = &state.config.sync;
        let jobs = SyncQueueRepository::claim_pending(
            &state.db,
            sync.queue_batch_size,
            Duration::minutes(sync.queue_claim_timeout_minutes),
        )
        .await?;

        let mut report = QueueReport::default();
        if jobs.is_empty() {
            return Ok(report);
        }

        info!("Processing {} pending Google Calendar sync job(s)", jobs.len());

        for job in jobs {
            report.processed += 1;

            match Self::process_job(state, &job).await {
                Ok(()) => match SyncQueueRepository::mark_completed(&state.db, &job.id).await {
                    Ok(()) => report.succeeded += 1,
                    Err(e) => {
                        error!(job_id = %job.id, "Failed to mark sync job completed: {}", e);
                        report.errors.push(JobError::new(&job, e.to_string()));
                    }
                },
                Err(e) => Self::handle_failure(state, &job, e.to_string(), &mut report).await,
            }
        }

        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            retried = report.retried,
            failed = report.failed,
            errors = report.errors.len(),
            "Sync queue batch finished"
        );

        Ok(report)
    }

    async fn handle_failure(
        state: &AppState,
        job: &SyncJob,
        message: String,
        report: &mut QueueReport,
    ) {
        let updated = match SyncQueueRepository::register_failure(&state.db, &job.id, &message).await
        {
            Ok(updated) => updated,
            Err(e) => {
                error!(job_id = %job.id, "Failed to record sync job failure: {}", e);
                report.errors.push(JobError::new(
                    job,
                    format!("{} (failure not recorded: {})", message, e),
                ));
                return;
            }
        };

        SyncLogRepository::record(
            &state.db,
            "error",
            CreateSyncLogEntry {
                event_id: None,
                calendar_id: None,
                action: job.action.clone(),
                direction: SyncDirection::LocalToGoogle,
                error_message: Some(message.clone()),
                payload: Some(serde_json::json!({
                    "job_id": job.id,
                    "appointment_id": job.appointment_id,
                    "retry_count": updated.retry_count,
                })),
            },
        )
        .await;

        if updated.status == "failed" {
            warn!(
                job_id = %job.id,
                "Sync job failed after {} retries: {}",
                updated.max_retries,
                message
            );
            report.failed += 1;
            report.errors.push(JobError::new(job, message));
        } else {
            warn!(
                job_id = %job.id,
                "Sync job will be retried (attempt {}/{}): {}",
                updated.retry_count,
                updated.max_retries,
                message
            );
            report.retried += 1;
        }
    }

    async fn process_job(state: &AppState, job: &SyncJob) -> AppResult<()> {
        let action: SyncAction = job.action.parse().map_err(AppError::BadRequest)?;

        let appointment = AppointmentRepository::find_by_id(&state.db, &job.appointment_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Appointment not found: {}", job.appointment_id))
            })?;

        let calendar_id = Self::calendar_for(state, &appointment).await?;
        let timezone = state.config.google.timezone.as_str();

        match action {
            SyncAction::Create => {
                if appointment.external_event_id.is_some() {
                    info!(appointment_id = %appointment.id, "Appointment already linked; nothing to create");
                    return Ok(());
                }

                let mut private = HashMap::new();
                private.insert(LOCAL_APPOINTMENT_PROPERTY.to_string(), appointment.id.clone());
                let body = EventWrite {
                    extended_properties: Some(ExtendedProperties {
                        private: Some(private),
                        shared: None,
                    }),
                    ..event_body(&appointment, timezone)
                };

                let created = state.calendar.insert_event(&calendar_id, &body).await?;
                Self::store_link(state, &appointment.id, &calendar_id, created).await?;
            }
            SyncAction::Update => {
                let event_id = linked_event_id(&appointment, action)?;
                let body = event_body(&appointment, timezone);

                let updated = state
                    .calendar
                    .patch_event(&calendar_id, event_id, &body, appointment.gcal_etag.as_deref())
                    .await?;
                Self::store_link(state, &appointment.id, &calendar_id, updated).await?;
            }
            SyncAction::Delete => {
                let event_id = linked_event_id(&appointment, action)?;

                match state.calendar.delete_event(&calendar_id, event_id).await {
                    Ok(()) => {}
                    Err(e) if matches!(e.upstream_status(), Some(404) | Some(410)) => {
                        info!(event_id, "Event already gone from Google Calendar");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        SyncLogRepository::record(
            &state.db,
            "success",
            CreateSyncLogEntry {
                event_id: appointment.external_event_id.clone(),
                calendar_id: Some(calendar_id),
                action: action.to_string(),
                direction: SyncDirection::LocalToGoogle,
                error_message: None,
                payload: Some(serde_json::json!({ "appointment_id": appointment.id })),
            },
        )
        .await;

        Ok(())
    }

    /// The calendar an appointment lives in: the one it is already linked to,
    /// otherwise its therapist's.
    async fn calendar_for(state: &AppState, appointment: &Appointment) -> AppResult<String> {
        if let Some(calendar_id) = appointment.external_calendar_id.clone() {
            return Ok(calendar_id);
        }

        TherapistRepository::find_by_id(&state.db, &appointment.therapist_id)
            .await?
            .and_then(|t| t.google_calendar_id)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "Therapist has no Google Calendar configured (therapist_id: {})",
                    appointment.therapist_id
                ))
            })
    }

    async fn store_link(
        state: &AppState,
        appointment_id: &str,
        calendar_id: &str,
        event: GoogleEvent,
    ) -> AppResult<()> {
        AppointmentRepository::set_external_link(
            &state.db,
            appointment_id,
            &ExternalEventLink {
                external_event_id: event.id,
                external_calendar_id: calendar_id.to_string(),
                html_link: event.html_link,
                gcal_etag: event.etag,
                ical_uid: event.ical_uid,
            },
        )
        .await
    }
}

fn event_body(appointment: &Appointment, timezone: &str) -> EventWrite {
    EventWrite {
        summary: appointment.summary.clone(),
        description: appointment.notes.clone(),
        start: EventDateTime::at(appointment.start_at, timezone),
        end: EventDateTime::at(appointment.end_at, timezone),
        extended_properties: None,
    }
}

fn linked_event_id(appointment: &Appointment, action: SyncAction) -> AppResult<&str> {
    appointment.external_event_id.as_deref().ok_or_else(|| {
        AppError::BadRequest(format!(
            "Cannot {}: appointment {} has no Google event",
            action, appointment.id
        ))
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::{seed_system_appointment, seed_therapist, test_pool, test_state, FakeCalendar};

    async fn jobs(pool: &sqlx::SqlitePool) -> Vec<SyncJob> {
        sqlx::query_as::<_, SyncJob>("SELECT * FROM gcal_sync_queue ORDER BY created_at, rowid")
            .fetch_all(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn insert_trigger_queues_create_and_processor_links_event() {
        let pool = test_pool().await;
        seed_therapist(&pool, "t1", Some("cal-1")).await;
        let id = seed_system_appointment(&pool, "t1", "Intake").await;

        let queued = jobs(&pool).await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].action, "create");

        let fake = Arc::new(FakeCalendar::default());
        let state = test_state(pool.clone(), fake.clone());

        let report = OutboundSync::process_queue(&state).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.succeeded, 1);

        let inserted = fake.inserted();
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].0, "cal-1");
        let private = inserted[0].1.extended_properties.clone().unwrap().private.unwrap();
        assert_eq!(private.get(LOCAL_APPOINTMENT_PROPERTY), Some(&id));

        let appointment = AppointmentRepository::find_by_id(&pool, &id).await.unwrap().unwrap();
        assert_eq!(appointment.external_event_id.as_deref(), Some("gcal-1"));
        assert_eq!(appointment.external_calendar_id.as_deref(), Some("cal-1"));
        assert!(appointment.gcal_etag.is_some());

        // Linking does not queue more work.
        let queued = jobs(&pool).await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].status, "completed");
    }

    #[tokio::test]
    async fn local_edit_and_cancel_are_mirrored() {
        let pool = test_pool().await;
        seed_therapist(&pool, "t1", Some("cal-1")).await;
        let id = seed_system_appointment(&pool, "t1", "Intake").await;
        let fake = Arc::new(FakeCalendar::default());
        let state = test_state(pool.clone(), fake.clone());
        OutboundSync::process_queue(&state).await.unwrap();

        sqlx::query("UPDATE appointments SET summary = 'Follow-up' WHERE id = ?")
            .bind(&id)
            .execute(&pool)
            .await
            .unwrap();
        let report = OutboundSync::process_queue(&state).await.unwrap();
        assert_eq!(report.succeeded, 1);
        let patched = fake.patched();
        assert_eq!(patched.len(), 1);
        assert_eq!(patched[0].1, "gcal-1");
        assert_eq!(patched[0].2.as_deref(), Some("\"etag-gcal-1\""));

        sqlx::query("UPDATE appointments SET status = 'cancelled' WHERE id = ?")
            .bind(&id)
            .execute(&pool)
            .await
            .unwrap();
        let report = OutboundSync::process_queue(&state).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(fake.deleted(), vec![("cal-1".to_string(), "gcal-1".to_string())]);
    }

    #[tokio::test]
    async fn inbound_changes_are_not_echoed() {
        let pool = test_pool().await;
        seed_therapist(&pool, "t1", Some("cal-1")).await;
        let id = seed_system_appointment(&pool, "t1", "Intake").await;
        let state = test_state(pool.clone(), Arc::new(FakeCalendar::default()));
        OutboundSync::process_queue(&state).await.unwrap();

        let appointment = AppointmentRepository::find_by_id(&pool, &id).await.unwrap().unwrap();
        let from_google = crate::db::models::AppointmentFromEvent {
            external_event_id: "gcal-1".to_string(),
            summary: Some("Renamed in Google".to_string()),
            notes: None,
            start_at: appointment.start_at,
            end_at: appointment.end_at,
            status: crate::db::models::AppointmentStatus::Scheduled,
            recurring_event_id: None,
            ical_uid: None,
            html_link: None,
            gcal_etag: Some("\"etag-2\"".to_string()),
            source_updated_at: Some(chrono::Utc::now().naive_utc()),
            local_appointment_id: None,
        };
        AppointmentRepository::update_from_event(&pool, &id, &from_google)
            .await
            .unwrap();

        assert_eq!(jobs(&pool).await.len(), 1);
    }

    #[tokio::test]
    async fn missing_appointment_is_retried_then_failed() {
        let pool = test_pool().await;
        seed_therapist(&pool, "t1", Some("cal-1")).await;
        let id = seed_system_appointment(&pool, "t1", "Intake").await;
        sqlx::query("DELETE FROM appointments WHERE id = ?")
            .bind(&id)
            .execute(&pool)
            .await
            .unwrap();

        let state = test_state(pool.clone(), Arc::new(FakeCalendar::default()));

        // max_retries = 3: three retries, then the fourth failure is final.
        for attempt in 1..=3 {
            let report = OutboundSync::process_queue(&state).await.unwrap();
            assert_eq!(report.retried, 1, "attempt {}", attempt);
            assert_eq!(report.failed, 0);
        }

        let report = OutboundSync::process_queue(&state).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(report.errors[0].message.contains("Appointment not found"));

        let job = &jobs(&pool).await[0];
        assert_eq!(job.status, "failed");
        assert_eq!(job.retry_count, 3);

        let report = OutboundSync::process_queue(&state).await.unwrap();
        assert_eq!(report, QueueReport::default());
    }

    #[tokio::test]
    async fn delete_of_already_removed_event_succeeds() {
        let pool = test_pool().await;
        seed_therapist(&pool, "t1", Some("cal-1")).await;
        let id = seed_system_appointment(&pool, "t1", "Intake").await;
        let fake = Arc::new(FakeCalendar::default());
        let state = test_state(pool.clone(), fake.clone());
        OutboundSync::process_queue(&state).await.unwrap();

        fake.fail_writes_with(410);
        sqlx::query("UPDATE appointments SET status = 'cancelled' WHERE id = ?")
            .bind(&id)
            .execute(&pool)
            .await
            .unwrap();

        let report = OutboundSync::process_queue(&state).await.unwrap();
        assert_eq!(report.succeeded, 1);
    }

    #[tokio::test]
    async fn failed_completion_writes_do_not_strand_the_batch() {
        let pool = test_pool().await;
        seed_therapist(&pool, "t1", Some("cal-1")).await;
        seed_system_appointment(&pool, "t1", "A").await;
        seed_system_appointment(&pool, "t1", "B").await;
        sqlx::query(
            "CREATE TRIGGER reject_completion BEFORE UPDATE OF status ON gcal_sync_queue \
             WHEN NEW.status = 'completed' \
             BEGIN SELECT RAISE(ABORT, 'completion write failed'); END",
        )
        .execute(&pool)
        .await
        .unwrap();

        let fake = Arc::new(FakeCalendar::default());
        let state = test_state(pool.clone(), fake.clone());

        // Both jobs are attempted even though neither can be marked done.
        let report = OutboundSync::process_queue(&state).await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors[0].message.contains("completion write failed"));
        assert_eq!(fake.inserted().len(), 2);

        let statuses: Vec<String> = jobs(&pool).await.into_iter().map(|j| j.status).collect();
        assert_eq!(statuses, vec!["processing", "processing"]);

        sqlx::query("DROP TRIGGER reject_completion")
            .execute(&pool)
            .await
            .unwrap();

        // Claims younger than the timeout are left alone.
        let report = OutboundSync::process_queue(&state).await.unwrap();
        assert_eq!(report.processed, 0);

        sqlx::query("UPDATE gcal_sync_queue SET claimed_at = ?")
            .bind(chrono::Utc::now().naive_utc() - chrono::Duration::hours(1))
            .execute(&pool)
            .await
            .unwrap();

        let report = OutboundSync::process_queue(&state).await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.succeeded, 2);
        // The appointments were already linked, so nothing is inserted twice.
        assert_eq!(fake.inserted().len(), 2);

        let stats = SyncQueueRepository::stats(&pool).await.unwrap();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.processing, 0);
    }

    #[tokio::test]
    async fn queue_stats_count_by_status() {
        let pool = test_pool().await;
        seed_therapist(&pool, "t1", Some("cal-1")).await;
        seed_system_appointment(&pool, "t1", "A").await;
        seed_system_appointment(&pool, "t1", "B").await;

        let stats = SyncQueueRepository::stats(&pool).await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.completed, 0);
    }
}
