use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::db::models::{AppointmentFromEvent, CalendarChannel, CreateSyncLogEntry, SyncDirection};
use crate::db::{AppointmentRepository, SyncLogRepository, SyncStateRepository, TherapistRepository};
use crate::error::{AppError, AppResult};
use crate::services::event_mapper::{map_event, IgnoreReason, MappedEvent};
use crate::services::google_calendar::{GoogleEvent, ListEventsQuery};
use crate::AppState;

/// Upper bound for either side of a resync window, in days.
pub const MAX_RESYNC_DAYS: i64 = 3650;

/// Guard against a provider that keeps handing out page tokens.
const MAX_PAGES: usize = 500;

/// Per-calendar async locks. A pull holds its calendar's lock from reading
/// the sync token until the new one is stored.
#[derive(Debug, Clone, Default)]
pub struct CalendarLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl CalendarLocks {
    pub async fn lock(&self, calendar_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(calendar_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// What happened to one event of a pulled batch.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Ignored(IgnoreReason),
    Created,
    Updated,
    /// A locally created appointment was matched to its Google event.
    Linked,
    /// `matched` is false when the event was never imported.
    Cancelled { matched: bool },
    Failed(String),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EventError {
    pub event_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SyncReport {
    /// Events that reached the database (created, updated, linked or cancelled).
    pub processed: usize,
    pub ignored: usize,
    pub created: usize,
    pub updated: usize,
    pub cancelled: usize,
    pub errors: Vec<EventError>,
    /// True when the pull listed the whole window instead of using a sync token.
    pub full_sync: bool,
}

impl SyncReport {
    fn record(&mut self, event_id: &str, outcome: EventOutcome) {
        match outcome {
            EventOutcome::Ignored(_) => self.ignored += 1,
            EventOutcome::Created => {
                self.processed += 1;
                self.created += 1;
            }
            EventOutcome::Updated | EventOutcome::Linked => {
                self.processed += 1;
                self.updated += 1;
            }
            EventOutcome::Cancelled { matched } => {
                self.processed += 1;
                if matched {
                    self.cancelled += 1;
                }
            }
            EventOutcome::Failed(message) => self.errors.push(EventError {
                event_id: event_id.to_string(),
                message,
            }),
        }
    }
}

/// Inbound half of the sync: pulls changes from Google and reconciles them
/// into `appointments`.
pub struct SyncProcessor;

impl SyncProcessor {
    /// Pull changes after a push notification on `channel`.
    ///
    /// Uses the stored sync token when there is one and lists the default
    /// window otherwise. A token Google reports as gone is cleared and the
    /// run continues with a window pull.
    pub async fn handle_notification(
        state: &AppState,
        channel: &CalendarChannel,
    ) -> AppResult<SyncReport> {
        let calendar_id = channel.calendar_id.as_str();
        let _guard = state.locks.lock(calendar_id).await;

        let sync_state = SyncStateRepository::find(&state.db, calendar_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Sync state not found for calendar {}", calendar_id))
            })?;

        let window = Self::default_window(state);

        let Some(sync_token) = sync_state.sync_token else {
            debug!(calendar_id, "No sync token stored; listing full window");
            return Self::pull(state, &channel.therapist_id, calendar_id, window).await;
        };

        let incremental = ListEventsQuery::Incremental { sync_token };
        match Self::pull(state, &channel.therapist_id, calendar_id, incremental).await {
            Err(AppError::SyncTokenExpired) => {
                warn!(calendar_id, "Sync token invalid (410 Gone); clearing and resyncing");
                SyncStateRepository::clear_token(&state.db, calendar_id).await?;
                Self::pull(state, &channel.therapist_id, calendar_id, window).await
            }
            other => other,
        }
    }

    /// Re-list `[now - days_back, now + days_forward]` for a therapist's
    /// calendar and store the fresh sync token.
    pub async fn resync(
        state: &AppState,
        therapist_id: &str,
        days_back: i64,
        days_forward: i64,
    ) -> AppResult<SyncReport> {
        for (name, value) in [("days_back", days_back), ("days_forward", days_forward)] {
            if !(0..=MAX_RESYNC_DAYS).contains(&value) {
                return Err(AppError::BadRequest(format!(
                    "{} must be between 0 and {}",
                    name, MAX_RESYNC_DAYS
                )));
            }
        }

        let therapist = TherapistRepository::find_by_id(&state.db, therapist_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Therapist not found".to_string()))?;
        let calendar_id = therapist
            .google_calendar_id
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                AppError::NotFound("Therapist has no Google Calendar configured".to_string())
            })?;

        let _guard = state.locks.lock(&calendar_id).await;

        let now = Utc::now();
        let window = ListEventsQuery::Window {
            time_min: now - Duration::days(days_back),
            time_max: now + Duration::days(days_forward),
        };

        info!(
            therapist_id,
            calendar_id = %calendar_id,
            days_back,
            days_forward,
            "Starting manual resync"
        );
        Self::pull(state, therapist_id, &calendar_id, window).await
    }

    fn default_window(state: &AppState) -> ListEventsQuery {
        let now = Utc::now();
        ListEventsQuery::Window {
            time_min: now - Duration::days(state.config.sync.resync_days_back),
            time_max: now + Duration::days(state.config.sync.resync_days_forward),
        }
    }

    /// List every page for `query`, reconcile each event, then persist the
    /// sync token from the last page. Callers hold the calendar lock.
    async fn pull(
        state: &AppState,
        therapist_id: &str,
        calendar_id: &str,
        query: ListEventsQuery,
    ) -> AppResult<SyncReport> {
        let mut report = SyncReport {
            full_sync: matches!(query, ListEventsQuery::Window { .. }),
            ..Default::default()
        };
        let mut page_token: Option<String> = None;
        let mut next_sync_token: Option<String> = None;

        for page_number in 1..=MAX_PAGES {
            let page = state
                .calendar
                .list_events(calendar_id, &query, page_token.as_deref())
                .await?;

            debug!(
                calendar_id,
                page_number,
                events = page.items.len(),
                "Fetched event page"
            );

            for event in &page.items {
                let outcome = Self::apply_event(state, therapist_id, calendar_id, event).await;
                report.record(&event.id, outcome);
            }

            next_sync_token = page.next_sync_token.or(next_sync_token);

            match page.next_page_token {
                Some(token) if page_number < MAX_PAGES => page_token = Some(token),
                Some(_) => {
                    warn!(calendar_id, "Stopping pagination after {} pages", MAX_PAGES);
                    break;
                }
                None => break,
            }
        }

        if next_sync_token.is_none() {
            warn!(calendar_id, "Provider returned no sync token; keeping the stored one");
        }
        SyncStateRepository::record_sync(&state.db, calendar_id, next_sync_token.as_deref())
            .await?;

        info!(
            calendar_id,
            processed = report.processed,
            ignored = report.ignored,
            errors = report.errors.len(),
            full_sync = report.full_sync,
            "Calendar pull finished"
        );

        Ok(report)
    }

    /// Reconcile one event. Errors are captured in the outcome, never raised.
    pub async fn apply_event(
        state: &AppState,
        therapist_id: &str,
        calendar_id: &str,
        event: &GoogleEvent,
    ) -> EventOutcome {
        let result = match map_event(event) {
            MappedEvent::Ignore(reason) => {
                debug!(event_id = %event.id, %reason, "Ignoring event");
                return EventOutcome::Ignored(reason);
            }
            MappedEvent::Cancel {
                external_event_id,
                source_updated_at,
            } => AppointmentRepository::cancel_by_external(
                &state.db,
                &external_event_id,
                calendar_id,
                source_updated_at,
            )
            .await
            .map(|rows| EventOutcome::Cancelled { matched: rows > 0 }),
            MappedEvent::Upsert(appointment) => {
                Self::upsert_appointment(state, therapist_id, calendar_id, &appointment).await
            }
        };

        let (action, outcome) = match result {
            Ok(outcome) => (outcome_action(&outcome), outcome),
            Err(e) => {
                warn!(event_id = %event.id, calendar_id, "Failed to apply event: {}", e);
                ("apply", EventOutcome::Failed(e.to_string()))
            }
        };

        let error_message = match &outcome {
            EventOutcome::Failed(message) => Some(message.clone()),
            _ => None,
        };
        SyncLogRepository::record(
            &state.db,
            if error_message.is_some() { "error" } else { "success" },
            CreateSyncLogEntry {
                event_id: Some(event.id.clone()),
                calendar_id: Some(calendar_id.to_string()),
                action: action.to_string(),
                direction: SyncDirection::GoogleToLocal,
                error_message,
                payload: None,
            },
        )
        .await;

        outcome
    }

    async fn upsert_appointment(
        state: &AppState,
        therapist_id: &str,
        calendar_id: &str,
        appointment: &AppointmentFromEvent,
    ) -> AppResult<EventOutcome> {
        if let Some(existing) = AppointmentRepository::find_by_external(
            &state.db,
            &appointment.external_event_id,
            calendar_id,
        )
        .await?
        {
            AppointmentRepository::update_from_event(&state.db, &existing.id, appointment).await?;
            return Ok(EventOutcome::Updated);
        }

        if let Some(local_id) = appointment.local_appointment_id.as_deref() {
            if AppointmentRepository::link_from_event(&state.db, local_id, calendar_id, appointment)
                .await?
                .is_some()
            {
                return Ok(EventOutcome::Linked);
            }
        }

        let (_, created) =
            AppointmentRepository::insert_from_event(&state.db, therapist_id, calendar_id, appointment)
                .await?;

        Ok(if created {
            EventOutcome::Created
        } else {
            EventOutcome::Updated
        })
    }
}

fn outcome_action(outcome: &EventOutcome) -> &'static str {
    match outcome {
        EventOutcome::Created => "create",
        EventOutcome::Updated => "update",
        EventOutcome::Linked => "link",
        EventOutcome::Cancelled { .. } => "cancel",
        EventOutcome::Ignored(_) => "ignore",
        EventOutcome::Failed(_) => "apply",
    }
}
