//! Test fixtures: in-memory database, seed helpers and a scripted
//! `CalendarProvider`.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::config::Config;
use crate::db::models::{CalendarChannel, UpsertCalendarChannel};
use crate::db::ChannelRepository;
use crate::error::{AppError, AppResult};
use crate::services::google_calendar::{
    CalendarProvider, EventPage, EventWrite, GoogleEvent, ListEventsQuery, WatchRegistration,
};
use crate::services::sync::CalendarLocks;
use crate::AppState;

pub(crate) const CRON_SECRET: &str = "test-cron-secret";

pub(crate) async fn test_pool() -> SqlitePool {
    // A single connection that never recycles keeps the in-memory database alive.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub(crate) fn test_config() -> Config {
    let mut config = Config::default();
    config.sync.callback_base_url = Some("https://clinic.test".to_string());
    config.sync.cron_secret = Some(CRON_SECRET.to_string());
    config
}

pub(crate) fn test_state(pool: SqlitePool, calendar: Arc<FakeCalendar>) -> Arc<AppState> {
    Arc::new(AppState {
        db: pool,
        config: test_config(),
        calendar,
        locks: CalendarLocks::default(),
    })
}

pub(crate) async fn seed_therapist(pool: &SqlitePool, id: &str, calendar_id: Option<&str>) {
    sqlx::query("INSERT INTO users (id, email, role, google_calendar_id) VALUES (?, ?, 'therapist', ?)")
        .bind(id)
        .bind(format!("{}@clinic.test", id))
        .bind(calendar_id)
        .execute(pool)
        .await
        .unwrap();
}

/// Insert a locally created appointment; the insert trigger queues a `create` job.
pub(crate) async fn seed_system_appointment(
    pool: &SqlitePool,
    therapist_id: &str,
    summary: &str,
) -> String {
    let id = Uuid::new_v4().to_string();
    let start = Utc::now().naive_utc() + Duration::days(1);
    sqlx::query(
        "INSERT INTO appointments (id, therapist_id, patient_id, summary, start_at, end_at) \
         VALUES (?, ?, 'patient-1', ?, ?, ?)",
    )
    .bind(&id)
    .bind(therapist_id)
    .bind(summary)
    .bind(start)
    .bind(start + Duration::hours(1))
    .execute(pool)
    .await
    .unwrap();
    id
}

pub(crate) async fn seed_channel(
    pool: &SqlitePool,
    therapist_id: &str,
    calendar_id: &str,
) -> CalendarChannel {
    seed_channel_expiring(pool, therapist_id, calendar_id, Utc::now().naive_utc() + Duration::days(6))
        .await
}

pub(crate) async fn seed_channel_expiring(
    pool: &SqlitePool,
    therapist_id: &str,
    calendar_id: &str,
    expiration: NaiveDateTime,
) -> CalendarChannel {
    ChannelRepository::upsert(
        pool,
        UpsertCalendarChannel {
            therapist_id: therapist_id.to_string(),
            calendar_id: calendar_id.to_string(),
            channel_id: format!("chan-{}", calendar_id),
            resource_id: format!("res-{}", calendar_id),
            channel_token: format!("token-{}", calendar_id),
            expiration,
        },
    )
    .await
    .unwrap()
}

/// Records every call and answers `events.list` from a script. An empty
/// script yields a single empty page carrying `next_sync_token = "fresh-token"`.
#[derive(Default)]
pub(crate) struct FakeCalendar {
    pages: Mutex<VecDeque<Result<EventPage, u16>>>,
    list_calls: Mutex<Vec<(ListEventsQuery, Option<String>)>>,
    watches: Mutex<Vec<(String, String, String, String)>>,
    stopped: Mutex<Vec<(String, String)>>,
    failing_calendars: Mutex<HashSet<String>>,
    write_failure: Mutex<Option<u16>>,
    inserted: Mutex<Vec<(String, EventWrite)>>,
    patched: Mutex<Vec<(String, String, Option<String>)>>,
    deleted: Mutex<Vec<(String, String)>>,
}

impl FakeCalendar {
    pub(crate) fn push_page(&self, page: Result<EventPage, u16>) {
        self.pages.lock().unwrap().push_back(page);
    }

    pub(crate) fn fail_watch_for(&self, calendar_id: &str) {
        self.failing_calendars
            .lock()
            .unwrap()
            .insert(calendar_id.to_string());
    }

    pub(crate) fn fail_writes_with(&self, status: u16) {
        *self.write_failure.lock().unwrap() = Some(status);
    }

    pub(crate) fn list_queries(&self) -> Vec<ListEventsQuery> {
        self.list_calls
            .lock()
            .unwrap()
            .iter()
            .map(|(q, _)| q.clone())
            .collect()
    }

    pub(crate) fn page_tokens(&self) -> Vec<Option<String>> {
        self.list_calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, t)| t.clone())
            .collect()
    }

    /// (calendar_id, channel_id, token, address) per watch call.
    pub(crate) fn watches(&self) -> Vec<(String, String, String, String)> {
        self.watches.lock().unwrap().clone()
    }

    pub(crate) fn stopped(&self) -> Vec<(String, String)> {
        self.stopped.lock().unwrap().clone()
    }

    pub(crate) fn inserted(&self) -> Vec<(String, EventWrite)> {
        self.inserted.lock().unwrap().clone()
    }

    /// (calendar_id, event_id, etag) per patch call.
    pub(crate) fn patched(&self) -> Vec<(String, String, Option<String>)> {
        self.patched.lock().unwrap().clone()
    }

    pub(crate) fn deleted(&self) -> Vec<(String, String)> {
        self.deleted.lock().unwrap().clone()
    }

    fn write_error(&self) -> Option<AppError> {
        self.write_failure.lock().unwrap().map(status_error)
    }
}

fn status_error(status: u16) -> AppError {
    AppError::GoogleApi {
        status,
        message: format!("scripted failure {}", status),
    }
}

#[async_trait]
impl CalendarProvider for FakeCalendar {
    async fn watch_events(
        &self,
        calendar_id: &str,
        channel_id: &str,
        channel_token: &str,
        address: &str,
    ) -> AppResult<WatchRegistration> {
        if self.failing_calendars.lock().unwrap().contains(calendar_id) {
            return Err(status_error(403));
        }

        let mut watches = self.watches.lock().unwrap();
        watches.push((
            calendar_id.to_string(),
            channel_id.to_string(),
            channel_token.to_string(),
            address.to_string(),
        ));

        Ok(WatchRegistration {
            channel_id: channel_id.to_string(),
            resource_id: format!("resource-{}", watches.len()),
            expiration: Utc::now().naive_utc() + Duration::days(7),
        })
    }

    async fn stop_channel(&self, channel_id: &str, resource_id: &str) -> AppResult<()> {
        self.stopped
            .lock()
            .unwrap()
            .push((channel_id.to_string(), resource_id.to_string()));
        Ok(())
    }

    async fn list_events(
        &self,
        _calendar_id: &str,
        query: &ListEventsQuery,
        page_token: Option<&str>,
    ) -> AppResult<EventPage> {
        self.list_calls
            .lock()
            .unwrap()
            .push((query.clone(), page_token.map(str::to_string)));

        match self.pages.lock().unwrap().pop_front() {
            Some(Ok(page)) => Ok(page),
            Some(Err(410)) => Err(AppError::SyncTokenExpired),
            Some(Err(status)) => Err(status_error(status)),
            None => Ok(EventPage {
                items: Vec::new(),
                next_page_token: None,
                next_sync_token: Some("fresh-token".to_string()),
            }),
        }
    }

    async fn insert_event(&self, calendar_id: &str, event: &EventWrite) -> AppResult<GoogleEvent> {
        if let Some(err) = self.write_error() {
            return Err(err);
        }

        let mut inserted = self.inserted.lock().unwrap();
        inserted.push((calendar_id.to_string(), event.clone()));
        let id = format!("gcal-{}", inserted.len());

        Ok(GoogleEvent {
            id: id.clone(),
            status: Some("confirmed".to_string()),
            etag: Some(format!("\"etag-{}\"", id)),
            html_link: Some(format!("https://calendar.test/{}", id)),
            ical_uid: Some(format!("{}@google.com", id)),
            summary: event.summary.clone(),
            ..Default::default()
        })
    }

    async fn patch_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        event: &EventWrite,
        etag: Option<&str>,
    ) -> AppResult<GoogleEvent> {
        if let Some(err) = self.write_error() {
            return Err(err);
        }

        self.patched.lock().unwrap().push((
            calendar_id.to_string(),
            event_id.to_string(),
            etag.map(str::to_string),
        ));

        Ok(GoogleEvent {
            id: event_id.to_string(),
            status: Some("confirmed".to_string()),
            etag: Some("\"etag-patched\"".to_string()),
            summary: event.summary.clone(),
            ..Default::default()
        })
    }

    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> AppResult<()> {
        if let Some(err) = self.write_error() {
            return Err(err);
        }

        self.deleted
            .lock()
            .unwrap()
            .push((calendar_id.to_string(), event_id.to_string()));
        Ok(())
    }
}
