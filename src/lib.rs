//! Two-way sync between clinic appointments and therapists' Google Calendars.
//!
//! Inbound: Google push channels notify `/api/gcal/webhook`, and the sync
//! processor pulls changes with the stored sync token. Outbound: database
//! triggers queue local appointment changes, drained by the queue processor.

use std::sync::Arc;

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod services;

#[cfg(test)]
pub(crate) mod testing;

use config::Config;
use services::google_calendar::CalendarProvider;
use services::sync::CalendarLocks;

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub calendar: Arc<dyn CalendarProvider>,
    pub locks: CalendarLocks,
}
