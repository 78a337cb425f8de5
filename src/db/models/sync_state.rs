use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Incremental sync cursor for one Google calendar.
///
/// `sync_token` is whatever Google last handed back in `nextSyncToken`, or
/// `None` when no pull has completed yet or the token was reported stale.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CalendarSyncState {
    pub calendar_id: String,
    pub sync_token: Option<String>,
    pub last_sync_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}
