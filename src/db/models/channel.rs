use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ============================================================================
// Google Calendar push channels (one per therapist/calendar pair)
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CalendarChannel {
    pub id: String,
    pub therapist_id: String,
    pub calendar_id: String,
    pub channel_id: String,
    pub resource_id: String,
    /// Opaque token echoed back by Google in `X-Goog-Channel-Token`.
    #[serde(skip_serializing)]
    pub channel_token: String,
    pub expiration: NaiveDateTime,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl CalendarChannel {
    /// True when the channel stops receiving pushes before `threshold`.
    pub fn expires_before(&self, threshold: NaiveDateTime) -> bool {
        self.expiration < threshold
    }
}

/// Fields written when a watch is (re-)registered with Google.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertCalendarChannel {
    pub therapist_id: String,
    pub calendar_id: String,
    pub channel_id: String,
    pub resource_id: String,
    pub channel_token: String,
    pub expiration: NaiveDateTime,
}

/// Aggregate channel counts reported by the cron status endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelCounts {
    pub total: i64,
    pub active: i64,
    /// Active channels expiring within the renewal window.
    pub expiring_soon: i64,
    /// Active channels already past their expiration.
    pub expired: i64,
}
