use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: String,
    pub event_id: Option<String>,
    pub calendar_id: Option<String>,
    pub action: String,
    pub direction: String,
    pub status: String,
    pub error_message: Option<String>,
    pub payload: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    GoogleToLocal,
    LocalToGoogle,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::GoogleToLocal => "google_to_local",
            SyncDirection::LocalToGoogle => "local_to_google",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSyncLogEntry {
    pub event_id: Option<String>,
    pub calendar_id: Option<String>,
    pub action: String,
    pub direction: SyncDirection,
    pub error_message: Option<String>,
    pub payload: Option<serde_json::Value>,
}
