use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A pending request to mirror a local appointment change into Google Calendar.
///
/// Rows are produced by triggers on `appointments` and drained by
/// `OutboundSync::process_queue`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: String,
    pub appointment_id: String,
    /// 'create', 'update' or 'delete'
    pub action: String,
    /// 'pending', 'processing', 'completed' or 'failed'
    pub status: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    pub created_at: NaiveDateTime,
    pub claimed_at: Option<NaiveDateTime>,
    pub processed_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Create => "create",
            SyncAction::Update => "update",
            SyncAction::Delete => "delete",
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(SyncAction::Create),
            "update" => Ok(SyncAction::Update),
            "delete" => Ok(SyncAction::Delete),
            other => Err(format!("Unknown action: {}", other)),
        }
    }
}

/// Row counts per queue status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}
