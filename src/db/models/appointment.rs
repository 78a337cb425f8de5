use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ============================================================================
// Appointment Models
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Appointment {
    pub id: String,
    pub therapist_id: String,
    pub patient_id: Option<String>,
    pub summary: Option<String>,
    pub notes: Option<String>,
    pub start_at: NaiveDateTime,
    pub end_at: NaiveDateTime,
    pub status: String,
    pub origin: String,
    pub external_event_id: Option<String>,
    pub external_calendar_id: Option<String>,
    pub recurring_event_id: Option<String>,
    pub ical_uid: Option<String>,
    pub html_link: Option<String>,
    pub gcal_etag: Option<String>,
    pub source_updated_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Tentative,
    Cancelled,
    Completed,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Tentative => "tentative",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an appointment was first created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentOrigin {
    /// Created inside the clinic application.
    System,
    /// Imported from a therapist's Google Calendar.
    Google,
}

impl AppointmentOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentOrigin::System => "system",
            AppointmentOrigin::Google => "google",
        }
    }
}

/// Appointment fields derived from a Google Calendar event.
///
/// Never carries a patient link or therapist; those stay owned by the local row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentFromEvent {
    pub external_event_id: String,
    pub summary: Option<String>,
    pub notes: Option<String>,
    pub start_at: NaiveDateTime,
    pub end_at: NaiveDateTime,
    pub status: AppointmentStatus,
    pub recurring_event_id: Option<String>,
    pub ical_uid: Option<String>,
    pub html_link: Option<String>,
    pub gcal_etag: Option<String>,
    pub source_updated_at: Option<NaiveDateTime>,
    /// Local appointment id stamped on events this service pushed to Google.
    pub local_appointment_id: Option<String>,
}

/// Provider identifiers written back after an outbound insert/patch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExternalEventLink {
    pub external_event_id: String,
    pub external_calendar_id: String,
    pub html_link: Option<String>,
    pub gcal_etag: Option<String>,
    pub ical_uid: Option<String>,
}
