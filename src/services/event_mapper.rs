//! Translation of Google Calendar events into local appointment fields.
//!
//! Mapping is pure: it never touches the database. The sync processor decides
//! what to do with the result.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::db::models::{AppointmentFromEvent, AppointmentStatus};
use crate::services::google_calendar::{EventDateTime, GoogleEvent, LOCAL_APPOINTMENT_PROPERTY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// Marked "free" in Google; not a booking.
    Transparent,
    MissingTimes,
    InvalidTimes,
    /// Master of a recurring series; its expanded instances are imported instead.
    RecurringSeries,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IgnoreReason::Transparent => "transparent event",
            IgnoreReason::MissingTimes => "event has no start or end",
            IgnoreReason::InvalidTimes => "event start or end could not be parsed",
            IgnoreReason::RecurringSeries => "recurring series master",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MappedEvent {
    Ignore(IgnoreReason),
    /// Status-only change for an already imported appointment.
    Cancel {
        external_event_id: String,
        source_updated_at: Option<NaiveDateTime>,
    },
    Upsert(AppointmentFromEvent),
}

pub fn map_event(event: &GoogleEvent) -> MappedEvent {
    if event.recurrence.is_some() {
        return MappedEvent::Ignore(IgnoreReason::RecurringSeries);
    }
    if event.transparency.as_deref() == Some("transparent") {
        return MappedEvent::Ignore(IgnoreReason::Transparent);
    }

    let source_updated_at = event.updated.as_deref().and_then(parse_rfc3339);

    if event.status.as_deref() == Some("cancelled") {
        return MappedEvent::Cancel {
            external_event_id: event.id.clone(),
            source_updated_at,
        };
    }

    let (Some(start), Some(end)) = (event.start.as_ref(), event.end.as_ref()) else {
        return MappedEvent::Ignore(IgnoreReason::MissingTimes);
    };
    if !has_time(start) || !has_time(end) {
        return MappedEvent::Ignore(IgnoreReason::MissingTimes);
    }

    let (Some(start_at), Some(end_at)) = (parse_event_time(start), parse_event_time(end)) else {
        return MappedEvent::Ignore(IgnoreReason::InvalidTimes);
    };
    if end_at < start_at {
        return MappedEvent::Ignore(IgnoreReason::InvalidTimes);
    }

    let status = match event.status.as_deref() {
        Some("confirmed") | None => AppointmentStatus::Scheduled,
        _ => AppointmentStatus::Tentative,
    };

    MappedEvent::Upsert(AppointmentFromEvent {
        external_event_id: event.id.clone(),
        summary: event.summary.clone(),
        notes: event.description.clone(),
        start_at,
        end_at,
        status,
        recurring_event_id: event.recurring_event_id.clone(),
        ical_uid: event.ical_uid.clone(),
        html_link: event.html_link.clone(),
        gcal_etag: event.etag.clone(),
        source_updated_at,
        local_appointment_id: event
            .private_property(LOCAL_APPOINTMENT_PROPERTY)
            .filter(|id| !id.is_empty())
            .map(str::to_string),
    })
}

fn has_time(value: &EventDateTime) -> bool {
    value.date_time.is_some() || value.date.is_some()
}

/// `dateTime` wins over `date`. All-day dates start at UTC midnight.
fn parse_event_time(value: &EventDateTime) -> Option<NaiveDateTime> {
    if let Some(date_time) = value.date_time.as_deref() {
        return parse_rfc3339(date_time);
    }

    value
        .date
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

fn parse_rfc3339(value: &str) -> Option<NaiveDateTime> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.naive_utc())
}
