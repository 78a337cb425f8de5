use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::GoogleConfig;
use crate::error::{AppError, AppResult};

/// Google keeps web_hook channels for about a week at most; when the watch
/// response carries no expiration we assume the conservative daily renewal.
const DEFAULT_CHANNEL_TTL_HOURS: i64 = 24;

/// Private extended property stamped on events this service creates.
pub const LOCAL_APPOINTMENT_PROPERTY: &str = "clinic_appointment_id";

// ============================================================================
// Event Types
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GoogleEvent {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<EventDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<EventDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transparency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurring_event_id: Option<String>,
    /// RRULE/EXDATE lines; only set on the master of a recurring series.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Vec<String>>,
    #[serde(rename = "iCalUID", default, skip_serializing_if = "Option::is_none")]
    pub ical_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// RFC 3339 last-modification time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_properties: Option<ExtendedProperties>,
}

impl GoogleEvent {
    pub fn private_property(&self, key: &str) -> Option<&str> {
        self.extended_properties
            .as_ref()
            .and_then(|p| p.private.as_ref())
            .and_then(|m| m.get(key))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventDateTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,
    /// All-day events carry a plain `YYYY-MM-DD` date instead of `dateTime`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

impl EventDateTime {
    pub fn at(instant: NaiveDateTime, time_zone: &str) -> Self {
        EventDateTime {
            date_time: Some(
                instant
                    .and_utc()
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            date: None,
            time_zone: Some(time_zone.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ExtendedProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared: Option<HashMap<String, String>>,
}

/// Body sent on insert and patch.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventWrite {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub start: EventDateTime,
    pub end: EventDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extended_properties: Option<ExtendedProperties>,
}

/// How `events.list` should select events.
#[derive(Debug, Clone, PartialEq)]
pub enum ListEventsQuery {
    /// Changes since the given sync token.
    Incremental { sync_token: String },
    /// Every event instance overlapping the window, recurring series expanded.
    Window {
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPage {
    #[serde(default)]
    pub items: Vec<GoogleEvent>,
    pub next_page_token: Option<String>,
    /// Only present on the last page.
    pub next_sync_token: Option<String>,
}

// ============================================================================
// Channel Types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WatchRequest<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    channel_type: &'a str,
    address: &'a str,
    token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchResponse {
    id: Option<String>,
    resource_id: String,
    /// Milliseconds since the epoch, as a decimal string.
    expiration: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StopChannelRequest<'a> {
    id: &'a str,
    resource_id: &'a str,
}

/// Result of registering a push channel.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchRegistration {
    pub channel_id: String,
    pub resource_id: String,
    pub expiration: NaiveDateTime,
}

/// Query string for `events.list`.
///
/// Google requires an incremental pull to repeat every parameter of the pull
/// that issued its sync token, except the window bounds. `showDeleted` and
/// `singleEvents` are therefore sent on both variants.
pub fn list_params(query: &ListEventsQuery, page_token: Option<&str>) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("showDeleted", "true".to_string()),
        ("singleEvents", "true".to_string()),
    ];
    match query {
        ListEventsQuery::Incremental { sync_token } => {
            params.push(("syncToken", sync_token.clone()));
        }
        ListEventsQuery::Window { time_min, time_max } => {
            params.push((
                "timeMin",
                time_min.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
            params.push((
                "timeMax",
                time_max.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }
    }
    if let Some(page_token) = page_token {
        params.push(("pageToken", page_token.to_string()));
    }
    params
}

/// Convert the watch response's millisecond expiration, falling back to
/// now + 24h when it is absent or unparsable.
pub fn parse_channel_expiration(raw: Option<&str>) -> NaiveDateTime {
    raw.and_then(|s| s.trim().parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|dt| dt.naive_utc())
        .unwrap_or_else(|| (Utc::now() + Duration::hours(DEFAULT_CHANNEL_TTL_HOURS)).naive_utc())
}

// ============================================================================
// Provider
// ============================================================================

/// The subset of Google Calendar v3 the sync engine needs.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// `events.watch`: register a web_hook channel on `calendar_id`.
    async fn watch_events(
        &self,
        calendar_id: &str,
        channel_id: &str,
        channel_token: &str,
        address: &str,
    ) -> AppResult<WatchRegistration>;

    /// `channels.stop`.
    async fn stop_channel(&self, channel_id: &str, resource_id: &str) -> AppResult<()>;

    /// One page of `events.list`. A stale sync token yields
    /// [`AppError::SyncTokenExpired`].
    async fn list_events(
        &self,
        calendar_id: &str,
        query: &ListEventsQuery,
        page_token: Option<&str>,
    ) -> AppResult<EventPage>;

    async fn insert_event(&self, calendar_id: &str, event: &EventWrite) -> AppResult<GoogleEvent>;

    /// Patch an event; with `etag` the write only applies if the event is unchanged.
    async fn patch_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        event: &EventWrite,
        etag: Option<&str>,
    ) -> AppResult<GoogleEvent>;

    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> AppResult<()>;
}

#[derive(Debug, Clone)]
struct AccessToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenRefreshResponse {
    access_token: String,
    expires_in: i64,
}

/// `CalendarProvider` backed by the Google REST API, authenticated as the
/// clinic's master account through a long-lived refresh token.
#[derive(Debug, Clone)]
pub struct GoogleCalendarService {
    client: Client,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    api_base_url: String,
    token_url: String,
    access_token: Arc<RwLock<Option<AccessToken>>>,
}

impl GoogleCalendarService {
    pub fn new(config: &GoogleConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            refresh_token: config.refresh_token.clone(),
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token_url: config.token_url.clone(),
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    fn events_url(&self, calendar_id: &str) -> String {
        format!(
            "{}/calendars/{}/events",
            self.api_base_url,
            urlencoding::encode(calendar_id)
        )
    }

    /// Exchange the refresh token for a fresh access token and cache it.
    async fn refresh_access_token(&self) -> AppResult<String> {
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", self.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::google(
                status,
                format!("Failed to refresh access token: {}", error_text),
            ));
        }

        let refreshed: TokenRefreshResponse = response.json().await?;
        let expires_at = Utc::now() + Duration::seconds(refreshed.expires_in);

        let mut guard = self.access_token.write().await;
        *guard = Some(AccessToken {
            token: refreshed.access_token.clone(),
            expires_at,
        });

        tracing::info!("Refreshed Google access token; expires at {}", expires_at);

        Ok(refreshed.access_token)
    }

    async fn get_valid_access_token(&self) -> AppResult<String> {
        const REFRESH_MARGIN_SECS: i64 = 60;

        {
            let guard = self.access_token.read().await;
            if let Some(ref t) = *guard {
                if t.expires_at - Duration::seconds(REFRESH_MARGIN_SECS) > Utc::now() {
                    return Ok(t.token.clone());
                }
            }
        }

        self.refresh_access_token().await
    }

    /// Send an authorized request, refreshing the access token once if Google
    /// answers 401.
    async fn send_authorized<F>(&self, make_request: F) -> AppResult<reqwest::Response>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let token = self.get_valid_access_token().await?;
        let response = make_request(&token).send().await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::warn!("Google rejected access token. Refreshing and retrying once.");
        let token = self.refresh_access_token().await?;
        Ok(make_request(&token).send().await?)
    }

    async fn error_from(response: reqwest::Response, context: &str) -> AppError {
        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();
        AppError::google(status, format!("{}: {}", context, error_text))
    }
}

#[async_trait]
impl CalendarProvider for GoogleCalendarService {
    async fn watch_events(
        &self,
        calendar_id: &str,
        channel_id: &str,
        channel_token: &str,
        address: &str,
    ) -> AppResult<WatchRegistration> {
        let url = format!("{}/watch", self.events_url(calendar_id));
        let request = WatchRequest {
            id: channel_id,
            channel_type: "web_hook",
            address,
            token: channel_token,
        };

        let response = self
            .send_authorized(|token| self.client.post(&url).bearer_auth(token).json(&request))
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response, "Failed to register watch channel").await);
        }

        let watch: WatchResponse = response.json().await?;

        Ok(WatchRegistration {
            channel_id: watch.id.unwrap_or_else(|| channel_id.to_string()),
            resource_id: watch.resource_id,
            expiration: parse_channel_expiration(watch.expiration.as_deref()),
        })
    }

    async fn stop_channel(&self, channel_id: &str, resource_id: &str) -> AppResult<()> {
        let url = format!("{}/channels/stop", self.api_base_url);
        let request = StopChannelRequest {
            id: channel_id,
            resource_id,
        };

        let response = self
            .send_authorized(|token| self.client.post(&url).bearer_auth(token).json(&request))
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response, "Failed to stop channel").await);
        }

        Ok(())
    }

    async fn list_events(
        &self,
        calendar_id: &str,
        query: &ListEventsQuery,
        page_token: Option<&str>,
    ) -> AppResult<EventPage> {
        let url = self.events_url(calendar_id);
        let params = list_params(query, page_token);

        let response = self
            .send_authorized(|token| self.client.get(&url).bearer_auth(token).query(&params))
            .await?;

        if response.status() == StatusCode::GONE {
            return Err(AppError::SyncTokenExpired);
        }
        if !response.status().is_success() {
            return Err(Self::error_from(response, "Failed to list events").await);
        }

        Ok(response.json().await?)
    }

    async fn insert_event(&self, calendar_id: &str, event: &EventWrite) -> AppResult<GoogleEvent> {
        let url = self.events_url(calendar_id);

        let response = self
            .send_authorized(|token| self.client.post(&url).bearer_auth(token).json(event))
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response, "Failed to create event").await);
        }

        Ok(response.json().await?)
    }

    async fn patch_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        event: &EventWrite,
        etag: Option<&str>,
    ) -> AppResult<GoogleEvent> {
        let url = format!(
            "{}/{}",
            self.events_url(calendar_id),
            urlencoding::encode(event_id)
        );

        let response = self
            .send_authorized(|token| {
                let request = self.client.patch(&url).bearer_auth(token).json(event);
                match etag {
                    Some(etag) => request.header(reqwest::header::IF_MATCH, etag),
                    None => request,
                }
            })
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response, "Failed to update event").await);
        }

        Ok(response.json().await?)
    }

    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> AppResult<()> {
        let url = format!(
            "{}/{}",
            self.events_url(calendar_id),
            urlencoding::encode(event_id)
        );

        let response = self
            .send_authorized(|token| self.client.delete(&url).bearer_auth(token))
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response, "Failed to delete event").await);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param<'a>(params: &'a [(&str, String)], key: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn incremental_pull_repeats_the_initial_expansion_flags() {
        let params = list_params(
            &ListEventsQuery::Incremental {
                sync_token: "tok-1".to_string(),
            },
            None,
        );

        assert_eq!(param(&params, "syncToken"), Some("tok-1"));
        assert_eq!(param(&params, "singleEvents"), Some("true"));
        assert_eq!(param(&params, "showDeleted"), Some("true"));
        assert_eq!(param(&params, "timeMin"), None);
        assert_eq!(param(&params, "timeMax"), None);
        assert_eq!(param(&params, "pageToken"), None);
    }

    #[test]
    fn window_pull_sends_bounds_and_page_token() {
        let time_min = DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let time_max = time_min + Duration::days(90);
        let params = list_params(
            &ListEventsQuery::Window { time_min, time_max },
            Some("page-2"),
        );

        assert_eq!(param(&params, "timeMin"), Some("2024-03-01T00:00:00Z"));
        assert_eq!(param(&params, "timeMax"), Some("2024-05-30T00:00:00Z"));
        assert_eq!(param(&params, "singleEvents"), Some("true"));
        assert_eq!(param(&params, "showDeleted"), Some("true"));
        assert_eq!(param(&params, "pageToken"), Some("page-2"));
        assert_eq!(param(&params, "syncToken"), None);
    }

    #[test]
    fn channel_expiration_is_read_from_millis() {
        let parsed = parse_channel_expiration(Some("1704067200000"));
        assert_eq!(
            parsed,
            DateTime::<Utc>::from_timestamp(1_704_067_200, 0)
                .unwrap()
                .naive_utc()
        );
    }

    #[test]
    fn missing_channel_expiration_defaults_to_a_day() {
        let before = Utc::now().naive_utc() + Duration::hours(23);
        let parsed = parse_channel_expiration(None);
        assert!(parsed > before);
        assert!(parsed <= Utc::now().naive_utc() + Duration::hours(24));

        assert!(parse_channel_expiration(Some("soon")) > before);
    }

    #[test]
    fn event_deserializes_from_google_json() {
        let raw = r#"{
            "kind": "calendar#event",
            "id": "evt1",
            "etag": "\"3181161784712000\"",
            "status": "confirmed",
            "htmlLink": "https://www.google.com/calendar/event?eid=abc",
            "updated": "2024-03-01T12:00:00.000Z",
            "summary": "Session",
            "transparency": "opaque",
            "iCalUID": "evt1@google.com",
            "start": { "dateTime": "2024-03-05T10:00:00-03:00", "timeZone": "America/Sao_Paulo" },
            "end": { "dateTime": "2024-03-05T11:00:00-03:00" },
            "extendedProperties": { "private": { "clinic_appointment_id": "appt-1" } }
        }"#;

        let event: GoogleEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.id, "evt1");
        assert_eq!(event.ical_uid.as_deref(), Some("evt1@google.com"));
        assert_eq!(event.private_property(LOCAL_APPOINTMENT_PROPERTY), Some("appt-1"));
        assert_eq!(
            event.start.unwrap().date_time.as_deref(),
            Some("2024-03-05T10:00:00-03:00")
        );
    }

    #[test]
    fn cancelled_stub_deserializes_without_times() {
        let event: GoogleEvent =
            serde_json::from_str(r#"{ "id": "gone", "status": "cancelled" }"#).unwrap();
        assert!(event.start.is_none());
        assert_eq!(event.status.as_deref(), Some("cancelled"));
    }

    #[test]
    fn event_write_uses_google_field_names() {
        let start = chrono::NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(13, 0, 0)
            .unwrap();
        let body = EventWrite {
            summary: Some("Session".to_string()),
            description: None,
            start: EventDateTime::at(start, "America/Sao_Paulo"),
            end: EventDateTime::at(start + Duration::hours(1), "America/Sao_Paulo"),
            extended_properties: None,
        };

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["start"]["dateTime"], "2024-03-05T13:00:00Z");
        assert_eq!(json["start"]["timeZone"], "America/Sao_Paulo");
        assert!(json.get("description").is_none());
    }
}
