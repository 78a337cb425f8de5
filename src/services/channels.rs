use chrono::{Duration, NaiveDateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::models::{
    CalendarChannel, CalendarSyncState, ChannelCounts, SyncLogEntry, Therapist,
    UpsertCalendarChannel,
};
use crate::db::{ChannelRepository, SyncLogRepository, SyncStateRepository, TherapistRepository};
use crate::error::{AppError, AppResult};
use crate::AppState;

const RECENT_LOG_LIMIT: i64 = 20;

/// Random secret Google echoes back in `X-Goog-Channel-Token`.
pub fn generate_channel_token() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RenewalError {
    pub calendar_id: String,
    pub channel_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RenewalReport {
    pub checked: usize,
    pub renewed: usize,
    pub failed: usize,
    pub errors: Vec<RenewalError>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SetupStatus {
    Created,
    AlreadyActive,
    Error,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SetupResult {
    pub therapist_id: String,
    pub calendar_id: String,
    pub status: SetupStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<NaiveDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SetupStats {
    pub total: usize,
    pub created: usize,
    pub already_active: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SetupSweepReport {
    pub results: Vec<SetupResult>,
    pub stats: SetupStats,
}

impl SetupSweepReport {
    fn push(&mut self, result: SetupResult) {
        self.stats.total += 1;
        match result.status {
            SetupStatus::Created => self.stats.created += 1,
            SetupStatus::AlreadyActive => self.stats.already_active += 1,
            SetupStatus::Error => self.stats.errors += 1,
        }
        self.results.push(result);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub therapist_id: String,
    pub calendar_id: Option<String>,
    pub channels: Vec<CalendarChannel>,
    pub sync_state: Option<CalendarSyncState>,
    pub recent_sync_log: Vec<SyncLogEntry>,
}

/// Lifecycle of Google push channels: one active watch per therapist calendar,
/// re-registered before Google lets it lapse.
pub struct ChannelManager;

impl ChannelManager {
    /// Register a fresh watch for the therapist's calendar.
    ///
    /// The calendar's sync token is reset so the next notification lists the
    /// full window. Any previous registration is stopped afterwards, best effort.
    pub async fn setup(state: &AppState, therapist_id: &str) -> AppResult<CalendarChannel> {
        let therapist = TherapistRepository::find_by_id(&state.db, therapist_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Therapist not found".to_string()))?;
        let calendar_id = calendar_of(&therapist)?;

        Self::register(state, &therapist.id, &calendar_id).await
    }

    async fn register(
        state: &AppState,
        therapist_id: &str,
        calendar_id: &str,
    ) -> AppResult<CalendarChannel> {
        let address = webhook_address(state)?;

        let previous =
            ChannelRepository::find_for_therapist_calendar(&state.db, therapist_id, calendar_id)
                .await?;

        let channel_id = Uuid::new_v4().to_string();
        let channel_token = generate_channel_token();

        let registration = state
            .calendar
            .watch_events(calendar_id, &channel_id, &channel_token, &address)
            .await?;

        SyncStateRepository::reset(&state.db, calendar_id).await?;

        let channel = ChannelRepository::upsert(
            &state.db,
            UpsertCalendarChannel {
                therapist_id: therapist_id.to_string(),
                calendar_id: calendar_id.to_string(),
                channel_id: registration.channel_id,
                resource_id: registration.resource_id,
                channel_token,
                expiration: registration.expiration,
            },
        )
        .await?;

        info!(
            therapist_id,
            calendar_id,
            channel_id = %channel.channel_id,
            expiration = %channel.expiration,
            "Registered Google Calendar watch"
        );

        if let Some(previous) = previous {
            Self::stop_quietly(state, &previous).await;
        }

        Ok(channel)
    }

    /// Re-register `channel` under a new channel id and token, keeping the
    /// calendar's sync token. On failure the channel is marked inactive and
    /// stays that way until the next setup.
    pub async fn renew(state: &AppState, channel: &CalendarChannel) -> AppResult<CalendarChannel> {
        match Self::try_renew(state, channel).await {
            Ok(renewed) => {
                Self::stop_quietly(state, channel).await;
                Ok(renewed)
            }
            Err(e) => {
                warn!(
                    calendar_id = %channel.calendar_id,
                    channel_id = %channel.channel_id,
                    "Channel renewal failed; marking inactive: {}",
                    e
                );
                if let Err(mark_err) = ChannelRepository::mark_inactive(&state.db, &channel.id).await {
                    warn!("Failed to mark channel {} inactive: {:?}", channel.id, mark_err);
                }
                Err(e)
            }
        }
    }

    async fn try_renew(state: &AppState, channel: &CalendarChannel) -> AppResult<CalendarChannel> {
        let address = webhook_address(state)?;

        let channel_id = Uuid::new_v4().to_string();
        let channel_token = generate_channel_token();

        let registration = state
            .calendar
            .watch_events(&channel.calendar_id, &channel_id, &channel_token, &address)
            .await?;

        let renewed = ChannelRepository::update_registration(
            &state.db,
            &channel.id,
            &registration.channel_id,
            &registration.resource_id,
            &channel_token,
            registration.expiration,
        )
        .await?;

        info!(
            calendar_id = %renewed.calendar_id,
            channel_id = %renewed.channel_id,
            expiration = %renewed.expiration,
            "Renewed Google Calendar watch"
        );

        Ok(renewed)
    }

    /// Renew every active channel that expires within the renewal window.
    /// Channels further out are left alone.
    pub async fn renew_expiring(state: &AppState) -> AppResult<RenewalReport> {
        webhook_address(state)?;
        let threshold =
            Utc::now().naive_utc() + Duration::hours(state.config.sync.renewal_window_hours);
        let channels = ChannelRepository::list_active_expiring_before(&state.db, threshold).await?;

        info!("Renewing {} Google Calendar channel(s) expiring before {}", channels.len(), threshold);

        let mut report = RenewalReport {
            checked: channels.len(),
            ..Default::default()
        };

        for channel in channels {
            match Self::renew(state, &channel).await {
                Ok(_) => report.renewed += 1,
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(RenewalError {
                        calendar_id: channel.calendar_id.clone(),
                        channel_id: channel.channel_id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    /// Make sure every therapist with a calendar has a live channel. One
    /// therapist failing does not stop the sweep.
    pub async fn setup_all(state: &AppState) -> AppResult<SetupSweepReport> {
        webhook_address(state)?;
        let therapists = TherapistRepository::list_with_calendar(&state.db).await?;
        let keep_after = Utc::now().naive_utc()
            + Duration::hours(state.config.sync.setup_skip_threshold_hours);

        let mut report = SetupSweepReport::default();

        for therapist in therapists {
            let Ok(calendar_id) = calendar_of(&therapist) else {
                continue;
            };

            let existing = match ChannelRepository::find_for_therapist_calendar(
                &state.db,
                &therapist.id,
                &calendar_id,
            )
            .await
            {
                Ok(existing) => existing,
                Err(e) => {
                    report.push(SetupResult::failed(&therapist.id, &calendar_id, &e));
                    continue;
                }
            };

            if let Some(channel) = existing.filter(|c| c.is_active && !c.expires_before(keep_after)) {
                report.push(SetupResult {
                    therapist_id: therapist.id.clone(),
                    calendar_id,
                    status: SetupStatus::AlreadyActive,
                    channel_id: Some(channel.channel_id),
                    expiration: Some(channel.expiration),
                    error: None,
                });
                continue;
            }

            match Self::register(state, &therapist.id, &calendar_id).await {
                Ok(channel) => report.push(SetupResult {
                    therapist_id: therapist.id.clone(),
                    calendar_id,
                    status: SetupStatus::Created,
                    channel_id: Some(channel.channel_id),
                    expiration: Some(channel.expiration),
                    error: None,
                }),
                Err(e) => {
                    warn!(therapist_id = %therapist.id, "Webhook setup failed: {}", e);
                    report.push(SetupResult::failed(&therapist.id, &calendar_id, &e));
                }
            }
        }

        info!(
            total = report.stats.total,
            created = report.stats.created,
            already_active = report.stats.already_active,
            errors = report.stats.errors,
            "Bulk webhook setup finished"
        );

        Ok(report)
    }

    pub async fn channel_status(state: &AppState, therapist_id: &str) -> AppResult<ChannelStatus> {
        let therapist = TherapistRepository::find_by_id(&state.db, therapist_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Therapist not found".to_string()))?;

        let channels = ChannelRepository::list_for_therapist(&state.db, therapist_id).await?;
        let calendar_id = calendar_of(&therapist).ok();

        let (sync_state, recent_sync_log) = match calendar_id.as_deref() {
            Some(calendar_id) => (
                SyncStateRepository::find(&state.db, calendar_id).await?,
                SyncLogRepository::list_recent(&state.db, calendar_id, RECENT_LOG_LIMIT).await?,
            ),
            None => (None, Vec::new()),
        };

        Ok(ChannelStatus {
            therapist_id: therapist.id,
            calendar_id,
            channels,
            sync_state,
            recent_sync_log,
        })
    }

    /// Channel counts with "expiring soon" meaning within the renewal window.
    pub async fn counts(state: &AppState) -> AppResult<ChannelCounts> {
        let now = Utc::now().naive_utc();
        let soon = now + Duration::hours(state.config.sync.renewal_window_hours);
        ChannelRepository::counts(&state.db, now, soon).await
    }

    async fn stop_quietly(state: &AppState, channel: &CalendarChannel) {
        if let Err(e) = state
            .calendar
            .stop_channel(&channel.channel_id, &channel.resource_id)
            .await
        {
            warn!(
                channel_id = %channel.channel_id,
                "Failed to stop previous channel: {}",
                e
            );
        }
    }
}

fn webhook_address(state: &AppState) -> AppResult<String> {
    state
        .config
        .sync
        .webhook_address()
        .map_err(|e| AppError::Config(e.to_string()))
}

impl SetupResult {
    fn failed(therapist_id: &str, calendar_id: &str, error: &AppError) -> Self {
        SetupResult {
            therapist_id: therapist_id.to_string(),
            calendar_id: calendar_id.to_string(),
            status: SetupStatus::Error,
            channel_id: None,
            expiration: None,
            error: Some(error.to_string()),
        }
    }
}

fn calendar_of(therapist: &Therapist) -> AppResult<String> {
    therapist
        .google_calendar_id
        .clone()
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| AppError::NotFound("Therapist has no Google Calendar configured".to_string()))
}
