use std::env;
use std::ops::RangeInclusive;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub google: GoogleConfig,
    pub sync: SyncConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origin allowed by CORS for the operator dashboard. CORS stays closed when unset.
    pub frontend_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Refresh token of the clinic's master Google account that owns every
    /// therapist calendar.
    pub refresh_token: String,
    pub api_base_url: String,
    pub token_url: String,
    /// IANA zone sent with outbound event times.
    pub timezone: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Public base URL Google pushes to (`{base}/api/gcal/webhook`). Read from `APP_URL`.
    pub callback_base_url: Option<String>,
    /// Shared secret expected as `Authorization: Bearer <secret>` on cron and
    /// operator endpoints. Read from `CRON_SECRET`.
    pub cron_secret: Option<String>,
    /// Channels expiring within this many hours are renewed by the sweep.
    pub renewal_window_hours: i64,
    /// Bulk setup leaves an active channel alone if it lives longer than this.
    pub setup_skip_threshold_hours: i64,
    pub resync_days_back: i64,
    pub resync_days_forward: i64,
    /// Maximum outbound jobs drained per queue run.
    pub queue_batch_size: i64,
    /// A job left in `processing` longer than this is handed back to `pending`.
    pub queue_claim_timeout_minutes: i64,
    /// Run renewal / setup / queue sweeps in-process instead of relying on an
    /// external cron hitting the endpoints.
    pub workers_enabled: bool,
    pub worker_interval_seconds: u64,
    pub queue_worker_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Allowed requests per second (per IP) for the Google push webhook
    pub webhook_per_second: u32,
    /// Burst size for the webhook endpoint
    pub webhook_burst: u32,
}

impl SyncConfig {
    /// Absolute URL Google should deliver channel notifications to.
    pub fn webhook_address(&self) -> Result<String, ConfigError> {
        let base = self
            .callback_base_url
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnv("APP_URL".to_string()))?;

        let base = url::Url::parse(base.trim_end_matches('/'))
            .map_err(|_| ConfigError::InvalidValue("APP_URL".to_string()))?;
        let address = base
            .join(&format!("{}/api/gcal/webhook", base.path().trim_end_matches('/')))
            .map_err(|_| ConfigError::InvalidValue("APP_URL".to_string()))?;

        Ok(address.to_string())
    }
}

/// Parse `key` when it is set. A value that does not parse is an error rather
/// than a silent fallback to the default.
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        _ => Ok(default),
    }
}

fn check_range<T: PartialOrd>(
    key: &str,
    value: T,
    range: RangeInclusive<T>,
) -> Result<(), ConfigError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue(key.to_string()))
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        let config = Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                frontend_url: env::var("FRONTEND_URL").ok().filter(|s| !s.is_empty()),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/clinic.db".to_string()),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 5)?,
            },
            google: GoogleConfig {
                client_id: env::var("GOOGLE_CLIENT_ID")
                    .map_err(|_| ConfigError::MissingEnv("GOOGLE_CLIENT_ID".to_string()))?,
                client_secret: env::var("GOOGLE_CLIENT_SECRET")
                    .map_err(|_| ConfigError::MissingEnv("GOOGLE_CLIENT_SECRET".to_string()))?,
                refresh_token: env::var("GOOGLE_REFRESH_TOKEN")
                    .map_err(|_| ConfigError::MissingEnv("GOOGLE_REFRESH_TOKEN".to_string()))?,
                api_base_url: env::var("GOOGLE_CALENDAR_API_URL")
                    .unwrap_or(defaults.google.api_base_url),
                token_url: env::var("GOOGLE_OAUTH_TOKEN_URL").unwrap_or(defaults.google.token_url),
                timezone: env::var("CALENDAR_TIMEZONE").unwrap_or(defaults.google.timezone),
            },
            sync: SyncConfig {
                callback_base_url: env::var("APP_URL").ok(),
                cron_secret: env::var("CRON_SECRET").ok().filter(|s| !s.is_empty()),
                renewal_window_hours: env_or(
                    "GCAL_RENEWAL_WINDOW_HOURS",
                    defaults.sync.renewal_window_hours,
                )?,
                setup_skip_threshold_hours: env_or(
                    "GCAL_SETUP_SKIP_THRESHOLD_HOURS",
                    defaults.sync.setup_skip_threshold_hours,
                )?,
                resync_days_back: env_or("GCAL_RESYNC_DAYS_BACK", defaults.sync.resync_days_back)?,
                resync_days_forward: env_or(
                    "GCAL_RESYNC_DAYS_FORWARD",
                    defaults.sync.resync_days_forward,
                )?,
                queue_batch_size: env_or("GCAL_QUEUE_BATCH_SIZE", defaults.sync.queue_batch_size)?,
                queue_claim_timeout_minutes: env_or(
                    "GCAL_QUEUE_CLAIM_TIMEOUT_MINUTES",
                    defaults.sync.queue_claim_timeout_minutes,
                )?,
                workers_enabled: env_flag("GCAL_WORKERS_ENABLED", false),
                worker_interval_seconds: env_or(
                    "GCAL_WORKER_INTERVAL_SECONDS",
                    defaults.sync.worker_interval_seconds,
                )?,
                queue_worker_interval_seconds: env_or(
                    "GCAL_QUEUE_WORKER_INTERVAL_SECONDS",
                    defaults.sync.queue_worker_interval_seconds,
                )?,
            },
            rate_limit: RateLimitConfig {
                webhook_per_second: env_or("RATE_LIMIT_WEBHOOKS_PER_SECOND", 10)?,
                webhook_burst: env_or("RATE_LIMIT_WEBHOOKS_BURST", 50)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject numeric settings outside the ranges the sweeps can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sync = &self.sync;
        check_range("GCAL_RENEWAL_WINDOW_HOURS", sync.renewal_window_hours, 1..=168)?;
        check_range(
            "GCAL_SETUP_SKIP_THRESHOLD_HOURS",
            sync.setup_skip_threshold_hours,
            0..=168,
        )?;
        check_range("GCAL_RESYNC_DAYS_BACK", sync.resync_days_back, 0..=3650)?;
        check_range("GCAL_RESYNC_DAYS_FORWARD", sync.resync_days_forward, 1..=3650)?;
        check_range("GCAL_QUEUE_BATCH_SIZE", sync.queue_batch_size, 1..=500)?;
        check_range(
            "GCAL_QUEUE_CLAIM_TIMEOUT_MINUTES",
            sync.queue_claim_timeout_minutes,
            1..=1440,
        )?;
        check_range(
            "GCAL_WORKER_INTERVAL_SECONDS",
            sync.worker_interval_seconds,
            1..=86_400,
        )?;
        check_range(
            "GCAL_QUEUE_WORKER_INTERVAL_SECONDS",
            sync.queue_worker_interval_seconds,
            1..=86_400,
        )?;
        check_range("DATABASE_MAX_CONNECTIONS", self.database.max_connections, 1..=100)?;
        check_range("RATE_LIMIT_WEBHOOKS_PER_SECOND", self.rate_limit.webhook_per_second, 1..=10_000)?;
        check_range("RATE_LIMIT_WEBHOOKS_BURST", self.rate_limit.webhook_burst, 1..=10_000)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                frontend_url: None,
            },
            database: DatabaseConfig {
                url: "sqlite://data/clinic.db".to_string(),
                max_connections: 5,
            },
            google: GoogleConfig {
                client_id: String::new(),
                client_secret: String::new(),
                refresh_token: String::new(),
                api_base_url: "https://www.googleapis.com/calendar/v3".to_string(),
                token_url: "https://oauth2.googleapis.com/token".to_string(),
                timezone: "America/Sao_Paulo".to_string(),
            },
            sync: SyncConfig {
                callback_base_url: None,
                cron_secret: None,
                renewal_window_hours: 24,
                setup_skip_threshold_hours: 1,
                resync_days_back: 30,
                resync_days_forward: 365,
                queue_batch_size: 10,
                queue_claim_timeout_minutes: 10,
                workers_enabled: false,
                worker_interval_seconds: 3600,
                queue_worker_interval_seconds: 60,
            },
            rate_limit: RateLimitConfig {
                webhook_per_second: 10,
                webhook_burst: 50,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_with_base(base: Option<&str>) -> SyncConfig {
        SyncConfig {
            callback_base_url: base.map(str::to_string),
            ..Config::default().sync
        }
    }

    #[test]
    fn webhook_address_appends_route() {
        let sync = sync_with_base(Some("https://clinic.example.com"));
        assert_eq!(
            sync.webhook_address().unwrap(),
            "https://clinic.example.com/api/gcal/webhook"
        );
    }

    #[test]
    fn webhook_address_keeps_base_path_and_trims_slash() {
        let sync = sync_with_base(Some("https://clinic.example.com/app/"));
        assert_eq!(
            sync.webhook_address().unwrap(),
            "https://clinic.example.com/app/api/gcal/webhook"
        );
    }

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let mut config = Config::default();
        config.sync.resync_days_back = -1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(key)) if key == "GCAL_RESYNC_DAYS_BACK"
        ));

        let mut config = Config::default();
        config.sync.resync_days_forward = i64::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(key)) if key == "GCAL_RESYNC_DAYS_FORWARD"
        ));

        let mut config = Config::default();
        config.sync.renewal_window_hours = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(key)) if key == "GCAL_RENEWAL_WINDOW_HOURS"
        ));

        let mut config = Config::default();
        config.sync.queue_worker_interval_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unparsable_env_value_is_an_error() {
        std::env::set_var("CLINIC_SYNC_TEST_UNPARSABLE", "abc");
        assert!(matches!(
            env_or::<i64>("CLINIC_SYNC_TEST_UNPARSABLE", 5),
            Err(ConfigError::InvalidValue(key)) if key == "CLINIC_SYNC_TEST_UNPARSABLE"
        ));

        std::env::set_var("CLINIC_SYNC_TEST_PARSABLE", " 42 ");
        assert_eq!(env_or::<i64>("CLINIC_SYNC_TEST_PARSABLE", 5).unwrap(), 42);
        assert_eq!(env_or::<i64>("CLINIC_SYNC_TEST_UNSET", 5).unwrap(), 5);
    }

    #[test]
    fn webhook_address_requires_app_url() {
        assert!(matches!(
            sync_with_base(None).webhook_address(),
            Err(ConfigError::MissingEnv(_))
        ));
        assert!(matches!(
            sync_with_base(Some("  ")).webhook_address(),
            Err(ConfigError::MissingEnv(_))
        ));
        assert!(matches!(
            sync_with_base(Some("not a url")).webhook_address(),
            Err(ConfigError::InvalidValue(_))
        ));
    }
}
