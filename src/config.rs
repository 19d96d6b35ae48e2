use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// SQLite database URL, e.g. "sqlite://database/crowding.db"
    #[serde(default = "Config::default_database_url")]
    pub database_url: String,
    /// Allowed CORS origins. Required unless cors_permissive is true.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Explicitly allow all origins (development only). Defaults to false.
    #[serde(default)]
    pub cors_permissive: bool,
    pub paths: DataPaths,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub bus_upstream: BusUpstreamConfig,
    #[serde(default)]
    pub metro_upstream: MetroUpstreamConfig,
    #[serde(default)]
    pub weather: WeatherConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    /// First-boot admin provisioning. Unset disables provisioning.
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,
    pub jwt_secret_key: Option<String>,
    #[serde(default = "Config::default_jwt_algorithm")]
    pub jwt_algorithm: String,
    #[serde(default = "Config::default_jwt_expire_minutes")]
    pub jwt_access_token_expire_minutes: u32,
}

/// Paths to the read-only static files consumed at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct DataPaths {
    pub historical_features_csv: PathBuf,
    pub calendar_csv: PathBuf,
    pub topology_json: PathBuf,
    pub line_shapes_json: Option<PathBuf>,
    pub rail_capacity_yaml: Option<PathBuf>,
    pub capacity_meta_csv: Option<PathBuf>,
    pub transport_lines_csv: Option<PathBuf>,
    pub model_artifact_json: PathBuf,
}

/// Cron schedule (Europe/Istanbul) for the nightly job chain, in "sec min hour day month weekday" form.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "ScheduleConfig::default_bus_prefetch")]
    pub bus_prefetch_cron: String,
    #[serde(default = "ScheduleConfig::default_metro_prefetch")]
    pub metro_prefetch_cron: String,
    #[serde(default = "ScheduleConfig::default_forecast")]
    pub forecast_cron: String,
    #[serde(default = "ScheduleConfig::default_cleanup")]
    pub cleanup_cron: String,
    #[serde(default = "ScheduleConfig::default_quality_check")]
    pub quality_check_cron: String,
    /// Firing interval for the dynamically-installed schedule-cache retry jobs
    /// (`bus_schedule_retry`/`metro_schedule_retry`), installed only while a
    /// service's pending-retry map is non-empty.
    #[serde(default = "ScheduleConfig::default_retry_cron")]
    pub retry_cron: String,
    #[serde(default = "ScheduleConfig::default_forecast_horizon_days")]
    pub forecast_horizon_days: i64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            bus_prefetch_cron: Self::default_bus_prefetch(),
            metro_prefetch_cron: Self::default_metro_prefetch(),
            forecast_cron: Self::default_forecast(),
            cleanup_cron: Self::default_cleanup(),
            quality_check_cron: Self::default_quality_check(),
            retry_cron: Self::default_retry_cron(),
            forecast_horizon_days: Self::default_forecast_horizon_days(),
        }
    }
}

impl ScheduleConfig {
    fn default_bus_prefetch() -> String {
        "0 10 0 * * *".into()
    }
    fn default_metro_prefetch() -> String {
        "0 30 2 * * *".into()
    }
    fn default_forecast() -> String {
        "0 0 4 * * *".into()
    }
    fn default_cleanup() -> String {
        "0 15 4 * * *".into()
    }
    fn default_quality_check() -> String {
        "0 30 4 * * *".into()
    }
    fn default_retry_cron() -> String {
        "0 */30 * * * *".into()
    }
    fn default_forecast_horizon_days() -> i64 {
        2
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusUpstreamConfig {
    #[serde(default = "BusUpstreamConfig::default_url")]
    pub url: String,
    #[serde(default = "BusUpstreamConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "BusUpstreamConfig::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "BusUpstreamConfig::default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

impl Default for BusUpstreamConfig {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
            timeout_secs: Self::default_timeout_secs(),
            max_attempts: Self::default_max_attempts(),
            retry_backoff_secs: Self::default_retry_backoff_secs(),
        }
    }
}

impl BusUpstreamConfig {
    fn default_url() -> String {
        "https://api.iett.istanbul/iettapp/IETT_SEFER_SAATLERI/SeferSaatleri.asmx".into()
    }
    fn default_timeout_secs() -> u64 {
        15
    }
    fn default_max_attempts() -> u32 {
        3
    }
    fn default_retry_backoff_secs() -> u64 {
        4
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetroUpstreamConfig {
    #[serde(default = "MetroUpstreamConfig::default_url")]
    pub url: String,
    #[serde(default = "MetroUpstreamConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "MetroUpstreamConfig::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "MetroUpstreamConfig::default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

impl Default for MetroUpstreamConfig {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
            timeout_secs: Self::default_timeout_secs(),
            max_attempts: Self::default_max_attempts(),
            retry_backoff_secs: Self::default_retry_backoff_secs(),
        }
    }
}

impl MetroUpstreamConfig {
    fn default_url() -> String {
        "https://api.metro.istanbul/MetroMobile/SeferSaati".into()
    }
    fn default_timeout_secs() -> u64 {
        12
    }
    fn default_max_attempts() -> u32 {
        3
    }
    fn default_retry_backoff_secs() -> u64 {
        4
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeatherConfig {
    #[serde(default = "WeatherConfig::default_url")]
    pub url: String,
    #[serde(default = "WeatherConfig::default_latitude")]
    pub latitude: f64,
    #[serde(default = "WeatherConfig::default_longitude")]
    pub longitude: f64,
    #[serde(default = "WeatherConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "WeatherConfig::default_max_retries")]
    pub max_retries: u32,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
            latitude: Self::default_latitude(),
            longitude: Self::default_longitude(),
            timeout_secs: Self::default_timeout_secs(),
            max_retries: Self::default_max_retries(),
        }
    }
}

impl WeatherConfig {
    fn default_url() -> String {
        "https://api.open-meteo.com/v1/forecast".into()
    }
    fn default_latitude() -> f64 {
        41.0082
    }
    fn default_longitude() -> f64 {
        28.9784
    }
    fn default_timeout_secs() -> u64 {
        10
    }
    fn default_max_retries() -> u32 {
        3
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "RetentionConfig::default_forecast_days")]
    pub forecast_days: i64,
    #[serde(default = "RetentionConfig::default_schedule_cache_days")]
    pub schedule_cache_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            forecast_days: Self::default_forecast_days(),
            schedule_cache_days: Self::default_schedule_cache_days(),
        }
    }
}

impl RetentionConfig {
    fn default_forecast_days() -> i64 {
        3
    }
    fn default_schedule_cache_days() -> i64 {
        5
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    fn default_database_url() -> String {
        "sqlite://database/crowding.db".into()
    }

    fn default_jwt_algorithm() -> String {
        "HS256".into()
    }

    fn default_jwt_expire_minutes() -> u32 {
        60
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
}
