use std::str::FromStr;
use std::time::Duration;

use crate::services::classify::WindBands;

/// Whether a repeated analysis request replays an earlier completed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultReusePolicy {
    /// Replay a completed result for the same route, departure, provider set and timing.
    ReuseCompleted,
    /// Always run the pipeline and create a new result.
    AlwaysNew,
}

impl FromStr for ResultReusePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reuse" | "reuse_completed" => Ok(Self::ReuseCompleted),
            "new" | "always_new" => Ok(Self::AlwaysNew),
            other => Err(format!("unknown result reuse policy '{}'", other)),
        }
    }
}

/// Application configuration, parsed from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    /// Directory containing GPX files seeded as demo routes at startup.
    pub data_dir: String,
    /// Emit JSON-formatted log lines instead of the human-readable format.
    pub json_logs: bool,

    pub open_meteo_base_url: String,
    pub open_meteo_archive_url: String,
    pub yr_base_url: String,
    pub yr_user_agent: String,
    pub forecast_timeout_secs: u64,
    pub max_concurrent_forecasts: usize,
    pub forecast_retry_attempts: u32,
    pub forecast_retry_backoff_ms: u64,

    pub sample_interval_km: f64,
    pub default_speed_kmh: f64,
    pub rider_height_m: f64,
    pub min_timestamp_coverage: f64,
    pub head_threshold_deg: f64,
    pub tail_threshold_deg: f64,
    pub result_reuse: ResultReusePolicy,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            port: env_or("PORT", 8000),
            data_dir: std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            json_logs: env_or("JSON_LOGS", false),
            open_meteo_base_url: std::env::var("OPEN_METEO_BASE_URL")
                .unwrap_or_else(|_| "https://api.open-meteo.com/v1".to_string()),
            open_meteo_archive_url: std::env::var("OPEN_METEO_ARCHIVE_URL")
                .unwrap_or_else(|_| "https://archive-api.open-meteo.com/v1".to_string()),
            yr_base_url: std::env::var("YR_BASE_URL").unwrap_or_else(|_| {
                "https://api.met.no/weatherapi/locationforecast/2.0".to_string()
            }),
            yr_user_agent: std::env::var("YR_USER_AGENT").unwrap_or_else(|_| {
                "AgainstWind/0.1 github.com/against-wind/against-wind-api".to_string()
            }),
            forecast_timeout_secs: env_or("FORECAST_TIMEOUT_SECS", 30),
            max_concurrent_forecasts: env_or("MAX_CONCURRENT_FORECASTS", 10),
            forecast_retry_attempts: env_or("FORECAST_RETRY_ATTEMPTS", 3),
            forecast_retry_backoff_ms: env_or("FORECAST_RETRY_BACKOFF_MS", 250),
            sample_interval_km: env_or("SAMPLE_INTERVAL_KM", 1.0),
            default_speed_kmh: env_or("DEFAULT_SPEED_KMH", 25.0),
            rider_height_m: env_or("RIDER_HEIGHT_M", 1.5),
            min_timestamp_coverage: env_or("MIN_TIMESTAMP_COVERAGE", 0.8),
            head_threshold_deg: env_or("HEAD_THRESHOLD_DEG", 60.0),
            tail_threshold_deg: env_or("TAIL_THRESHOLD_DEG", 120.0),
            result_reuse: env_or("RESULT_REUSE", ResultReusePolicy::ReuseCompleted),
        }
    }

    /// Derive the per-job pipeline settings.
    ///
    /// Invalid classification bands fall back to the defaults with a warning
    /// so a typo in the environment does not prevent startup.
    pub fn pipeline(&self) -> PipelineConfig {
        let bands = WindBands::new(self.head_threshold_deg, self.tail_threshold_deg)
            .unwrap_or_else(|e| {
                tracing::warn!("{}; using default wind bands", e);
                WindBands::default()
            });

        PipelineConfig {
            sample_interval_m: self.sample_interval_km.max(0.05) * 1000.0,
            default_speed_kmh: self.default_speed_kmh,
            min_timestamp_coverage: self.min_timestamp_coverage.clamp(0.0, 1.0),
            bands,
            max_concurrency: self.max_concurrent_forecasts.max(1),
            retry_attempts: self.forecast_retry_attempts,
            retry_backoff: Duration::from_millis(self.forecast_retry_backoff_ms),
            reuse: self.result_reuse,
        }
    }

    pub fn forecast_timeout(&self) -> Duration {
        Duration::from_secs(self.forecast_timeout_secs)
    }
}

/// Settings passed by value into every analysis job.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Target spacing between route samples in metres.
    pub sample_interval_m: f64,
    pub default_speed_kmh: f64,
    pub min_timestamp_coverage: f64,
    pub bands: WindBands,
    /// Upper bound on in-flight provider requests per job.
    pub max_concurrency: usize,
    /// Retries after the first failed attempt of a transient provider error.
    pub retry_attempts: u32,
    /// Base delay, doubled on every retry.
    pub retry_backoff: Duration,
    pub reuse: ResultReusePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_interval_m: 1000.0,
            default_speed_kmh: 25.0,
            min_timestamp_coverage: 0.8,
            bands: WindBands::default(),
            max_concurrency: 10,
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(250),
            reuse: ResultReusePolicy::ReuseCompleted,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid value '{}' for {}", raw, key);
            default
        }),
        Err(_) => default,
    }
}
