//! Forecast provider contract and registry.
//!
//! A provider answers "what is the wind at (lat, lon, time)" with the
//! direction the wind blows from, speed at the 10 m reference height, speed
//! at rider height, an optional gust speed and the identity of the model run
//! that produced the value.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Von Kármán constant.
const VON_KARMAN: f64 = 0.41;
/// Roughness length for open country with hedges and scattered buildings (m).
const ROUGHNESS_LENGTH_M: f64 = 0.1;
/// Height the providers report wind at.
pub const REFERENCE_HEIGHT_M: f64 = 10.0;

/// One wind reading from a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct WindReading {
    /// Meteorological direction the wind blows from, degrees.
    pub wind_dir_deg: f64,
    /// Speed at the 10 m reference height (m/s).
    pub wind_speed_high_ms: f64,
    /// Speed at rider height (m/s).
    pub wind_speed_low_ms: f64,
    pub gust_ms: Option<f64>,
    pub model_run_id: String,
    /// Relative spread of the provider's own ensemble, when it reports one.
    pub uncertainty: Option<f64>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("{provider} request failed: {message}")]
    Transport { provider: String, message: String },
    #[error("{provider} returned HTTP {status}")]
    Status { provider: String, status: u16 },
    #[error("{provider} response could not be parsed: {message}")]
    Parse { provider: String, message: String },
    #[error("{provider} has no data for this time: {message}")]
    OutOfRange { provider: String, message: String },
}

impl ProviderError {
    /// Whether retrying the same request can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Transport { .. } => true,
            ProviderError::Status { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Parse { .. } | ProviderError::OutOfRange { .. } => false,
        }
    }

    pub fn transport(provider: &str, err: impl std::fmt::Display) -> Self {
        ProviderError::Transport {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }

    pub fn parse(provider: &str, err: impl std::fmt::Display) -> Self {
        ProviderError::Parse {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }

    pub fn out_of_range(provider: &str, message: impl Into<String>) -> Self {
        ProviderError::OutOfRange {
            provider: provider.to_string(),
            message: message.into(),
        }
    }
}

/// A source of point wind forecasts.
#[async_trait]
pub trait ForecastProvider: Send + Sync {
    /// Registry key, e.g. `open-meteo`.
    fn name(&self) -> &str;

    async fn fetch(
        &self,
        lat: f64,
        lon: f64,
        time: DateTime<Utc>,
    ) -> Result<WindReading, ProviderError>;
}

/// Scale a 10 m wind speed down to `height_m` with a logarithmic wind profile.
///
/// Heights at or above the reference height return the input unchanged.
pub fn downscale_to_height(speed_10m: f64, height_m: f64) -> f64 {
    if height_m >= REFERENCE_HEIGHT_M || speed_10m <= 0.0 {
        return speed_10m.max(0.0);
    }
    let height_m = height_m.max(ROUGHNESS_LENGTH_M * 1.01);
    let u_star = speed_10m * VON_KARMAN / (REFERENCE_HEIGHT_M / ROUGHNESS_LENGTH_M).ln();
    (u_star / VON_KARMAN * (height_m / ROUGHNESS_LENGTH_M).ln()).max(0.0)
}

/// Providers available to analysis jobs, keyed by name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn ForecastProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn ForecastProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ForecastProvider>> {
        self.providers.get(name).cloned()
    }

    /// Sorted provider names.
    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}
