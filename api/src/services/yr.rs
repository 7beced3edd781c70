//! yr.no Locationforecast 2.0 adapter.
//!
//! Fetches the `complete` product from the MET Norway API and keeps the
//! timeseries per location in memory until the `Expires` header says it is
//! stale, revalidating with `If-Modified-Since` afterwards.
//! See: https://api.met.no/weatherapi/locationforecast/2.0/documentation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, IF_MODIFIED_SINCE, USER_AGENT};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::services::provider::{downscale_to_height, ForecastProvider, ProviderError, WindReading};

pub const PROVIDER_NAME: &str = "yr";

/// yr.no steps are hourly for ~2.5 days, then 6-hourly.
const MAX_TIME_GAP_SECS: u64 = 3 * 3600;

/// Expired entries are kept this long for If-Modified-Since revalidation.
const STALE_RETENTION_MINS: i64 = 60;

/// yr.no Locationforecast adapter with a per-location timeseries cache.
#[derive(Clone)]
pub struct YrProvider {
    client: reqwest::Client,
    base_url: String,
    user_agent: String,
    rider_height_m: f64,
    cache: Arc<RwLock<HashMap<LocationKey, CachedTimeseries>>>,
}

/// Coordinates as sent to yr.no (4 decimal places).
type LocationKey = (String, String);

#[derive(Debug, Clone)]
struct CachedTimeseries {
    expires_at: DateTime<Utc>,
    last_modified: Option<String>,
    forecast: Arc<YrForecast>,
}

/// The parts of a yr.no response the wind analysis uses.
#[derive(Debug)]
struct YrForecast {
    updated_at: Option<DateTime<Utc>>,
    /// Sorted by time.
    entries: Vec<(DateTime<Utc>, YrInstantDetails)>,
}

// --- yr.no JSON response types ---

#[derive(Debug, Deserialize)]
struct YrResponse {
    properties: YrProperties,
}

#[derive(Debug, Deserialize)]
struct YrProperties {
    #[serde(default)]
    meta: Option<YrMeta>,
    timeseries: Vec<YrTimeseries>,
}

#[derive(Debug, Deserialize)]
struct YrMeta {
    updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YrTimeseries {
    time: String,
    data: YrData,
}

#[derive(Debug, Deserialize)]
struct YrData {
    instant: YrInstant,
}

#[derive(Debug, Deserialize)]
struct YrInstant {
    details: YrInstantDetails,
}

#[derive(Debug, Clone, Deserialize)]
struct YrInstantDetails {
    wind_speed: Option<f64>,
    wind_speed_percentile_10: Option<f64>,
    wind_speed_percentile_90: Option<f64>,
    wind_from_direction: Option<f64>,
    wind_speed_of_gust: Option<f64>,
}

impl YrForecast {
    fn from_json(raw: YrResponse) -> Result<Self, ProviderError> {
        let mut entries: Vec<(DateTime<Utc>, YrInstantDetails)> = raw
            .properties
            .timeseries
            .into_iter()
            .filter_map(|ts| {
                let time = DateTime::parse_from_rfc3339(&ts.time).ok()?;
                Some((time.with_timezone(&Utc), ts.data.instant.details))
            })
            .collect();
        if entries.is_empty() {
            return Err(ProviderError::parse(PROVIDER_NAME, "empty timeseries"));
        }
        entries.sort_by_key(|(t, _)| *t);

        let updated_at = raw
            .properties
            .meta
            .and_then(|m| m.updated_at)
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(Self {
            updated_at,
            entries,
        })
    }

    fn model_run_id(&self) -> String {
        match self.updated_at {
            Some(t) => format!("{}-{}", PROVIDER_NAME, t.format("%Y%m%dT%H%MZ")),
            None => format!("{}-unknown", PROVIDER_NAME),
        }
    }

    /// Closest entry to `time` with both wind speed and direction.
    fn wind_at(&self, time: DateTime<Utc>) -> Result<&YrInstantDetails, ProviderError> {
        let target = time.timestamp();
        let (gap, details) = self
            .entries
            .iter()
            .filter(|(_, d)| d.wind_speed.is_some() && d.wind_from_direction.is_some())
            .map(|(t, d)| ((t.timestamp() - target).unsigned_abs(), d))
            .min_by_key(|(gap, _)| *gap)
            .ok_or_else(|| ProviderError::parse(PROVIDER_NAME, "no wind values in timeseries"))?;

        if gap > MAX_TIME_GAP_SECS {
            return Err(ProviderError::out_of_range(
                PROVIDER_NAME,
                format!("{} is outside the forecast timeseries", time),
            ));
        }
        Ok(details)
    }
}

impl YrProvider {
    pub fn new(
        base_url: &str,
        user_agent: &str,
        timeout: std::time::Duration,
        rider_height_m: f64,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to build HTTP client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            user_agent: user_agent.to_string(),
            rider_height_m,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Return the cached timeseries for a location, refreshing it when expired.
    async fn timeseries(&self, lat: f64, lon: f64) -> Result<Arc<YrForecast>, ProviderError> {
        // Limit to 4 decimal places per yr.no terms of service
        let key: LocationKey = (format!("{:.4}", lat), format!("{:.4}", lon));

        let cached = self.cache.read().await.get(&key).cloned();
        if let Some(entry) = &cached {
            if entry.expires_at > Utc::now() {
                return Ok(entry.forecast.clone());
            }
        }

        let url = format!("{}/complete?lat={}&lon={}", self.base_url, key.0, key.1);

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.user_agent)
                .map_err(|e| ProviderError::transport(PROVIDER_NAME, format!("invalid User-Agent: {}", e)))?,
        );
        if let Some(ims) = cached.as_ref().and_then(|c| c.last_modified.as_deref()) {
            if let Ok(val) = HeaderValue::from_str(ims) {
                headers.insert(IF_MODIFIED_SINCE, val);
            }
        }

        let response = self
            .client
            .get(&url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| ProviderError::transport(PROVIDER_NAME, e))?;

        let expires_at = response
            .headers()
            .get("expires")
            .and_then(|v| v.to_str().ok())
            .map(parse_expires_header)
            .unwrap_or_else(|| Utc::now() + chrono::Duration::minutes(30));

        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            if let Some(mut entry) = cached {
                tracing::debug!("yr.no data for {},{} not modified", key.0, key.1);
                entry.expires_at = expires_at;
                let forecast = entry.forecast.clone();
                self.remember(key, entry).await;
                return Ok(forecast);
            }
        }

        if !response.status().is_success() {
            return Err(ProviderError::Status {
                provider: PROVIDER_NAME.to_string(),
                status: response.status().as_u16(),
            });
        }

        let last_modified = response
            .headers()
            .get("last-modified")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let raw: YrResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::parse(PROVIDER_NAME, e))?;
        let forecast = Arc::new(YrForecast::from_json(raw)?);

        self.remember(
            key,
            CachedTimeseries {
                expires_at,
                last_modified,
                forecast: forecast.clone(),
            },
        )
        .await;
        Ok(forecast)
    }

    /// Cache a timeseries, dropping entries that are long past their expiry.
    async fn remember(&self, key: LocationKey, entry: CachedTimeseries) {
        let mut cache = self.cache.write().await;
        prune_stale(&mut cache, Utc::now());
        cache.insert(key, entry);
    }
}

fn prune_stale(cache: &mut HashMap<LocationKey, CachedTimeseries>, now: DateTime<Utc>) {
    let cutoff = now - chrono::Duration::minutes(STALE_RETENTION_MINS);
    let before = cache.len();
    cache.retain(|_, entry| entry.expires_at > cutoff);
    if cache.len() < before {
        tracing::debug!("Pruned {} stale yr.no cache entries", before - cache.len());
    }
}

#[async_trait]
impl ForecastProvider for YrProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn fetch(
        &self,
        lat: f64,
        lon: f64,
        time: DateTime<Utc>,
    ) -> Result<WindReading, ProviderError> {
        let forecast = self.timeseries(lat, lon).await?;
        let details = forecast.wind_at(time)?;

        let speed = details.wind_speed.unwrap_or(0.0).max(0.0);
        let uncertainty = match (
            details.wind_speed_percentile_10,
            details.wind_speed_percentile_90,
        ) {
            (Some(p10), Some(p90)) => Some(((p90 - p10) / speed.max(1.0)).max(0.0)),
            _ => None,
        };

        Ok(WindReading {
            wind_dir_deg: details.wind_from_direction.unwrap_or(0.0),
            wind_speed_high_ms: speed,
            wind_speed_low_ms: downscale_to_height(speed, self.rider_height_m),
            gust_ms: details.wind_speed_of_gust,
            model_run_id: forecast.model_run_id(),
            uncertainty,
        })
    }
}

/// Parse an HTTP date string (e.g. "Sat, 14 Feb 2026 12:00:00 GMT") into a
/// `DateTime<Utc>`. Falls back to `Utc::now() + 30 minutes` if parsing fails.
pub fn parse_expires_header(expires: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc2822(expires)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| httpdate_parse(expires))
        .unwrap_or_else(|_| {
            tracing::warn!(
                "Failed to parse Expires header '{}', defaulting to now + 30m",
                expires
            );
            Utc::now() + chrono::Duration::minutes(30)
        })
}

/// Parse the HTTP-date formats allowed for the Expires header.
fn httpdate_parse(s: &str) -> Result<DateTime<Utc>, String> {
    let formats = [
        "%a, %d %b %Y %H:%M:%S GMT",
        "%A, %d-%b-%y %H:%M:%S GMT",
        "%a %b %e %H:%M:%S %Y",
    ];

    for fmt in &formats {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    Err(format!("Could not parse HTTP date: {}", s))
}
