//! Open-Meteo client.
//!
//! Times within the last 16 days or up to 16 days ahead come from the
//! forecast API; older times come from the ERA5 reanalysis archive.
//! See: https://open-meteo.com/en/docs

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::Deserialize;

use crate::services::provider::{downscale_to_height, ForecastProvider, ProviderError, WindReading};

pub const PROVIDER_NAME: &str = "open-meteo";

/// Days the forecast API covers on either side of today.
const FORECAST_WINDOW_DAYS: i64 = 16;
/// Maximum distance between the requested time and the chosen hourly value.
const MAX_TIME_GAP_SECS: i64 = 7200;
const HOURLY_VARIABLES: &str = "wind_speed_10m,wind_direction_10m,wind_gusts_10m";

/// Open-Meteo forecast and ERA5 archive adapter.
#[derive(Debug, Clone)]
pub struct OpenMeteoProvider {
    client: reqwest::Client,
    base_url: String,
    archive_url: String,
    rider_height_m: f64,
}

// --- Open-Meteo JSON response types ---

#[derive(Debug, Deserialize)]
struct OpenMeteoResponse {
    hourly: OpenMeteoHourly,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoHourly {
    time: Vec<String>,
    wind_speed_10m: Vec<Option<f64>>,
    wind_direction_10m: Vec<Option<f64>>,
    #[serde(default)]
    wind_gusts_10m: Vec<Option<f64>>,
}

/// Hourly wind value picked for one requested time.
#[derive(Debug, Clone, Copy, PartialEq)]
struct HourlyWind {
    direction_deg: f64,
    speed_ms: f64,
    gust_ms: Option<f64>,
}

impl OpenMeteoProvider {
    pub fn new(
        base_url: &str,
        archive_url: &str,
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
            archive_url: archive_url.trim_end_matches('/').to_string(),
            rider_height_m,
        }
    }

    /// Build the request URL and query for `time`, plus the model run id to report.
    fn plan_request(
        &self,
        lat: f64,
        lon: f64,
        time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(String, Vec<(&'static str, String)>, String), ProviderError> {
        let today = now.date_naive();
        let target = time.date_naive();
        let earliest = NaiveDate::from_ymd_opt(1940, 1, 1).unwrap_or(NaiveDate::MIN);

        if target < earliest {
            return Err(ProviderError::out_of_range(
                PROVIDER_NAME,
                format!("no reanalysis data before {}", earliest),
            ));
        }
        if time > now + Duration::days(FORECAST_WINDOW_DAYS) {
            return Err(ProviderError::out_of_range(
                PROVIDER_NAME,
                format!("{} is beyond the {}-day forecast horizon", time, FORECAST_WINDOW_DAYS),
            ));
        }

        // Limit to 4 decimal places, ~11 m
        let mut query = vec![
            ("latitude", format!("{:.4}", lat)),
            ("longitude", format!("{:.4}", lon)),
            ("hourly", HOURLY_VARIABLES.to_string()),
            ("wind_speed_unit", "ms".to_string()),
            ("timezone", "UTC".to_string()),
        ];

        if target >= today - Duration::days(FORECAST_WINDOW_DAYS) {
            let past_days = (today - target).num_days().clamp(0, FORECAST_WINDOW_DAYS);
            let forecast_days = ((target - today).num_days() + 1).clamp(0, FORECAST_WINDOW_DAYS);
            if past_days > 0 {
                query.push(("past_days", past_days.to_string()));
            }
            if forecast_days > 0 {
                query.push(("forecast_days", forecast_days.to_string()));
            }
            Ok((
                format!("{}/forecast", self.base_url),
                query,
                forecast_model_run_id(now),
            ))
        } else {
            query.push(("start_date", target.to_string()));
            query.push(("end_date", target.to_string()));
            Ok((
                format!("{}/era5", self.archive_url),
                query,
                format!("{}-era5", PROVIDER_NAME),
            ))
        }
    }
}

#[async_trait]
impl ForecastProvider for OpenMeteoProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn fetch(
        &self,
        lat: f64,
        lon: f64,
        time: DateTime<Utc>,
    ) -> Result<WindReading, ProviderError> {
        let (url, query, model_run_id) = self.plan_request(lat, lon, time, Utc::now())?;

        tracing::debug!("Fetching Open-Meteo {} for {:.4},{:.4} at {}", url, lat, lon, time);

        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| ProviderError::transport(PROVIDER_NAME, e))?;

        if !response.status().is_success() {
            return Err(ProviderError::Status {
                provider: PROVIDER_NAME.to_string(),
                status: response.status().as_u16(),
            });
        }

        let body: OpenMeteoResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::parse(PROVIDER_NAME, e))?;

        let wind = closest_hourly_wind(&body.hourly, time)?;
        Ok(WindReading {
            wind_dir_deg: wind.direction_deg,
            wind_speed_high_ms: wind.speed_ms,
            wind_speed_low_ms: downscale_to_height(wind.speed_ms, self.rider_height_m),
            gust_ms: wind.gust_ms,
            model_run_id,
            uncertainty: None,
        })
    }
}

/// Open-Meteo refreshes its blended models on a 6-hourly cycle.
fn forecast_model_run_id(now: DateTime<Utc>) -> String {
    let cycle_hour = now.hour() - now.hour() % 6;
    format!(
        "{}-{}{:02}",
        PROVIDER_NAME,
        now.format("%Y%m%d"),
        cycle_hour
    )
}

/// Pick the hourly entry closest to `time` that has both speed and direction.
fn closest_hourly_wind(
    hourly: &OpenMeteoHourly,
    time: DateTime<Utc>,
) -> Result<HourlyWind, ProviderError> {
    let target_ts = time.timestamp();

    let closest = hourly
        .time
        .iter()
        .enumerate()
        .filter_map(|(i, raw)| {
            let ts = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M")
                .ok()?
                .and_utc()
                .timestamp();
            let speed = hourly.wind_speed_10m.get(i).copied().flatten()?;
            let direction = hourly.wind_direction_10m.get(i).copied().flatten()?;
            let gust = hourly.wind_gusts_10m.get(i).copied().flatten();
            Some(((ts - target_ts).abs(), speed, direction, gust))
        })
        .min_by_key(|(gap, ..)| *gap);

    match closest {
        Some((gap, speed, direction, gust)) if gap <= MAX_TIME_GAP_SECS => Ok(HourlyWind {
            direction_deg: direction,
            speed_ms: speed.max(0.0),
            gust_ms: gust,
        }),
        Some((gap, ..)) => Err(ProviderError::out_of_range(
            PROVIDER_NAME,
            format!("closest hourly value is {} min away", gap / 60),
        )),
        None => Err(ProviderError::parse(
            PROVIDER_NAME,
            "response has no usable hourly wind values",
        )),
    }
}
