//! Forecast acquisition for a whole route.
//!
//! Samples are grouped into (location, hour) buckets so that one provider
//! request serves every sample in the bucket. Buckets are fetched with bounded
//! concurrency and retried with exponential backoff on transient errors;
//! a bucket that still fails leaves its samples unresolved instead of failing
//! the job. Outcomes are memoised per job, so repeated lookups (for example
//! when scanning alternative departure times) reuse the same model run.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::helpers::floor_to_hour;
use crate::services::provider::{ForecastProvider, WindReading};

/// Confidence halves every this many hours of lead time.
const CONFIDENCE_HALF_LIFE_HOURS: f64 = 72.0;
/// Bucket grid resolution in degrees (~1.1 km in latitude).
const BUCKET_DEGREES: f64 = 0.01;

/// One wind lookup, index-aligned with the route samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchRequest {
    pub lat: f64,
    pub lon: f64,
    pub time: DateTime<Utc>,
}

/// A resolved sample: the provider reading plus the derived confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedWind {
    pub reading: WindReading,
    pub confidence: f64,
}

/// Rounded (location, hour) a request is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketKey {
    lat_cells: i64,
    lon_cells: i64,
    hour_ts: i64,
}

impl BucketKey {
    pub fn for_request(req: &FetchRequest) -> Self {
        Self {
            lat_cells: (req.lat / BUCKET_DEGREES).round() as i64,
            lon_cells: (req.lon / BUCKET_DEGREES).round() as i64,
            hour_ts: floor_to_hour(req.time).timestamp(),
        }
    }

    /// Representative coordinates and time sent to the provider.
    fn query(&self) -> (f64, f64, DateTime<Utc>) {
        (
            self.lat_cells as f64 * BUCKET_DEGREES,
            self.lon_cells as f64 * BUCKET_DEGREES,
            DateTime::from_timestamp(self.hour_ts, 0).unwrap_or_default(),
        )
    }
}

/// Concurrency and retry limits for one job.
#[derive(Debug, Clone, Copy)]
pub struct FetchSettings {
    pub max_concurrency: usize,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
}

/// Per-job forecast fetcher with a memo of every bucket outcome.
pub struct ForecastFetcher {
    settings: FetchSettings,
    /// `None` marks a bucket that could not be resolved.
    memo: HashMap<(String, BucketKey), Option<WindReading>>,
}

impl ForecastFetcher {
    pub fn new(settings: FetchSettings) -> Self {
        Self {
            settings,
            memo: HashMap::new(),
        }
    }

    /// Provider calls issued so far (including unresolved buckets).
    pub fn buckets_fetched(&self) -> usize {
        self.memo.len()
    }

    /// Resolve every request against `provider`.
    ///
    /// `on_progress(done, total)` is called after each newly fetched bucket.
    /// The result is index-aligned with `requests`; `None` marks an unresolved sample.
    pub async fn fetch_all<F>(
        &mut self,
        provider: &Arc<dyn ForecastProvider>,
        requests: &[FetchRequest],
        now: DateTime<Utc>,
        mut on_progress: F,
    ) -> Vec<Option<ResolvedWind>>
    where
        F: FnMut(usize, usize),
    {
        let name = provider.name().to_string();
        let keys: Vec<BucketKey> = requests.iter().map(BucketKey::for_request).collect();

        let mut seen = HashSet::new();
        let missing: Vec<BucketKey> = keys
            .iter()
            .filter(|k| !self.memo.contains_key(&(name.clone(), **k)) && seen.insert(**k))
            .copied()
            .collect();

        let total = missing.len();
        if total > 0 {
            tracing::info!(
                "Fetching {} forecast buckets from {} for {} samples",
                total,
                name,
                requests.len()
            );
        }

        let settings = self.settings;
        let mut in_flight = stream::iter(missing.into_iter().map(|key| {
            let provider = Arc::clone(provider);
            async move {
                let outcome = fetch_with_retry(provider.as_ref(), key, settings).await;
                (key, outcome)
            }
        }))
        .buffer_unordered(settings.max_concurrency.max(1));

        let mut done = 0;
        while let Some((key, outcome)) = in_flight.next().await {
            self.memo.insert((name.clone(), key), outcome);
            done += 1;
            on_progress(done, total);
        }

        requests
            .iter()
            .zip(keys.iter())
            .map(|(req, key)| {
                let reading = self.memo.get(&(name.clone(), *key)).cloned().flatten()?;
                let confidence = confidence(req.time, now, reading.uncertainty);
                Some(ResolvedWind {
                    reading,
                    confidence,
                })
            })
            .collect()
    }
}

async fn fetch_with_retry(
    provider: &dyn ForecastProvider,
    key: BucketKey,
    settings: FetchSettings,
) -> Option<WindReading> {
    let (lat, lon, time) = key.query();
    let mut attempt: u32 = 0;
    loop {
        match provider.fetch(lat, lon, time).await {
            Ok(reading) => return Some(reading),
            Err(e) if e.is_transient() && attempt < settings.retry_attempts => {
                let delay = settings.retry_backoff * 2u32.saturating_pow(attempt);
                attempt += 1;
                tracing::warn!(
                    "{} (attempt {}/{}), retrying in {:?}",
                    e,
                    attempt,
                    settings.retry_attempts + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                tracing::warn!(
                    "Leaving bucket {:.2},{:.2} @ {} unresolved: {}",
                    lat,
                    lon,
                    time,
                    e
                );
                return None;
            }
        }
    }
}

/// Confidence in [0, 1], decreasing with lead time and provider uncertainty.
///
/// Halves every 72 h of lead time; times in the past have zero lead.
pub fn confidence(time: DateTime<Utc>, now: DateTime<Utc>, uncertainty: Option<f64>) -> f64 {
    let lead_hours = ((time - now).num_seconds() as f64 / 3600.0).max(0.0);
    let lead_factor = 0.5f64.powf(lead_hours / CONFIDENCE_HALF_LIFE_HOURS);
    let uncertainty_factor = 1.0 / (1.0 + uncertainty.unwrap_or(0.0).max(0.0));
    (lead_factor * uncertainty_factor).clamp(0.0, 1.0)
}

/// Mean per-sample spread (max − min) of rider-height speed across providers.
///
/// Only samples resolved by at least two providers count. `None` for
/// single-provider runs or when no sample overlaps.
pub fn provider_spread(per_provider: &[Vec<Option<ResolvedWind>>]) -> Option<f64> {
    if per_provider.len() < 2 {
        return None;
    }
    let n = per_provider.iter().map(Vec::len).min().unwrap_or(0);
    let spreads: Vec<f64> = (0..n)
        .filter_map(|i| {
            let speeds: Vec<f64> = per_provider
                .iter()
                .filter_map(|results| results[i].as_ref())
                .map(|w| w.reading.wind_speed_low_ms)
                .collect();
            if speeds.len() < 2 {
                return None;
            }
            let max = speeds.iter().cloned().fold(f64::MIN, f64::max);
            let min = speeds.iter().cloned().fold(f64::MAX, f64::min);
            Some(max - min)
        })
        .collect();

    if spreads.is_empty() {
        None
    } else {
        Some(spreads.iter().sum::<f64>() / spreads.len() as f64)
    }
}
