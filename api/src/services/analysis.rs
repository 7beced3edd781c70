//! Analysis job orchestration.
//!
//! A job runs the pipeline stages in order (resample, resolve times, fetch
//! forecasts, classify, summarize, optionally scan alternative departures,
//! store) and reports over a bounded channel:
//! - `progress` events after each stage (dropped when the consumer lags)
//! - exactly one terminal `complete` or `error` event (never dropped)
//!
//! Dropping the receiver cancels the job: the sender observes the closed
//! channel at the next stage boundary, records the result as `failed` and
//! stops.

use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::{PipelineConfig, ResultReusePolicy};
use crate::db::store::{NewResult, ResultStore, StoreError};
use crate::helpers::round_dp;
use crate::services::classify::{classify, WindBands, WindClass};
use crate::services::fetcher::{provider_spread, FetchRequest, FetchSettings, ForecastFetcher, ResolvedWind};
use crate::services::gpx::RawPoint;
use crate::services::provider::{ForecastProvider, ProviderRegistry};
use crate::services::resample::{resample, ResampleError, RouteSample};
use crate::services::summary::{best_departure, summarize, DepartureCandidate, Summary};
use crate::services::timing::{
    resolve_times, GpxSubMode, ResolvedTime, TimingContext, TimingError, TimingMode,
};

/// Events buffered between the job and a slow consumer.
pub const EVENT_BUFFER: usize = 16;
/// Longest departure window that may be scanned, in hours.
pub const MAX_WINDOW_HOURS: u32 = 12;

/// One classified sample of an analysis result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SegmentWind {
    pub seq: usize,
    pub time_utc: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub distance_km: f64,
    /// Direction of travel, degrees from north
    pub bearing_deg: f64,
    /// Direction the wind blows from at 10 m
    pub wind_dir_deg10m: f64,
    pub wind_ms10m: f64,
    /// Wind speed at rider height
    pub wind_ms_rider: f64,
    /// Signed angle between wind origin and direction of travel; 0 = headwind
    pub yaw_deg: f64,
    pub wind_class: WindClass,
    pub gust_ms: Option<f64>,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub model_run_id: String,
}

/// Event emitted by a running analysis.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(untagged)]
pub enum AnalysisEvent {
    Progress {
        stage: String,
        progress: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Complete {
        forecast_result_id: Uuid,
        summary: Summary,
        segments: Vec<SegmentWind>,
    },
    Error {
        message: String,
    },
}

impl AnalysisEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            AnalysisEvent::Progress { .. } => "progress",
            AnalysisEvent::Complete { .. } => "complete",
            AnalysisEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AnalysisEvent::Progress { .. })
    }
}

/// Everything a job needs about the request.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub route_id: Uuid,
    /// Parsed GPX points with cumulative distance.
    pub points: Vec<RawPoint>,
    pub timestamp_coverage: f64,
    pub departure: DateTime<Utc>,
    /// Provider names, primary first.
    pub providers: Vec<String>,
    pub timing: TimingMode,
    /// Scan hourly departures up to this many hours after `departure`.
    pub window_hours: Option<u32>,
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("{0}")]
    Validation(String),
    #[error("No forecast could be resolved for any of the {0} samples")]
    TotalFailure(usize),
    #[error("Analysis cancelled by the client")]
    Cancelled,
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ResampleError> for AnalysisError {
    fn from(err: ResampleError) -> Self {
        AnalysisError::Validation(err.to_string())
    }
}

impl From<TimingError> for AnalysisError {
    fn from(err: TimingError) -> Self {
        AnalysisError::Validation(err.to_string())
    }
}

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resampling,
    ResolvingTimes,
    FetchingForecasts,
    Classifying,
    Summarizing,
    ScanningDepartures,
    Storing,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Resampling => "resampling",
            Stage::ResolvingTimes => "resolving_times",
            Stage::FetchingForecasts => "fetching_forecasts",
            Stage::Classifying => "classifying",
            Stage::Summarizing => "summarizing",
            Stage::ScanningDepartures => "scanning_departures",
            Stage::Storing => "storing",
        }
    }

    /// Overall progress once the stage has finished.
    fn done_fraction(self) -> f64 {
        match self {
            Stage::Resampling => 0.10,
            Stage::ResolvingTimes => 0.15,
            Stage::FetchingForecasts => 0.75,
            Stage::Classifying => 0.80,
            Stage::Summarizing => 0.85,
            Stage::ScanningDepartures => 0.95,
            Stage::Storing => 0.98,
        }
    }
}

/// Lifecycle of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Processing(Stage),
    Completed,
    Failed,
}

/// Starts analysis jobs against the registered providers and result store.
#[derive(Clone)]
pub struct AnalysisService {
    registry: ProviderRegistry,
    store: Arc<dyn ResultStore>,
    config: PipelineConfig,
}

impl AnalysisService {
    pub fn new(registry: ProviderRegistry, store: Arc<dyn ResultStore>, config: PipelineConfig) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Spawn a job and return its event stream.
    pub fn start(&self, request: AnalysisRequest) -> mpsc::Receiver<AnalysisEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let service = self.clone();
        tokio::spawn(async move { service.run(request, tx).await });
        rx
    }

    /// Run a job to completion, reporting on `tx`. Returns the final state.
    pub async fn run(&self, request: AnalysisRequest, tx: mpsc::Sender<AnalysisEvent>) -> JobState {
        let mut job = Job {
            service: self,
            tx,
            state: JobState::Created,
            progress: 0.0,
        };
        job.execute(request).await;
        job.state
    }
}

struct Job<'a> {
    service: &'a AnalysisService,
    tx: mpsc::Sender<AnalysisEvent>,
    state: JobState,
    progress: f64,
}

/// Output of the pipeline stages before storage.
struct PipelineOutput {
    segments: Vec<SegmentWind>,
    summary: Summary,
    model_run_id: Option<String>,
}

impl<'a> Job<'a> {
    async fn execute(&mut self, request: AnalysisRequest) {
        let providers = match self.resolve_providers(&request.providers) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Rejecting analysis of route {}: {}", request.route_id, e);
                self.state = JobState::Failed;
                self.send_terminal(AnalysisEvent::Error {
                    message: e.to_string(),
                })
                .await;
                return;
            }
        };

        let key = NewResult {
            route_id: request.route_id,
            depart_time: request.departure,
            provider: request.providers.join(","),
            timing_key: format!(
                "{}|w{}",
                request.timing.cache_key(),
                request.window_hours.unwrap_or(0)
            ),
        };

        if self.service.config.reuse == ResultReusePolicy::ReuseCompleted {
            match self.replay_cached(&key).await {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => tracing::warn!("Result cache lookup failed, running analysis: {}", e),
            }
        }

        let result_id = match self.service.store.create_result(&key).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!("Failed to create forecast result: {}", e);
                self.state = JobState::Failed;
                self.send_terminal(AnalysisEvent::Error {
                    message: "Failed to create analysis result".to_string(),
                })
                .await;
                return;
            }
        };
        tracing::info!(
            "Analysis {} started for route {} (providers {}, depart {})",
            result_id,
            request.route_id,
            key.provider,
            request.departure
        );

        // A panic in a stage must still end the job with a terminal event.
        let stages = AssertUnwindSafe(async {
            match self.pipeline(&request, &providers).await {
                Ok(output) => self.store_output(result_id, output).await,
                Err(e) => Err(e),
            }
        });
        let outcome = match stages.catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(AnalysisError::Internal(panic_message(panic.as_ref()))),
        };

        match outcome {
            Ok(event) => {
                self.state = JobState::Completed;
                tracing::info!("Analysis {} completed", result_id);
                self.send_terminal(event).await;
            }
            Err(AnalysisError::Cancelled) => {
                self.state = JobState::Failed;
                tracing::info!("Analysis {} cancelled: client disconnected", result_id);
                if let Err(e) = self.service.store.fail_result(result_id, "cancelled").await {
                    tracing::error!("Failed to mark analysis {} as cancelled: {}", result_id, e);
                }
            }
            Err(e) => {
                self.state = JobState::Failed;
                tracing::error!("Analysis {} failed: {}", result_id, e);
                if let Err(store_err) = self.service.store.fail_result(result_id, &e.to_string()).await {
                    tracing::error!("Failed to mark analysis {} as failed: {}", result_id, store_err);
                }
                self.send_terminal(AnalysisEvent::Error {
                    message: e.to_string(),
                })
                .await;
            }
        }
    }

    fn resolve_providers(
        &self,
        names: &[String],
    ) -> Result<Vec<Arc<dyn ForecastProvider>>, AnalysisError> {
        if names.is_empty() {
            return Err(AnalysisError::Validation("no forecast provider requested".to_string()));
        }
        names
            .iter()
            .map(|name| {
                self.service.registry.get(name).ok_or_else(|| {
                    AnalysisError::Validation(format!(
                        "unknown provider '{}' (available: {})",
                        name,
                        self.service.registry.names().join(", ")
                    ))
                })
            })
            .collect()
    }

    /// Replay a completed result for the same request. Returns `true` when replayed.
    async fn replay_cached(&mut self, key: &NewResult) -> Result<bool, StoreError> {
        let Some(id) = self.service.store.find_completed(key).await? else {
            return Ok(false);
        };
        let Some(stored) = self.service.store.load_analysis(id).await? else {
            return Ok(false);
        };
        let Some(summary) = stored.summary else {
            return Ok(false);
        };

        tracing::info!("Replaying completed analysis {} for route {}", id, key.route_id);
        self.emit("cache_hit", 0.95, Some("Using previously computed result".to_string()));
        self.state = JobState::Completed;
        self.send_terminal(AnalysisEvent::Complete {
            forecast_result_id: id,
            summary,
            segments: stored.segments,
        })
        .await;
        Ok(true)
    }

    async fn pipeline(
        &mut self,
        request: &AnalysisRequest,
        providers: &[Arc<dyn ForecastProvider>],
    ) -> Result<PipelineOutput, AnalysisError> {
        let config = self.service.config.clone();
        let now = Utc::now();

        self.enter(Stage::Resampling);
        let samples = resample(&request.points, config.sample_interval_m)?;
        self.finish_stage(Stage::Resampling, Some(format!("{} samples", samples.len())))?;

        self.enter(Stage::ResolvingTimes);
        let timing_ctx = TimingContext {
            timestamp_coverage: request.timestamp_coverage,
            min_timestamp_coverage: config.min_timestamp_coverage,
            default_speed_kmh: config.default_speed_kmh,
            now,
        };
        let times = resolve_times(&samples, request.departure, &request.timing, &timing_ctx)?;
        self.finish_stage(Stage::ResolvingTimes, None)?;

        self.enter(Stage::FetchingForecasts);
        let mut fetcher = ForecastFetcher::new(FetchSettings {
            max_concurrency: config.max_concurrency,
            retry_attempts: config.retry_attempts,
            retry_backoff: config.retry_backoff,
        });
        let requests: Vec<FetchRequest> = samples
            .iter()
            .zip(&times)
            .map(|(s, t)| FetchRequest {
                lat: s.lat,
                lon: s.lon,
                time: t.time,
            })
            .collect();

        let span = Stage::FetchingForecasts.done_fraction() - Stage::ResolvingTimes.done_fraction();
        let per_provider = span / providers.len() as f64;
        let mut per_provider_results: Vec<Vec<Option<ResolvedWind>>> = Vec::with_capacity(providers.len());
        for (p_idx, provider) in providers.iter().enumerate() {
            let base = Stage::ResolvingTimes.done_fraction() + per_provider * p_idx as f64;
            let provider_name = provider.name().to_string();
            let results = fetcher
                .fetch_all(provider, &requests, now, |done, total| {
                    let fraction = base + per_provider * done as f64 / total.max(1) as f64;
                    self.emit(
                        Stage::FetchingForecasts.name(),
                        fraction,
                        Some(format!("{}: {}/{} forecast locations", provider_name, done, total)),
                    );
                })
                .await;
            per_provider_results.push(results);
        }
        tracing::debug!("{} forecast buckets fetched", fetcher.buckets_fetched());
        let primary = per_provider_results[0].clone();
        let resolved = primary.iter().filter(|r| r.is_some()).count();
        self.finish_stage(
            Stage::FetchingForecasts,
            Some(format!("{} of {} samples resolved", resolved, samples.len())),
        )?;
        if resolved == 0 {
            return Err(AnalysisError::TotalFailure(samples.len()));
        }

        self.enter(Stage::Classifying);
        let segments = build_segments(&samples, &times_of(&times), &primary, &config.bands);
        let classes = classes_by_index(samples.len(), &segments);
        self.finish_stage(Stage::Classifying, None)?;

        self.enter(Stage::Summarizing);
        let mut summary =
            summarize(&samples, &classes).ok_or(AnalysisError::TotalFailure(samples.len()))?;
        summary.provider_spread_ms = provider_spread(&per_provider_results).map(|s| round_dp(s, 2));
        self.finish_stage(Stage::Summarizing, None)?;

        if let Some(hours) = request.window_hours.filter(|h| *h > 0) {
            self.enter(Stage::ScanningDepartures);
            if matches!(
                request.timing,
                TimingMode::GpxTimestamps {
                    sub_mode: GpxSubMode::Historical
                }
            ) {
                append_note(&mut summary, "departure window not scanned for historical timing");
            } else {
                let mut candidates = vec![DepartureCandidate {
                    depart: request.departure,
                    head_pct: summary.head_pct,
                    tail_pct: summary.tail_pct,
                }];
                for offset in 1..=hours.min(MAX_WINDOW_HOURS) {
                    let Some(depart) = request
                        .departure
                        .checked_add_signed(TimeDelta::hours(offset as i64))
                    else {
                        break;
                    };
                    let shifted = resolve_times(&samples, depart, &request.timing, &timing_ctx)?;
                    let shifted_requests: Vec<FetchRequest> = samples
                        .iter()
                        .zip(&shifted)
                        .map(|(s, t)| FetchRequest {
                            lat: s.lat,
                            lon: s.lon,
                            time: t.time,
                        })
                        .collect();
                    let results = fetcher
                        .fetch_all(&providers[0], &shifted_requests, now, |_, _| {})
                        .await;
                    let segs = build_segments(&samples, &times_of(&shifted), &results, &config.bands);
                    if let Some(s) = summarize(&samples, &classes_by_index(samples.len(), &segs)) {
                        candidates.push(DepartureCandidate {
                            depart,
                            head_pct: s.head_pct,
                            tail_pct: s.tail_pct,
                        });
                    }
                    self.emit(
                        Stage::ScanningDepartures.name(),
                        Stage::Summarizing.done_fraction()
                            + 0.10 * offset as f64 / hours.min(MAX_WINDOW_HOURS) as f64,
                        Some(format!("departure +{}h", offset)),
                    );
                }
                summary.best_departure = best_departure(&candidates);
            }
            self.finish_stage(Stage::ScanningDepartures, None)?;
        }

        Ok(PipelineOutput {
            model_run_id: dominant_model_run(&segments),
            segments,
            summary,
        })
    }

    async fn store_output(
        &mut self,
        result_id: Uuid,
        output: PipelineOutput,
    ) -> Result<AnalysisEvent, AnalysisError> {
        self.enter(Stage::Storing);
        self.service
            .store
            .complete_result(
                result_id,
                output.model_run_id.as_deref(),
                &output.segments,
                &output.summary,
            )
            .await?;
        self.emit(Stage::Storing.name(), Stage::Storing.done_fraction(), None);
        Ok(AnalysisEvent::Complete {
            forecast_result_id: result_id,
            summary: output.summary,
            segments: output.segments,
        })
    }

    fn enter(&mut self, stage: Stage) {
        tracing::debug!("Entering stage {}", stage.name());
        self.state = JobState::Processing(stage);
    }

    /// Report a finished stage and stop if the consumer went away.
    fn finish_stage(&mut self, stage: Stage, message: Option<String>) -> Result<(), AnalysisError> {
        tracing::info!(
            "Stage {} done{}",
            stage.name(),
            message.as_deref().map(|m| format!(": {}", m)).unwrap_or_default()
        );
        self.emit(stage.name(), stage.done_fraction(), message);
        if self.tx.is_closed() {
            return Err(AnalysisError::Cancelled);
        }
        Ok(())
    }

    /// Best-effort progress event: dropped when the channel is full or closed.
    fn emit(&mut self, stage: &str, fraction: f64, message: Option<String>) {
        self.progress = fraction.clamp(self.progress, 1.0);
        let _ = self.tx.try_send(AnalysisEvent::Progress {
            stage: stage.to_string(),
            progress: round_dp(self.progress, 3),
            message,
        });
    }

    async fn send_terminal(&mut self, event: AnalysisEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::debug!("Analysis consumer disconnected before the terminal event");
        }
    }
}

fn times_of(resolved: &[ResolvedTime]) -> Vec<DateTime<Utc>> {
    resolved.iter().map(|r| r.time).collect()
}

/// Classify every resolved sample; unresolved samples are omitted.
fn build_segments(
    samples: &[RouteSample],
    times: &[DateTime<Utc>],
    winds: &[Option<ResolvedWind>],
    bands: &WindBands,
) -> Vec<SegmentWind> {
    samples
        .iter()
        .zip(times)
        .zip(winds)
        .filter_map(|((sample, time), wind)| {
            let wind = wind.as_ref()?;
            let reading = &wind.reading;
            let (yaw, class) = classify(reading.wind_dir_deg, sample.bearing_deg, bands);
            Some(SegmentWind {
                seq: sample.seq,
                time_utc: *time,
                lat: sample.lat,
                lon: sample.lon,
                distance_km: round_dp(sample.distance_m / 1000.0, 3),
                bearing_deg: round_dp(sample.bearing_deg, 1),
                wind_dir_deg10m: round_dp(reading.wind_dir_deg, 1),
                wind_ms10m: round_dp(reading.wind_speed_high_ms, 1),
                wind_ms_rider: round_dp(reading.wind_speed_low_ms, 1),
                yaw_deg: round_dp(yaw, 1),
                wind_class: class,
                gust_ms: reading.gust_ms.map(|g| round_dp(g, 1)),
                confidence: round_dp(wind.confidence, 3),
                model_run_id: reading.model_run_id.clone(),
            })
        })
        .collect()
}

/// Index-aligned classes (`None` = unresolved) from the sparse segment list.
fn classes_by_index(n: usize, segments: &[SegmentWind]) -> Vec<Option<WindClass>> {
    let mut classes = vec![None; n];
    for seg in segments {
        if let Some(slot) = classes.get_mut(seg.seq) {
            *slot = Some(seg.wind_class);
        }
    }
    classes
}

/// The model run most samples came from (ties: lexicographically smallest).
fn dominant_model_run(segments: &[SegmentWind]) -> Option<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for seg in segments {
        *counts.entry(seg.model_run_id.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0)))
        .map(|(id, _)| id.to_string())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "analysis task panicked".to_string()
    }
}

fn append_note(summary: &mut Summary, note: &str) {
    summary.notes = Some(match summary.notes.take() {
        Some(existing) => format!("{}; {}", existing, note),
        None => note.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::testing::MemoryResultStore;
    use crate::db::store::ResultStatus;
    use crate::services::gpx::assign_cumulative_distance;
    use crate::services::provider::testing::{BrokenProvider, FixedWindProvider};

    fn t(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    /// ~10 km due east along the equator.
    fn eastward_points() -> Vec<RawPoint> {
        let mut pts: Vec<RawPoint> = (0..=9)
            .map(|i| RawPoint {
                lat: 0.0,
                lon: i as f64 * 0.01,
                elevation_m: None,
                time: None,
                distance_m: 0.0,
            })
            .collect();
        assign_cumulative_distance(&mut pts);
        pts
    }

    fn request(providers: &[&str]) -> AnalysisRequest {
        AnalysisRequest {
            route_id: Uuid::new_v4(),
            points: eastward_points(),
            timestamp_coverage: 0.0,
            departure: t("2025-06-15T07:00:00Z"),
            providers: providers.iter().map(|p| p.to_string()).collect(),
            timing: TimingMode::Manual { avg_speed_kmh: Some(20.0) },
            window_hours: None,
        }
    }

    fn config(reuse: ResultReusePolicy) -> PipelineConfig {
        PipelineConfig {
            retry_backoff: std::time::Duration::from_millis(1),
            retry_attempts: 1,
            reuse,
            ..PipelineConfig::default()
        }
    }

    fn service(
        providers: Vec<Arc<dyn ForecastProvider>>,
        store: Arc<MemoryResultStore>,
        reuse: ResultReusePolicy,
    ) -> AnalysisService {
        let mut registry = ProviderRegistry::new();
        for p in providers {
            registry.register(p);
        }
        AnalysisService::new(registry, store, config(reuse))
    }

    async fn collect(mut rx: mpsc::Receiver<AnalysisEvent>) -> Vec<AnalysisEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    async fn run_to_end(service: &AnalysisService, req: AnalysisRequest) -> Vec<AnalysisEvent> {
        collect(service.start(req)).await
    }

    fn assert_well_formed(events: &[AnalysisEvent]) {
        let terminal: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminal.len(), 1, "exactly one terminal event");
        assert!(events.last().unwrap().is_terminal(), "terminal event comes last");

        let mut last = 0.0;
        for e in events {
            if let AnalysisEvent::Progress { progress, .. } = e {
                assert!((0.0..=1.0).contains(progress));
                assert!(*progress >= last, "progress went backwards");
                last = *progress;
            }
        }
    }

    #[tokio::test]
    async fn test_headwind_route_completes() {
        let store = Arc::new(MemoryResultStore::default());
        let wind: Arc<dyn ForecastProvider> = Arc::new(FixedWindProvider::new("fake", 90.0, 6.0));
        let svc = service(vec![wind], store.clone(), ResultReusePolicy::AlwaysNew);

        let events = run_to_end(&svc, request(&["fake"])).await;
        assert_well_formed(&events);

        let Some(AnalysisEvent::Complete {
            forecast_result_id,
            summary,
            segments,
        }) = events.last()
        else {
            panic!("expected complete event, got {:?}", events.last());
        };
        assert_eq!(summary.head_pct, 100.0);
        assert_eq!(summary.tail_pct, 0.0);
        assert!(summary.longest_head_km > 9.0);
        assert_eq!(summary.provider_spread_ms, None);
        assert!(segments.iter().all(|s| s.wind_class == WindClass::Head));
        assert!(segments.iter().all(|s| (0.0..=1.0).contains(&s.confidence)));
        for (i, s) in segments.iter().enumerate() {
            assert_eq!(s.seq, i);
        }
        assert_eq!(store.status_of(*forecast_result_id).await, Some(ResultStatus::Completed));

        let stages: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AnalysisEvent::Progress { stage, .. } => Some(stage.as_str()),
                _ => None,
            })
            .collect();
        assert!(stages.contains(&"resampling"));
        assert!(stages.contains(&"summarizing"));
    }

    #[tokio::test]
    async fn test_manual_timing_spreads_times_along_route() {
        let store = Arc::new(MemoryResultStore::default());
        let wind: Arc<dyn ForecastProvider> = Arc::new(FixedWindProvider::new("fake", 0.0, 6.0));
        let svc = service(vec![wind], store, ResultReusePolicy::AlwaysNew);

        let events = run_to_end(&svc, request(&["fake"])).await;
        let Some(AnalysisEvent::Complete { segments, .. }) = events.last() else {
            panic!("expected complete event");
        };
        let first = segments.first().unwrap();
        let last = segments.last().unwrap();
        assert_eq!(first.time_utc, t("2025-06-15T07:00:00Z"));
        // ~10 km at 20 km/h
        let minutes = (last.time_utc - first.time_utc).num_minutes();
        assert!((29..=31).contains(&minutes), "took {} min", minutes);
        assert!(segments.iter().all(|s| s.wind_class == WindClass::Cross));
    }

    #[tokio::test]
    async fn test_failing_provider_fails_job() {
        let store = Arc::new(MemoryResultStore::default());
        let broken: Arc<dyn ForecastProvider> = Arc::new(BrokenProvider::new(true));
        let svc = service(vec![broken], store.clone(), ResultReusePolicy::AlwaysNew);

        let events = run_to_end(&svc, request(&["broken"])).await;
        assert_well_formed(&events);
        assert!(matches!(events.last(), Some(AnalysisEvent::Error { .. })));
        assert_eq!(store.statuses().await, vec![ResultStatus::Failed]);
    }

    #[tokio::test]
    async fn test_route_too_short_is_validation_error() {
        let store = Arc::new(MemoryResultStore::default());
        let wind: Arc<dyn ForecastProvider> = Arc::new(FixedWindProvider::new("fake", 0.0, 3.0));
        let svc = service(vec![wind], store.clone(), ResultReusePolicy::AlwaysNew);

        let mut req = request(&["fake"]);
        req.points.truncate(1);
        let events = run_to_end(&svc, req).await;
        let Some(AnalysisEvent::Error { message }) = events.last() else {
            panic!("expected error event");
        };
        assert!(message.contains("too short"));
        assert_eq!(store.statuses().await, vec![ResultStatus::Failed]);
    }

    #[tokio::test]
    async fn test_gpx_timing_without_timestamps_is_rejected() {
        let store = Arc::new(MemoryResultStore::default());
        let wind: Arc<dyn ForecastProvider> = Arc::new(FixedWindProvider::new("fake", 0.0, 3.0));
        let svc = service(vec![wind], store, ResultReusePolicy::AlwaysNew);

        let mut req = request(&["fake"]);
        req.timing = TimingMode::GpxTimestamps {
            sub_mode: GpxSubMode::Future,
        };
        let events = run_to_end(&svc, req).await;
        let Some(AnalysisEvent::Error { message }) = events.last() else {
            panic!("expected error event");
        };
        assert!(message.contains("coverage"));
    }

    #[tokio::test]
    async fn test_unknown_provider_creates_no_result() {
        let store = Arc::new(MemoryResultStore::default());
        let svc = service(vec![], store.clone(), ResultReusePolicy::AlwaysNew);

        let events = run_to_end(&svc, request(&["ecmwf"])).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], AnalysisEvent::Error { message } if message.contains("ecmwf")));
        assert!(store.statuses().await.is_empty());
    }

    #[tokio::test]
    async fn test_reuse_policy_replays_completed_result() {
        let store = Arc::new(MemoryResultStore::default());
        let fake = Arc::new(FixedWindProvider::new("fake", 270.0, 4.0));
        let wind: Arc<dyn ForecastProvider> = fake.clone();
        let svc = service(vec![wind], store.clone(), ResultReusePolicy::ReuseCompleted);

        let req = request(&["fake"]);
        let first = run_to_end(&svc, req.clone()).await;
        let calls_after_first = fake.call_count();
        let second = run_to_end(&svc, req).await;

        let id_of = |events: &[AnalysisEvent]| match events.last() {
            Some(AnalysisEvent::Complete {
                forecast_result_id, ..
            }) => *forecast_result_id,
            other => panic!("expected complete, got {:?}", other),
        };
        assert_eq!(id_of(&first), id_of(&second));
        assert_eq!(fake.call_count(), calls_after_first);
        assert!(second.iter().any(
            |e| matches!(e, AnalysisEvent::Progress { stage, .. } if stage == "cache_hit")
        ));
        assert_eq!(store.statuses().await.len(), 1);
    }

    #[tokio::test]
    async fn test_always_new_policy_creates_new_results() {
        let store = Arc::new(MemoryResultStore::default());
        let wind: Arc<dyn ForecastProvider> = Arc::new(FixedWindProvider::new("fake", 270.0, 4.0));
        let svc = service(vec![wind], store.clone(), ResultReusePolicy::AlwaysNew);

        let req = request(&["fake"]);
        run_to_end(&svc, req.clone()).await;
        run_to_end(&svc, req).await;
        assert_eq!(
            store.statuses().await,
            vec![ResultStatus::Completed, ResultStatus::Completed]
        );
    }

    #[tokio::test]
    async fn test_disconnect_marks_result_failed() {
        let store = Arc::new(MemoryResultStore::default());
        let slow: Arc<dyn ForecastProvider> = Arc::new(
            FixedWindProvider::new("slow", 90.0, 5.0)
                .with_delay(std::time::Duration::from_millis(20)),
        );
        let svc = service(vec![slow], store.clone(), ResultReusePolicy::AlwaysNew);

        let (tx, mut rx) = mpsc::channel(1);
        let job_service = svc.clone();
        let handle = tokio::spawn(async move { job_service.run(request(&["slow"]), tx).await });

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, AnalysisEvent::Progress { .. }));
        drop(rx);

        let final_state = handle.await.unwrap();
        assert_eq!(final_state, JobState::Failed);
        assert_eq!(store.statuses().await, vec![ResultStatus::Failed]);
    }

    #[tokio::test]
    async fn test_multi_provider_run_reports_spread() {
        let store = Arc::new(MemoryResultStore::default());
        let calm: Arc<dyn ForecastProvider> = Arc::new(FixedWindProvider::new("calm", 90.0, 2.0));
        let windy: Arc<dyn ForecastProvider> = Arc::new(FixedWindProvider::new("windy", 270.0, 10.0));
        let svc = service(vec![calm, windy], store, ResultReusePolicy::AlwaysNew);

        let events = run_to_end(&svc, request(&["calm", "windy"])).await;
        let Some(AnalysisEvent::Complete { summary, .. }) = events.last() else {
            panic!("expected complete event");
        };
        // Primary provider drives classification
        assert_eq!(summary.head_pct, 100.0);
        assert!(summary.provider_spread_ms.unwrap() > 4.0);
    }

    #[tokio::test]
    async fn test_departure_window_picks_earliest_on_tie() {
        let store = Arc::new(MemoryResultStore::default());
        let fake = Arc::new(FixedWindProvider::new("fake", 90.0, 5.0));
        let wind: Arc<dyn ForecastProvider> = fake.clone();
        let svc = service(vec![wind], store, ResultReusePolicy::AlwaysNew);

        let mut req = request(&["fake"]);
        req.window_hours = Some(2);
        let events = run_to_end(&svc, req).await;
        assert_well_formed(&events);
        let Some(AnalysisEvent::Complete { summary, .. }) = events.last() else {
            panic!("expected complete event");
        };
        assert_eq!(summary.best_departure, Some(t("2025-06-15T07:00:00Z")));
    }

    #[tokio::test]
    async fn test_partial_provider_coverage_completes_without_missing_samples() {
        let store = Arc::new(MemoryResultStore::default());
        let patchy: Arc<dyn ForecastProvider> =
            Arc::new(FixedWindProvider::new("patchy", 90.0, 5.0).no_data_east_of(0.05));
        let svc = service(vec![patchy], store.clone(), ResultReusePolicy::AlwaysNew);

        let events = run_to_end(&svc, request(&["patchy"])).await;
        assert_well_formed(&events);
        let Some(AnalysisEvent::Complete {
            forecast_result_id,
            summary,
            segments,
        }) = events.last()
        else {
            panic!("expected complete event, got {:?}", events.last());
        };

        assert!(!segments.is_empty());
        assert!(summary.unresolved_samples > 0);
        // Buckets are rounded to 0.01 degrees before the provider sees them
        assert!(segments.iter().all(|s| s.lon < 0.055), "{:?}", segments);
        assert!(segments.windows(2).all(|w| w[0].seq < w[1].seq));
        assert!(summary
            .notes
            .as_deref()
            .is_some_and(|n| n.contains("no forecast")));
        assert_eq!(summary.head_pct, 100.0);
        assert_eq!(store.status_of(*forecast_result_id).await, Some(ResultStatus::Completed));
    }

    #[tokio::test]
    async fn test_unrepresentable_arrival_time_fails_job() {
        let store = Arc::new(MemoryResultStore::default());
        let wind: Arc<dyn ForecastProvider> = Arc::new(FixedWindProvider::new("fake", 90.0, 5.0));
        let svc = service(vec![wind], store.clone(), ResultReusePolicy::AlwaysNew);

        let mut req = request(&["fake"]);
        req.timing = TimingMode::Manual {
            avg_speed_kmh: Some(1e-300),
        };
        let events = run_to_end(&svc, req).await;
        assert_well_formed(&events);
        let Some(AnalysisEvent::Error { message }) = events.last() else {
            panic!("expected error event, got {:?}", events.last());
        };
        assert!(message.contains("out of range"), "{}", message);
        assert_eq!(store.statuses().await, vec![ResultStatus::Failed]);
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "analysis task panicked");
    }

    #[test]
    fn test_dominant_model_run() {
        let seg = |run: &str| SegmentWind {
            seq: 0,
            time_utc: t("2025-06-15T07:00:00Z"),
            lat: 0.0,
            lon: 0.0,
            distance_km: 0.0,
            bearing_deg: 0.0,
            wind_dir_deg10m: 0.0,
            wind_ms10m: 0.0,
            wind_ms_rider: 0.0,
            yaw_deg: 0.0,
            wind_class: WindClass::Head,
            gust_ms: None,
            confidence: 1.0,
            model_run_id: run.to_string(),
        };
        let segments = vec![seg("b"), seg("a"), seg("b"), seg("a")];
        assert_eq!(dominant_model_run(&segments), Some("a".to_string()));
        assert_eq!(dominant_model_run(&[]), None);
    }
}
