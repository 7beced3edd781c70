use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::db::queries;
use crate::errors::{AppError, ErrorResponse};
use crate::services::analysis::{AnalysisRequest, AnalysisService, MAX_WINDOW_HOURS};
use crate::services::gpx::{parse_gpx, route_metadata};
use crate::services::open_meteo;
use crate::services::timing::{GpxSubMode, TimingMode};

/// Shared state for the analysis, route and result endpoints.
#[derive(Clone)]
pub struct AppState {
    pub(crate) pool: sqlx::PgPool,
    pub(crate) analysis: AnalysisService,
}

/// SSE keep-alive interval while a job is quiet (e.g. waiting on a provider).
const KEEP_ALIVE_SECS: u64 = 15;
/// Accepted range for a manual riding speed, km/h.
const MIN_SPEED_KMH: f64 = 1.0;
const MAX_SPEED_KMH: f64 = 100.0;
/// Longest accepted estimated ride duration, hours.
const MAX_DURATION_HOURS: f64 = 240.0;

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct AnalyzeQuery {
    /// Route UUID returned by the upload endpoint
    pub route_id: Uuid,
    /// Departure time in ISO 8601 format (e.g. "2025-06-15T07:00:00Z")
    pub depart: String,
    /// Single forecast provider (default "open-meteo")
    pub provider: Option<String>,
    /// Comma-separated providers, primary first (e.g. "open-meteo,yr")
    pub providers: Option<String>,
    /// "manual" (default), "gpx_timestamps" or "estimated_duration"
    pub timing_mode: Option<String>,
    /// Average speed for manual timing in km/h
    pub avg_speed_kmh: Option<f64>,
    /// Total ride duration for estimated_duration timing
    pub duration_hours: Option<f64>,
    /// "future" (default) or "historical" for gpx_timestamps timing
    pub gpx_sub_mode: Option<String>,
    /// Also scan hourly departures up to this many hours later (max 12)
    pub window_hours: Option<u32>,
}

/// Stream a wind analysis of a stored route as Server-Sent Events.
///
/// Emits `progress` events while the job runs, then exactly one `complete`
/// (summary and per-sample segments) or `error` event. Closing the connection
/// cancels the job.
#[utoipa::path(
    get,
    path = "/api/v1/analyze",
    tag = "Analysis",
    params(AnalyzeQuery),
    responses(
        (status = 200, description = "text/event-stream of progress, complete and error events"),
        (status = 400, description = "Invalid analysis parameters", body = ErrorResponse),
        (status = 404, description = "Route not found", body = ErrorResponse),
    )
)]
pub async fn analyze(
    State(state): State<AppState>,
    Query(params): Query<AnalyzeQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let departure = parse_departure(&params.depart)?;
    let timing = parse_timing(&params)?;
    let providers = parse_providers(&params);
    let window_hours = parse_window(params.window_hours)?;

    let gpx = queries::get_route_gpx(&state.pool, params.route_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Route {} not found", params.route_id)))?;
    let points = parse_gpx(&gpx)?;
    let meta = route_metadata(&points);

    let mut rx = state.analysis.start(AnalysisRequest {
        route_id: params.route_id,
        points,
        timestamp_coverage: meta.timestamp_coverage,
        departure,
        providers,
        timing,
        window_hours,
    });

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let data = serde_json::to_string(&event).unwrap_or_default();
            let terminal = event.is_terminal();
            yield Ok(Event::default().event(event.name()).data(data));
            if terminal {
                break;
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(KEEP_ALIVE_SECS))
            .text("keep-alive"),
    ))
}

fn parse_departure(raw: &str) -> Result<DateTime<Utc>, AppError> {
    raw.parse()
        .map_err(|e| AppError::BadRequest(format!("Invalid depart: {}", e)))
}

fn parse_timing(params: &AnalyzeQuery) -> Result<TimingMode, AppError> {
    match params.timing_mode.as_deref().unwrap_or("manual") {
        "manual" => {
            if let Some(speed) = params.avg_speed_kmh {
                if !(MIN_SPEED_KMH..=MAX_SPEED_KMH).contains(&speed) {
                    return Err(AppError::BadRequest(format!(
                        "avg_speed_kmh must be between {} and {}, got {}",
                        MIN_SPEED_KMH, MAX_SPEED_KMH, speed
                    )));
                }
            }
            Ok(TimingMode::Manual {
                avg_speed_kmh: params.avg_speed_kmh,
            })
        }
        "gpx_timestamps" => {
            let sub_mode = match params.gpx_sub_mode.as_deref().unwrap_or("future") {
                "future" => GpxSubMode::Future,
                "historical" => GpxSubMode::Historical,
                other => {
                    return Err(AppError::BadRequest(format!(
                        "Unknown gpx_sub_mode '{}'",
                        other
                    )))
                }
            };
            Ok(TimingMode::GpxTimestamps { sub_mode })
        }
        "estimated_duration" => {
            let hours = params.duration_hours.ok_or_else(|| {
                AppError::BadRequest("duration_hours is required for estimated_duration".into())
            })?;
            if !hours.is_finite() || hours <= 0.0 || hours > MAX_DURATION_HOURS {
                return Err(AppError::BadRequest(format!(
                    "duration_hours must be positive and at most {}, got {}",
                    MAX_DURATION_HOURS, hours
                )));
            }
            Ok(TimingMode::EstimatedDuration {
                duration_hours: hours,
            })
        }
        other => Err(AppError::BadRequest(format!("Unknown timing_mode '{}'", other))),
    }
}

/// Requested providers, primary first, without duplicates.
fn parse_providers(params: &AnalyzeQuery) -> Vec<String> {
    let raw = params
        .providers
        .as_deref()
        .or(params.provider.as_deref())
        .unwrap_or(open_meteo::PROVIDER_NAME);
    let mut names: Vec<String> = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    if names.is_empty() {
        names.push(open_meteo::PROVIDER_NAME.to_string());
    }
    names
}

fn parse_window(window_hours: Option<u32>) -> Result<Option<u32>, AppError> {
    match window_hours {
        Some(h) if h > MAX_WINDOW_HOURS => Err(AppError::BadRequest(format!(
            "window_hours must be at most {}, got {}",
            MAX_WINDOW_HOURS, h
        ))),
        Some(0) | None => Ok(None),
        some => Ok(some),
    }
}
