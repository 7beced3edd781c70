use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::analyze::AppState;
use crate::config::PipelineConfig;
use crate::db::store::ResultRecord;
use crate::db::{models, queries};
use crate::errors::{AppError, ErrorResponse};
use crate::helpers::{dec_to_f64, round_dp};
use crate::services::gpx::{content_hash, parse_gpx, route_metadata, RouteMetadata};
use crate::services::resample::resample;
use crate::services::timing::{resolve_times, TimingContext, TimingMode};

/// Default and maximum number of results listed per route.
const DEFAULT_RESULTS_LIMIT: i64 = 20;
const MAX_RESULTS_LIMIT: i64 = 100;

#[derive(Debug, Deserialize, IntoParams)]
pub struct UploadQuery {
    /// Optional display name for the route
    pub name: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ResultsQuery {
    /// Maximum number of results to return (default 20, max 100)
    pub limit: Option<i64>,
}

/// Response type for route upload and GET /api/v1/routes/:id.
#[derive(Debug, Serialize, ToSchema)]
pub struct RouteResponse {
    pub id: Uuid,
    pub name: Option<String>,
    /// Total route length in kilometres
    pub total_distance_km: f64,
    /// [min_lon, min_lat, max_lon, max_lat]
    pub bbox: [f64; 4],
    pub has_timestamps: bool,
    /// Fraction of GPX points carrying a timestamp (0–1)
    pub timestamp_coverage: f64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Recorded duration, or the length at the default riding speed
    pub estimated_duration_hours: f64,
    pub created_at: DateTime<Utc>,
}

impl RouteResponse {
    fn from_row(r: models::Route, default_speed_kmh: f64) -> Self {
        let meta = RouteMetadata {
            bbox: [
                dec_to_f64(r.min_lon),
                dec_to_f64(r.min_lat),
                dec_to_f64(r.max_lon),
                dec_to_f64(r.max_lat),
            ],
            total_distance_km: dec_to_f64(r.total_distance_km),
            has_timestamps: r.has_timestamps,
            timestamp_coverage: dec_to_f64(r.timestamp_coverage),
            start_time: r.start_time,
            end_time: r.end_time,
        };
        Self {
            id: r.id,
            name: r.name,
            estimated_duration_hours: round_dp(meta.estimated_duration_hours(default_speed_kmh), 2),
            total_distance_km: round_dp(meta.total_distance_km, 3),
            bbox: meta.bbox,
            has_timestamps: meta.has_timestamps,
            timestamp_coverage: meta.timestamp_coverage,
            start_time: meta.start_time,
            end_time: meta.end_time,
            created_at: r.created_at,
        }
    }
}

/// One stored sample of a route's default resampling.
#[derive(Debug, Serialize, ToSchema)]
pub struct RouteCoordinate {
    pub seq: i32,
    pub lat: f64,
    pub lon: f64,
    pub distance_km: f64,
    pub bearing_deg: f64,
}

impl From<models::RouteSampleRow> for RouteCoordinate {
    fn from(s: models::RouteSampleRow) -> Self {
        Self {
            seq: s.seq,
            lat: dec_to_f64(s.lat),
            lon: dec_to_f64(s.lon),
            distance_km: round_dp(dec_to_f64(s.distance_m) / 1000.0, 3),
            bearing_deg: dec_to_f64(s.bearing_deg),
        }
    }
}

/// A stored route and whether this call created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportedRoute {
    pub id: Uuid,
    pub created: bool,
}

/// What to do with an upload given the routes already stored.
#[derive(Debug, PartialEq, Eq)]
enum ImportPlan {
    /// The same GPX body is already stored.
    Existing(Uuid),
    Insert,
}

fn plan_import(
    same_content: Option<Uuid>,
    same_name: Option<Uuid>,
    name: Option<&str>,
) -> Result<ImportPlan, AppError> {
    if let Some(id) = same_content {
        return Ok(ImportPlan::Existing(id));
    }
    match (same_name, name) {
        (Some(owner), Some(name)) => Err(name_taken(name, Some(owner))),
        _ => Ok(ImportPlan::Insert),
    }
}

fn name_taken(name: &str, owner: Option<Uuid>) -> AppError {
    match owner {
        Some(id) => AppError::Conflict(format!("Route name '{}' is already used by route {}", name, id)),
        None => AppError::Conflict(format!("Route name '{}' is already used", name)),
    }
}

/// Parse, resample and store a GPX document.
///
/// An identical GPX body returns the route stored for it earlier. A name
/// already used by a different route is a conflict. The stored samples carry
/// elapsed offsets at the default riding speed.
pub async fn import_route(
    pool: &PgPool,
    config: &PipelineConfig,
    name: Option<&str>,
    gpx_xml: &str,
) -> Result<ImportedRoute, AppError> {
    let hash = content_hash(gpx_xml);
    let same_content = queries::find_route_by_content_hash(pool, &hash).await?;
    let same_name = match name {
        Some(n) if same_content.is_none() => queries::find_route_by_name(pool, n).await?,
        _ => None,
    };
    if let ImportPlan::Existing(id) = plan_import(same_content, same_name, name)? {
        tracing::info!("GPX upload matches stored route {}", id);
        return Ok(ImportedRoute { id, created: false });
    }

    let points = parse_gpx(gpx_xml)?;
    let meta = route_metadata(&points);
    let samples = resample(&points, config.sample_interval_m)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    let ctx = TimingContext {
        timestamp_coverage: meta.timestamp_coverage,
        min_timestamp_coverage: config.min_timestamp_coverage,
        default_speed_kmh: config.default_speed_kmh,
        now: Utc::now(),
    };
    let offsets: Vec<f64> = resolve_times(
        &samples,
        ctx.now,
        &TimingMode::Manual {
            avg_speed_kmh: Some(config.default_speed_kmh),
        },
        &ctx,
    )
    .map_err(|e| AppError::BadRequest(e.to_string()))?
    .into_iter()
    .map(|t| t.offset_s)
    .collect();

    let id = match queries::insert_route(pool, name, gpx_xml, &hash, &meta, &samples, &offsets).await {
        Ok(id) => id,
        // A concurrent upload won the race for the same body or name
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            if let Some(id) = queries::find_route_by_content_hash(pool, &hash).await? {
                return Ok(ImportedRoute { id, created: false });
            }
            return Err(name_taken(name.unwrap_or_default(), None));
        }
        Err(e) => return Err(e.into()),
    };
    tracing::info!(
        "Stored route {} ({:.1} km, {} samples, {:.0}% timestamped)",
        id,
        meta.total_distance_km,
        samples.len(),
        meta.timestamp_coverage * 100.0
    );
    Ok(ImportedRoute { id, created: true })
}

/// Upload a GPX route.
///
/// Accepts GPX 1.1 XML as the request body. Track points are preferred;
/// route points are used when the file has no track. Uploading a body that
/// is already stored returns the existing route with 200.
#[utoipa::path(
    post,
    path = "/api/v1/routes",
    tag = "Routes",
    params(UploadQuery),
    request_body(content = String, content_type = "application/gpx+xml"),
    responses(
        (status = 201, description = "Route stored", body = RouteResponse),
        (status = 200, description = "Identical GPX already stored", body = RouteResponse),
        (status = 400, description = "Invalid or too short GPX", body = ErrorResponse),
        (status = 409, description = "Route name already in use", body = ErrorResponse),
    )
)]
pub async fn upload_route(
    State(state): State<AppState>,
    Query(params): Query<UploadQuery>,
    body: String,
) -> Result<(StatusCode, Json<RouteResponse>), AppError> {
    let config = state.analysis.config();
    let imported = import_route(&state.pool, config, params.name.as_deref(), &body).await?;
    let route = fetch_route(&state.pool, imported.id).await?;
    let status = if imported.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(RouteResponse::from_row(route, config.default_speed_kmh))))
}

/// Get route metadata.
#[utoipa::path(
    get,
    path = "/api/v1/routes/{id}",
    tag = "Routes",
    params(
        ("id" = Uuid, Path, description = "Route UUID"),
    ),
    responses(
        (status = 200, description = "Route metadata", body = RouteResponse),
        (status = 404, description = "Route not found", body = ErrorResponse),
    )
)]
pub async fn get_route(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RouteResponse>, AppError> {
    let route = fetch_route(&state.pool, id).await?;
    Ok(Json(RouteResponse::from_row(
        route,
        state.analysis.config().default_speed_kmh,
    )))
}

/// Get the resampled coordinates of a route, ordered from the start.
#[utoipa::path(
    get,
    path = "/api/v1/routes/{id}/coordinates",
    tag = "Routes",
    params(
        ("id" = Uuid, Path, description = "Route UUID"),
    ),
    responses(
        (status = 200, description = "Resampled route coordinates", body = Vec<RouteCoordinate>),
        (status = 404, description = "Route not found", body = ErrorResponse),
    )
)]
pub async fn get_route_coordinates(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<RouteCoordinate>>, AppError> {
    fetch_route(&state.pool, id).await?;
    let samples = queries::get_route_samples(&state.pool, id).await?;
    Ok(Json(samples.into_iter().map(RouteCoordinate::from).collect()))
}

/// List recent analysis results of a route, newest first.
#[utoipa::path(
    get,
    path = "/api/v1/routes/{id}/results",
    tag = "Routes",
    params(
        ("id" = Uuid, Path, description = "Route UUID"),
        ResultsQuery,
    ),
    responses(
        (status = 200, description = "Recent analysis results", body = Vec<ResultRecord>),
        (status = 404, description = "Route not found", body = ErrorResponse),
    )
)]
pub async fn list_route_results(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<ResultsQuery>,
) -> Result<Json<Vec<ResultRecord>>, AppError> {
    fetch_route(&state.pool, id).await?;
    let limit = clamp_limit(params.limit);
    let records = queries::list_route_results(&state.pool, id, limit)
        .await?
        .into_iter()
        .map(ResultRecord::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(records))
}

async fn fetch_route(pool: &PgPool, id: Uuid) -> Result<models::Route, AppError> {
    queries::get_route(pool, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Route {} not found", id)))
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_RESULTS_LIMIT).clamp(1, MAX_RESULTS_LIMIT)
}
