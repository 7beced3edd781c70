use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{ForecastResultRow, Route, RouteSampleRow, SegmentWindRow, SummaryRow};
use crate::helpers::{opt_to_decimal_1dp, to_decimal_1dp, to_decimal_3dp, to_decimal_geo};
use crate::services::analysis::SegmentWind;
use crate::services::gpx::RouteMetadata;
use crate::services::resample::RouteSample;
use crate::services::summary::Summary;

const ROUTE_COLUMNS: &str = "id, name, total_distance_km, min_lon, min_lat, max_lon, max_lat,
     has_timestamps, timestamp_coverage, start_time, end_time, created_at";

const RESULT_COLUMNS: &str = "id, route_id, depart_time, provider, timing_key, model_run_id,
     status, error_message, created_at, finished_at";

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

/// Insert an uploaded route together with its default resampling.
///
/// `offsets_s` is index-aligned with `samples`.
pub async fn insert_route(
    pool: &PgPool,
    name: Option<&str>,
    gpx_xml: &str,
    content_hash: &str,
    meta: &RouteMetadata,
    samples: &[RouteSample],
    offsets_s: &[f64],
) -> Result<Uuid, sqlx::Error> {
    let id = Uuid::new_v4();
    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO routes (
            id, name, gpx_xml, content_hash, total_distance_km, min_lon, min_lat, max_lon,
            max_lat, has_timestamps, timestamp_coverage, start_time, end_time, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW())",
    )
    .bind(id)
    .bind(name)
    .bind(gpx_xml)
    .bind(content_hash)
    .bind(to_decimal_geo(meta.total_distance_km))
    .bind(to_decimal_geo(meta.bbox[0]))
    .bind(to_decimal_geo(meta.bbox[1]))
    .bind(to_decimal_geo(meta.bbox[2]))
    .bind(to_decimal_geo(meta.bbox[3]))
    .bind(meta.has_timestamps)
    .bind(to_decimal_3dp(meta.timestamp_coverage))
    .bind(meta.start_time)
    .bind(meta.end_time)
    .execute(&mut *tx)
    .await?;

    for (sample, offset_s) in samples.iter().zip(offsets_s) {
        sqlx::query(
            "INSERT INTO route_samples (route_id, seq, lat, lon, distance_m, bearing_deg, eta_offset_s)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(id)
        .bind(sample.seq as i32)
        .bind(to_decimal_geo(sample.lat))
        .bind(to_decimal_geo(sample.lon))
        .bind(to_decimal_geo(sample.distance_m))
        .bind(to_decimal_1dp(sample.bearing_deg))
        .bind(to_decimal_1dp(*offset_s))
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(id)
}

/// Look up a route by its (unique) name, used when seeding demo routes.
pub async fn find_route_by_name(pool: &PgPool, name: &str) -> Result<Option<Uuid>, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>("SELECT id FROM routes WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await
}

/// The route previously stored from an identical GPX body, if any.
pub async fn find_route_by_content_hash(
    pool: &PgPool,
    content_hash: &str,
) -> Result<Option<Uuid>, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>("SELECT id FROM routes WHERE content_hash = $1")
        .bind(content_hash)
        .fetch_optional(pool)
        .await
}

pub async fn get_route(pool: &PgPool, id: Uuid) -> Result<Option<Route>, sqlx::Error> {
    sqlx::query_as::<_, Route>(&format!("SELECT {} FROM routes WHERE id = $1", ROUTE_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// The original GPX body of a route.
pub async fn get_route_gpx(pool: &PgPool, id: Uuid) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>("SELECT gpx_xml FROM routes WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_route_samples(
    pool: &PgPool,
    route_id: Uuid,
) -> Result<Vec<RouteSampleRow>, sqlx::Error> {
    sqlx::query_as::<_, RouteSampleRow>(
        "SELECT route_id, seq, lat, lon, distance_m, bearing_deg, eta_offset_s
         FROM route_samples
         WHERE route_id = $1
         ORDER BY seq",
    )
    .bind(route_id)
    .fetch_all(pool)
    .await
}

/// Most recent analysis runs of a route, newest first.
pub async fn list_route_results(
    pool: &PgPool,
    route_id: Uuid,
    limit: i64,
) -> Result<Vec<ForecastResultRow>, sqlx::Error> {
    sqlx::query_as::<_, ForecastResultRow>(&format!(
        "SELECT {} FROM forecast_results
         WHERE route_id = $1
         ORDER BY created_at DESC
         LIMIT $2",
        RESULT_COLUMNS
    ))
    .bind(route_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

// ---------------------------------------------------------------------------
// Forecast results
// ---------------------------------------------------------------------------

pub async fn insert_forecast_result(
    pool: &PgPool,
    route_id: Uuid,
    depart_time: DateTime<Utc>,
    provider: &str,
    timing_key: &str,
) -> Result<Uuid, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>(
        "INSERT INTO forecast_results (id, route_id, depart_time, provider, timing_key, status, created_at)
         VALUES ($1, $2, $3, $4, $5, 'processing', NOW())
         RETURNING id",
    )
    .bind(Uuid::new_v4())
    .bind(route_id)
    .bind(depart_time)
    .bind(provider)
    .bind(timing_key)
    .fetch_one(pool)
    .await
}

/// Write segments and summary, then flip the result to `completed`.
///
/// Returns `false` (and writes nothing) when the result is no longer `processing`.
pub async fn complete_forecast_result(
    pool: &PgPool,
    result_id: Uuid,
    model_run_id: Option<&str>,
    segments: &[SegmentWind],
    summary: &Summary,
) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let flipped = sqlx::query(
        "UPDATE forecast_results
         SET status = 'completed', model_run_id = $2, finished_at = NOW()
         WHERE id = $1 AND status = 'processing'",
    )
    .bind(result_id)
    .bind(model_run_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if flipped == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    for s in segments {
        sqlx::query(
            "INSERT INTO segment_wind (
                result_id, seq, time_utc, lat, lon, distance_m, bearing_deg,
                wind_dir_deg10m, wind_ms10m, wind_ms_rider, yaw_deg, wind_class,
                gust_ms, confidence, model_run_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(result_id)
        .bind(s.seq as i32)
        .bind(s.time_utc)
        .bind(to_decimal_geo(s.lat))
        .bind(to_decimal_geo(s.lon))
        .bind(to_decimal_geo(s.distance_km * 1000.0))
        .bind(to_decimal_1dp(s.bearing_deg))
        .bind(to_decimal_1dp(s.wind_dir_deg10m))
        .bind(to_decimal_1dp(s.wind_ms10m))
        .bind(to_decimal_1dp(s.wind_ms_rider))
        .bind(to_decimal_1dp(s.yaw_deg))
        .bind(s.wind_class.as_str())
        .bind(opt_to_decimal_1dp(s.gust_ms))
        .bind(to_decimal_3dp(s.confidence))
        .bind(&s.model_run_id)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        "INSERT INTO summaries (
            result_id, head_pct, cross_pct, tail_pct, longest_head_km, best_departure,
            provider_spread_ms, resolved_samples, unresolved_samples, notes
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (result_id) DO UPDATE SET
            head_pct = EXCLUDED.head_pct,
            cross_pct = EXCLUDED.cross_pct,
            tail_pct = EXCLUDED.tail_pct,
            longest_head_km = EXCLUDED.longest_head_km,
            best_departure = EXCLUDED.best_departure,
            provider_spread_ms = EXCLUDED.provider_spread_ms,
            resolved_samples = EXCLUDED.resolved_samples,
            unresolved_samples = EXCLUDED.unresolved_samples,
            notes = EXCLUDED.notes",
    )
    .bind(result_id)
    .bind(to_decimal_1dp(summary.head_pct))
    .bind(to_decimal_1dp(summary.cross_pct))
    .bind(to_decimal_1dp(summary.tail_pct))
    .bind(to_decimal_3dp(summary.longest_head_km))
    .bind(summary.best_departure)
    .bind(opt_to_decimal_1dp(summary.provider_spread_ms))
    .bind(summary.resolved_samples as i32)
    .bind(summary.unresolved_samples as i32)
    .bind(&summary.notes)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

/// Flip a `processing` result to `failed`. Returns `false` if it was already terminal.
pub async fn fail_forecast_result(
    pool: &PgPool,
    result_id: Uuid,
    message: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE forecast_results
         SET status = 'failed', error_message = $2, finished_at = NOW()
         WHERE id = $1 AND status = 'processing'",
    )
    .bind(result_id)
    .bind(message)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Latest completed result for the same request, if any.
pub async fn find_completed_result(
    pool: &PgPool,
    route_id: Uuid,
    depart_time: DateTime<Utc>,
    provider: &str,
    timing_key: &str,
) -> Result<Option<Uuid>, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>(
        "SELECT id FROM forecast_results
         WHERE route_id = $1 AND depart_time = $2 AND provider = $3
           AND timing_key = $4 AND status = 'completed'
         ORDER BY finished_at DESC NULLS LAST
         LIMIT 1",
    )
    .bind(route_id)
    .bind(depart_time)
    .bind(provider)
    .bind(timing_key)
    .fetch_optional(pool)
    .await
}

pub async fn get_forecast_result(
    pool: &PgPool,
    id: Uuid,
) -> Result<Option<ForecastResultRow>, sqlx::Error> {
    sqlx::query_as::<_, ForecastResultRow>(&format!(
        "SELECT {} FROM forecast_results WHERE id = $1",
        RESULT_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn get_segments(pool: &PgPool, result_id: Uuid) -> Result<Vec<SegmentWindRow>, sqlx::Error> {
    sqlx::query_as::<_, SegmentWindRow>(
        "SELECT seq, time_utc, lat, lon, distance_m, bearing_deg, wind_dir_deg10m, wind_ms10m,
                wind_ms_rider, yaw_deg, wind_class, gust_ms, confidence, model_run_id
         FROM segment_wind
         WHERE result_id = $1
         ORDER BY seq",
    )
    .bind(result_id)
    .fetch_all(pool)
    .await
}

pub async fn get_summary(pool: &PgPool, result_id: Uuid) -> Result<Option<SummaryRow>, sqlx::Error> {
    sqlx::query_as::<_, SummaryRow>(
        "SELECT head_pct, cross_pct, tail_pct, longest_head_km, best_departure,
                provider_spread_ms, resolved_samples, unresolved_samples, notes
         FROM summaries
         WHERE result_id = $1",
    )
    .bind(result_id)
    .fetch_optional(pool)
    .await
}
