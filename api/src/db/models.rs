use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

/// An uploaded route (without the GPX body), used for metadata endpoints.
#[derive(Debug, Clone, FromRow)]
pub struct Route {
    pub id: Uuid,
    pub name: Option<String>,
    pub total_distance_km: Decimal,
    pub min_lon: Decimal,
    pub min_lat: Decimal,
    pub max_lon: Decimal,
    pub max_lat: Decimal,
    pub has_timestamps: bool,
    pub timestamp_coverage: Decimal,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A stored default-resampled point of a route.
#[derive(Debug, Clone, FromRow)]
#[allow(dead_code)] // route_id populated by FromRow; responses are keyed by the request path
pub struct RouteSampleRow {
    pub route_id: Uuid,
    pub seq: i32,
    pub lat: Decimal,
    pub lon: Decimal,
    pub distance_m: Decimal,
    pub bearing_deg: Decimal,
    pub eta_offset_s: Decimal,
}

/// One analysis run.
#[derive(Debug, Clone, FromRow)]
pub struct ForecastResultRow {
    pub id: Uuid,
    pub route_id: Uuid,
    pub depart_time: DateTime<Utc>,
    pub provider: String,
    pub timing_key: String,
    pub model_run_id: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One classified sample of an analysis run.
#[derive(Debug, Clone, FromRow)]
pub struct SegmentWindRow {
    pub seq: i32,
    pub time_utc: DateTime<Utc>,
    pub lat: Decimal,
    pub lon: Decimal,
    pub distance_m: Decimal,
    pub bearing_deg: Decimal,
    pub wind_dir_deg10m: Decimal,
    pub wind_ms10m: Decimal,
    pub wind_ms_rider: Decimal,
    pub yaw_deg: Decimal,
    pub wind_class: String,
    pub gust_ms: Option<Decimal>,
    pub confidence: Decimal,
    pub model_run_id: String,
}

/// Ride-level aggregate of an analysis run.
#[derive(Debug, Clone, FromRow)]
pub struct SummaryRow {
    pub head_pct: Decimal,
    pub cross_pct: Decimal,
    pub tail_pct: Decimal,
    pub longest_head_km: Decimal,
    pub best_departure: Option<DateTime<Utc>>,
    pub provider_spread_ms: Option<Decimal>,
    pub resolved_samples: i32,
    pub unresolved_samples: i32,
    pub notes: Option<String>,
}
