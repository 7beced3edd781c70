//! Shared numeric helpers.
//!
//! Decimal conversions for the NUMERIC columns:
//! - `to_decimal_1dp`: wind speeds, angles and percentages (0.1 precision)
//! - `to_decimal_geo`: coordinates and distances (6 decimal places, ~0.1 m)
//!
//! Both return `Decimal::ZERO` for non-finite inputs.
//!
//! Angle and time bucketing helpers shared by the pipeline stages live here too.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

fn to_decimal_dp(v: f64, dp: u32) -> Decimal {
    if !v.is_finite() {
        tracing::warn!("Decimal conversion received non-finite value {}, storing 0", v);
        return Decimal::ZERO;
    }
    Decimal::from_f64(v)
        .map(|d| d.round_dp(dp))
        .unwrap_or_default()
}

/// Wind speeds, directions, yaw and percentages.
pub(crate) fn to_decimal_1dp(v: f64) -> Decimal {
    to_decimal_dp(v, 1)
}

pub(crate) fn opt_to_decimal_1dp(v: Option<f64>) -> Option<Decimal> {
    v.map(to_decimal_1dp)
}

/// Latitude, longitude and distances in metres or kilometres.
pub(crate) fn to_decimal_geo(v: f64) -> Decimal {
    to_decimal_dp(v, 6)
}

/// Confidence values in [0, 1].
pub(crate) fn to_decimal_3dp(v: f64) -> Decimal {
    to_decimal_dp(v, 3)
}

/// Convert a Decimal to f64, defaulting to 0.0 for values that can't be represented.
pub(crate) fn dec_to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

pub(crate) fn opt_dec_to_f64(d: Option<Decimal>) -> Option<f64> {
    d.and_then(|v| v.to_f64())
}

/// Normalize an angle in degrees into [0, 360).
pub(crate) fn normalize_deg_360(deg: f64) -> f64 {
    let d = deg.rem_euclid(360.0);
    // rem_euclid can return 360.0 for tiny negative inputs
    if d >= 360.0 {
        0.0
    } else {
        d
    }
}

/// Normalize an angle in degrees into [-180, 180).
pub(crate) fn normalize_deg_180(deg: f64) -> f64 {
    normalize_deg_360(deg + 180.0) - 180.0
}

/// Truncate a timestamp to the start of its hour.
pub(crate) fn floor_to_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(TimeDelta::hours(1)).unwrap_or(t)
}

/// Round to `dp` decimal places for JSON output.
pub(crate) fn round_dp(v: f64, dp: i32) -> f64 {
    let factor = 10f64.powi(dp);
    (v * factor).round() / factor
}
