//! Fixed-interval route resampling.
//!
//! Turns the raw GPX point sequence into evenly spaced samples carrying a
//! sequence index, cumulative distance and direction of travel. Timestamps
//! recorded in the GPX are carried over by interpolation so the timing
//! resolver can work on the resampled route.

use chrono::{DateTime, Utc};
use geo::{Bearing, Haversine, Point};
use thiserror::Error;

use crate::helpers::normalize_deg_360;
use crate::services::gpx::RawPoint;

/// Hard cap on samples per route; long routes get a coarser interval.
pub const MAX_SAMPLES: usize = 2000;

#[derive(Debug, Error, PartialEq)]
pub enum ResampleError {
    #[error("Route too short: {0}")]
    RouteTooShort(String),
}

/// One resampled point along a route.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSample {
    /// Zero-based, contiguous.
    pub seq: usize,
    pub lat: f64,
    pub lon: f64,
    /// Cumulative distance from the start in metres, non-decreasing.
    pub distance_m: f64,
    /// Direction of travel, degrees clockwise from north in [0, 360).
    pub bearing_deg: f64,
    /// GPX time interpolated between the surrounding raw points, when both have one.
    pub source_time: Option<DateTime<Utc>>,
}

impl RouteSample {
    /// Distance to the next sample in metres (zero for the last sample).
    pub fn forward_distance_m(samples: &[RouteSample], idx: usize) -> f64 {
        match (samples.get(idx), samples.get(idx + 1)) {
            (Some(cur), Some(next)) => (next.distance_m - cur.distance_m).max(0.0),
            _ => 0.0,
        }
    }
}

/// Initial great-circle bearing from one position to another, in [0, 360).
pub fn initial_bearing(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let bearing = Haversine::bearing(Point::new(lon1, lat1), Point::new(lon2, lat2));
    if bearing.is_finite() {
        normalize_deg_360(bearing)
    } else {
        0.0
    }
}

/// Resample `points` at a fixed interval of `interval_m` metres.
///
/// Samples sit at 0, interval, 2×interval, … and always include the route end.
/// Bearing at sample *i* points towards sample *i+1*; the final sample repeats
/// the previous bearing.
pub fn resample(points: &[RawPoint], interval_m: f64) -> Result<Vec<RouteSample>, ResampleError> {
    if points.len() < 2 {
        return Err(ResampleError::RouteTooShort(format!(
            "need at least 2 points, got {}",
            points.len()
        )));
    }

    let total_m = points.last().map(|p| p.distance_m).unwrap_or(0.0);
    if !total_m.is_finite() || total_m <= 0.0 {
        return Err(ResampleError::RouteTooShort(
            "route has zero length".to_string(),
        ));
    }
    if !interval_m.is_finite() || interval_m <= 0.0 {
        return Err(ResampleError::RouteTooShort(format!(
            "invalid sampling interval {} m",
            interval_m
        )));
    }

    let interval_m = interval_m.max(total_m / (MAX_SAMPLES - 1) as f64);
    let full_steps = (total_m / interval_m).floor() as usize;

    let mut targets: Vec<f64> = (0..=full_steps).map(|i| i as f64 * interval_m).collect();
    // Close the route unless the last step already landed (almost) on the end
    if total_m - targets[targets.len() - 1] > 1e-6 {
        targets.push(total_m);
    } else if let Some(last) = targets.last_mut() {
        *last = total_m;
    }

    let mut samples = Vec::with_capacity(targets.len());
    let mut seg = 0;
    for (seq, &target) in targets.iter().enumerate() {
        // Advance to the raw segment containing the target distance
        while seg + 2 < points.len() && points[seg + 1].distance_m < target {
            seg += 1;
        }
        let (a, b) = (&points[seg], &points[seg + 1]);
        let span = b.distance_m - a.distance_m;
        let frac = if span > 0.0 {
            ((target - a.distance_m) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };

        samples.push(RouteSample {
            seq,
            lat: a.lat + (b.lat - a.lat) * frac,
            lon: a.lon + (b.lon - a.lon) * frac,
            distance_m: target,
            bearing_deg: 0.0,
            source_time: interpolate_time(a.time, b.time, frac),
        });
    }

    assign_bearings(&mut samples);
    Ok(samples)
}

/// Fill `bearing_deg` from each sample towards its successor.
pub fn assign_bearings(samples: &mut [RouteSample]) {
    let n = samples.len();
    for i in 0..n.saturating_sub(1) {
        let (cur, next) = (&samples[i], &samples[i + 1]);
        samples[i].bearing_deg = initial_bearing(cur.lat, cur.lon, next.lat, next.lon);
    }
    if n >= 2 {
        samples[n - 1].bearing_deg = samples[n - 2].bearing_deg;
    }
}

fn interpolate_time(
    a: Option<DateTime<Utc>>,
    b: Option<DateTime<Utc>>,
    frac: f64,
) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(ta), Some(tb)) => {
            let span_ms = (tb - ta).num_milliseconds() as f64;
            Some(ta + chrono::Duration::milliseconds((span_ms * frac).round() as i64))
        }
        (Some(ta), None) if frac == 0.0 => Some(ta),
        (None, Some(tb)) if frac == 1.0 => Some(tb),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::gpx::assign_cumulative_distance;

    fn raw(lat: f64, lon: f64, time: Option<&str>) -> RawPoint {
        RawPoint {
            lat,
            lon,
            elevation_m: None,
            time: time.map(|t| t.parse().unwrap()),
            distance_m: 0.0,
        }
    }

    fn eastward_route() -> Vec<RawPoint> {
        // Along the equator, 0.01° of longitude ≈ 1112 m
        let mut pts = vec![
            raw(0.0, 0.0, Some("2025-06-01T08:00:00Z")),
            raw(0.0, 0.01, Some("2025-06-01T08:04:00Z")),
            raw(0.0, 0.02, Some("2025-06-01T08:08:00Z")),
            raw(0.0, 0.03, Some("2025-06-01T08:12:00Z")),
        ];
        assign_cumulative_distance(&mut pts);
        pts
    }

    #[test]
    fn test_too_few_points() {
        let pts = vec![raw(0.0, 0.0, None)];
        assert!(matches!(
            resample(&pts, 1000.0),
            Err(ResampleError::RouteTooShort(_))
        ));
        assert!(matches!(resample(&[], 1000.0), Err(ResampleError::RouteTooShort(_))));
    }

    #[test]
    fn test_zero_length_route_is_too_short() {
        let mut pts = vec![raw(1.0, 1.0, None), raw(1.0, 1.0, None)];
        assign_cumulative_distance(&mut pts);
        assert!(resample(&pts, 1000.0).is_err());
    }

    #[test]
    fn test_sequence_and_distance_invariants() {
        let pts = eastward_route();
        let total = pts.last().unwrap().distance_m;
        let samples = resample(&pts, 500.0).unwrap();

        for (i, s) in samples.iter().enumerate() {
            assert_eq!(s.seq, i);
        }
        for w in samples.windows(2) {
            assert!(w[1].distance_m >= w[0].distance_m);
        }
        assert_eq!(samples[0].distance_m, 0.0);
        assert!((samples.last().unwrap().distance_m - total).abs() < 1e-9);
        assert!(samples.last().unwrap().distance_m <= total);
    }

    #[test]
    fn test_bearing_east_and_last_repeats() {
        let samples = resample(&eastward_route(), 1000.0).unwrap();
        for s in &samples {
            assert!((s.bearing_deg - 90.0).abs() < 0.01, "bearing {}", s.bearing_deg);
        }
        let n = samples.len();
        assert_eq!(samples[n - 1].bearing_deg, samples[n - 2].bearing_deg);
    }

    #[test]
    fn test_bearing_north_and_west() {
        assert!(initial_bearing(0.0, 0.0, 1.0, 0.0).abs() < 1e-9);
        assert!((initial_bearing(0.0, 0.0, 0.0, -1.0) - 270.0).abs() < 1e-9);
        assert!((initial_bearing(0.0, 0.0, -1.0, 0.0) - 180.0).abs() < 1e-9);
    }

    #[test]
    fn test_times_interpolated() {
        let pts = eastward_route();
        let half = pts[1].distance_m / 2.0;
        let samples = resample(&pts, half).unwrap();
        let t = samples[1].source_time.unwrap();
        assert_eq!(t.to_rfc3339(), "2025-06-01T08:02:00+00:00");
    }

    #[test]
    fn test_long_route_is_capped() {
        let mut pts = vec![raw(0.0, 0.0, None), raw(0.0, 30.0, None)];
        assign_cumulative_distance(&mut pts);
        let samples = resample(&pts, 10.0).unwrap();
        assert!(samples.len() <= MAX_SAMPLES + 1);
    }

    #[test]
    fn test_forward_distance() {
        let samples = resample(&eastward_route(), 1000.0).unwrap();
        assert!((RouteSample::forward_distance_m(&samples, 0) - 1000.0).abs() < 1e-9);
        assert_eq!(RouteSample::forward_distance_m(&samples, samples.len() - 1), 0.0);
    }
}
