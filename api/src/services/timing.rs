//! Timing resolution: assigns an absolute UTC time to every route sample.
//!
//! Three mutually exclusive modes:
//! - `Manual`: constant average speed from the departure time
//! - `GpxTimestamps`: the recorded GPX times, either verbatim (`Historical`)
//!   or shifted so the ride starts at the chosen departure (`Future`)
//! - `EstimatedDuration`: elapsed time proportional to distance over a given duration

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::services::resample::RouteSample;

#[derive(Debug, Error, PartialEq)]
pub enum TimingError {
    #[error("Invalid timing configuration: {0}")]
    InvalidTimingConfig(String),
}

/// How GPX timestamps are mapped onto the analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GpxSubMode {
    /// Keep the recorded times (a ride that already happened).
    Historical,
    /// Keep the recorded pacing, start at the chosen departure.
    Future,
}

/// Caller-selected timing mode with its mode-specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TimingMode {
    Manual { avg_speed_kmh: Option<f64> },
    GpxTimestamps { sub_mode: GpxSubMode },
    EstimatedDuration { duration_hours: f64 },
}

impl TimingMode {
    /// Stable textual key used to recognise repeated requests.
    pub fn cache_key(&self) -> String {
        match self {
            TimingMode::Manual { avg_speed_kmh: Some(v) } => format!("manual:{:.2}", v),
            TimingMode::Manual { avg_speed_kmh: None } => "manual".to_string(),
            TimingMode::GpxTimestamps { sub_mode: GpxSubMode::Historical } => {
                "gpx:historical".to_string()
            }
            TimingMode::GpxTimestamps { sub_mode: GpxSubMode::Future } => "gpx:future".to_string(),
            TimingMode::EstimatedDuration { duration_hours } => {
                format!("estimated:{:.3}", duration_hours)
            }
        }
    }
}

/// Route facts and settings the resolver needs besides the samples.
#[derive(Debug, Clone)]
pub struct TimingContext {
    /// Fraction of raw GPX points that carry a timestamp.
    pub timestamp_coverage: f64,
    pub min_timestamp_coverage: f64,
    pub default_speed_kmh: f64,
    pub now: DateTime<Utc>,
}

/// Absolute time for one sample, plus its elapsed offset from departure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedTime {
    pub offset_s: f64,
    pub time: DateTime<Utc>,
}

/// Resolve absolute times for `samples`, index-aligned with the input.
pub fn resolve_times(
    samples: &[RouteSample],
    departure: DateTime<Utc>,
    mode: &TimingMode,
    ctx: &TimingContext,
) -> Result<Vec<ResolvedTime>, TimingError> {
    if samples.is_empty() {
        return Err(TimingError::InvalidTimingConfig(
            "no samples to time".to_string(),
        ));
    }

    match mode {
        TimingMode::Manual { avg_speed_kmh } => {
            let fully_timestamped = ctx.timestamp_coverage >= 1.0
                && samples.iter().all(|s| s.source_time.is_some());
            match avg_speed_kmh {
                None if fully_timestamped => {
                    let recorded = fill_gpx_times(samples, ctx.default_speed_kmh)?;
                    shift_to_departure(&recorded, departure)
                }
                _ => {
                    let speed = avg_speed_kmh.unwrap_or(ctx.default_speed_kmh);
                    constant_speed(samples, departure, speed)
                }
            }
        }
        TimingMode::GpxTimestamps { sub_mode } => {
            if ctx.timestamp_coverage < ctx.min_timestamp_coverage {
                return Err(TimingError::InvalidTimingConfig(format!(
                    "GPX timestamp coverage {:.0}% is below the required {:.0}%",
                    ctx.timestamp_coverage * 100.0,
                    ctx.min_timestamp_coverage * 100.0
                )));
            }
            let recorded = fill_gpx_times(samples, ctx.default_speed_kmh)?;
            match sub_mode {
                GpxSubMode::Historical => {
                    let start = recorded[0];
                    if recorded.iter().any(|t| *t > ctx.now) {
                        return Err(TimingError::InvalidTimingConfig(
                            "historical mode requires GPX timestamps in the past".to_string(),
                        ));
                    }
                    Ok(recorded
                        .iter()
                        .map(|&t| ResolvedTime {
                            offset_s: (t - start).num_milliseconds() as f64 / 1000.0,
                            time: t,
                        })
                        .collect())
                }
                GpxSubMode::Future => shift_to_departure(&recorded, departure),
            }
        }
        TimingMode::EstimatedDuration { duration_hours } => {
            if !duration_hours.is_finite() || *duration_hours <= 0.0 {
                return Err(TimingError::InvalidTimingConfig(format!(
                    "duration must be positive, got {} h",
                    duration_hours
                )));
            }
            let total_m = samples.last().map(|s| s.distance_m).unwrap_or(0.0);
            let duration_s = duration_hours * 3600.0;
            samples
                .iter()
                .map(|s| {
                    let offset_s = if total_m > 0.0 {
                        s.distance_m / total_m * duration_s
                    } else {
                        0.0
                    };
                    at_offset(departure, offset_s)
                })
                .collect()
        }
    }
}

fn constant_speed(
    samples: &[RouteSample],
    departure: DateTime<Utc>,
    speed_kmh: f64,
) -> Result<Vec<ResolvedTime>, TimingError> {
    if !speed_kmh.is_finite() || speed_kmh <= 0.0 {
        return Err(TimingError::InvalidTimingConfig(format!(
            "average speed must be positive, got {} km/h",
            speed_kmh
        )));
    }
    let speed_ms = speed_kmh / 3.6;
    samples
        .iter()
        .map(|s| at_offset(departure, s.distance_m / speed_ms))
        .collect()
}

/// `t + offset_s`, or an error when the result leaves the representable range.
fn add_seconds(t: DateTime<Utc>, offset_s: f64) -> Result<DateTime<Utc>, TimingError> {
    let out_of_range = || {
        TimingError::InvalidTimingConfig(format!(
            "resolved time {} s after {} is out of range",
            offset_s, t
        ))
    };
    let millis = (offset_s * 1000.0).round();
    if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
        return Err(out_of_range());
    }
    TimeDelta::try_milliseconds(millis as i64)
        .and_then(|delta| t.checked_add_signed(delta))
        .ok_or_else(out_of_range)
}

fn at_offset(departure: DateTime<Utc>, offset_s: f64) -> Result<ResolvedTime, TimingError> {
    Ok(ResolvedTime {
        offset_s,
        time: add_seconds(departure, offset_s)?,
    })
}

/// Keep the recorded pacing but move the first sample onto `departure`.
fn shift_to_departure(
    recorded: &[DateTime<Utc>],
    departure: DateTime<Utc>,
) -> Result<Vec<ResolvedTime>, TimingError> {
    let start = recorded[0];
    recorded
        .iter()
        .map(|&t| at_offset(departure, (t - start).num_milliseconds() as f64 / 1000.0))
        .collect()
}

/// Complete the per-sample GPX times.
///
/// Samples between two timestamped samples are interpolated by distance;
/// samples before the first or after the last timestamp are extrapolated at
/// `fallback_speed_kmh`.
fn fill_gpx_times(
    samples: &[RouteSample],
    fallback_speed_kmh: f64,
) -> Result<Vec<DateTime<Utc>>, TimingError> {
    let known: Vec<usize> = samples
        .iter()
        .enumerate()
        .filter_map(|(i, s)| s.source_time.map(|_| i))
        .collect();

    let (first, last) = match (known.first(), known.last()) {
        (Some(&f), Some(&l)) => (f, l),
        _ => {
            return Err(TimingError::InvalidTimingConfig(
                "route has no usable GPX timestamps".to_string(),
            ))
        }
    };
    if !fallback_speed_kmh.is_finite() || fallback_speed_kmh <= 0.0 {
        return Err(TimingError::InvalidTimingConfig(format!(
            "default speed must be positive, got {} km/h",
            fallback_speed_kmh
        )));
    }
    let speed_ms = fallback_speed_kmh / 3.6;
    let shift = |t: DateTime<Utc>, metres: f64| add_seconds(t, metres / speed_ms);

    let mut times = Vec::with_capacity(samples.len());
    let mut next_known = 0;
    for (i, s) in samples.iter().enumerate() {
        if let Some(t) = s.source_time {
            if known.get(next_known) == Some(&i) {
                next_known += 1;
            }
            times.push(t);
            continue;
        }

        let t = if i < first {
            let anchor = &samples[first];
            shift(anchor.source_time.unwrap_or_default(), s.distance_m - anchor.distance_m)?
        } else if i > last {
            let anchor = &samples[last];
            shift(anchor.source_time.unwrap_or_default(), s.distance_m - anchor.distance_m)?
        } else {
            let (a, b) = (&samples[known[next_known - 1]], &samples[known[next_known]]);
            let (ta, tb) = (
                a.source_time.unwrap_or_default(),
                b.source_time.unwrap_or_default(),
            );
            let span = b.distance_m - a.distance_m;
            let frac = if span > 0.0 {
                (s.distance_m - a.distance_m) / span
            } else {
                0.0
            };
            add_seconds(ta, (tb - ta).num_milliseconds() as f64 / 1000.0 * frac)?
        };
        times.push(t);
    }
    Ok(times)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn sample(seq: usize, distance_m: f64, time: Option<&str>) -> RouteSample {
        RouteSample {
            seq,
            lat: 0.0,
            lon: 0.0,
            distance_m,
            bearing_deg: 90.0,
            source_time: time.map(t),
        }
    }

    fn ctx(coverage: f64) -> TimingContext {
        TimingContext {
            timestamp_coverage: coverage,
            min_timestamp_coverage: 0.8,
            default_speed_kmh: 25.0,
            now: t("2025-06-10T00:00:00Z"),
        }
    }

    fn untimed_20km() -> Vec<RouteSample> {
        (0..=20).map(|i| sample(i, i as f64 * 1000.0, None)).collect()
    }

    #[test]
    fn test_estimated_duration_midpoint_is_one_hour() {
        let samples = untimed_20km();
        let depart = t("2025-06-15T07:00:00Z");
        let mode = TimingMode::EstimatedDuration { duration_hours: 2.0 };
        let times = resolve_times(&samples, depart, &mode, &ctx(0.0)).unwrap();
        assert!((times[10].offset_s - 3600.0).abs() < 1e-9);
        assert_eq!(times[10].time, t("2025-06-15T08:00:00Z"));
        assert_eq!(times[20].time, t("2025-06-15T09:00:00Z"));
    }

    #[test]
    fn test_estimated_duration_rejects_non_positive() {
        let mode = TimingMode::EstimatedDuration { duration_hours: 0.0 };
        let err = resolve_times(&untimed_20km(), Utc::now(), &mode, &ctx(0.0)).unwrap_err();
        assert!(matches!(err, TimingError::InvalidTimingConfig(_)));
    }

    #[test]
    fn test_out_of_range_times_are_rejected() {
        let depart = t("2025-06-15T07:00:00Z");
        let modes = [
            TimingMode::Manual {
                avg_speed_kmh: Some(1e-300),
            },
            TimingMode::EstimatedDuration {
                duration_hours: 1e300,
            },
        ];
        for mode in modes {
            let err = resolve_times(&untimed_20km(), depart, &mode, &ctx(0.0)).unwrap_err();
            assert!(
                matches!(&err, TimingError::InvalidTimingConfig(m) if m.contains("out of range")),
                "{:?} gave {:?}",
                mode,
                err
            );
        }
    }

    #[test]
    fn test_gpx_future_shift_past_calendar_end_is_rejected() {
        let samples = vec![
            sample(0, 0.0, Some("2025-06-01T07:00:00Z")),
            sample(1, 1000.0, Some("2025-06-01T09:00:00Z")),
        ];
        let depart = DateTime::<Utc>::MAX_UTC - TimeDelta::hours(1);
        let mode = TimingMode::GpxTimestamps {
            sub_mode: GpxSubMode::Future,
        };
        let err = resolve_times(&samples, depart, &mode, &ctx(1.0)).unwrap_err();
        assert!(matches!(err, TimingError::InvalidTimingConfig(_)));
    }

    #[test]
    fn test_manual_constant_speed() {
        let samples = untimed_20km();
        let depart = t("2025-06-15T07:00:00Z");
        let mode = TimingMode::Manual { avg_speed_kmh: Some(20.0) };
        let times = resolve_times(&samples, depart, &mode, &ctx(0.0)).unwrap();
        assert_eq!(times[0].time, depart);
        assert_eq!(times[20].time, t("2025-06-15T08:00:00Z"));
    }

    #[test]
    fn test_manual_default_speed_without_timestamps() {
        let samples = untimed_20km();
        let depart = t("2025-06-15T07:00:00Z");
        let mode = TimingMode::Manual { avg_speed_kmh: None };
        let times = resolve_times(&samples, depart, &mode, &ctx(0.0)).unwrap();
        // 20 km at 25 km/h = 48 minutes
        assert_eq!(times[20].time, t("2025-06-15T07:48:00Z"));
    }

    #[test]
    fn test_manual_uses_gpx_pacing_when_fully_timestamped() {
        let samples = vec![
            sample(0, 0.0, Some("2024-05-01T10:00:00Z")),
            sample(1, 1000.0, Some("2024-05-01T10:06:00Z")),
        ];
        let depart = t("2025-06-15T07:00:00Z");
        let mode = TimingMode::Manual { avg_speed_kmh: None };
        let times = resolve_times(&samples, depart, &mode, &ctx(1.0)).unwrap();
        assert_eq!(times[1].time, t("2025-06-15T07:06:00Z"));
    }

    #[test]
    fn test_manual_rejects_zero_speed() {
        let mode = TimingMode::Manual { avg_speed_kmh: Some(0.0) };
        assert!(resolve_times(&untimed_20km(), Utc::now(), &mode, &ctx(0.0)).is_err());
    }

    #[test]
    fn test_gpx_mode_requires_coverage() {
        let samples = vec![
            sample(0, 0.0, Some("2025-06-01T08:00:00Z")),
            sample(1, 1000.0, None),
        ];
        let mode = TimingMode::GpxTimestamps { sub_mode: GpxSubMode::Future };
        let err = resolve_times(&samples, Utc::now(), &mode, &ctx(0.5)).unwrap_err();
        assert!(err.to_string().contains("coverage"));
    }

    #[test]
    fn test_gpx_historical_keeps_times() {
        let samples = vec![
            sample(0, 0.0, Some("2025-06-01T08:00:00Z")),
            sample(1, 1000.0, Some("2025-06-01T08:03:00Z")),
        ];
        let mode = TimingMode::GpxTimestamps { sub_mode: GpxSubMode::Historical };
        let times = resolve_times(&samples, t("2030-01-01T00:00:00Z"), &mode, &ctx(1.0)).unwrap();
        assert_eq!(times[0].time, t("2025-06-01T08:00:00Z"));
        assert_eq!(times[1].time, t("2025-06-01T08:03:00Z"));
        assert_eq!(times[1].offset_s, 180.0);
    }

    #[test]
    fn test_gpx_historical_rejects_future_timestamps() {
        let samples = vec![
            sample(0, 0.0, Some("2025-07-01T08:00:00Z")),
            sample(1, 1000.0, Some("2025-07-01T08:03:00Z")),
        ];
        let mode = TimingMode::GpxTimestamps { sub_mode: GpxSubMode::Historical };
        assert!(resolve_times(&samples, Utc::now(), &mode, &ctx(1.0)).is_err());
    }

    #[test]
    fn test_gpx_future_shifts_to_departure() {
        let samples = vec![
            sample(0, 0.0, Some("2025-06-01T08:00:00Z")),
            sample(1, 1000.0, Some("2025-06-01T08:03:00Z")),
        ];
        let mode = TimingMode::GpxTimestamps { sub_mode: GpxSubMode::Future };
        let depart = t("2025-06-20T06:30:00Z");
        let times = resolve_times(&samples, depart, &mode, &ctx(1.0)).unwrap();
        assert_eq!(times[0].time, depart);
        assert_eq!(times[1].time, t("2025-06-20T06:33:00Z"));
    }

    #[test]
    fn test_gpx_gaps_interpolated_and_ends_extrapolated() {
        let samples = vec![
            sample(0, 0.0, None),
            sample(1, 1000.0, Some("2025-06-01T08:00:00Z")),
            sample(2, 2000.0, None),
            sample(3, 3000.0, Some("2025-06-01T08:10:00Z")),
            sample(4, 4000.0, None),
        ];
        let mode = TimingMode::GpxTimestamps { sub_mode: GpxSubMode::Historical };
        let times = resolve_times(&samples, Utc::now(), &mode, &ctx(0.9)).unwrap();
        // 1 km at 25 km/h = 144 s
        assert_eq!(times[0].time, t("2025-06-01T07:57:36Z"));
        assert_eq!(times[2].time, t("2025-06-01T08:05:00Z"));
        assert_eq!(times[4].time, t("2025-06-01T08:12:24Z"));
    }

    #[test]
    fn test_cache_key_distinguishes_modes() {
        let a = TimingMode::Manual { avg_speed_kmh: None }.cache_key();
        let b = TimingMode::EstimatedDuration { duration_hours: 2.0 }.cache_key();
        assert_ne!(a, b);
        assert_eq!(b, "estimated:2.000");
    }
}
