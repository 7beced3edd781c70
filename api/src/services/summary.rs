//! Ride-level aggregation over classified samples.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::helpers::round_dp;
use crate::services::classify::WindClass;
use crate::services::resample::RouteSample;

/// Aggregate statistics for one analysis result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Summary {
    /// Share of resolved distance with a headwind, in percent
    pub head_pct: f64,
    pub cross_pct: f64,
    pub tail_pct: f64,
    /// Longest contiguous stretch of headwind in km
    pub longest_head_km: f64,
    /// Departure among the scanned candidates with the least headwind
    pub best_departure: Option<DateTime<Utc>>,
    /// Mean per-sample rider-height wind speed spread across providers (m/s)
    pub provider_spread_ms: Option<f64>,
    pub resolved_samples: usize,
    pub unresolved_samples: usize,
    pub notes: Option<String>,
}

/// Aggregate `classes` (index-aligned with `samples`, `None` = unresolved).
///
/// Returns `None` when no sample was resolved.
pub fn summarize(samples: &[RouteSample], classes: &[Option<WindClass>]) -> Option<Summary> {
    let resolved = classes.iter().filter(|c| c.is_some()).count();
    if resolved == 0 {
        return None;
    }
    let unresolved = samples.len().saturating_sub(resolved);

    let weight = |i: usize| RouteSample::forward_distance_m(samples, i);
    let mut totals = [0.0f64; 3];
    for (i, class) in classes.iter().enumerate() {
        if let Some(class) = class {
            totals[class_index(*class)] += weight(i);
        }
    }

    let mut notes = Vec::new();
    let mut denominator: f64 = totals.iter().sum();
    if denominator <= 0.0 {
        // Only zero-length segments resolved (e.g. just the final sample)
        totals = [0.0; 3];
        for class in classes.iter().flatten() {
            totals[class_index(*class)] += 1.0;
        }
        denominator = resolved as f64;
        notes.push("percentages weighted by sample count".to_string());
    }

    if unresolved > 0 {
        notes.push(format!(
            "{} of {} samples had no forecast and were excluded",
            unresolved,
            samples.len()
        ));
    }

    Some(Summary {
        head_pct: round_dp(totals[0] / denominator * 100.0, 1),
        cross_pct: round_dp(totals[1] / denominator * 100.0, 1),
        tail_pct: round_dp(totals[2] / denominator * 100.0, 1),
        longest_head_km: round_dp(longest_head_run_m(samples, classes) / 1000.0, 3),
        best_departure: None,
        provider_spread_ms: None,
        resolved_samples: resolved,
        unresolved_samples: unresolved,
        notes: if notes.is_empty() {
            None
        } else {
            Some(notes.join("; "))
        },
    })
}

fn class_index(class: WindClass) -> usize {
    match class {
        WindClass::Head => 0,
        WindClass::Cross => 1,
        WindClass::Tail => 2,
    }
}

/// Longest run of consecutive resolved `head` samples, summed by forward
/// distance. An unresolved sample breaks the run; ties keep the earliest run.
pub fn longest_head_run_m(samples: &[RouteSample], classes: &[Option<WindClass>]) -> f64 {
    let mut best = 0.0;
    let mut current = 0.0;
    for (i, class) in classes.iter().enumerate() {
        if *class == Some(WindClass::Head) {
            current += RouteSample::forward_distance_m(samples, i);
            if current > best {
                best = current;
            }
        } else {
            current = 0.0;
        }
    }
    best
}

/// Outcome of re-running classification for one candidate departure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepartureCandidate {
    pub depart: DateTime<Utc>,
    pub head_pct: f64,
    pub tail_pct: f64,
}

/// Least headwind wins; ties go to more tailwind, then the earlier departure.
pub fn best_departure(candidates: &[DepartureCandidate]) -> Option<DateTime<Utc>> {
    candidates
        .iter()
        .min_by(|a, b| {
            a.head_pct
                .total_cmp(&b.head_pct)
                .then(b.tail_pct.total_cmp(&a.tail_pct))
                .then(a.depart.cmp(&b.depart))
        })
        .map(|c| c.depart)
}
