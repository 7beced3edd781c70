//! Wind classification relative to the rider's direction of travel.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::helpers::normalize_deg_180;

/// Headwind / crosswind / tailwind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum WindClass {
    Head,
    Cross,
    Tail,
}

impl WindClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindClass::Head => "head",
            WindClass::Cross => "cross",
            WindClass::Tail => "tail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "head" => Some(WindClass::Head),
            "cross" => Some(WindClass::Cross),
            "tail" => Some(WindClass::Tail),
            _ => None,
        }
    }
}

/// Symmetric angular bands on |yaw|: head up to `head_max_deg`, tail from
/// `tail_min_deg`, cross in between.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindBands {
    pub head_max_deg: f64,
    pub tail_min_deg: f64,
}

impl Default for WindBands {
    fn default() -> Self {
        Self {
            head_max_deg: 60.0,
            tail_min_deg: 120.0,
        }
    }
}

impl WindBands {
    pub fn new(head_max_deg: f64, tail_min_deg: f64) -> Result<Self, String> {
        let valid = head_max_deg.is_finite()
            && tail_min_deg.is_finite()
            && head_max_deg >= 0.0
            && head_max_deg < tail_min_deg
            && tail_min_deg <= 180.0;
        if valid {
            Ok(Self {
                head_max_deg,
                tail_min_deg,
            })
        } else {
            Err(format!(
                "invalid wind bands: head {}° / tail {}° (need 0 <= head < tail <= 180)",
                head_max_deg, tail_min_deg
            ))
        }
    }

    pub fn classify(&self, yaw_deg: f64) -> WindClass {
        let magnitude = yaw_deg.abs();
        if magnitude <= self.head_max_deg {
            WindClass::Head
        } else if magnitude >= self.tail_min_deg {
            WindClass::Tail
        } else {
            WindClass::Cross
        }
    }
}

/// Signed yaw in [-180, 180): 0 means the wind comes from straight ahead,
/// ±180 from straight behind. Positive when the wind comes from the rider's right.
pub fn yaw_angle(wind_from_deg: f64, bearing_deg: f64) -> f64 {
    normalize_deg_180(wind_from_deg - bearing_deg)
}

/// Yaw and class for one resolved sample.
pub fn classify(wind_from_deg: f64, bearing_deg: f64, bands: &WindBands) -> (f64, WindClass) {
    let yaw = yaw_angle(wind_from_deg, bearing_deg);
    (yaw, bands.classify(yaw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wind_from_ahead_is_head() {
        let (yaw, class) = classify(90.0, 90.0, &WindBands::default());
        assert_eq!(yaw, 0.0);
        assert_eq!(class, WindClass::Head);
    }

    #[test]
    fn test_wind_from_behind_is_tail() {
        let (yaw, class) = classify(270.0, 90.0, &WindBands::default());
        assert_eq!(yaw.abs(), 180.0);
        assert_eq!(class, WindClass::Tail);
    }

    #[test]
    fn test_wind_from_side_is_cross() {
        let (yaw, class) = classify(0.0, 90.0, &WindBands::default());
        assert_eq!(yaw, -90.0);
        assert_eq!(class, WindClass::Cross);
        let (yaw, _) = classify(180.0, 90.0, &WindBands::default());
        assert_eq!(yaw, 90.0);
    }

    #[test]
    fn test_yaw_range_and_periodicity() {
        for wind in (0..720).step_by(7) {
            for bearing in (0..360).step_by(11) {
                let (w, b) = (wind as f64, bearing as f64);
                let yaw = yaw_angle(w, b);
                assert!((-180.0..=180.0).contains(&yaw), "yaw {} out of range", yaw);
                assert!((yaw - yaw_angle(w + 360.0, b)).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_classification_symmetric() {
        let bands = WindBands::default();
        for yaw in 0..=180 {
            let y = yaw as f64;
            assert_eq!(bands.classify(y), bands.classify(-y));
        }
    }

    #[test]
    fn test_band_boundaries_inclusive() {
        let bands = WindBands::default();
        assert_eq!(bands.classify(60.0), WindClass::Head);
        assert_eq!(bands.classify(60.1), WindClass::Cross);
        assert_eq!(bands.classify(119.9), WindClass::Cross);
        assert_eq!(bands.classify(-120.0), WindClass::Tail);
    }

    #[test]
    fn test_bands_validation() {
        assert!(WindBands::new(45.0, 135.0).is_ok());
        assert!(WindBands::new(90.0, 90.0).is_err());
        assert!(WindBands::new(-1.0, 120.0).is_err());
        assert!(WindBands::new(60.0, 190.0).is_err());
    }

    #[test]
    fn test_wind_class_serde_lowercase() {
        let json = serde_json::to_string(&WindClass::Cross).unwrap();
        assert_eq!(json, "\"cross\"");
        assert_eq!(WindClass::parse("tail"), Some(WindClass::Tail));
        assert_eq!(WindClass::parse("gale"), None);
    }
}
