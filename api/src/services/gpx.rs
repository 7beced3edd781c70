//! GPX parser for uploaded cycling routes.
//!
//! Reads `<trkpt>` and `<rtept>` elements (track points first, then route
//! points, in document order) and extracts:
//! - coordinates from the `lat`/`lon` attributes
//! - optional `<ele>` elevation and `<time>` timestamp
//!
//! Cumulative haversine distance and route-level metadata (bounding box,
//! timestamp coverage, time span) are computed from the parsed points.

use chrono::{DateTime, Utc};
use geo::{Distance, Haversine, Point};
use quick_xml::events::Event;
use quick_xml::Reader;
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during GPX parsing.
#[derive(Debug, Error)]
pub enum GpxError {
    #[error("IO error reading GPX file: {0}")]
    Io(#[from] std::io::Error),
    #[error("XML parsing error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("No track or route points found in GPX")]
    NoPoints,
    #[error("Invalid coordinate '{value}' for {field}")]
    InvalidCoordinate { field: String, value: String },
}

/// A raw point along an uploaded route, with cumulative distance from the start.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPoint {
    pub lat: f64,
    pub lon: f64,
    pub elevation_m: Option<f64>,
    /// Original timestamp recorded in the GPX, if any.
    pub time: Option<DateTime<Utc>>,
    /// Cumulative along-route distance in metres.
    pub distance_m: f64,
}

/// Route-level facts derived from the raw points.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteMetadata {
    /// [min_lon, min_lat, max_lon, max_lat]
    pub bbox: [f64; 4],
    pub total_distance_km: f64,
    pub has_timestamps: bool,
    /// Fraction of points carrying a timestamp, in [0, 1].
    pub timestamp_coverage: f64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl RouteMetadata {
    /// Ride duration in hours: the recorded time span when the GPX is timestamped,
    /// otherwise the route length at `default_speed_kmh`.
    pub fn estimated_duration_hours(&self, default_speed_kmh: f64) -> f64 {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) if end > start => {
                (end - start).num_seconds() as f64 / 3600.0
            }
            _ if default_speed_kmh > 0.0 => self.total_distance_km / default_speed_kmh,
            _ => 0.0,
        }
    }
}

/// Parse GPX XML content into raw points with cumulative distance.
pub fn parse_gpx(gpx_xml: &str) -> Result<Vec<RawPoint>, GpxError> {
    let mut reader = Reader::from_str(gpx_xml);

    let mut track_points: Vec<RawPoint> = Vec::new();
    let mut route_points: Vec<RawPoint> = Vec::new();

    // Current point state (while inside a <trkpt> or <rtept> element)
    let mut current: Option<(bool, RawPoint)> = None;
    let mut reading: Option<&'static str> = None;

    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let local = local_name_str(e.name().as_ref());
                match local.as_str() {
                    "trkpt" | "rtept" => {
                        let (lat, lon) = point_attributes(e)?;
                        current = Some((
                            local == "trkpt",
                            RawPoint {
                                lat,
                                lon,
                                elevation_m: None,
                                time: None,
                                distance_m: 0.0,
                            },
                        ));
                    }
                    "ele" if current.is_some() => reading = Some("ele"),
                    "time" if current.is_some() => reading = Some("time"),
                    _ => {}
                }
            }
            Ok(Event::Empty(ref e)) => {
                // Self-closing <trkpt .../> carries coordinates only
                let local = local_name_str(e.name().as_ref());
                if local == "trkpt" || local == "rtept" {
                    let (lat, lon) = point_attributes(e)?;
                    let point = RawPoint {
                        lat,
                        lon,
                        elevation_m: None,
                        time: None,
                        distance_m: 0.0,
                    };
                    if local == "trkpt" {
                        track_points.push(point);
                    } else {
                        route_points.push(point);
                    }
                }
            }
            Ok(Event::Text(ref e)) => {
                if let (Some(field), Some((_, point))) = (reading, current.as_mut()) {
                    let text = e.unescape().unwrap_or_default().trim().to_string();
                    if !text.is_empty() {
                        match field {
                            "ele" => point.elevation_m = text.parse().ok(),
                            "time" => {
                                point.time = DateTime::parse_from_rfc3339(&text)
                                    .map(|dt| dt.with_timezone(&Utc))
                                    .map_err(|e| {
                                        tracing::warn!(
                                            "Ignoring malformed GPX time '{}': {}",
                                            text,
                                            e
                                        );
                                    })
                                    .ok();
                            }
                            _ => {}
                        }
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                let local = local_name_str(e.name().as_ref());
                match local.as_str() {
                    "ele" | "time" => reading = None,
                    "trkpt" | "rtept" => {
                        if let Some((is_track, point)) = current.take() {
                            if is_track {
                                track_points.push(point);
                            } else {
                                route_points.push(point);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(GpxError::Xml(e)),
            _ => {}
        }
        buf.clear();
    }

    let mut points = track_points;
    points.extend(route_points);
    if points.is_empty() {
        return Err(GpxError::NoPoints);
    }

    assign_cumulative_distance(&mut points);
    Ok(points)
}

/// Haversine distance in metres between two lat/lon positions.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    Haversine::distance(Point::new(lon1, lat1), Point::new(lon2, lat2))
}

/// Fill `distance_m` as the running haversine sum from the first point.
pub fn assign_cumulative_distance(points: &mut [RawPoint]) {
    let mut cumulative = 0.0;
    for i in 0..points.len() {
        if i > 0 {
            let (prev, cur) = (&points[i - 1], &points[i]);
            cumulative += haversine_m(prev.lat, prev.lon, cur.lat, cur.lon);
        }
        points[i].distance_m = cumulative;
    }
}

/// Compute bounding box, length and timestamp coverage for parsed points.
pub fn route_metadata(points: &[RawPoint]) -> RouteMetadata {
    let mut bbox = [f64::MAX, f64::MAX, f64::MIN, f64::MIN];
    for p in points {
        bbox[0] = bbox[0].min(p.lon);
        bbox[1] = bbox[1].min(p.lat);
        bbox[2] = bbox[2].max(p.lon);
        bbox[3] = bbox[3].max(p.lat);
    }
    if points.is_empty() {
        bbox = [0.0; 4];
    }

    let timestamped = points.iter().filter(|p| p.time.is_some()).count();
    let timestamp_coverage = if points.is_empty() {
        0.0
    } else {
        timestamped as f64 / points.len() as f64
    };

    RouteMetadata {
        bbox,
        total_distance_km: points.last().map(|p| p.distance_m / 1000.0).unwrap_or(0.0),
        has_timestamps: timestamped > 0,
        timestamp_coverage,
        start_time: points.iter().filter_map(|p| p.time).min(),
        end_time: points.iter().filter_map(|p| p.time).max(),
    }
}

fn point_attributes(e: &quick_xml::events::BytesStart) -> Result<(f64, f64), GpxError> {
    let mut lat = None;
    let mut lon = None;
    for attr in e.attributes().flatten() {
        let key = std::str::from_utf8(attr.key.as_ref()).unwrap_or("");
        let val = std::str::from_utf8(&attr.value).unwrap_or("");
        match key {
            "lat" => lat = Some(parse_coordinate("lat", val, 90.0)?),
            "lon" => lon = Some(parse_coordinate("lon", val, 180.0)?),
            _ => {}
        }
    }
    match (lat, lon) {
        (Some(lat), Some(lon)) => Ok((lat, lon)),
        _ => Err(GpxError::InvalidCoordinate {
            field: "lat/lon".to_string(),
            value: String::new(),
        }),
    }
}

fn parse_coordinate(field: &str, value: &str, limit: f64) -> Result<f64, GpxError> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && v.abs() <= limit)
        .ok_or_else(|| GpxError::InvalidCoordinate {
            field: field.to_string(),
            value: value.to_string(),
        })
}

/// Extract the local name from a potentially namespaced XML element name.
/// e.g. `gpx:trkpt` -> `trkpt`, `trkpt` -> `trkpt`
fn local_name_str(full: &[u8]) -> String {
    let s = std::str::from_utf8(full).unwrap_or("");
    match s.rfind(':') {
        Some(pos) => s[pos + 1..].to_string(),
        None => s.to_string(),
    }
}

/// Hex SHA-256 of a GPX body, used to recognise repeated uploads.
pub fn content_hash(gpx_xml: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(gpx_xml.as_bytes());
    hex::encode(hasher.finalize())
}

/// Scan a directory for `*.gpx` files, returning `(file stem, gpx xml)` pairs.
pub fn load_gpx_from_dir(dir: &Path) -> Result<Vec<(String, String)>, GpxError> {
    let mut files = Vec::new();
    if !dir.exists() {
        tracing::warn!("Data directory does not exist: {}", dir.display());
        return Ok(files);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "gpx") {
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            tracing::info!("Loading route from GPX: {}", path.display());
            files.push((name, std::fs::read_to_string(&path)?));
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMED_GPX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx xmlns="http://www.topografix.com/GPX/1/1" version="1.1" creator="test">
  <trk><name>Glossop loop</name><trkseg>
    <trkpt lat="53.4430" lon="-1.9490"><ele>150</ele><time>2025-06-01T08:00:00Z</time></trkpt>
    <trkpt lat="53.4430" lon="-1.9340"><ele>180</ele><time>2025-06-01T08:04:00Z</time></trkpt>
    <trkpt lat="53.4520" lon="-1.9340"><ele>210</ele></trkpt>
  </trkseg></trk>
</gpx>"#;

    #[test]
    fn test_parse_track_points() {
        let points = parse_gpx(TIMED_GPX).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].lat, 53.443);
        assert_eq!(points[0].lon, -1.949);
        assert_eq!(points[0].elevation_m, Some(150.0));
        assert_eq!(
            points[0].time,
            Some("2025-06-01T08:00:00Z".parse::<DateTime<Utc>>().unwrap())
        );
        assert!(points[2].time.is_none());
    }

    #[test]
    fn test_cumulative_distance_monotonic() {
        let points = parse_gpx(TIMED_GPX).unwrap();
        assert_eq!(points[0].distance_m, 0.0);
        // ~1 km east, then ~1 km north
        assert!((points[1].distance_m - 1000.0).abs() < 30.0);
        assert!(points[2].distance_m > points[1].distance_m);
    }

    #[test]
    fn test_route_points_are_accepted() {
        let gpx = r#"<gpx version="1.1"><rte>
            <rtept lat="51.0" lon="0.0"/>
            <rtept lat="51.1" lon="0.0"/>
        </rte></gpx>"#;
        let points = parse_gpx(gpx).unwrap();
        assert_eq!(points.len(), 2);
        assert!((points[1].distance_m - 11_119.5).abs() < 20.0);
    }

    #[test]
    fn test_no_points_errors() {
        let gpx = r#"<gpx version="1.1"><wpt lat="51.0" lon="0.0"/></gpx>"#;
        assert!(matches!(parse_gpx(gpx), Err(GpxError::NoPoints)));
    }

    #[test]
    fn test_invalid_latitude_errors() {
        let gpx = r#"<gpx><trk><trkseg><trkpt lat="95.0" lon="0.0"></trkpt></trkseg></trk></gpx>"#;
        let err = parse_gpx(gpx).unwrap_err();
        assert!(err.to_string().contains("95.0"));
    }

    #[test]
    fn test_route_metadata_coverage_and_span() {
        let points = parse_gpx(TIMED_GPX).unwrap();
        let meta = route_metadata(&points);
        assert!(meta.has_timestamps);
        assert!((meta.timestamp_coverage - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(meta.bbox[0], -1.949);
        assert_eq!(meta.bbox[3], 53.452);
        assert!((meta.estimated_duration_hours(25.0) - 4.0 / 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_estimated_duration_without_timestamps_uses_speed() {
        let meta = RouteMetadata {
            bbox: [0.0; 4],
            total_distance_km: 50.0,
            has_timestamps: false,
            timestamp_coverage: 0.0,
            start_time: None,
            end_time: None,
        };
        assert_eq!(meta.estimated_duration_hours(25.0), 2.0);
    }

    #[test]
    fn test_content_hash_identifies_identical_uploads() {
        let hash = content_hash(TIMED_GPX);
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, content_hash(TIMED_GPX));
        assert_ne!(hash, content_hash(&TIMED_GPX.replace("Glossop", "Hayfield")));
    }
}
