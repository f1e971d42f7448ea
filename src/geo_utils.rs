//! Geographic helpers for detection coordinates.
//!
//! Everything here works on WGS84 latitude/longitude degrees, the frame
//! the collector reports GPS fixes in. Distances are great-circle on a
//! mean-radius sphere; at pothole scale (meters between detections, a
//! few km per trip) that is accurate to well under a meter.

use crate::GpsPoint;
use geo::{Distance, Haversine, Point};

/// Meters per degree used for degree-span estimates. Deliberately a
/// little below the true value on the haversine sphere (~111,195 at the
/// equator), so spans derived from it are never under-sized.
const METERS_PER_DEGREE_FLOOR: f64 = 111_000.0;

/// Great-circle distance between two fixes, in meters.
///
/// Delegates to the haversine implementation in `geo`, which assumes a
/// spherical earth with mean radius 6 371 008.8 m.
///
/// # Example
///
/// ```rust
/// use roadwatch::{GpsPoint, geo_utils};
///
/// let beirut = GpsPoint::new(33.8886, 35.4955);
/// let tripoli = GpsPoint::new(34.4367, 35.8497);
///
/// let distance = geo_utils::haversine_distance(&beirut, &tripoli);
/// assert!((distance - 69_100.0).abs() < 1_000.0); // ~69 km up the coast
/// ```
#[inline]
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine::distance(point1, point2)
}

/// Convert a distance in meters to a degree span at the given latitude.
///
/// Sized for R-tree search envelopes: the result is never smaller than
/// the true angular span (for either axis), so an envelope built from it
/// may over-fetch but cannot miss a neighbor. Candidates are always
/// verified with [`haversine_distance`] afterwards, which makes the
/// over-fetch harmless.
#[inline]
pub fn meters_to_degrees(meters: f64, latitude: f64) -> f64 {
    // cos() floor keeps the span finite near the poles
    let meters_per_degree = METERS_PER_DEGREE_FLOOR * latitude.to_radians().cos().max(0.1);
    meters / meters_per_degree
}

/// Arithmetic mean of latitude and longitude over a set of points.
///
/// This is the definition of a cluster centroid. Members of one cluster
/// sit within a few meters of each other, so plain averaging in degree
/// space is exact for our purposes. Returns (0, 0) for empty input.
pub fn compute_center(points: &[GpsPoint]) -> GpsPoint {
    if points.is_empty() {
        return GpsPoint::new(0.0, 0.0);
    }

    let sum_lat: f64 = points.iter().map(|p| p.latitude).sum();
    let sum_lng: f64 = points.iter().map(|p| p.longitude).sum();
    let n = points.len() as f64;

    GpsPoint::new(sum_lat / n, sum_lng / n)
}
