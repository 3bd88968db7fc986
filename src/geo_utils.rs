//! # Geodesy & Speed Utilities
//!
//! Core geographic and kinematic computations for GPS track analysis.
//!
//! All positions are WGS84 latitude/longitude in degrees, the coordinate
//! system produced by GPS receivers and GPX files. Distances are meters
//! along a spherical Earth (haversine), accurate to well under 0.5% at
//! orienteering-course scales.
//!
//! ## Overview
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance`] | Great-circle distance between two positions |
//! | [`step_distance_3d`] | Slope distance from a planar step and an elevation delta |
//! | [`speed_kmh`] | Meters over seconds as km/h |
//! | [`pace_min_per_km`] | Reciprocal pace from a speed |

use geo::{Distance, Haversine, Point};

/// Calculate the great-circle distance between two positions using the
/// Haversine formula.
///
/// Positions are `(latitude, longitude)` in degrees; the result is in
/// meters.
///
/// # Example
///
/// ```rust
/// use split_analyzer::geo_utils::haversine_distance;
///
/// let london = (51.5074, -0.1278);
/// let paris = (48.8566, 2.3522);
/// let distance = haversine_distance(london, paris);
/// assert!((distance - 343_560.0).abs() < 1000.0); // ~344 km
/// ```
#[inline]
pub fn haversine_distance(p1: (f64, f64), p2: (f64, f64)) -> f64 {
    let point1 = Point::new(p1.1, p1.0);
    let point2 = Point::new(p2.1, p2.0);
    Haversine::distance(point1, point2)
}

/// Slope (3D) distance of one track step: the planar haversine distance
/// combined with the elevation change over the same step.
#[inline]
pub fn step_distance_3d(dist_2d: f64, elevation_delta: f64) -> f64 {
    (dist_2d * dist_2d + elevation_delta * elevation_delta).sqrt()
}

/// Convert a distance covered over a duration into km/h.
///
/// A non-positive duration yields 0.0 rather than infinity; callers that
/// need a floor apply it themselves.
#[inline]
pub fn speed_kmh(meters: f64, seconds: f64) -> f64 {
    if seconds <= 0.0 {
        return 0.0;
    }
    meters / seconds * 3.6
}

/// Pace in minutes per kilometer for a speed in km/h.
///
/// The caller is expected to have floored the speed already (the track
/// normalizer clamps to a configured minimum), so a non-positive speed
/// returns 0.0 instead of blowing up.
#[inline]
pub fn pace_min_per_km(speed_kmh: f64) -> f64 {
    if speed_kmh <= 0.0 {
        return 0.0;
    }
    60.0 / speed_kmh
}

// =============================================================================
// Unit Tests
// =============================================================================
