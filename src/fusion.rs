//! # Split/GPS Fusion
//!
//! Attaches physical metrics to each recorded leg of a split table by
//! slicing the matching window out of a normalized 1-second track.
//!
//! Because the track grid is exactly one point per second from the
//! start instant, a leg that ends `cum` seconds in and lasted `dur`
//! seconds occupies grid indices `[cum - dur, cum)`. A window that does
//! not fit the track means the track and the official times disagree;
//! the whole fusion fails and the caller degrades to split-only mode.

use crate::geo_utils::{haversine_distance, speed_kmh};
use crate::splits::{median, seconds, SplitTable};
use crate::track::{NormalizedTrack, TrackError, TrackPoint};
use crate::AnalysisConfig;

/// Physical metrics of one leg, derived from its GPS window.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct LegMetrics {
    /// Straight-line distance between the leg's endpoints, meters.
    pub straight_m: f64,
    /// Distance actually covered on the ground, meters.
    pub path_m: f64,
    /// `path_m / straight_m`; the configured fallback ratio when the
    /// endpoints coincide.
    pub path_ratio: f64,
    /// Net elevation change over the leg, meters.
    pub elevation_delta_m: f64,
    /// Total ascent, meters.
    pub climb_m: f64,
    /// Total descent, meters (negative or zero).
    pub descent_m: f64,
    /// Straight-line distance over leg duration, km/h.
    pub speed_efficiency_kmh: f64,
    /// Ground distance over leg duration, km/h.
    pub speed_real_kmh: f64,
    /// Sample standard deviation of per-second speeds, km/h.
    pub speed_std: f64,
    pub speed_max_kmh: f64,
    pub speed_min_kmh: f64,
    /// Median per-second pace, minutes per kilometer.
    pub pace_median: f64,
    /// Number of distinct stops (maximal runs of slow seconds at least
    /// the configured length).
    pub stop_count: u32,
    pub start_lat: f64,
    pub start_lon: f64,
    pub end_lat: f64,
    pub end_lon: f64,
}

/// Attach [`LegMetrics`] to every leg of `table` that has both a
/// cumulative time and a duration. "No data" spans are left untouched.
///
/// Fails with [`TrackError::LegOutOfRange`] when any leg window falls
/// outside the track; no partial fusion is kept in that case because
/// the table is rebuilt from scratch on the next request anyway.
pub fn fuse(
    table: &mut SplitTable,
    track: &NormalizedTrack,
    config: &AnalysisConfig,
) -> Result<(), TrackError> {
    let len = track.points.len();
    for leg in &mut table.legs {
        let (Some(cumulative), Some(duration)) = (leg.cumulative, leg.duration) else {
            continue;
        };
        let end = cumulative.num_seconds();
        let start = end - duration.num_seconds();
        if start < 0 || end > len as i64 || end <= start {
            return Err(TrackError::LegOutOfRange { start, end, len });
        }
        let window = &track.points[start as usize..end as usize];
        leg.metrics = Some(leg_metrics(window, seconds(duration), config));
    }
    Ok(())
}

fn leg_metrics(window: &[TrackPoint], duration_secs: f64, config: &AnalysisConfig) -> LegMetrics {
    let first = window[0];
    let last = window[window.len() - 1];

    let straight_m = haversine_distance(
        (first.latitude, first.longitude),
        (last.latitude, last.longitude),
    );
    let path_m: f64 = window.iter().map(|p| p.dist_2d).sum();
    let path_ratio = if straight_m == 0.0 {
        config.fallback_ratio
    } else {
        path_m / straight_m
    };

    let elevation_delta_m = last.elevation - first.elevation;
    let mut climb_m = 0.0;
    let mut descent_m = 0.0;
    for point in window {
        if point.elevation_delta > 0.0 {
            climb_m += point.elevation_delta;
        } else {
            descent_m += point.elevation_delta;
        }
    }

    let speeds: Vec<f64> = window.iter().map(|p| p.speed_kmh).collect();
    let mut paces: Vec<f64> = window.iter().map(|p| p.pace_min_per_km).collect();

    LegMetrics {
        straight_m,
        path_m,
        path_ratio,
        elevation_delta_m,
        climb_m,
        descent_m,
        speed_efficiency_kmh: speed_kmh(straight_m, duration_secs),
        speed_real_kmh: speed_kmh(path_m, duration_secs),
        speed_std: sample_std(&speeds),
        speed_max_kmh: speeds.iter().copied().fold(f64::MIN, f64::max),
        speed_min_kmh: speeds.iter().copied().fold(f64::MAX, f64::min),
        pace_median: median(&mut paces),
        stop_count: count_stops(&speeds, config),
        start_lat: first.latitude,
        start_lon: first.longitude,
        end_lat: last.latitude,
        end_lon: last.longitude,
    }
}

/// Sample standard deviation (N-1 denominator); 0 for fewer than two
/// observations.
fn sample_std(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    var.sqrt()
}

/// Count maximal runs of slow seconds. A run qualifies as one stop once
/// it reaches the configured minimum length; extending it further does
/// not count again until the speed recovers.
fn count_stops(speeds: &[f64], config: &AnalysisConfig) -> u32 {
    let mut stops = 0;
    let mut run: u32 = 0;
    for speed in speeds {
        if *speed < config.stop_speed_kmh {
            run += 1;
            if run == config.stop_min_seconds {
                stops += 1;
            }
        } else {
            run = 0;
        }
    }
    stops
}

// =============================================================================
// Unit Tests
// =============================================================================
