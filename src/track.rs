//! # GPS Track Normalizer
//!
//! Turns raw GPX bytes into a timezone-correct, gap-free time series at
//! exactly 1-second cadence, annotated per second with incremental
//! distance, elevation delta, speed and pace. The uniform grid is what
//! lets the fuser slice legs out of the track by plain index arithmetic.
//!
//! ## Pipeline
//! 1. Parse GPX; keep only positioned samples with timestamps (naive
//!    timestamps are assumed UTC).
//! 2. Resolve the IANA timezone from the first sample's coordinates and
//!    localize every timestamp into it.
//! 3. Pick the analysis start: the caller-supplied start-of-day clock
//!    time, or the first minute-aligned sample within the track's first
//!    minute.
//! 4. Resample onto an exact 1-second grid covering the expected total
//!    duration: positions interpolate linearly, the first/last sample is
//!    held beyond the track's ends (this also covers a start instant
//!    before the recording began), and elevation gaps back-fill with the
//!    first nonzero elevation observed (0 when the track has none).
//! 5. Annotate each grid second with 2D/3D step distance, elevation
//!    delta, speed (km/h, floored to keep pace bounded) and pace.
//!
//! Every failure here is a [`TrackError`]; the aggregator catches it and
//! degrades the request to split-only mode instead of surfacing it.

use std::io::Cursor;
use std::sync::OnceLock;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use tzf_rs::DefaultFinder;

use crate::geo_utils::{haversine_distance, pace_min_per_km, speed_kmh, step_distance_3d};
use crate::AnalysisConfig;

/// One raw track sample as parsed from the source recording.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsSample {
    pub time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: Option<f64>,
}

/// One second of the normalized track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
    /// Planar distance from the previous grid second, meters.
    pub dist_2d: f64,
    /// Slope distance from the previous grid second, meters.
    pub dist_3d: f64,
    /// Elevation change from the previous grid second, meters.
    pub elevation_delta: f64,
    /// Instantaneous speed in km/h, floored at the configured minimum.
    pub speed_kmh: f64,
    /// Pace in minutes per kilometer (reciprocal of the floored speed).
    pub pace_min_per_km: f64,
}

/// A gap-free 1-second-cadence track tagged with its resolved timezone.
///
/// `points.len()` equals the expected total duration in seconds; index
/// `i` is the state `i` seconds after `start`.
#[derive(Debug, Clone)]
pub struct NormalizedTrack {
    pub timezone: Tz,
    pub start: DateTime<Tz>,
    pub points: Vec<TrackPoint>,
}

/// Failures of track normalization and leg fusion. All of them degrade
/// the request to split-only mode at the aggregator.
#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    #[error("failed to parse gpx: {0}")]
    Parse(#[from] gpx::errors::GpxError),

    #[error("track has no positioned samples with timestamps")]
    EmptyTrack,

    #[error("no timezone found for ({lat}, {lon})")]
    UnknownTimezone { lat: f64, lon: f64 },

    #[error("start-of-day time {0} does not exist in timezone {1}")]
    BadStartTime(NaiveTime, Tz),

    #[error("no minute-aligned sample within the first minute of the track")]
    StartNotFound,

    #[error("expected duration must be positive, got {0}s")]
    BadDuration(i64),

    #[error("leg window [{start}s, {end}s) lies outside the {len}s track")]
    LegOutOfRange { start: i64, end: i64, len: usize },
}

/// Parse GPX bytes into raw samples.
///
/// Waypoints without a timestamp are skipped; a track without a single
/// usable sample is [`TrackError::EmptyTrack`].
pub fn parse_gpx(bytes: &[u8]) -> Result<Vec<GpsSample>, TrackError> {
    let gpx = gpx::read(Cursor::new(bytes))?;

    let mut samples = Vec::new();
    for track in &gpx.tracks {
        for segment in &track.segments {
            for wpt in &segment.points {
                let Some(time) = wpt.time else { continue };
                let odt = time::OffsetDateTime::from(time);
                let Some(t) = DateTime::from_timestamp(odt.unix_timestamp(), odt.nanosecond())
                else {
                    continue;
                };
                let point = wpt.point();
                samples.push(GpsSample {
                    time: t,
                    latitude: point.y(),
                    longitude: point.x(),
                    elevation: wpt.elevation,
                });
            }
        }
    }

    if samples.is_empty() {
        return Err(TrackError::EmptyTrack);
    }
    Ok(samples)
}

/// Resolve the IANA timezone covering a coordinate.
///
/// The finder parses its embedded polygon data on first use, so it is
/// built once and shared.
pub fn resolve_timezone(lat: f64, lon: f64) -> Result<Tz, TrackError> {
    static FINDER: OnceLock<DefaultFinder> = OnceLock::new();
    let finder = FINDER.get_or_init(DefaultFinder::new);
    let name = finder.get_tz_name(lon, lat);
    if name.is_empty() {
        return Err(TrackError::UnknownTimezone { lat, lon });
    }
    name.parse::<Tz>()
        .map_err(|_| TrackError::UnknownTimezone { lat, lon })
}

/// Parse and normalize in one step. `expected` is the athlete's total
/// result duration from the split table.
pub fn normalize_gpx(
    bytes: &[u8],
    start_time: Option<NaiveTime>,
    expected: Duration,
    config: &AnalysisConfig,
) -> Result<NormalizedTrack, TrackError> {
    let samples = parse_gpx(bytes)?;
    normalize_track(&samples, start_time, expected, config)
}

/// Normalize raw samples onto the 1-second grid.
///
/// See the module docs for the pipeline. The returned track always has
/// exactly `expected` points at 1-second spacing.
pub fn normalize_track(
    samples: &[GpsSample],
    start_time: Option<NaiveTime>,
    expected: Duration,
    config: &AnalysisConfig,
) -> Result<NormalizedTrack, TrackError> {
    let total_secs = expected.num_seconds();
    if total_secs <= 0 {
        return Err(TrackError::BadDuration(total_secs));
    }
    if samples.is_empty() {
        return Err(TrackError::EmptyTrack);
    }

    let mut samples: Vec<GpsSample> = samples.to_vec();
    samples.sort_by_key(|s| s.time);

    let timezone = resolve_timezone(samples[0].latitude, samples[0].longitude)?;
    let local: Vec<DateTime<Tz>> = samples
        .iter()
        .map(|s| s.time.with_timezone(&timezone))
        .collect();

    let start = match start_time {
        Some(t) => {
            let date = local[0].date_naive();
            timezone
                .from_local_datetime(&date.and_time(t))
                .earliest()
                .ok_or(TrackError::BadStartTime(t, timezone))?
        }
        None => local
            .iter()
            .take(59)
            .find(|dt| dt.second() == 0)
            .copied()
            .ok_or(TrackError::StartNotFound)?,
    };

    // Sample offsets in seconds relative to the start instant. Offsets
    // may be negative (recording began before the logical start) or
    // fractional (sub-second devices).
    let offsets: Vec<f64> = local
        .iter()
        .map(|t| (*t - start).num_milliseconds() as f64 / 1000.0)
        .collect();

    let latitudes: Vec<f64> = samples.iter().map(|s| s.latitude).collect();
    let longitudes: Vec<f64> = samples.iter().map(|s| s.longitude).collect();

    let n = total_secs as usize;
    let mut grid_lat = Vec::with_capacity(n);
    let mut grid_lon = Vec::with_capacity(n);
    for i in 0..n {
        let target = i as f64;
        grid_lat.push(sample_series(&offsets, &latitudes, target));
        grid_lon.push(sample_series(&offsets, &longitudes, target));
    }
    let grid_alt = elevation_grid(&samples, &offsets, n);

    // Per-second annotations. The first second has no predecessor, so
    // its distances are zero and its speed sits on the floor.
    let mut points = Vec::with_capacity(n);
    for i in 0..n {
        let (dist_2d, elevation_delta) = if i == 0 {
            (0.0, 0.0)
        } else {
            (
                haversine_distance(
                    (grid_lat[i - 1], grid_lon[i - 1]),
                    (grid_lat[i], grid_lon[i]),
                ),
                grid_alt[i] - grid_alt[i - 1],
            )
        };
        let dist_3d = step_distance_3d(dist_2d, elevation_delta);
        let speed = speed_kmh(dist_3d, 1.0).max(config.min_speed_kmh);
        points.push(TrackPoint {
            latitude: grid_lat[i],
            longitude: grid_lon[i],
            elevation: grid_alt[i],
            dist_2d,
            dist_3d,
            elevation_delta,
            speed_kmh: speed,
            pace_min_per_km: pace_min_per_km(speed),
        });
    }

    Ok(NormalizedTrack {
        timezone,
        start,
        points,
    })
}

/// Piecewise-linear sampling of `(offsets, values)` at `target`, holding
/// the first/last value beyond the series' ends.
fn sample_series(offsets: &[f64], values: &[f64], target: f64) -> f64 {
    debug_assert_eq!(offsets.len(), values.len());
    if target <= offsets[0] {
        return values[0];
    }
    let last = offsets.len() - 1;
    if target >= offsets[last] {
        return values[last];
    }
    // partition_point finds the first offset > target; target is known
    // to sit strictly inside the series here.
    let hi = offsets.partition_point(|o| *o <= target);
    let lo = hi - 1;
    let span = offsets[hi] - offsets[lo];
    if span <= 0.0 {
        return values[lo];
    }
    let frac = (target - offsets[lo]) / span;
    values[lo] + frac * (values[hi] - values[lo])
}

/// Elevation series for the grid: linear interpolation over the samples
/// that carry elevation, the region before the first of them back-filled
/// with the first nonzero elevation observed, all zeros when the track
/// has no elevation at all.
fn elevation_grid(samples: &[GpsSample], offsets: &[f64], n: usize) -> Vec<f64> {
    let mut ele_offsets = Vec::new();
    let mut ele_values = Vec::new();
    for (off, sample) in offsets.iter().zip(samples) {
        if let Some(e) = sample.elevation {
            ele_offsets.push(*off);
            ele_values.push(e);
        }
    }

    if ele_values.is_empty() {
        return vec![0.0; n];
    }

    let backfill = ele_values
        .iter()
        .copied()
        .find(|e| *e != 0.0)
        .unwrap_or(0.0);

    (0..n)
        .map(|i| {
            let target = i as f64;
            if target < ele_offsets[0] {
                backfill
            } else {
                sample_series(&ele_offsets, &ele_values, target)
            }
        })
        .collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
