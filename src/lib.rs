//! # Split Analyzer
//!
//! Split-time and GPS analytics engine for orienteering race results.
//!
//! This library provides:
//! - Fuzzy resolution of a free-text athlete name against a result matrix
//! - Per-leg split tables with backlog, leader and rank within a cohort
//! - GPS track normalization onto a uniform 1-second grid
//! - Fusion of the two into per-leg physical metrics (distance, climb,
//!   speed, pacing, stops)
//!
//! The crate is the computational core of a results platform: it consumes
//! an already-parsed [`SplitMatrix`] + [`RouteSpec`] and already-fetched
//! GPX bytes, and produces a [`ResultPost`]. Storage, HTTP and result-page
//! scraping live outside this crate.
//!
//! ## Quick Start
//!
//! ```rust
//! use chrono::Duration;
//! use split_analyzer::{
//!     AthleteKey, SplitMatrix, RouteSpec, CourseVariant,
//!     AnalysisConfig, ResultRequest, compute_result,
//! };
//!
//! let mut matrix = SplitMatrix::new();
//! let key = AthleteKey::new("Ivanov Ivan", "M21");
//! matrix.push_row(key.clone(), vec![
//!     ("31".into(), Some(Duration::seconds(600))),
//!     ("45".into(), Some(Duration::seconds(1200))),
//!     ("RES".into(), Some(Duration::seconds(1800))),
//! ]);
//!
//! let mut routes = RouteSpec::new();
//! routes.insert_variant("M21", CourseVariant {
//!     codes: vec!["31".into(), "45".into()],
//!     members: vec![key.wire()],
//! });
//!
//! let config = AnalysisConfig::default();
//! let post = compute_result(
//!     "Ivanov Iavn", // typo-tolerant
//!     &matrix,
//!     &routes,
//!     &ResultRequest::default(),
//!     &config,
//! ).unwrap();
//!
//! assert_eq!(post.place, 1);
//! assert!(!post.gps);
//! ```
//!
//! ## Failure model
//!
//! Resolution below the similarity threshold is the only terminal error
//! ([`AnalysisError::AthleteNotFound`]). Everything GPS-related degrades:
//! a malformed track, an unresolvable timezone or an unusable leg window
//! yields a split-only [`ResultPost`] with `gps = false`, never an error.

use std::collections::HashMap;

use chrono::Duration;
use serde::Serialize;

pub mod aggregate;
pub mod fusion;
pub mod geo_utils;
pub mod resolver;
pub mod splits;
pub mod track;

pub use aggregate::{compute_result, ResultPost, ResultRequest, TableJson};
pub use fusion::{fuse, LegMetrics};
pub use resolver::{filter_cohort, resolve, CohortFilter, Resolution};
pub use splits::{compute_split_table, SplitLeg, SplitTable};
pub use track::{
    normalize_gpx, normalize_track, parse_gpx, resolve_timezone, GpsSample, NormalizedTrack,
    TrackError, TrackPoint,
};

// ============================================================================
// Core Types
// ============================================================================

/// Reserved control code for the finish / total-result column.
pub const FINISH_CODE: &str = "RES";

/// Identity of one athlete within an event's result set.
///
/// Name and group are uppercase-normalized on construction; the wire form
/// `"NAME^GROUP"` matches the result matrix index of the source exports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AthleteKey {
    pub name: String,
    pub group: String,
}

impl AthleteKey {
    /// Create a key, uppercasing both parts.
    pub fn new(name: &str, group: &str) -> Self {
        Self {
            name: name.trim().to_uppercase(),
            group: group.trim().to_uppercase(),
        }
    }

    /// Parse the wire form `"NAME^GROUP"`.
    pub fn parse(wire: &str) -> Option<Self> {
        let (name, group) = wire.rsplit_once('^')?;
        if name.is_empty() || group.is_empty() {
            return None;
        }
        Some(Self::new(name, group))
    }

    /// Wire form used as the matrix row index: `"NAME^GROUP"`.
    pub fn wire(&self) -> String {
        format!("{}^{}", self.name, self.group)
    }

    /// Short display label: first word, initial of the second, group.
    ///
    /// `"IVANOV IVAN" / "M21"` becomes `"IVANOV I.[M21]"`. Used for the
    /// per-leg leader column.
    pub fn display_label(&self) -> String {
        let mut words = self.name.split_whitespace();
        let first = words.next().unwrap_or_default();
        match words.next().and_then(|w| w.chars().next()) {
            Some(initial) => format!("{} {}.[{}]", first, initial, self.group),
            None => format!("{} [{}]", first, self.group),
        }
    }
}

/// The full table of recorded leg times for one event.
///
/// Each row maps control codes to that athlete's **leg duration** ending
/// at the code; the reserved [`FINISH_CODE`] column holds the total
/// finish time. A code mapped to `None` exists in the results but was not
/// recorded for this athlete; a code absent from the row does not apply
/// to their course.
///
/// Rows keep insertion order. That order is the documented tie-break
/// order for fuzzy resolution and leg-leader selection, so it should
/// match the row order of the source export.
#[derive(Debug, Clone, Default)]
pub struct SplitMatrix {
    rows: Vec<(AthleteKey, HashMap<String, Option<Duration>>)>,
}

impl SplitMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a row. An existing row for the same key is replaced in place.
    pub fn push_row<I>(&mut self, key: AthleteKey, cells: I)
    where
        I: IntoIterator<Item = (String, Option<Duration>)>,
    {
        let cells: HashMap<String, Option<Duration>> = cells.into_iter().collect();
        if let Some(row) = self.rows.iter_mut().find(|(k, _)| *k == key) {
            row.1 = cells;
        } else {
            self.rows.push((key, cells));
        }
    }

    /// Set a single cell, creating the row when needed.
    pub fn set(&mut self, key: &AthleteKey, code: &str, time: Option<Duration>) {
        match self.rows.iter_mut().find(|(k, _)| k == key) {
            Some((_, cells)) => {
                cells.insert(code.to_string(), time);
            }
            None => self
                .rows
                .push((key.clone(), HashMap::from([(code.to_string(), time)]))),
        }
    }

    pub fn row(&self, key: &AthleteKey) -> Option<&HashMap<String, Option<Duration>>> {
        self.rows.iter().find(|(k, _)| k == key).map(|(_, c)| c)
    }

    /// One recorded cell, flattened across "row missing", "code missing"
    /// and "code unrecorded".
    pub fn time(&self, key: &AthleteKey, code: &str) -> Option<Duration> {
        self.row(key)?.get(code).copied().flatten()
    }

    /// The athlete's total finish time ([`FINISH_CODE`] column).
    pub fn finish_time(&self, key: &AthleteKey) -> Option<Duration> {
        self.time(key, FINISH_CODE)
    }

    /// Athletes in insertion order.
    pub fn athletes(&self) -> impl Iterator<Item = &AthleteKey> {
        self.rows.iter().map(|(k, _)| k)
    }

    /// All recorded times for one code, in row order.
    pub fn recorded_times(&self, code: &str) -> Vec<(&AthleteKey, Duration)> {
        self.rows
            .iter()
            .filter_map(|(k, cells)| cells.get(code).copied().flatten().map(|t| (k, t)))
            .collect()
    }

    /// Subset of rows matching the predicate, preserving order.
    pub fn filtered<F: Fn(&AthleteKey) -> bool>(&self, keep: F) -> SplitMatrix {
        SplitMatrix {
            rows: self
                .rows
                .iter()
                .filter(|(k, _)| keep(k))
                .cloned()
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One course variant of a group's dispersion: the ordered control codes
/// plus the wire keys of the athletes running it.
#[derive(Debug, Clone, PartialEq)]
pub struct CourseVariant {
    pub codes: Vec<String>,
    pub members: Vec<String>,
}

/// Per-group course definitions ("dispersion"). Groups may share
/// identical or different courses; one group may have several variants.
#[derive(Debug, Clone, Default)]
pub struct RouteSpec {
    groups: HashMap<String, Vec<CourseVariant>>,
}

impl RouteSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_variant(&mut self, group: &str, variant: CourseVariant) {
        self.groups
            .entry(group.trim().to_uppercase())
            .or_default()
            .push(variant);
    }

    /// The course for one athlete: the variant listing them as a member,
    /// falling back to the group's first variant.
    pub fn course_for(&self, key: &AthleteKey) -> Option<&[String]> {
        let variants = self.groups.get(&key.group)?;
        let wire = key.wire();
        variants
            .iter()
            .find(|v| v.members.iter().any(|m| m == &wire))
            .or_else(|| variants.first())
            .map(|v| v.codes.as_slice())
    }
}

/// A control code is usable only if no segment of it is the unknown
/// marker `0` (vendor exports encode unresolved controls as `0` or
/// `a->0` style pairs).
pub(crate) fn code_is_known(code: &str) -> bool {
    !code.split("->").any(|part| part.trim() == "0")
}

// ============================================================================
// Configuration
// ============================================================================

/// Tunable constants of the engine.
///
/// The defaults reproduce the behavior of the production platform; they
/// are engineering constants, not physically-derived thresholds, and
/// downstream ranking depends on keeping them stable.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Minimum similarity (0-100) for plain athlete resolution.
    /// Default: 80.0
    pub resolve_threshold: f64,

    /// Minimum similarity (0-100) for strict contexts such as creating
    /// a post from a user profile. Default: 90.0
    pub strict_resolve_threshold: f64,

    /// Ratio substituted when a straight-line or reference duration is
    /// zero, to avoid division by zero. Default: 2.0
    pub fallback_ratio: f64,

    /// Speed below which a second counts toward a stop, in km/h.
    /// Default: 4.0
    pub stop_speed_kmh: f64,

    /// Consecutive seconds below [`stop_speed_kmh`](Self::stop_speed_kmh)
    /// required before a run counts as one stop. Default: 3
    pub stop_min_seconds: u32,

    /// Floor applied to per-second speed to keep pace bounded, in km/h.
    /// Default: 1.0
    pub min_speed_kmh: f64,

    /// Sex markers embedded in group labels, `(male, female)`.
    /// Default: `('М', 'Ж')` — the Cyrillic markers of the source exports.
    pub sex_markers: (char, char),
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            resolve_threshold: 80.0,
            strict_resolve_threshold: 90.0,
            fallback_ratio: 2.0,
            stop_speed_kmh: 4.0,
            stop_min_seconds: 3,
            min_speed_kmh: 1.0,
            sex_markers: ('М', 'Ж'),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Terminal errors of the public entry points.
///
/// Everything else (missing split data, GPS failures, degenerate ratios)
/// is recovered locally with a defined fallback.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// No athlete scored at or above the resolution threshold. Carries
    /// the best candidate and its score as a per-request diagnostic.
    #[error("no athlete matching {query:?} (best: {best_candidate:?} at {best_score:.0})")]
    AthleteNotFound {
        query: String,
        best_candidate: Option<String>,
        best_score: f64,
    },
}

// ============================================================================
// Tests
// ============================================================================
