//! # Split Table Builder
//!
//! Builds the per-leg split table for one athlete within a comparison
//! cohort: cumulative and leg times, backlog to the leg's fastest time,
//! backlog percentage, leg leader and leg rank.
//!
//! ## Algorithm
//! 1. Classify each course code as recorded or unrecorded against the
//!    athlete's matrix row (codes absent from the matrix, or carrying the
//!    unknown-control marker, count as unrecorded).
//! 2. Collapse each maximal run of unrecorded codes into one labeled
//!    "no data" leg spanning its boundary recorded codes.
//! 3. Cumulative times run forward before the first gap and backward
//!    from the finish time after the last gap; between two gaps they are
//!    unknowable and stay empty.
//! 4. Per recorded leg, compare against the cohort: signed backlog and
//!    backlog percentage, leader label, 1-based rank.
//!
//! An athlete with a finish time but no recorded intermediate controls
//! yields an *empty* table flagged `has_data = false` — that is a valid
//! result (DNS or punch failure), not an error.

use chrono::Duration;
use log::{debug, warn};

use crate::fusion::LegMetrics;
use crate::{code_is_known, AnalysisConfig, AthleteKey, RouteSpec, SplitMatrix, FINISH_CODE};

/// One row of the split table: a course leg, or a "no data" span
/// replacing a run of unrecorded controls.
#[derive(Debug, Clone, Default)]
pub struct SplitLeg {
    /// `"#3 [45]"` for a recorded leg; `"#2->#4 no data"` for a span,
    /// labeled with the boundary control indices it replaces.
    pub label: String,
    /// Control code ending the leg; `None` for a "no data" span.
    pub code: Option<String>,
    /// Elapsed time from the start at the end of this leg.
    pub cumulative: Option<Duration>,
    /// Raw leg duration.
    pub duration: Option<Duration>,
    /// Signed gap to the cohort's fastest time on this leg: negative
    /// margin to the runner-up when this athlete owns the leg, positive
    /// gap to the fastest otherwise.
    pub backlog: Option<Duration>,
    /// The same gap as a percentage of the reference time.
    pub backlog_pct: Option<f64>,
    /// Display label of the cohort member owning the fastest leg time.
    pub leader: Option<String>,
    /// 1-based rank of this athlete's leg time within the cohort.
    pub rank: Option<u32>,
    /// Physical metrics, attached by GPS fusion when a track is present.
    pub metrics: Option<LegMetrics>,
}

impl SplitLeg {
    /// Whether this row is a recorded leg rather than a "no data" span.
    pub fn is_recorded(&self) -> bool {
        self.code.is_some()
    }
}

/// Ordered split table for one athlete. `has_data` is false when the
/// athlete had no recorded intermediate controls (the table is empty).
#[derive(Debug, Clone, Default)]
pub struct SplitTable {
    pub legs: Vec<SplitLeg>,
    pub has_data: bool,
}

impl SplitTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Legs where this athlete posted the cohort's fastest time.
    pub fn split_firsts(&self) -> usize {
        self.legs.iter().filter(|l| l.rank == Some(1)).count()
    }

    /// Median of the non-missing leg backlog percentages — the headline
    /// backlog metric of the final record. 0.0 when no leg has one.
    pub fn median_backlog_pct(&self) -> f64 {
        let mut values: Vec<f64> = self.legs.iter().filter_map(|l| l.backlog_pct).collect();
        median(&mut values)
    }
}

/// Median with linear midpoint for even counts; 0.0 for empty input.
pub(crate) fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        (values[mid - 1] + values[mid]) / 2.0
    }
}

/// Signed `MM:SS` / `HH:MM:SS` rendering of a duration, the display form
/// used by result tables. Positive values carry a leading space so
/// columns line up against negative ones.
pub fn format_signed(d: Duration) -> String {
    let total = d.num_seconds();
    let sign = if total < 0 { '-' } else { ' ' };
    let total = total.abs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h == 0 {
        format!("{sign}{m:02}:{s:02}")
    } else {
        format!("{sign}{h:02}:{m:02}:{s:02}")
    }
}

/// Build the split table for `key` against `cohort`.
///
/// The course comes from `routes`; a missing course or matrix row yields
/// an empty table rather than an error, per the crate's best-effort
/// policy. When the course's final code is [`FINISH_CODE`], that
/// position's leg duration is derived from the finish time minus the
/// preceding recorded legs and its comparisons run over the cohort's
/// finish column.
pub fn compute_split_table(
    key: &AthleteKey,
    cohort: &SplitMatrix,
    routes: &RouteSpec,
    config: &AnalysisConfig,
) -> SplitTable {
    let Some(course) = routes.course_for(key) else {
        warn!("no course for group {:?}, returning empty table", key.group);
        return SplitTable::empty();
    };
    let Some(row) = cohort.row(key) else {
        warn!("{} missing from cohort, returning empty table", key.wire());
        return SplitTable::empty();
    };

    let n = course.len();
    let res_total = cohort.finish_time(key);
    let anchor = |i: usize| i == n - 1 && course[i] == FINISH_CODE;

    let recorded: Vec<bool> = course
        .iter()
        .map(|code| code_is_known(code) && row.get(code).copied().flatten().is_some())
        .collect();

    let has_intermediate = course
        .iter()
        .zip(&recorded)
        .any(|(code, rec)| *rec && code != FINISH_CODE);
    if !has_intermediate {
        debug!("{} has no recorded intermediate controls", key.wire());
        return SplitTable::empty();
    }

    // Raw leg durations; the finish anchor is derived below.
    let mut duration: Vec<Option<Duration>> = (0..n)
        .map(|i| {
            if !recorded[i] || anchor(i) {
                None
            } else {
                row.get(&course[i]).copied().flatten()
            }
        })
        .collect();

    let first_gap = recorded.iter().position(|r| !r);
    let last_gap = recorded.iter().rposition(|r| !r);

    // Cumulative times: forward up to the first gap...
    let mut cumulative: Vec<Option<Duration>> = vec![None; n];
    let mut running = Duration::zero();
    for i in 0..first_gap.unwrap_or(n) {
        if anchor(i) {
            cumulative[i] = res_total;
            duration[i] = res_total.map(|r| r - running);
        } else if let Some(d) = duration[i] {
            running += d;
            cumulative[i] = Some(running);
        }
    }

    // ...and backward from the finish time after the last gap.
    if let Some(lg) = last_gap {
        let mut tail = Duration::zero();
        let mut chain_ok = true;
        for i in ((lg + 1)..n).rev() {
            if !chain_ok {
                continue;
            }
            cumulative[i] = res_total.map(|r| r - tail);
            match duration[i] {
                Some(d) => tail += d,
                // The finish anchor's own duration is unknowable across
                // a gap; cumulative times before it stay empty.
                None => chain_ok = false,
            }
        }
    }

    let mut legs = Vec::with_capacity(n);
    let mut i = 0;
    while i < n {
        if !recorded[i] {
            // Collapse the maximal unrecorded run into one span, labeled
            // with the 1-based boundary indices it replaces (0 = start).
            let start = i;
            while i < n && !recorded[i] {
                i += 1;
            }
            legs.push(SplitLeg {
                label: format!("#{}->#{} no data", start, i + 1),
                ..SplitLeg::default()
            });
            continue;
        }

        let code = &course[i];
        let value = if anchor(i) {
            res_total
        } else {
            row.get(code).copied().flatten()
        };
        let comparison = value.map(|t| leg_comparison(t, cohort, code, config));

        let (backlog, backlog_pct, leader, rank) = match comparison {
            Some(c) => (Some(c.backlog), Some(c.backlog_pct), Some(c.leader), Some(c.rank)),
            None => (None, None, None, None),
        };
        legs.push(SplitLeg {
            label: format!("#{} [{}]", i + 1, code),
            code: Some(code.clone()),
            cumulative: cumulative[i],
            duration: duration[i],
            backlog,
            backlog_pct,
            leader,
            rank,
            metrics: None,
        });
        i += 1;
    }

    SplitTable {
        legs,
        has_data: true,
    }
}

struct LegComparison {
    backlog: Duration,
    backlog_pct: f64,
    leader: String,
    rank: u32,
}

/// Compare one leg time against the cohort's column for the same code.
fn leg_comparison(
    t: Duration,
    cohort: &SplitMatrix,
    code: &str,
    config: &AnalysisConfig,
) -> LegComparison {
    let times = cohort.recorded_times(code);
    let mut sorted: Vec<Duration> = times.iter().map(|(_, d)| *d).collect();
    sorted.sort();

    let best = sorted.first().copied().unwrap_or(t);
    let fastest = t <= best;
    // The owner of a leg is measured against the runner-up; everyone
    // else against the fastest time.
    let reference = if fastest {
        sorted.get(1).copied().unwrap_or(t)
    } else {
        best
    };

    let backlog = t - reference;
    let t_secs = seconds(t);
    let ref_secs = seconds(reference);
    let ratio = if ref_secs == 0.0 {
        config.fallback_ratio
    } else {
        t_secs / ref_secs
    };
    let backlog_pct = ((ratio - 1.0) * 100.0).round();

    // First strict minimum in row order owns the leg.
    let leader = times
        .iter()
        .min_by_key(|(_, d)| *d)
        .map(|(k, _)| k.display_label())
        .unwrap_or_default();

    let rank = sorted.iter().filter(|d| **d < t).count() as u32 + 1;

    LegComparison {
        backlog,
        backlog_pct,
        leader,
        rank,
    }
}

pub(crate) fn seconds(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CourseVariant;

    fn secs(s: i64) -> Option<Duration> {
        Some(Duration::seconds(s))
    }

    fn simple_routes(group: &str, codes: &[&str]) -> RouteSpec {
        let mut routes = RouteSpec::new();
        routes.insert_variant(
            group,
            CourseVariant {
                codes: codes.iter().map(|c| c.to_string()).collect(),
                members: vec![],
            },
        );
        routes
    }

    /// Scenario: a single competitor resolves with rank 1 and zero
    /// backlog on every leg.
    #[test]
    fn test_single_competitor_table() {
        let key = AthleteKey::new("Ivanov", "M21");
        let mut matrix = SplitMatrix::new();
        matrix.push_row(
            key.clone(),
            vec![
                ("CP1".into(), secs(600)),
                ("CP2".into(), secs(1200)),
                ("RES".into(), secs(3600)),
            ],
        );
        let routes = simple_routes("M21", &["CP1", "CP2"]);
        let table = compute_split_table(&key, &matrix, &routes, &AnalysisConfig::default());

        assert!(table.has_data);
        assert_eq!(table.legs.len(), 2);
        for leg in &table.legs {
            assert_eq!(leg.rank, Some(1));
            assert_eq!(leg.backlog, Some(Duration::zero()));
            assert_eq!(leg.backlog_pct, Some(0.0));
        }
        assert_eq!(table.legs[0].cumulative, secs(600));
        assert_eq!(table.legs[1].cumulative, secs(1800));
    }

    /// The finish anchor derives its leg duration from the total, so a
    /// fully recorded course sums exactly to the finish time.
    #[test]
    fn test_leg_durations_sum_to_finish_time() {
        let key = AthleteKey::new("Ivanov", "M21");
        let mut matrix = SplitMatrix::new();
        matrix.push_row(
            key.clone(),
            vec![
                ("CP1".into(), secs(600)),
                ("CP2".into(), secs(1200)),
                ("RES".into(), secs(3600)),
            ],
        );
        let routes = simple_routes("M21", &["CP1", "CP2", "RES"]);
        let table = compute_split_table(&key, &matrix, &routes, &AnalysisConfig::default());

        assert_eq!(table.legs.len(), 3);
        assert_eq!(table.legs[2].duration, secs(1800));
        assert_eq!(table.legs[2].cumulative, secs(3600));
        let total = table
            .legs
            .iter()
            .filter_map(|l| l.duration)
            .fold(Duration::zero(), |acc, d| acc + d);
        assert_eq!(total, Duration::seconds(3600));
    }

    #[test]
    fn test_backlog_signs_and_leader() {
        let fast = AthleteKey::new("Fast", "M21");
        let slow = AthleteKey::new("Slow", "M21");
        let mut matrix = SplitMatrix::new();
        matrix.push_row(
            fast.clone(),
            vec![("CP1".into(), secs(100)), ("RES".into(), secs(100))],
        );
        matrix.push_row(
            slow.clone(),
            vec![("CP1".into(), secs(130)), ("RES".into(), secs(130))],
        );
        let routes = simple_routes("M21", &["CP1"]);
        let config = AnalysisConfig::default();

        let winner = compute_split_table(&fast, &matrix, &routes, &config);
        let leg = &winner.legs[0];
        // Negative margin to the runner-up for the leg owner.
        assert_eq!(leg.backlog, Some(Duration::seconds(-30)));
        assert_eq!(leg.backlog_pct, Some(-23.0));
        assert_eq!(leg.rank, Some(1));
        assert_eq!(leg.leader.as_deref(), Some("FAST [M21]"));

        let loser = compute_split_table(&slow, &matrix, &routes, &config);
        let leg = &loser.legs[0];
        // Positive gap to the fastest for everyone else.
        assert_eq!(leg.backlog, Some(Duration::seconds(30)));
        assert_eq!(leg.backlog_pct, Some(30.0));
        assert_eq!(leg.rank, Some(2));
        assert_eq!(leg.leader.as_deref(), Some("FAST [M21]"));
    }

    /// A zero-duration reference falls back to the fixed 2.0 ratio
    /// instead of dividing by zero.
    #[test]
    fn test_zero_reference_uses_fallback_ratio() {
        let a = AthleteKey::new("A", "M21");
        let b = AthleteKey::new("B", "M21");
        let mut matrix = SplitMatrix::new();
        matrix.push_row(
            a.clone(),
            vec![("CP1".into(), secs(10)), ("RES".into(), secs(10))],
        );
        matrix.push_row(
            b.clone(),
            vec![("CP1".into(), secs(0)), ("RES".into(), secs(10))],
        );
        let routes = simple_routes("M21", &["CP1"]);
        let table = compute_split_table(&a, &matrix, &routes, &AnalysisConfig::default());

        // ratio 2.0 -> (2.0 - 1.0) * 100
        assert_eq!(table.legs[0].backlog_pct, Some(100.0));
    }

    /// Scenario: an unrecorded control collapses its two adjacent legs
    /// into one "no data" span labeled with the boundary indices.
    #[test]
    fn test_missing_control_collapses_to_span() {
        let key = AthleteKey::new("Ivanov", "M21");
        let mut matrix = SplitMatrix::new();
        matrix.push_row(
            key.clone(),
            vec![
                ("CP7".into(), secs(100)),
                ("CP8".into(), secs(110)),
                ("CP9".into(), None),
                ("CP10".into(), secs(120)),
                ("RES".into(), secs(500)),
            ],
        );
        let routes = simple_routes("M21", &["CP7", "CP8", "CP9", "CP10"]);
        let table = compute_split_table(&key, &matrix, &routes, &AnalysisConfig::default());

        assert_eq!(table.legs.len(), 4); // CP7, CP8, span, CP10
        let span = &table.legs[2];
        assert!(!span.is_recorded());
        assert_eq!(span.label, "#2->#4 no data");
        assert_eq!(span.duration, None);
        assert_eq!(span.rank, None);

        // Forward cumulative before the gap, backward after it.
        assert_eq!(table.legs[1].cumulative, secs(210));
        assert_eq!(table.legs[3].cumulative, secs(500) /* RES - 0 */);
    }

    #[test]
    fn test_two_gaps_leave_middle_cumulative_unknown() {
        let key = AthleteKey::new("Ivanov", "M21");
        let mut matrix = SplitMatrix::new();
        matrix.push_row(
            key.clone(),
            vec![
                ("C1".into(), secs(100)),
                ("C2".into(), None),
                ("C3".into(), secs(100)),
                ("C4".into(), None),
                ("C5".into(), secs(100)),
                ("RES".into(), secs(600)),
            ],
        );
        let routes = simple_routes("M21", &["C1", "C2", "C3", "C4", "C5"]);
        let table = compute_split_table(&key, &matrix, &routes, &AnalysisConfig::default());

        assert_eq!(table.legs.len(), 5);
        assert_eq!(table.legs[0].cumulative, secs(100)); // forward
        assert_eq!(table.legs[2].cumulative, None); // between gaps
        assert_eq!(table.legs[4].cumulative, secs(600)); // backward
    }

    /// Only a finish time on record: an explicitly empty table, not an
    /// error.
    #[test]
    fn test_finish_only_row_yields_empty_table() {
        let key = AthleteKey::new("Ivanov", "M21");
        let mut matrix = SplitMatrix::new();
        matrix.push_row(key.clone(), vec![("RES".into(), secs(3600))]);
        let routes = simple_routes("M21", &["CP1", "CP2"]);
        let table = compute_split_table(&key, &matrix, &routes, &AnalysisConfig::default());

        assert!(!table.has_data);
        assert!(table.legs.is_empty());
    }

    #[test]
    fn test_unknown_marker_code_is_unrecorded() {
        let key = AthleteKey::new("Ivanov", "M21");
        let mut matrix = SplitMatrix::new();
        matrix.push_row(
            key.clone(),
            vec![
                ("31".into(), secs(100)),
                ("31->0".into(), secs(50)),
                ("45".into(), secs(100)),
                ("RES".into(), secs(250)),
            ],
        );
        let routes = simple_routes("M21", &["31", "31->0", "45"]);
        let table = compute_split_table(&key, &matrix, &routes, &AnalysisConfig::default());

        // The marker code is treated as unrecorded even though a value
        // exists for it.
        assert_eq!(table.legs.len(), 3);
        assert!(!table.legs[1].is_recorded());
    }

    #[test]
    fn test_split_firsts_and_median_pct() {
        let mut table = SplitTable {
            legs: vec![
                SplitLeg {
                    rank: Some(1),
                    backlog_pct: Some(-5.0),
                    ..SplitLeg::default()
                },
                SplitLeg {
                    rank: Some(2),
                    backlog_pct: Some(10.0),
                    ..SplitLeg::default()
                },
                SplitLeg::default(), // no-data span
                SplitLeg {
                    rank: Some(1),
                    backlog_pct: Some(-2.0),
                    ..SplitLeg::default()
                },
            ],
            has_data: true,
        };
        assert_eq!(table.split_firsts(), 2);
        assert_eq!(table.median_backlog_pct(), -2.0);

        table.legs.clear();
        assert_eq!(table.median_backlog_pct(), 0.0);
    }

    #[test]
    fn test_format_signed() {
        assert_eq!(format_signed(Duration::seconds(75)), " 01:15");
        assert_eq!(format_signed(Duration::seconds(-75)), "-01:15");
        assert_eq!(format_signed(Duration::seconds(3675)), " 01:01:15");
        assert_eq!(format_signed(Duration::zero()), " 00:00");
    }
}
