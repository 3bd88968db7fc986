//! # Result Aggregation
//!
//! The crate's front door: resolve an athlete, build their split table
//! against the chosen cohort, optionally fuse a GPS track into it, and
//! package everything as a [`ResultPost`] ready for publication.
//!
//! GPS is strictly best-effort here. Any track failure (unparseable
//! file, unresolvable timezone, leg windows that disagree with the
//! official times) is logged and the post degrades to split-only with
//! `gps = false` and zeroed totals. The only terminal error is a failed
//! athlete resolution.

use chrono::{Duration, NaiveTime};
use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;

use crate::fusion::fuse;
use crate::resolver::{filter_cohort, resolve, CohortFilter};
use crate::splits::{compute_split_table, median, seconds, SplitLeg, SplitTable};
use crate::track::normalize_gpx;
use crate::{AnalysisConfig, AnalysisError, RouteSpec, SplitMatrix, FINISH_CODE};

/// Per-request knobs for [`compute_result`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultRequest<'a> {
    /// Raw GPX bytes, if the athlete uploaded a track.
    pub gpx: Option<&'a [u8]>,
    /// Start-of-day clock time in the race's local timezone. When
    /// absent, the track's first minute-aligned sample is used.
    pub start_time: Option<NaiveTime>,
    /// Expected total duration for the normalized grid. Defaults to the
    /// athlete's recorded finish time.
    pub expected: Option<Duration>,
    /// Who the athlete is ranked against.
    pub cohort_filter: CohortFilter,
    /// Use the strict resolution threshold (profile-initiated requests).
    pub strict: bool,
}

/// Split-table serialization in pandas' `orient="split"` layout:
/// parallel `columns` / `index` vectors plus one data row per leg.
/// Cells that do not apply hold the string `"-"`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableJson {
    pub columns: Vec<String>,
    pub index: Vec<String>,
    pub data: Vec<Vec<Value>>,
}

/// The finished analysis for one athlete.
#[derive(Debug, Clone, Serialize)]
pub struct ResultPost {
    /// Resolved athlete, `"NAME^GROUP"` wire form.
    pub athlete: String,
    pub group: String,
    /// Resolution similarity score, 0-100.
    pub score: f64,
    /// 1-based finish place within the cohort; 0 when the athlete has
    /// no recorded finish time.
    pub place: u32,
    /// Finish time in seconds; 0 without a recorded finish.
    pub result_secs: f64,
    /// Gap to the cohort's fastest finish, seconds.
    pub backlog_secs: f64,
    /// Median per-leg backlog percentage.
    pub median_backlog_pct: f64,
    /// Legs on which this athlete set the fastest cohort time.
    pub split_firsts: usize,
    pub leg_count: usize,
    /// Whether GPS metrics were fused in. Split columns are always
    /// present; the physical columns only when this is `true`.
    pub gps: bool,
    /// Sum of straight-line leg distances, meters (0 without GPS).
    pub length_straight_m: f64,
    /// Sum of ground leg distances, meters (0 without GPS).
    pub length_path_m: f64,
    /// Total ascent, meters (0 without GPS).
    pub climb_m: f64,
    /// Median of per-leg median paces, min/km (0 without GPS).
    pub pace_min_per_km: f64,
    pub table: TableJson,
}

/// Run the full pipeline for one athlete.
///
/// `query` is free text and is fuzzily matched against the matrix rows;
/// everything downstream uses the resolved key. See the module docs for
/// the degradation rules.
pub fn compute_result(
    query: &str,
    matrix: &SplitMatrix,
    routes: &RouteSpec,
    request: &ResultRequest<'_>,
    config: &AnalysisConfig,
) -> Result<ResultPost, AnalysisError> {
    let threshold = if request.strict {
        config.strict_resolve_threshold
    } else {
        config.resolve_threshold
    };
    let resolution = resolve(query, matrix, threshold)?;
    let key = resolution.key;
    debug!(
        "resolved {:?} -> {} (score {:.1})",
        query,
        key.wire(),
        resolution.score
    );

    let cohort = filter_cohort(matrix, &key.group, request.cohort_filter, config);
    let mut table = compute_split_table(&key, &cohort, routes, config);
    let result = matrix.finish_time(&key);

    let mut gps = false;
    if let (Some(bytes), Some(res)) = (request.gpx, result) {
        if table.has_data && res > Duration::zero() {
            let expected = request.expected.unwrap_or(res);
            let fused = normalize_gpx(bytes, request.start_time, expected, config)
                .and_then(|track| fuse(&mut table, &track, config));
            match fused {
                Ok(()) => gps = true,
                Err(err) => {
                    warn!("gps degraded for {}: {err}", key.wire());
                    for leg in &mut table.legs {
                        leg.metrics = None;
                    }
                }
            }
        }
    }

    let finishes = cohort.recorded_times(FINISH_CODE);
    let (place, backlog_secs) = match result {
        Some(res) => {
            let ahead = finishes.iter().filter(|(_, t)| *t < res).count();
            let best = finishes.iter().map(|(_, t)| *t).min().unwrap_or(res);
            (ahead as u32 + 1, seconds(res - best))
        }
        None => (0, 0.0),
    };

    let (length_straight_m, length_path_m, climb_m, pace_min_per_km) = if gps {
        let metrics: Vec<_> = table.legs.iter().filter_map(|l| l.metrics).collect();
        let mut paces: Vec<f64> = metrics.iter().map(|m| m.pace_median).collect();
        (
            metrics.iter().map(|m| m.straight_m).sum::<f64>().round(),
            metrics.iter().map(|m| m.path_m).sum::<f64>().round(),
            metrics.iter().map(|m| m.climb_m).sum::<f64>().round(),
            (median(&mut paces) * 100.0).round() / 100.0,
        )
    } else {
        (0.0, 0.0, 0.0, 0.0)
    };

    Ok(ResultPost {
        athlete: key.wire(),
        group: key.group.clone(),
        score: resolution.score,
        place,
        result_secs: result.map(seconds).unwrap_or(0.0),
        backlog_secs,
        median_backlog_pct: table.median_backlog_pct(),
        split_firsts: table.split_firsts(),
        leg_count: table.legs.len(),
        gps,
        length_straight_m,
        length_path_m,
        climb_m,
        pace_min_per_km,
        table: table_json(&table, gps),
    })
}

const SPLIT_COLUMNS: [&str; 6] = ["gt", "s", "bk", "p_bk", "l", "s_p"];
const GPS_COLUMNS: [&str; 17] = [
    "xy", "path", "dif", "a_dif", "climb", "down", "spde", "spdr", "spd_std", "spd_max",
    "spd_min", "stops", "pace", "stx", "sty", "fnx", "fny",
];

/// Serialize a split table. Physical columns appear only when `gps` is
/// set; durations serialize as fractional seconds.
fn table_json(table: &SplitTable, gps: bool) -> TableJson {
    let mut columns: Vec<String> = SPLIT_COLUMNS.iter().map(|c| c.to_string()).collect();
    if gps {
        columns.extend(GPS_COLUMNS.iter().map(|c| c.to_string()));
    }

    let index = table.legs.iter().map(|l| l.label.clone()).collect();
    let data = table
        .legs
        .iter()
        .map(|leg| {
            let mut row = split_row(leg);
            if gps {
                row.extend(gps_row(leg));
            }
            row
        })
        .collect();

    TableJson {
        columns,
        index,
        data,
    }
}

fn split_row(leg: &SplitLeg) -> Vec<Value> {
    vec![
        opt_num(leg.cumulative.map(seconds)),
        opt_num(leg.duration.map(seconds)),
        opt_num(leg.backlog.map(seconds)),
        opt_num(leg.backlog_pct),
        leg.leader
            .as_deref()
            .map(Value::from)
            .unwrap_or_else(dash),
        leg.rank.map(Value::from).unwrap_or_else(dash),
    ]
}

fn gps_row(leg: &SplitLeg) -> Vec<Value> {
    let Some(m) = leg.metrics else {
        return vec![dash(); GPS_COLUMNS.len()];
    };
    vec![
        Value::from(m.straight_m),
        Value::from(m.path_m),
        // `dif` is the path/straight coefficient; `a_dif` the net
        // altitude change.
        Value::from(m.path_ratio),
        Value::from(m.elevation_delta_m),
        Value::from(m.climb_m),
        Value::from(m.descent_m),
        Value::from(m.speed_efficiency_kmh),
        Value::from(m.speed_real_kmh),
        Value::from(m.speed_std),
        Value::from(m.speed_max_kmh),
        Value::from(m.speed_min_kmh),
        Value::from(m.stop_count),
        Value::from(m.pace_median),
        Value::from(m.start_lat),
        Value::from(m.start_lon),
        Value::from(m.end_lat),
        Value::from(m.end_lon),
    ]
}

fn opt_num(v: Option<f64>) -> Value {
    v.map(Value::from).unwrap_or_else(dash)
}

fn dash() -> Value {
    Value::from("-")
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::LegMetrics;
    use crate::{AthleteKey, CourseVariant};

    fn secs(s: i64) -> Option<Duration> {
        Some(Duration::seconds(s))
    }

    fn fixture() -> (SplitMatrix, RouteSpec) {
        let mut matrix = SplitMatrix::new();
        matrix.push_row(
            AthleteKey::new("Ivanov Ivan", "M21"),
            vec![
                ("31".into(), secs(600)),
                ("45".into(), secs(1200)),
                ("RES".into(), secs(3600)),
            ],
        );
        matrix.push_row(
            AthleteKey::new("Petrov Petr", "M21"),
            vec![
                ("31".into(), secs(650)),
                ("45".into(), secs(1150)),
                ("RES".into(), secs(3700)),
            ],
        );

        let mut routes = RouteSpec::new();
        routes.insert_variant(
            "M21",
            CourseVariant {
                codes: vec!["31".into(), "45".into()],
                members: vec![],
            },
        );
        (matrix, routes)
    }

    fn config() -> AnalysisConfig {
        AnalysisConfig::default()
    }

    #[test]
    fn test_winner_gets_place_one_and_zero_backlog() {
        let (matrix, routes) = fixture();
        let post = compute_result(
            "Ivanov Ivan",
            &matrix,
            &routes,
            &ResultRequest::default(),
            &config(),
        )
        .unwrap();

        assert_eq!(post.place, 1);
        assert_eq!(post.result_secs, 3600.0);
        assert_eq!(post.backlog_secs, 0.0);
        assert_eq!(post.leg_count, 2);
        assert!(!post.gps);
        assert_eq!(post.length_path_m, 0.0);
    }

    #[test]
    fn test_runner_up_backlog_is_gap_to_fastest_finish() {
        let (matrix, routes) = fixture();
        let post = compute_result(
            "Petrov Petr",
            &matrix,
            &routes,
            &ResultRequest::default(),
            &config(),
        )
        .unwrap();

        assert_eq!(post.place, 2);
        assert_eq!(post.backlog_secs, 100.0);
        // Petrov owns leg 2 (1150 vs 1200).
        assert_eq!(post.split_firsts, 1);
    }

    #[test]
    fn test_bad_gpx_degrades_to_split_only() {
        let (matrix, routes) = fixture();
        let request = ResultRequest {
            gpx: Some(b"definitely not gpx"),
            ..ResultRequest::default()
        };
        let post = compute_result("Ivanov Ivan", &matrix, &routes, &request, &config()).unwrap();

        assert!(!post.gps);
        assert_eq!(post.length_straight_m, 0.0);
        assert_eq!(post.climb_m, 0.0);
        assert_eq!(post.pace_min_per_km, 0.0);
        // Split side is untouched by the degraded track.
        assert_eq!(post.place, 1);
        assert_eq!(post.table.columns.len(), SPLIT_COLUMNS.len());
    }

    #[test]
    fn test_strict_threshold_rejects_loose_match() {
        let (matrix, routes) = fixture();
        let request = ResultRequest {
            strict: true,
            ..ResultRequest::default()
        };
        // Two edits off "IVANOV IVAN": ~82, over 80 but under 90.
        let err = compute_result("Ivanov Iv", &matrix, &routes, &request, &config()).unwrap_err();
        assert!(matches!(err, AnalysisError::AthleteNotFound { .. }));
    }

    #[test]
    fn test_table_json_layout() {
        let (matrix, routes) = fixture();
        let post = compute_result(
            "Ivanov Ivan",
            &matrix,
            &routes,
            &ResultRequest::default(),
            &config(),
        )
        .unwrap();

        assert_eq!(post.table.columns, SPLIT_COLUMNS.to_vec());
        assert_eq!(post.table.index.len(), 2);
        assert_eq!(post.table.index[0], "#1 [31]");
        let row = &post.table.data[0];
        assert_eq!(row.len(), SPLIT_COLUMNS.len());
        assert_eq!(row[0], Value::from(600.0)); // gt
        assert_eq!(row[1], Value::from(600.0)); // s
        assert_eq!(row[5], Value::from(1u32)); // s_p
    }

    /// The `dif` column is the path/straight coefficient and `a_dif`
    /// the net altitude change, matching the transport format the
    /// result pages consume.
    #[test]
    fn test_gps_columns_carry_ratio_and_altitude_difference() {
        let metrics = LegMetrics {
            straight_m: 100.0,
            path_m: 120.0,
            path_ratio: 1.2,
            elevation_delta_m: 18.0,
            climb_m: 20.0,
            descent_m: -2.0,
            speed_efficiency_kmh: 6.0,
            speed_real_kmh: 7.2,
            speed_std: 0.5,
            speed_max_kmh: 9.0,
            speed_min_kmh: 4.0,
            pace_median: 8.0,
            stop_count: 1,
            start_lat: 55.0,
            start_lon: 37.0,
            end_lat: 55.001,
            end_lon: 37.0,
        };
        let table = SplitTable {
            legs: vec![SplitLeg {
                label: "#1 [31]".into(),
                code: Some("31".into()),
                cumulative: Some(Duration::seconds(60)),
                duration: Some(Duration::seconds(60)),
                backlog: None,
                backlog_pct: None,
                leader: None,
                rank: None,
                metrics: Some(metrics),
            }],
            has_data: true,
        };
        let json = table_json(&table, true);

        let dif = SPLIT_COLUMNS.len() + 2;
        assert_eq!(json.columns[dif], "dif");
        assert_eq!(json.columns[dif + 1], "a_dif");
        assert_eq!(json.data[0][dif], Value::from(1.2));
        assert_eq!(json.data[0][dif + 1], Value::from(18.0));
    }

    #[test]
    fn test_table_json_span_cells_are_dashes() {
        let table = SplitTable {
            legs: vec![SplitLeg {
                label: "#1->#3 no data".into(),
                code: None,
                cumulative: None,
                duration: None,
                backlog: None,
                backlog_pct: None,
                leader: None,
                rank: None,
                metrics: None,
            }],
            has_data: true,
        };
        let json = table_json(&table, true);
        assert_eq!(json.columns.len(), SPLIT_COLUMNS.len() + GPS_COLUMNS.len());
        assert!(json.data[0].iter().all(|v| *v == Value::from("-")));
    }

    #[test]
    fn test_unknown_athlete_carries_best_candidate() {
        let (matrix, routes) = fixture();
        let err = compute_result(
            "Completely Different",
            &matrix,
            &routes,
            &ResultRequest::default(),
            &config(),
        )
        .unwrap_err();
        let AnalysisError::AthleteNotFound {
            query,
            best_candidate,
            best_score,
        } = err;
        assert_eq!(query, "Completely Different");
        assert!(best_candidate.is_some());
        assert!(best_score < config().resolve_threshold);
    }
}
