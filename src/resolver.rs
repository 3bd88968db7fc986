//! # Athlete Resolution & Cohort Filtering
//!
//! Matches a free-text athlete name against the result matrix index and
//! narrows the matrix down to the comparison cohort used for ranking.
//!
//! Resolution is fuzzy: queries come from user profiles and search boxes
//! and rarely match the export spelling exactly. Scores are on a 0-100
//! scale; the thresholds (80 plain, 90 strict) are part of the engine's
//! contract since downstream ranking depends on stable resolution.

use log::warn;
use strsim::normalized_levenshtein;

use crate::{AnalysisConfig, AnalysisError, AthleteKey, SplitMatrix};

/// Outcome of a successful resolution: the matched key exactly as stored
/// in the matrix, plus the similarity score that selected it.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub key: AthleteKey,
    pub score: f64,
}

/// Which rows of the matrix form the comparison cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CohortFilter {
    /// Rank against the full result set.
    #[default]
    Unfiltered,
    /// Rank against athletes of the same group.
    SameGroup,
    /// Rank against athletes whose group carries the same sex marker.
    SameSex,
}

/// Similarity of two names on a 0-100 scale.
///
/// Normalized Levenshtein over the uppercased strings; an exact match is
/// exactly 100.0.
pub fn similarity(a: &str, b: &str) -> f64 {
    normalized_levenshtein(&a.to_uppercase(), &b.to_uppercase()) * 100.0
}

/// Resolve a free-text name against the matrix index.
///
/// Every athlete name (group suffix ignored) is scored against the query;
/// the maximum wins, ties going to the first maximum in matrix row order.
/// A best score below `threshold` fails with
/// [`AnalysisError::AthleteNotFound`] carrying the best candidate and its
/// score as a per-request diagnostic.
///
/// # Example
///
/// ```rust
/// use chrono::Duration;
/// use split_analyzer::{AthleteKey, SplitMatrix, resolver::resolve};
///
/// let mut matrix = SplitMatrix::new();
/// matrix.push_row(
///     AthleteKey::new("Ivanov Ivan", "M21"),
///     vec![("RES".into(), Some(Duration::seconds(3600)))],
/// );
///
/// let resolution = resolve("ivanov ivan", &matrix, 80.0).unwrap();
/// assert_eq!(resolution.key, AthleteKey::new("Ivanov Ivan", "M21"));
/// assert_eq!(resolution.score, 100.0);
/// ```
pub fn resolve(
    query: &str,
    matrix: &SplitMatrix,
    threshold: f64,
) -> Result<Resolution, AnalysisError> {
    let query = query.trim();
    let mut best: Option<(&AthleteKey, f64)> = None;

    for key in matrix.athletes() {
        let score = similarity(query, &key.name);
        // Strict comparison keeps the first maximum in row order.
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((key, score));
        }
    }

    match best {
        Some((key, score)) if score >= threshold => Ok(Resolution {
            key: key.clone(),
            score,
        }),
        Some((key, score)) => Err(AnalysisError::AthleteNotFound {
            query: query.to_string(),
            best_candidate: Some(key.name.clone()),
            best_score: score,
        }),
        None => Err(AnalysisError::AthleteNotFound {
            query: query.to_string(),
            best_candidate: None,
            best_score: 0.0,
        }),
    }
}

/// Narrow the matrix to the comparison cohort.
///
/// `group` is the resolved athlete's group label; sex is derived from the
/// configured markers embedded in it. The filter fails open: when a sex
/// marker is absent or the filtered cohort ends up empty, the unfiltered
/// matrix is returned — ranking against a larger cohort beats a hard
/// failure.
pub fn filter_cohort(
    matrix: &SplitMatrix,
    group: &str,
    filter: CohortFilter,
    config: &AnalysisConfig,
) -> SplitMatrix {
    let group = group.trim().to_uppercase();
    let filtered = match filter {
        CohortFilter::Unfiltered => return matrix.clone(),
        CohortFilter::SameGroup => matrix.filtered(|key| key.group == group),
        CohortFilter::SameSex => {
            let (male, female) = config.sex_markers;
            let marker = if group.contains(male) {
                male
            } else if group.contains(female) {
                female
            } else {
                // A group label carrying neither marker ("OPEN" style
                // classes) ranks against the full matrix.
                return matrix.clone();
            };
            matrix.filtered(|key| key.group.contains(marker))
        }
    };

    if filtered.is_empty() {
        warn!(
            "cohort filter {:?} for group {:?} selected no rows, failing open",
            filter, group
        );
        return matrix.clone();
    }
    filtered
}

// =============================================================================
// Unit Tests
// =============================================================================
