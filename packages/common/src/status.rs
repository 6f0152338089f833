//! Submission status and grading-result alphabets.
//!
//! Two independent orderings live here and must not be collapsed into one:
//! the bitmask a worker reports for a single testcase decodes under one
//! priority (§4.3), while the overall submission result is the *max* over all
//! testcase results under a different, fixed precedence (§3). Both are
//! preserved exactly as specified even though they disagree on where `OLE`
//! and `TLE` rank relative to each other.

#[cfg(feature = "sea-orm")]
use sea_orm::prelude::StringLen;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a submission row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(
    feature = "sea-orm",
    derive(sea_orm::DeriveActiveEnum, sea_orm::EnumIter),
    sea_orm(rs_type = "String", db_type = "String(StringLen::None)")
)]
#[serde(rename_all = "PascalCase")]
pub enum Status {
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "Queued"))]
    Queued,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "Processing"))]
    Processing,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "Grading"))]
    Grading,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "Done"))]
    Done,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "CompileError"))]
    CompileError,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "InternalError"))]
    InternalError,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "Aborted"))]
    Aborted,
}

impl Status {
    /// Terminal statuses are never mutated again except by an external rejudge.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::CompileError | Self::InternalError | Self::Aborted
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "Queued",
            Self::Processing => "Processing",
            Self::Grading => "Grading",
            Self::Done => "Done",
            Self::CompileError => "CompileError",
            Self::InternalError => "InternalError",
            Self::Aborted => "Aborted",
        };
        f.write_str(s)
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::Queued
    }
}

/// A single testcase or overall-submission grading result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(
    feature = "sea-orm",
    derive(sea_orm::DeriveActiveEnum, sea_orm::EnumIter),
    sea_orm(rs_type = "String", db_type = "String(StringLen::None)")
)]
pub enum Result {
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "AC"))]
    Ac,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "WA"))]
    Wa,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "TLE"))]
    Tle,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "MLE"))]
    Mle,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "OLE"))]
    Ole,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "IR"))]
    Ir,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "RTE"))]
    Rte,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "CE"))]
    Ce,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "IE"))]
    Ie,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "SC"))]
    Sc,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "AB"))]
    Ab,
}

impl Result {
    /// Decode a worker's per-testcase status bitmask into a single verdict.
    ///
    /// Bit values and priority come straight from §4.3: a worker may (in
    /// principle) set more than one bit, so the highest-priority set bit
    /// wins. `0` with no other bit set decodes to `AC`.
    pub fn from_testcase_bitmask(bits: u32) -> Self {
        const TLE: u32 = 4;
        const MLE: u32 = 8;
        const OLE: u32 = 64;
        const RTE: u32 = 2;
        const IR: u32 = 16;
        const WA: u32 = 1;
        const SC: u32 = 32;

        if bits & TLE != 0 {
            Self::Tle
        } else if bits & MLE != 0 {
            Self::Mle
        } else if bits & OLE != 0 {
            Self::Ole
        } else if bits & RTE != 0 {
            Self::Rte
        } else if bits & IR != 0 {
            Self::Ir
        } else if bits & WA != 0 {
            Self::Wa
        } else if bits & SC != 0 {
            Self::Sc
        } else {
            Self::Ac
        }
    }

    /// Rank used for the overall-submission aggregate: `SC < AC < WA < MLE <
    /// TLE < IR < RTE < OLE`. `CE`/`IE`/`AB` never arise from testcase
    /// aggregation (they are whole-submission terminal results) and rank
    /// alongside `SC` so they never accidentally dominate a max-fold.
    fn aggregate_rank(self) -> u8 {
        match self {
            Self::Sc | Self::Ce | Self::Ie | Self::Ab => 0,
            Self::Ac => 1,
            Self::Wa => 2,
            Self::Mle => 3,
            Self::Tle => 4,
            Self::Ir => 5,
            Self::Rte => 6,
            Self::Ole => 7,
        }
    }

    /// Fold two verdicts under the §3 aggregate precedence, returning the max.
    pub fn aggregate_max(self, other: Self) -> Self {
        if other.aggregate_rank() > self.aggregate_rank() {
            other
        } else {
            self
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ac => "AC",
            Self::Wa => "WA",
            Self::Tle => "TLE",
            Self::Mle => "MLE",
            Self::Ole => "OLE",
            Self::Ir => "IR",
            Self::Rte => "RTE",
            Self::Ce => "CE",
            Self::Ie => "IE",
            Self::Sc => "SC",
            Self::Ab => "AB",
        }
    }
}

impl fmt::Display for Result {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Round to 3 decimal places the way the submission store persists points.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Compute `points` per the §3 invariant: `round(case_points / case_total *
/// problem_points, 3)` when `case_total > 0`, else `0`; clamped to `0` when
/// the problem is non-partial and the result isn't the full score.
pub fn compute_points(
    case_points: f64,
    case_total: f64,
    problem_points: f64,
    partial: bool,
) -> f64 {
    if case_total <= 0.0 {
        return 0.0;
    }
    let points = round3(case_points / case_total * problem_points);
    if !partial && points != problem_points {
        0.0
    } else {
        points
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmask_decode_priority() {
        // TLE beats everything else when bits overlap.
        assert_eq!(Result::from_testcase_bitmask(4 | 1), Result::Tle);
        assert_eq!(Result::from_testcase_bitmask(8 | 2), Result::Mle);
        assert_eq!(Result::from_testcase_bitmask(64 | 32), Result::Ole);
        assert_eq!(Result::from_testcase_bitmask(2 | 32), Result::Rte);
        assert_eq!(Result::from_testcase_bitmask(16 | 1), Result::Ir);
        assert_eq!(Result::from_testcase_bitmask(1), Result::Wa);
        assert_eq!(Result::from_testcase_bitmask(32), Result::Sc);
        assert_eq!(Result::from_testcase_bitmask(0), Result::Ac);
    }

    #[test]
    fn aggregate_precedence_matches_spec_order() {
        let order = [
            Result::Sc,
            Result::Ac,
            Result::Wa,
            Result::Mle,
            Result::Tle,
            Result::Ir,
            Result::Rte,
            Result::Ole,
        ];
        let mut acc = order[0];
        for &next in &order[1..] {
            acc = acc.aggregate_max(next);
            assert_eq!(acc, next, "expected {next:?} to dominate");
        }
        // Max folding is order-independent.
        assert_eq!(Result::Wa.aggregate_max(Result::Ac), Result::Wa);
        assert_eq!(Result::Ac.aggregate_max(Result::Wa), Result::Wa);
    }

    #[test]
    fn points_partial_problem() {
        assert_eq!(compute_points(8.0, 11.0, 100.0, true), round3(8.0 / 11.0 * 100.0));
    }

    #[test]
    fn points_non_partial_clamps_to_zero_unless_full() {
        assert_eq!(compute_points(8.0, 11.0, 100.0, false), 0.0);
        assert_eq!(compute_points(11.0, 11.0, 100.0, false), 100.0);
    }

    #[test]
    fn points_zero_case_total() {
        assert_eq!(compute_points(0.0, 0.0, 100.0, true), 0.0);
    }
}
