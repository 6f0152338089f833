use common::{SubmissionStatus, Verdict};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "submission")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i64,

    pub user_id: i32,
    pub problem_id: i32,
    pub language_id: String,

    /// Inline source text. Mutually exclusive with `source_url`.
    #[sea_orm(column_type = "Text", nullable)]
    pub source: Option<String>,
    /// External file URL, sent instead of `source` when the language is file-only.
    #[sea_orm(column_type = "Text", nullable)]
    pub source_url: Option<String>,

    /// NULL for standalone submissions.
    pub contest_participation_id: Option<i32>,
    #[sea_orm(default_value = false)]
    pub is_virtual: bool,

    #[sea_orm(default_value = false)]
    pub short_circuit: bool,
    #[sea_orm(default_value = false)]
    pub pretests_only: bool,
    #[sea_orm(default_value = false)]
    pub file_only: bool,
    pub file_size_limit: Option<i64>,

    pub status: SubmissionStatus,
    pub result: Option<Verdict>,

    /// Raw aggregate numerator accumulated across testcases/batches (§3).
    #[sea_orm(default_value = 0.0)]
    pub case_points: f64,
    /// Raw aggregate denominator accumulated across testcases/batches (§3).
    #[sea_orm(default_value = 0.0)]
    pub case_total: f64,
    /// Final scaled score, computed at `grading-end` per the §3 points invariant.
    pub points: Option<f64>,

    /// Max time across testcases, in seconds.
    pub time_used: Option<f64>,
    /// Max memory across testcases, in kilobytes.
    pub memory_used: Option<i64>,

    #[sea_orm(default_value = 1)]
    pub current_testcase: i32,
    #[sea_orm(default_value = false)]
    pub batched: bool,

    pub judged_on: Option<String>,
    pub judged_date: Option<DateTimeUtc>,
    #[sea_orm(column_type = "Text", nullable)]
    pub error_text: Option<String>,

    /// Set once a terminal packet has finalized this row; any later write
    /// attempt for this submission is rejected (stray/duplicate packets from
    /// a worker that lost ownership, per the WorkerVanished/AckMismatch
    /// handling in §7).
    pub locked_after: Option<DateTimeUtc>,
    /// Bumped on every dispatch; write methods verify the caller's
    /// generation still matches before mutating the row.
    #[sea_orm(default_value = 0)]
    pub generation: i32,

    #[sea_orm(belongs_to, from = "problem_id", to = "id")]
    pub problem: HasOne<super::problem::Entity>,
    #[sea_orm(has_many)]
    pub test_cases: HasMany<super::test_case::Entity>,

    pub created_at: DateTimeUtc,
}

impl ActiveModelBehavior for ActiveModel {}
