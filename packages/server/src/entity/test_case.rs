use common::Verdict;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A single testcase result row (§3 "TestCase"). Deleted in bulk and
/// reinserted at the start of every grading attempt (`grading-begin`).
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "submission_test_case")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub submission_id: i64,
    /// Dense from 1 within a submission.
    pub ordinal: i32,

    pub status: Verdict,
    pub time: f64,
    pub memory: i64,
    pub points: f64,
    pub total: f64,

    /// Set when this case was reported inside a `batch-begin`/`batch-end` pair.
    pub batch_ordinal: Option<i32>,

    /// Truncated to the platform's max length (<=50 chars).
    pub feedback: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub extended_feedback: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub output: Option<String>,

    #[sea_orm(belongs_to, from = "submission_id", to = "id")]
    pub submission: HasOne<super::submission::Entity>,

    pub created_at: DateTimeUtc,
}

impl ActiveModelBehavior for ActiveModel {}
