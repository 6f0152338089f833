//! Submission projection store: the narrow interface the session uses to
//! read submission metadata and persist grading progress (§6).

use std::collections::HashSet;

use chrono::Utc;
use common::{SubmissionStatus, Verdict};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, TransactionTrait,
};
use thiserror::Error;

use crate::entity::{problem, submission, test_case, worker, worker_runtime};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("submission {0} not found")]
    UnknownSubmission(i64),
    #[error("submission {0} is locked (already finalized)")]
    Locked(i64),
    #[error("submission {0} generation mismatch: expected {expected}, row is {actual}")]
    GenerationMismatch {
        id: i64,
        expected: i32,
        actual: i32,
    },
    #[error("database error: {0}")]
    Db(#[from] DbErr),
}

impl StoreError {
    /// Per the §9 open-question decision: a typed predicate the ping loop
    /// and write paths use to decide "reconnect, don't kill the session",
    /// instead of string-matching an exception class name.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Db(DbErr::Conn(_)) | StoreError::Db(DbErr::ConnectionAcquire(_))
        )
    }
}

pub struct SubmissionMetadata {
    pub id: i64,
    pub problem_id: i32,
    pub problem_code: String,
    pub user_id: i32,
    pub language_id: String,
    pub source: Option<String>,
    pub source_url: Option<String>,
    pub time_limit: f64,
    pub memory_limit: i64,
    pub short_circuit: bool,
    pub pretests_only: bool,
    pub contest_participation_id: Option<i32>,
    pub is_virtual: bool,
    pub file_only: bool,
    pub file_size_limit: Option<i64>,
    pub problem_points: f64,
    pub problem_partial: bool,
    pub testcase_visibility: problem::TestcaseVisibility,
}

pub struct WorkerAuthRecord {
    pub id: i32,
    pub name: String,
    pub auth_key: String,
    pub disabled: bool,
    pub blocked: bool,
    pub tier: i32,
}

pub struct TestCaseWrite {
    pub ordinal: i32,
    pub status: Verdict,
    pub time: f64,
    pub memory: i64,
    pub points: f64,
    pub total: f64,
    pub batch_ordinal: Option<i32>,
    pub feedback: Option<String>,
    pub extended_feedback: Option<String>,
    pub output: Option<String>,
}

/// Consumed exclusively from `Session`; no other component mutates
/// submission or testcase rows (§5).
#[async_trait::async_trait]
pub trait ProjectionStore: Send + Sync {
    /// Looked up by worker name during `handshake` to verify `key` and load
    /// tier/disabled/blocked (§4.2 AwaitingHandshake).
    async fn worker_auth(&self, name: &str) -> std::result::Result<WorkerAuthRecord, StoreError>;

    /// The platform-wide problem-code set, used when the bridge is
    /// configured with `ignore_problems_packet` instead of trusting a
    /// worker's self-reported `problems` list.
    async fn all_problem_codes(&self) -> std::result::Result<HashSet<String>, StoreError>;

    async fn submission_metadata(&self, id: i64) -> std::result::Result<SubmissionMetadata, StoreError>;

    /// Count of prior attempts by the same (user, problem, participation),
    /// excluding CompileError/InternalError, used to populate `attempt-no`.
    async fn attempt_no(&self, id: i64) -> std::result::Result<i32, StoreError>;

    async fn mark_processing(&self, id: i64) -> std::result::Result<(), StoreError>;

    async fn mark_grading_begin(&self, id: i64, judged_on: &str) -> std::result::Result<(), StoreError>;

    async fn append_compile_message(&self, id: i64, log: &str) -> std::result::Result<(), StoreError>;

    async fn mark_compile_error(&self, id: i64, log: &str) -> std::result::Result<(), StoreError>;

    async fn mark_internal_error(&self, id: i64, message: &str) -> std::result::Result<(), StoreError>;

    async fn mark_aborted(&self, id: i64) -> std::result::Result<(), StoreError>;

    async fn insert_test_cases(
        &self,
        id: i64,
        cases: &[TestCaseWrite],
        current_testcase: i32,
        batched: bool,
    ) -> std::result::Result<(), StoreError>;

    async fn finalize_grading(
        &self,
        id: i64,
        case_points: f64,
        case_total: f64,
        time_used: f64,
        memory_used: i64,
    ) -> std::result::Result<(), StoreError>;

    async fn set_worker_online(
        &self,
        name: &str,
        online: bool,
        last_ip: Option<&str>,
    ) -> std::result::Result<(), StoreError>;

    async fn update_worker_health(
        &self,
        name: &str,
        latency_ms: f64,
        load: f64,
    ) -> std::result::Result<(), StoreError>;

    async fn replace_runtimes(
        &self,
        worker_name: &str,
        runtimes: &[(String, String, String, i32)],
    ) -> std::result::Result<(), StoreError>;
}

pub struct SeaOrmStore {
    db: DatabaseConnection,
}

impl SeaOrmStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    async fn load_submission(&self, id: i64) -> std::result::Result<submission::Model, StoreError> {
        submission::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or(StoreError::UnknownSubmission(id))
    }

    fn guard_unlocked(row: &submission::Model) -> std::result::Result<(), StoreError> {
        if row.locked_after.is_some() {
            return Err(StoreError::Locked(row.id));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ProjectionStore for SeaOrmStore {
    async fn worker_auth(&self, name: &str) -> std::result::Result<WorkerAuthRecord, StoreError> {
        let row = worker::Entity::find()
            .filter(worker::Column::Name.eq(name))
            .one(&self.db)
            .await?
            .ok_or_else(|| StoreError::Db(DbErr::RecordNotFound(name.to_owned())))?;
        Ok(WorkerAuthRecord {
            id: row.id,
            name: row.name,
            auth_key: row.auth_key,
            disabled: row.disabled,
            blocked: row.blocked,
            tier: row.tier,
        })
    }

    async fn all_problem_codes(&self) -> std::result::Result<HashSet<String>, StoreError> {
        let codes = problem::Entity::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|p| p.code)
            .collect();
        Ok(codes)
    }

    async fn submission_metadata(&self, id: i64) -> std::result::Result<SubmissionMetadata, StoreError> {
        let row = self.load_submission(id).await?;
        let problem = problem::Entity::find_by_id(row.problem_id)
            .one(&self.db)
            .await?
            .ok_or(StoreError::UnknownSubmission(id))?;
        let (time_limit, memory_limit) = problem.limits_for(&row.language_id);
        Ok(SubmissionMetadata {
            id: row.id,
            problem_id: row.problem_id,
            problem_code: problem.code,
            user_id: row.user_id,
            language_id: row.language_id,
            source: row.source,
            source_url: row.source_url,
            time_limit,
            memory_limit,
            short_circuit: row.short_circuit,
            pretests_only: row.pretests_only,
            contest_participation_id: row.contest_participation_id,
            is_virtual: row.is_virtual,
            file_only: row.file_only,
            file_size_limit: row.file_size_limit,
            problem_points: problem.points,
            problem_partial: problem.partial,
            testcase_visibility: problem.testcase_visibility,
        })
    }

    async fn attempt_no(&self, id: i64) -> std::result::Result<i32, StoreError> {
        let row = self.load_submission(id).await?;
        let count = submission::Entity::find()
            .filter(submission::Column::UserId.eq(row.user_id))
            .filter(submission::Column::ProblemId.eq(row.problem_id))
            .filter(submission::Column::ContestParticipationId.eq(row.contest_participation_id))
            .filter(submission::Column::Id.lt(row.id))
            .filter(submission::Column::Status.ne(SubmissionStatus::CompileError))
            .filter(submission::Column::Status.ne(SubmissionStatus::InternalError))
            .count(&self.db)
            .await?;
        Ok(count as i32)
    }

    async fn mark_processing(&self, id: i64) -> std::result::Result<(), StoreError> {
        let row = self.load_submission(id).await?;
        Self::guard_unlocked(&row)?;
        let mut active: submission::ActiveModel = row.into();
        active.status = Set(SubmissionStatus::Processing);
        active.update(&self.db).await?;
        Ok(())
    }

    async fn mark_grading_begin(&self, id: i64, judged_on: &str) -> std::result::Result<(), StoreError> {
        let row = self.load_submission(id).await?;
        Self::guard_unlocked(&row)?;
        test_case::Entity::delete_many()
            .filter(test_case::Column::SubmissionId.eq(id))
            .exec(&self.db)
            .await?;
        let mut active: submission::ActiveModel = row.into();
        active.status = Set(SubmissionStatus::Grading);
        active.current_testcase = Set(1);
        active.batched = Set(false);
        active.judged_on = Set(Some(judged_on.to_owned()));
        active.judged_date = Set(Some(Utc::now()));
        active.case_points = Set(0.0);
        active.case_total = Set(0.0);
        active.update(&self.db).await?;
        Ok(())
    }

    async fn append_compile_message(&self, id: i64, log: &str) -> std::result::Result<(), StoreError> {
        let row = self.load_submission(id).await?;
        Self::guard_unlocked(&row)?;
        let mut active: submission::ActiveModel = row.into();
        active.error_text = Set(Some(log.to_owned()));
        active.update(&self.db).await?;
        Ok(())
    }

    async fn mark_compile_error(&self, id: i64, log: &str) -> std::result::Result<(), StoreError> {
        let row = self.load_submission(id).await?;
        Self::guard_unlocked(&row)?;
        let mut active: submission::ActiveModel = row.into();
        active.status = Set(SubmissionStatus::CompileError);
        active.result = Set(Some(Verdict::Ce));
        active.error_text = Set(Some(log.to_owned()));
        active.points = Set(Some(0.0));
        active.locked_after = Set(Some(Utc::now()));
        active.update(&self.db).await?;
        Ok(())
    }

    async fn mark_internal_error(&self, id: i64, message: &str) -> std::result::Result<(), StoreError> {
        let row = self.load_submission(id).await?;
        if row.locked_after.is_some() {
            // Already terminal; WorkerVanished races with a prior terminal
            // packet are tolerated silently (§7 UnknownSubmission-style drop).
            return Ok(());
        }
        let mut active: submission::ActiveModel = row.into();
        active.status = Set(SubmissionStatus::InternalError);
        active.result = Set(Some(Verdict::Ie));
        active.error_text = Set(Some(message.to_owned()));
        active.points = Set(Some(0.0));
        active.locked_after = Set(Some(Utc::now()));
        active.update(&self.db).await?;
        Ok(())
    }

    async fn mark_aborted(&self, id: i64) -> std::result::Result<(), StoreError> {
        let row = self.load_submission(id).await?;
        Self::guard_unlocked(&row)?;
        let mut active: submission::ActiveModel = row.into();
        active.status = Set(SubmissionStatus::Aborted);
        active.result = Set(Some(Verdict::Ab));
        active.points = Set(Some(0.0));
        active.locked_after = Set(Some(Utc::now()));
        active.update(&self.db).await?;
        Ok(())
    }

    async fn insert_test_cases(
        &self,
        id: i64,
        cases: &[TestCaseWrite],
        current_testcase: i32,
        batched: bool,
    ) -> std::result::Result<(), StoreError> {
        let row = self.load_submission(id).await?;
        Self::guard_unlocked(&row)?;
        let txn = self.db.begin().await?;
        for case in cases {
            let active = test_case::ActiveModel {
                submission_id: Set(id),
                ordinal: Set(case.ordinal),
                status: Set(case.status),
                time: Set(case.time),
                memory: Set(case.memory),
                points: Set(case.points),
                total: Set(case.total),
                batch_ordinal: Set(case.batch_ordinal),
                feedback: Set(case.feedback.clone()),
                extended_feedback: Set(case.extended_feedback.clone()),
                output: Set(case.output.clone()),
                created_at: Set(Utc::now()),
                ..Default::default()
            };
            active.insert(&txn).await?;
        }
        let mut active: submission::ActiveModel = row.into();
        active.current_testcase = Set(current_testcase);
        if batched {
            active.batched = Set(true);
        }
        active.update(&txn).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn finalize_grading(
        &self,
        id: i64,
        case_points: f64,
        case_total: f64,
        time_used: f64,
        memory_used: i64,
    ) -> std::result::Result<(), StoreError> {
        let row = self.load_submission(id).await?;
        Self::guard_unlocked(&row)?;

        let problem = problem::Entity::find_by_id(row.problem_id)
            .one(&self.db)
            .await?
            .ok_or(StoreError::UnknownSubmission(id))?;

        let cases = test_case::Entity::find()
            .filter(test_case::Column::SubmissionId.eq(id))
            .order_by_asc(test_case::Column::Ordinal)
            .all(&self.db)
            .await?;
        // Fold from the first case rather than a fixed `Ac` seed: `Sc` ranks
        // below `Ac` in the aggregate order, so seeding at `Ac` would hide an
        // all-SC submission's result behind a phantom AC.
        let result = match cases.split_first() {
            Some((first, rest)) => rest.iter().fold(first.status, |acc, c| acc.aggregate_max(c.status)),
            None => Verdict::Ac,
        };
        let points = common::status::compute_points(
            case_points,
            case_total,
            problem.points,
            problem.partial,
        );

        let txn = self.db.begin().await?;
        let mut active: submission::ActiveModel = row.into();
        active.status = Set(SubmissionStatus::Done);
        active.result = Set(Some(result));
        active.case_points = Set(case_points);
        active.case_total = Set(case_total);
        active.points = Set(Some(points));
        active.time_used = Set(Some(time_used));
        active.memory_used = Set(Some(memory_used));
        active.locked_after = Set(Some(Utc::now()));
        active.update(&txn).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn set_worker_online(
        &self,
        name: &str,
        online: bool,
        last_ip: Option<&str>,
    ) -> std::result::Result<(), StoreError> {
        let row = worker::Entity::find()
            .filter(worker::Column::Name.eq(name))
            .one(&self.db)
            .await?
            .ok_or_else(|| StoreError::Db(DbErr::RecordNotFound(name.to_owned())))?;
        let mut active: worker::ActiveModel = row.into();
        active.online = Set(online);
        if let Some(ip) = last_ip {
            active.last_ip = Set(Some(ip.to_owned()));
        }
        active.update(&self.db).await?;
        Ok(())
    }

    async fn update_worker_health(
        &self,
        name: &str,
        latency_ms: f64,
        load: f64,
    ) -> std::result::Result<(), StoreError> {
        let row = worker::Entity::find()
            .filter(worker::Column::Name.eq(name))
            .one(&self.db)
            .await?
            .ok_or_else(|| StoreError::Db(DbErr::RecordNotFound(name.to_owned())))?;
        let mut active: worker::ActiveModel = row.into();
        active.last_latency_ms = Set(Some(latency_ms));
        active.last_load = Set(Some(load));
        active.update(&self.db).await?;
        Ok(())
    }

    async fn replace_runtimes(
        &self,
        worker_name: &str,
        runtimes: &[(String, String, String, i32)],
    ) -> std::result::Result<(), StoreError> {
        let row = worker::Entity::find()
            .filter(worker::Column::Name.eq(worker_name))
            .one(&self.db)
            .await?
            .ok_or_else(|| StoreError::Db(DbErr::RecordNotFound(worker_name.to_owned())))?;

        let txn = self.db.begin().await?;
        worker_runtime::Entity::delete_many()
            .filter(worker_runtime::Column::WorkerId.eq(row.id))
            .exec(&txn)
            .await?;
        for (language_id, runtime_name, version, rank) in runtimes {
            let active = worker_runtime::ActiveModel {
                worker_id: Set(row.id),
                language_id: Set(language_id.clone()),
                runtime_name: Set(runtime_name.clone()),
                version: Set(version.clone()),
                rank: Set(*rank),
                ..Default::default()
            };
            active.insert(&txn).await?;
        }
        txn.commit().await?;
        Ok(())
    }
}
