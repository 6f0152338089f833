//! The shared scheduler task (§5): holds submissions that couldn't be
//! dispatched immediately and reconsiders them whenever a session becomes
//! Idle or updates its capabilities (§4.4).

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::events::Publisher;
use crate::registry::{DispatchError, DispatchMeta, Registry};
use crate::store::ProjectionStore;

pub struct Scheduler {
    registry: Arc<Registry>,
    store: Arc<dyn ProjectionStore>,
    publisher: Arc<Publisher>,
    queue: Mutex<VecDeque<i64>>,
}

impl Scheduler {
    pub fn new(registry: Arc<Registry>, store: Arc<dyn ProjectionStore>, publisher: Arc<Publisher>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            publisher,
            queue: Mutex::new(VecDeque::new()),
        })
    }

    /// Hand a queued submission to the scheduler: dispatch it immediately if
    /// a worker is eligible now, otherwise hold it for reconsideration.
    pub async fn submit(&self, submission_id: i64) {
        if !self.try_dispatch(submission_id).await {
            self.queue.lock().await.push_back(submission_id);
        }
    }

    /// Run forever, waking on registry transitions and walking the pending
    /// queue once per wake (§5 "a wake signal for the scheduler").
    pub async fn run(self: Arc<Self>) {
        loop {
            let notified = self.registry.notified();
            self.drain().await;
            notified.await;
        }
    }

    async fn drain(&self) {
        let pending = {
            let mut queue = self.queue.lock().await;
            std::mem::take(&mut *queue)
        };
        if pending.is_empty() {
            return;
        }
        let mut still_pending = VecDeque::new();
        for id in pending {
            if !self.try_dispatch(id).await {
                still_pending.push_back(id);
            }
        }
        if !still_pending.is_empty() {
            self.queue.lock().await.extend(still_pending);
        }
    }

    /// `true` if the submission was dispatched (or is unrecoverable and
    /// should be dropped rather than requeued forever).
    async fn try_dispatch(&self, submission_id: i64) -> bool {
        let meta = match self.store.submission_metadata(submission_id).await {
            Ok(meta) => meta,
            Err(err) => {
                warn!(submission_id, %err, "dropping queued submission with no metadata");
                return true;
            }
        };
        let attempt_no = self.store.attempt_no(submission_id).await.unwrap_or(0);
        let dispatch_meta = DispatchMeta::from_submission_metadata(&meta, attempt_no);

        match self
            .registry
            .dispatch(submission_id, &meta.problem_code, &meta.language_id, None, dispatch_meta)
            .await
        {
            Ok(()) => {
                self.publisher.publish(submission_id, "dispatched", serde_json::json!({ "submission-id": submission_id }));
                true
            }
            Err(DispatchError::NoEligibleWorker) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::problem::TestcaseVisibility;
    use crate::store::{StoreError, SubmissionMetadata, TestCaseWrite, WorkerAuthRecord};
    use async_trait::async_trait;
    use common::Capabilities;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct FakeStore {
        metadata: SubmissionMetadata,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl ProjectionStore for FakeStore {
        async fn worker_auth(&self, _name: &str) -> Result<WorkerAuthRecord, StoreError> {
            unimplemented!()
        }
        async fn all_problem_codes(&self) -> Result<HashSet<String>, StoreError> {
            unimplemented!()
        }
        async fn submission_metadata(&self, _id: i64) -> Result<SubmissionMetadata, StoreError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(SubmissionMetadata {
                id: self.metadata.id,
                problem_id: self.metadata.problem_id,
                problem_code: self.metadata.problem_code.clone(),
                user_id: self.metadata.user_id,
                language_id: self.metadata.language_id.clone(),
                source: self.metadata.source.clone(),
                source_url: self.metadata.source_url.clone(),
                time_limit: self.metadata.time_limit,
                memory_limit: self.metadata.memory_limit,
                short_circuit: self.metadata.short_circuit,
                pretests_only: self.metadata.pretests_only,
                contest_participation_id: self.metadata.contest_participation_id,
                is_virtual: self.metadata.is_virtual,
                file_only: self.metadata.file_only,
                file_size_limit: self.metadata.file_size_limit,
                problem_points: self.metadata.problem_points,
                problem_partial: self.metadata.problem_partial,
                testcase_visibility: self.metadata.testcase_visibility,
            })
        }
        async fn attempt_no(&self, _id: i64) -> Result<i32, StoreError> {
            Ok(0)
        }
        async fn mark_processing(&self, _id: i64) -> Result<(), StoreError> {
            Ok(())
        }
        async fn mark_grading_begin(&self, _id: i64, _judged_on: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn append_compile_message(&self, _id: i64, _log: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn mark_compile_error(&self, _id: i64, _log: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn mark_internal_error(&self, _id: i64, _message: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn mark_aborted(&self, _id: i64) -> Result<(), StoreError> {
            Ok(())
        }
        async fn insert_test_cases(
            &self,
            _id: i64,
            _cases: &[TestCaseWrite],
            _current_testcase: i32,
            _batched: bool,
        ) -> Result<(), StoreError> {
            Ok(())
        }
        async fn finalize_grading(
            &self,
            _id: i64,
            _case_points: f64,
            _case_total: f64,
            _time_used: f64,
            _memory_used: i64,
        ) -> Result<(), StoreError> {
            Ok(())
        }
        async fn set_worker_online(&self, _name: &str, _online: bool, _last_ip: Option<&str>) -> Result<(), StoreError> {
            Ok(())
        }
        async fn update_worker_health(&self, _name: &str, _latency_ms: f64, _load: f64) -> Result<(), StoreError> {
            Ok(())
        }
        async fn replace_runtimes(&self, _worker_name: &str, _runtimes: &[(String, String, String, i32)]) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn meta(problem_code: &str, language_id: &str) -> SubmissionMetadata {
        SubmissionMetadata {
            id: 42,
            problem_id: 1,
            problem_code: problem_code.to_string(),
            user_id: 7,
            language_id: language_id.to_string(),
            source: Some("print(1)".to_string()),
            source_url: None,
            time_limit: 2.0,
            memory_limit: 65536,
            short_circuit: false,
            pretests_only: false,
            contest_participation_id: None,
            is_virtual: false,
            file_only: false,
            file_size_limit: None,
            problem_points: 100.0,
            problem_partial: true,
            testcase_visibility: TestcaseVisibility::All,
        }
    }

    fn idle_session(name: &str) -> (crate::registry::SessionHandle, mpsc::Receiver<crate::registry::SessionCommand>) {
        let (tx, rx) = mpsc::channel(8);
        let mut caps = Capabilities::default();
        caps.problems.insert("p1".to_string());
        caps.executors.insert("py3".to_string(), vec![("CPython".to_string(), vec![3, 11, 5])]);
        (
            crate::registry::SessionHandle {
                name: name.to_string(),
                tier: 1,
                disabled: false,
                capabilities: caps,
                last_latency_ms: 0.0,
                last_load: 0.0,
                idle: true,
                to_session: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn submit_queues_then_dispatches_once_a_worker_frees_up() {
        let registry = Arc::new(Registry::new());
        let store: Arc<dyn ProjectionStore> = Arc::new(FakeStore {
            metadata: meta("p1", "py3"),
            lookups: AtomicUsize::new(0),
        });
        let publisher = Arc::new(Publisher::new(b"secret".to_vec(), 5, std::time::Duration::from_millis(500)));
        let scheduler = Scheduler::new(registry.clone(), store, publisher);

        // No worker registered yet: submit must queue rather than drop it.
        scheduler.submit(42).await;
        assert!(registry.owner_of(42).is_none());

        let (handle, _rx) = idle_session("w1");
        registry.register(handle);

        // Simulate the scheduler task's wake-driven drain.
        scheduler.drain().await;
        assert_eq!(registry.owner_of(42).as_deref(), Some("w1"));
    }
}
