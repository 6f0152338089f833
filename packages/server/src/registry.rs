//! The set of live judge sessions and the scheduler that matches queued
//! submissions to eligible ones (§4.4).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, Ordering};

use common::Capabilities;
use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};

use crate::store::SubmissionMetadata;

/// Everything the scheduler needs to know about a live session without
/// reaching into its private state; the session itself owns the wire handle
/// and in-flight slot, the registry only holds this non-owning handle (§9).
#[derive(Clone)]
pub struct SessionHandle {
    pub name: String,
    pub tier: i32,
    pub disabled: bool,
    pub capabilities: Capabilities,
    pub last_latency_ms: f64,
    pub last_load: f64,
    pub idle: bool,
    pub to_session: mpsc::Sender<SessionCommand>,
}

/// Commands the registry sends into a session's command loop. The session
/// transitions its own state machine in response; the registry never mutates
/// session state directly.
#[derive(Debug)]
pub enum SessionCommand {
    Dispatch(Box<DispatchJob>),
    Terminate,
    Disconnect { force: bool },
}

#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub submission_id: i64,
    pub generation: i32,
    pub meta: DispatchMeta,
}

#[derive(Debug, Clone)]
pub struct DispatchMeta {
    pub problem_code: String,
    pub language: String,
    pub source: Option<String>,
    pub source_url: Option<String>,
    pub time_limit: f64,
    pub memory_limit: i64,
    pub short_circuit: bool,
    pub pretests_only: bool,
    pub in_contest: bool,
    pub attempt_no: i32,
    pub user_id: i32,
    pub file_only: bool,
    pub file_size_limit: Option<i64>,
    /// Cached from the problem row at dispatch time so the session doesn't
    /// need a store round-trip per testcase packet to decide whether events
    /// are suppressed (§4.5: non-ALL testcase-visibility problems).
    pub testcase_visibility_all: bool,
}

impl DispatchMeta {
    pub fn from_submission_metadata(meta: &SubmissionMetadata, attempt_no: i32) -> Self {
        Self {
            problem_code: meta.problem_code.clone(),
            language: meta.language_id.clone(),
            source: meta.source.clone(),
            source_url: meta.source_url.clone(),
            time_limit: meta.time_limit,
            memory_limit: meta.memory_limit,
            short_circuit: meta.short_circuit,
            pretests_only: meta.pretests_only,
            in_contest: meta.contest_participation_id.is_some(),
            attempt_no,
            user_id: meta.user_id,
            testcase_visibility_all: matches!(
                meta.testcase_visibility,
                crate::entity::problem::TestcaseVisibility::All
            ),
            file_only: meta.file_only,
            file_size_limit: meta.file_size_limit,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no eligible worker is online for this (problem, language) pair")]
    NoEligibleWorker,
}

#[derive(Debug, thiserror::Error)]
pub enum AbortError {
    #[error("submission is not currently dispatched to any worker")]
    NotRunning,
}

/// The one shared mutable structure in the system (§5): registration,
/// deregistration, capability updates and dispatch/free are all serialized
/// through `DashMap`'s per-shard locking.
pub struct Registry {
    sessions: DashMap<String, SessionHandle>,
    owners: DashMap<i64, String>,
    generation: AtomicI32,
    /// Woken on every transition that might make a previously-ineligible
    /// submission dispatchable (§5: "the scheduler runs as a shared task
    /// that is woken on session state transitions").
    wake: Notify,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            owners: DashMap::new(),
            generation: AtomicI32::new(0),
            wake: Notify::new(),
        }
    }

    /// A future that resolves the next time a session transition occurs.
    /// Must be created *before* the scheduler checks its queue, so a wake
    /// that fires between the check and the `.await` isn't missed.
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.wake.notified()
    }

    pub fn register(&self, handle: SessionHandle) {
        self.sessions.insert(handle.name.clone(), handle);
        self.wake.notify_one();
    }

    pub fn deregister(&self, name: &str) {
        self.sessions.remove(name);
        self.owners.retain(|_, owner| owner != name);
    }

    pub fn set_capabilities(&self, name: &str, capabilities: Capabilities) {
        if let Some(mut entry) = self.sessions.get_mut(name) {
            entry.capabilities = capabilities;
        }
        self.wake.notify_one();
    }

    pub fn set_idle(&self, name: &str, idle: bool) {
        if let Some(mut entry) = self.sessions.get_mut(name) {
            entry.idle = idle;
        }
        if idle {
            self.wake.notify_one();
        }
    }

    pub fn set_health(&self, name: &str, latency_ms: f64, load: f64) {
        if let Some(mut entry) = self.sessions.get_mut(name) {
            entry.last_latency_ms = latency_ms;
            entry.last_load = load;
        }
    }

    pub fn set_disabled(&self, name: &str, disabled: bool) -> bool {
        let found = if let Some(mut entry) = self.sessions.get_mut(name) {
            entry.disabled = disabled;
            true
        } else {
            false
        };
        if found && !disabled {
            self.wake.notify_one();
        }
        found
    }

    pub fn owner_of(&self, submission_id: i64) -> Option<String> {
        self.owners.get(&submission_id).map(|e| e.clone())
    }

    /// Select, among sessions matching `(problem, language)`, not disabled
    /// (unless `directed_to` names them explicitly) and currently Idle, the
    /// one ranked best by `(tier, load, latency, name)` (§4.4).
    fn select_eligible(
        &self,
        problem_code: &str,
        language: &str,
        directed_to: Option<&str>,
    ) -> Option<String> {
        let mut best: Option<SessionHandle> = None;
        for entry in self.sessions.iter() {
            let s = entry.value();
            if !s.idle {
                continue;
            }
            if !s.capabilities.supports(problem_code, language) {
                continue;
            }
            let directed = directed_to.is_some_and(|n| n == s.name);
            if s.disabled && !directed {
                continue;
            }
            if directed_to.is_some() && !directed {
                continue;
            }
            let better = match &best {
                None => true,
                Some(current) => ranks_before(s, current),
            };
            if better {
                best = Some(s.clone());
            }
        }
        best.map(|s| s.name)
    }

    /// `dispatch(submission)` (§4.4). Atomically marks the chosen session
    /// non-idle and records ownership before returning, so a concurrent
    /// `dispatch` call can never double-book it.
    pub async fn dispatch(
        &self,
        submission_id: i64,
        problem_code: &str,
        language: &str,
        directed_to: Option<&str>,
        meta: DispatchMeta,
    ) -> Result<(), DispatchError> {
        let name = self
            .select_eligible(problem_code, language, directed_to)
            .ok_or(DispatchError::NoEligibleWorker)?;

        let sender = {
            let mut entry = match self.sessions.get_mut(&name) {
                Some(entry) => entry,
                None => return Err(DispatchError::NoEligibleWorker),
            };
            if !entry.idle {
                return Err(DispatchError::NoEligibleWorker);
            }
            entry.idle = false;
            entry.to_session.clone()
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.owners.insert(submission_id, name.clone());

        let job = DispatchJob {
            submission_id,
            generation,
            meta,
        };
        if sender.send(SessionCommand::Dispatch(Box::new(job))).await.is_err() {
            self.owners.remove(&submission_id);
            self.set_idle(&name, true);
            return Err(DispatchError::NoEligibleWorker);
        }
        Ok(())
    }

    pub async fn abort(&self, submission_id: i64) -> Result<(), AbortError> {
        let name = self.owners.get(&submission_id).map(|e| e.clone());
        let Some(name) = name else {
            return Err(AbortError::NotRunning);
        };
        let sender = self.sessions.get(&name).map(|s| s.to_session.clone());
        let Some(sender) = sender else {
            return Err(AbortError::NotRunning);
        };
        let _ = sender.send(SessionCommand::Terminate).await;
        Ok(())
    }

    pub async fn disconnect(&self, name: &str, force: bool) -> bool {
        let sender = self.sessions.get(name).map(|s| s.to_session.clone());
        match sender {
            Some(sender) => {
                let _ = sender.send(SessionCommand::Disconnect { force }).await;
                true
            }
            None => false,
        }
    }

    /// Snapshot of session names, for diagnostics/tests.
    pub fn session_names(&self) -> HashSet<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn eligible_problem_language_pairs(&self) -> HashMap<String, HashSet<String>> {
        let mut out: HashMap<String, HashSet<String>> = HashMap::new();
        for entry in self.sessions.iter() {
            for problem in &entry.capabilities.problems {
                out.entry(problem.clone())
                    .or_default()
                    .extend(entry.capabilities.executors.keys().cloned());
            }
        }
        out
    }
}

/// `true` if `candidate` outranks `current` under the §4.4 preference order:
/// lowest tier, then lowest load, then lowest latency, ties broken by name.
fn ranks_before(candidate: &SessionHandle, current: &SessionHandle) -> bool {
    use std::cmp::Ordering;

    match candidate.tier.cmp(&current.tier) {
        Ordering::Less => return true,
        Ordering::Greater => return false,
        Ordering::Equal => {}
    }
    match candidate.last_load.partial_cmp(&current.last_load) {
        Some(Ordering::Less) => return true,
        Some(Ordering::Greater) => return false,
        _ => {}
    }
    match candidate.last_latency_ms.partial_cmp(&current.last_latency_ms) {
        Some(Ordering::Less) => return true,
        Some(Ordering::Greater) => return false,
        _ => {}
    }
    candidate.name < current.name
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Capabilities;

    fn handle(name: &str, tier: i32, load: f64, latency: f64, idle: bool) -> (SessionHandle, mpsc::Receiver<SessionCommand>) {
        let (tx, rx) = mpsc::channel(8);
        let mut caps = Capabilities::default();
        caps.problems.insert("p1".to_string());
        caps.executors.insert("py3".to_string(), vec![("CPython".to_string(), vec![3, 11, 5])]);
        (
            SessionHandle {
                name: name.to_string(),
                tier,
                disabled: false,
                capabilities: caps,
                last_latency_ms: latency,
                last_load: load,
                idle,
                to_session: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn dispatch_prefers_lower_tier_then_load_then_latency_then_name() {
        let registry = Registry::new();
        let (h1, _rx1) = handle("b-worker", 1, 0.5, 10.0, true);
        let (h2, _rx2) = handle("a-worker", 1, 0.1, 10.0, true);
        let (h3, _rx3) = handle("c-worker", 2, 0.0, 0.0, true);
        registry.register(h1);
        registry.register(h2);
        registry.register(h3);

        let meta = DispatchMeta {
            problem_code: "p1".into(),
            language: "py3".into(),
            source: Some("print(1)".into()),
            source_url: None,
            time_limit: 2.0,
            memory_limit: 65536,
            short_circuit: false,
            pretests_only: false,
            in_contest: false,
            attempt_no: 0,
            user_id: 1,
            file_only: false,
            file_size_limit: None,
            testcase_visibility_all: true,
        };
        registry.dispatch(42, "p1", "py3", None, meta).await.unwrap();
        assert_eq!(registry.owner_of(42).as_deref(), Some("a-worker"));
    }

    #[tokio::test]
    async fn dispatch_fails_when_no_eligible_worker() {
        let registry = Registry::new();
        let meta = DispatchMeta {
            problem_code: "p1".into(),
            language: "py3".into(),
            source: None,
            source_url: None,
            time_limit: 2.0,
            memory_limit: 65536,
            short_circuit: false,
            pretests_only: false,
            in_contest: false,
            attempt_no: 0,
            user_id: 1,
            file_only: false,
            file_size_limit: None,
            testcase_visibility_all: true,
        };
        let err = registry.dispatch(1, "p1", "py3", None, meta).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoEligibleWorker));
    }

    #[tokio::test]
    async fn abort_without_owner_is_not_running() {
        let registry = Registry::new();
        assert!(matches!(registry.abort(5).await, Err(AbortError::NotRunning)));
    }
}
