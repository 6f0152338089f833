//! Per-worker state machine (§4.2, §4.3): handshake, capabilities, liveness,
//! in-flight job, packet dispatch.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::{BridgeConfig, Capabilities};
use protocol::{ServerMessage, SubmissionMeta, SubmissionSource, TestCaseReport, Transport, TransportReader, TransportWriter, WorkerMessage};
use subtle::ConstantTimeEq;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::events::Publisher;
use crate::registry::{DispatchJob, Registry, SessionCommand, SessionHandle};
use crate::store::{ProjectionStore, TestCaseWrite};

/// States of the per-worker FSM (§4.2). `GradingEnded`/`Errored`/`Aborted`
/// from the spec's diagram all collapse back into `Idle` here: they are
/// momentary, not states a packet handler needs to branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingHandshake,
    Idle,
    Dispatched,
    Acknowledged,
    Grading,
}

struct WorkingJob {
    submission_id: i64,
    generation: i32,
    ack_deadline: Option<Instant>,
    in_batch: bool,
    batch_ordinal: i32,
    case_points: f64,
    case_total: f64,
    time_used: f64,
    memory_used: i64,
    testcase_visibility_all: bool,
}

/// Last 6 samples of a measured quantity, averaged (§4.6: "kept as 6-sample
/// rolling means, ~1 minute" at a 10s ping interval).
struct RollingMean {
    samples: VecDeque<f64>,
    cap: usize,
}

impl RollingMean {
    fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(6),
            cap: 6,
        }
    }

    fn push(&mut self, value: f64) {
        if self.samples.len() == self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().sum::<f64>() / self.samples.len() as f64
        }
    }
}

pub struct Session {
    peer_addr: SocketAddr,
    name: String,
    state: State,
    working: Option<WorkingJob>,
    registry: Arc<Registry>,
    store: Arc<dyn ProjectionStore>,
    publisher: Arc<Publisher>,
    config: Arc<BridgeConfig>,
    writer: Arc<Mutex<TransportWriter>>,
    latency: RollingMean,
    skew: RollingMean,
}

/// Accept a worker connection and drive its session to completion. Spawns
/// its own task; returns once the connection is fully torn down.
pub fn spawn(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<Registry>,
    store: Arc<dyn ProjectionStore>,
    publisher: Arc<Publisher>,
    config: Arc<BridgeConfig>,
) {
    tokio::spawn(async move {
        if let Err(err) = run(stream, peer_addr, registry, store, publisher, config).await {
            warn!(%peer_addr, %err, "session ended with error");
        }
    });
}

async fn run(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<Registry>,
    store: Arc<dyn ProjectionStore>,
    publisher: Arc<Publisher>,
    config: Arc<BridgeConfig>,
) -> anyhow::Result<()> {
    let transport = Transport::new(stream, config.max_frame_bytes);
    let (mut reader, writer) = transport.split();
    let writer = Arc::new(Mutex::new(writer));

    let (worker_name, capabilities, tier, disabled) =
        match handshake(&mut reader, &writer, &store, &config).await? {
            Some((name, (capabilities, tier, disabled))) => (name, capabilities, tier, disabled),
            None => return Ok(()),
        };

    let (cmd_tx, mut cmd_rx) = mpsc::channel(32);
    registry.register(SessionHandle {
        name: worker_name.clone(),
        tier,
        disabled,
        capabilities,
        last_latency_ms: 0.0,
        last_load: 0.0,
        idle: true,
        to_session: cmd_tx,
    });
    let _ = store.set_worker_online(&worker_name, true, Some(&peer_addr.ip().to_string())).await;

    let mut session = Session {
        peer_addr,
        name: worker_name.clone(),
        state: State::Idle,
        working: None,
        registry: registry.clone(),
        store,
        publisher,
        config,
        writer: writer.clone(),
        latency: RollingMean::new(),
        skew: RollingMean::new(),
    };

    let ping_task = spawn_ping_loop(writer, session.config.ping_interval());

    let result = session.drive(&mut reader, &mut cmd_rx).await;

    ping_task.abort();
    registry.deregister(&worker_name);
    let _ = session.store.set_worker_online(&worker_name, false, None).await;
    if let Some(job) = session.working.take() {
        // Disconnect while a submission was in flight: force InternalError,
        // never propagate to the worker (§4.2 Disconnect handling, §7 WorkerVanished).
        let _ = session.store.mark_internal_error(job.submission_id, "").await;
        session
            .publisher
            .publish_terminal(job.submission_id, "internal-error", serde_json::json!({ "submission-id": job.submission_id }));
    }
    info!(worker = %worker_name, peer = %peer_addr, "session closed");

    result
}

fn spawn_ping_loop(writer: Arc<Mutex<TransportWriter>>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            let when = unix_timestamp();
            let msg = ServerMessage::Ping { when };
            let Ok(bytes) = msg.encode() else { continue };
            let mut guard = writer.lock().await;
            if guard.send_raw(&bytes).await.is_err() {
                break;
            }
        }
    })
}

fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Drive the AwaitingHandshake phase; returns `Some((capabilities, tier,
/// disabled))` on success, `None` if the connection was closed/rejected.
async fn handshake(
    reader: &mut TransportReader,
    writer: &Arc<Mutex<TransportWriter>>,
    store: &Arc<dyn ProjectionStore>,
    config: &BridgeConfig,
) -> anyhow::Result<Option<(String, (Capabilities, i32, bool))>> {
    let frame = match tokio::time::timeout(config.handshake_timeout(), reader.recv_raw()).await {
        Ok(Ok(Some(bytes))) => bytes,
        _ => return Ok(None),
    };

    let msg = match WorkerMessage::decode(&frame) {
        Ok(msg) => msg,
        Err(_) => return Ok(None),
    };

    let WorkerMessage::Handshake { id, key, problems, executors } = msg else {
        return Ok(None);
    };

    let auth = match store.worker_auth(&id).await {
        Ok(auth) => auth,
        Err(_) => {
            warn!(worker = %id, "handshake from unknown worker id");
            return Ok(None);
        }
    };

    if auth.blocked || !constant_time_eq(&auth.auth_key, &key) {
        warn!(worker = %id, "handshake rejected: bad key or blocked worker");
        return Ok(None);
    }

    let problem_set = if config.ignore_problems_packet {
        store.all_problem_codes().await.unwrap_or_default()
    } else {
        problems.into_iter().map(|(code,)| code).collect()
    };
    let capabilities = Capabilities {
        problems: problem_set,
        executors: executors.clone(),
    };

    let runtimes: Vec<(String, String, String, i32)> = executors
        .iter()
        .flat_map(|(language, versions)| {
            versions.iter().enumerate().map(move |(rank, (name, version))| {
                (
                    language.clone(),
                    name.clone(),
                    version.iter().map(|n| n.to_string()).collect::<Vec<_>>().join("."),
                    rank as i32,
                )
            })
        })
        .collect();
    let _ = store.replace_runtimes(&auth.name, &runtimes).await;

    let ack = ServerMessage::HandshakeSuccess {};
    if let Ok(bytes) = ack.encode() {
        let mut guard = writer.lock().await;
        if guard.send_raw(&bytes).await.is_err() {
            return Ok(None);
        }
    }

    info!(worker = %auth.name, "handshake succeeded");
    Ok(Some((auth.name, (capabilities, auth.tier, auth.disabled))))
}

fn constant_time_eq(expected: &str, got: &str) -> bool {
    let expected = expected.as_bytes();
    let got = got.as_bytes();
    if expected.len() != got.len() {
        return false;
    }
    expected.ct_eq(got).into()
}

impl Session {
    async fn send(&self, msg: &ServerMessage) -> anyhow::Result<()> {
        let bytes = msg.encode()?;
        let mut guard = self.writer.lock().await;
        guard.send_raw(&bytes).await?;
        Ok(())
    }

    async fn drive(
        &mut self,
        reader: &mut TransportReader,
        cmd_rx: &mut mpsc::Receiver<SessionCommand>,
    ) -> anyhow::Result<()> {
        loop {
            let read_timeout = self.config.idle_timeout();
            let ack_deadline = self.working.as_ref().and_then(|w| w.ack_deadline);

            let ack_wait = async {
                match ack_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                frame = tokio::time::timeout(read_timeout, reader.recv_raw()) => {
                    match frame {
                        Err(_elapsed) => {
                            info!(worker = %self.name, "session idle-timed out");
                            return Ok(());
                        }
                        Ok(Err(err)) => {
                            warn!(worker = %self.name, %err, "protocol fault, closing session");
                            return Ok(());
                        }
                        Ok(Ok(None)) => {
                            info!(worker = %self.name, "worker disconnected");
                            return Ok(());
                        }
                        Ok(Ok(Some(bytes))) => {
                            if self.handle_frame(&bytes).await {
                                return Ok(());
                            }
                        }
                    }
                }
                _ = ack_wait => {
                    self.handle_ack_timeout().await;
                    return Ok(());
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::Dispatch(job)) => self.handle_dispatch(*job).await,
                        Some(SessionCommand::Terminate) => self.handle_terminate_command().await,
                        Some(SessionCommand::Disconnect { force }) => {
                            let _ = self.send(&ServerMessage::Disconnect {}).await;
                            if force {
                                return Ok(());
                            }
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn handle_ack_timeout(&mut self) {
        if let Some(job) = self.working.take() {
            warn!(worker = %self.name, submission = job.submission_id, "acknowledgement watchdog fired");
            let _ = self.store.mark_internal_error(job.submission_id, "acknowledgement timed out").await;
            self.publisher.publish_terminal(
                job.submission_id,
                "internal-error",
                serde_json::json!({ "submission-id": job.submission_id }),
            );
        }
    }

    async fn handle_dispatch(&mut self, job: DispatchJob) {
        if self.state != State::Idle {
            warn!(worker = %self.name, "dispatch received while not idle, forcing submission to IE");
            let _ = self.store.mark_internal_error(job.submission_id, "dispatched to a busy worker").await;
            return;
        }

        let source = if job.meta.file_only {
            SubmissionSource::Url {
                source_url: job.meta.source_url.clone().unwrap_or_default(),
            }
        } else {
            SubmissionSource::Inline {
                source: job.meta.source.clone().unwrap_or_default(),
            }
        };

        let request = ServerMessage::SubmissionRequest {
            submission_id: job.submission_id,
            problem_id: job.meta.problem_code.clone(),
            language: job.meta.language.clone(),
            source,
            time_limit: job.meta.time_limit,
            memory_limit: job.meta.memory_limit,
            short_circuit: job.meta.short_circuit,
            meta: SubmissionMeta {
                pretests_only: job.meta.pretests_only,
                in_contest: job.meta.in_contest,
                attempt_no: job.meta.attempt_no.max(0) as u32,
                user: job.meta.user_id.to_string(),
                file_only: job.meta.file_only,
                file_size_limit: job.meta.file_size_limit,
                ide_input: None,
            },
        };

        if self.send(&request).await.is_err() {
            let _ = self.store.mark_internal_error(job.submission_id, "failed to dispatch").await;
            return;
        }

        self.state = State::Dispatched;
        self.registry.set_idle(&self.name, false);
        self.working = Some(WorkingJob {
            submission_id: job.submission_id,
            generation: job.generation,
            ack_deadline: Some(Instant::now() + self.config.ack_timeout()),
            in_batch: false,
            batch_ordinal: 0,
            case_points: 0.0,
            case_total: 0.0,
            time_used: 0.0,
            memory_used: 0.0,
            testcase_visibility_all: job.meta.testcase_visibility_all,
        });
    }

    async fn handle_terminate_command(&self) {
        if let Some(job) = &self.working {
            let _ = self
                .send(&ServerMessage::TerminateSubmission {
                    submission_id: job.submission_id,
                })
                .await;
        }
    }

    fn free_to_idle(&mut self) {
        self.state = State::Idle;
        self.working = None;
        self.registry.set_idle(&self.name, true);
    }

    /// Returns `true` if the connection must now be closed.
    async fn handle_frame(&mut self, bytes: &[u8]) -> bool {
        let msg = match WorkerMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(worker = %self.name, %err, "malformed packet");
                return false;
            }
        };

        match msg {
            WorkerMessage::Handshake { .. } => {
                warn!(worker = %self.name, "duplicate handshake after registration");
                false
            }
            WorkerMessage::SubmissionAcknowledged { submission_id } => {
                self.on_submission_acknowledged(submission_id).await
            }
            WorkerMessage::GradingBegin { submission_id } => {
                self.on_grading_begin(submission_id).await;
                false
            }
            WorkerMessage::GradingEnd { submission_id } => {
                self.on_grading_end_internal(submission_id).await;
                false
            }
            WorkerMessage::CompileMessage { log } => {
                self.on_compile_message(log).await;
                false
            }
            WorkerMessage::CompileError { log } => {
                self.on_compile_error(log).await;
                false
            }
            WorkerMessage::BatchBegin {} => {
                if let Some(job) = &mut self.working {
                    job.in_batch = true;
                    job.batch_ordinal += 1;
                }
                false
            }
            WorkerMessage::BatchEnd {} => {
                if let Some(job) = &mut self.working {
                    job.in_batch = false;
                }
                false
            }
            WorkerMessage::TestCaseStatus { cases } => {
                self.on_test_case_status(cases).await;
                false
            }
            WorkerMessage::InternalError { message } => {
                self.on_internal_error(message).await;
                false
            }
            WorkerMessage::SubmissionTerminated {} => {
                self.on_submission_terminated().await;
                false
            }
            WorkerMessage::PingResponse { when, time, load } => {
                self.on_ping_response(when, time, load).await;
                false
            }
            WorkerMessage::SupportedProblems { problems } => {
                self.on_supported_problems(problems).await;
                false
            }
            WorkerMessage::Executors { executors } => {
                self.on_executors(executors).await;
                false
            }
            WorkerMessage::TestcaseIde { result } => {
                self.on_test_case_ide(result);
                false
            }
        }
    }

    async fn on_submission_acknowledged(&mut self, submission_id: i64) -> bool {
        let Some(job) = &self.working else {
            warn!(worker = %self.name, submission_id, "ack with no in-flight submission");
            return false;
        };
        if job.submission_id != submission_id {
            let expected = job.submission_id;
            warn!(worker = %self.name, expected, got = submission_id, "ack mismatch");
            let _ = self.store.mark_internal_error(expected, "acknowledgement mismatch").await;
            let _ = self.store.mark_internal_error(submission_id, "acknowledgement mismatch").await;
            self.publisher.publish_terminal(expected, "internal-error", serde_json::json!({ "submission-id": expected }));
            self.publisher.publish_terminal(submission_id, "internal-error", serde_json::json!({ "submission-id": submission_id }));
            return true;
        }

        if let Some(job) = &mut self.working {
            job.ack_deadline = None;
        }
        let _ = self.store.mark_processing(submission_id).await;
        self.state = State::Acknowledged;
        self.publisher.publish(submission_id, "processing", serde_json::json!({ "submission-id": submission_id }));
        false
    }

    async fn on_grading_begin(&mut self, submission_id: i64) {
        if !self.owns(submission_id) {
            return;
        }
        self.state = State::Grading;
        if let Err(err) = self.store.mark_grading_begin(submission_id, &self.name).await {
            warn!(worker = %self.name, %err, "failed to record grading-begin");
        }
        self.publisher.publish(submission_id, "grading-begin", serde_json::json!({ "submission-id": submission_id }));
    }

    async fn on_compile_message(&mut self, log: String) {
        let Some(id) = self.working_id() else { return };
        let _ = self.store.append_compile_message(id, &log).await;
        self.publisher.publish(id, "compile-message", serde_json::json!({ "log": log }));
    }

    async fn on_compile_error(&mut self, log: String) {
        let Some(id) = self.working_id() else { return };
        let _ = self.store.mark_compile_error(id, &log).await;
        self.publisher.publish_terminal(id, "compile-error", serde_json::json!({ "log": log }));
        self.publisher.publish_terminal(id, "ide-compile-error", serde_json::json!({ "submission-id": id, "log": log }));
        self.free_to_idle();
    }

    async fn on_internal_error(&mut self, message: String) {
        let Some(id) = self.working_id() else { return };
        let _ = self.store.mark_internal_error(id, &message).await;
        self.publisher.publish_terminal(id, "internal-error", serde_json::json!({ "submission-id": id, "message": message }));
        self.free_to_idle();
    }

    async fn on_submission_terminated(&mut self) {
        let Some(id) = self.working_id() else { return };
        let _ = self.store.mark_aborted(id).await;
        self.publisher.publish_terminal(id, "aborted", serde_json::json!({ "submission-id": id }));
        self.free_to_idle();
    }

    async fn on_test_case_status(&mut self, cases: Vec<TestCaseReport>) {
        let Some(id) = self.working_id() else { return };
        if cases.is_empty() {
            return;
        }

        let visible = self.working.as_ref().is_some_and(|w| w.testcase_visibility_all);

        let max_position = cases.iter().map(|c| c.position).max().unwrap_or(0);
        let in_batch = self.working.as_ref().is_some_and(|w| w.in_batch);
        let batch_ordinal = self.working.as_ref().map(|w| w.batch_ordinal);

        const MAX_FEEDBACK_LEN: usize = 50;
        let writes: Vec<TestCaseWrite> = cases
            .iter()
            .map(|c| TestCaseWrite {
                ordinal: c.position as i32,
                status: common::Verdict::from_testcase_bitmask(c.status),
                time: c.time,
                memory: c.memory,
                points: c.points,
                total: c.total_points,
                batch_ordinal: if in_batch { batch_ordinal } else { None },
                feedback: c.feedback.as_ref().map(|f| truncate(f, MAX_FEEDBACK_LEN)),
                extended_feedback: c.extended_feedback.clone(),
                output: c.output.clone(),
            })
            .collect();

        if let Err(err) = self
            .store
            .insert_test_cases(id, &writes, max_position as i32 + 1, in_batch)
            .await
        {
            warn!(worker = %self.name, %err, "failed to insert testcase rows");
        }

        if let Some(job) = &mut self.working {
            // Batch aggregation per §3/§9: batch-points = min(case.points),
            // batch-total = max(case.total); standalone cases add directly.
            if in_batch {
                let batch_points = cases.iter().map(|c| c.points).fold(f64::INFINITY, f64::min);
                let batch_total = cases.iter().map(|c| c.total_points).fold(f64::NEG_INFINITY, f64::max);
                job.case_points += batch_points;
                job.case_total += batch_total;
            } else {
                job.case_points += cases.iter().map(|c| c.points).sum::<f64>();
                job.case_total += cases.iter().map(|c| c.total_points).sum::<f64>();
            }
            job.time_used = job.time_used.max(cases.iter().map(|c| c.time).fold(0.0, f64::max));
            job.memory_used = job.memory_used.max(cases.iter().map(|c| c.memory).max().unwrap_or(0));
        }

        if visible {
            self.publisher.publish_testcase(id, "test-case", serde_json::json!({ "submission-id": id, "cases": writes_summary(&cases) }));
        }
    }

    async fn on_ping_response(&mut self, when: f64, worker_time: f64, load: f64) {
        let now = unix_timestamp();
        let round_trip = (now - when).max(0.0);
        let skew = (now + when) / 2.0 - worker_time;
        self.latency.push(round_trip * 1000.0);
        self.skew.push(skew);

        let latency_ms = self.latency.mean();
        self.registry.set_health(&self.name, latency_ms, load);
        if let Err(err) = self.store.update_worker_health(&self.name, latency_ms, load).await {
            if err.is_transient() {
                warn!(worker = %self.name, "transient storage error updating ping stats, will retry next tick");
            } else {
                warn!(worker = %self.name, %err, "failed to persist ping stats");
            }
        }
    }

    async fn on_supported_problems(&mut self, problems: Vec<(String,)>) {
        if self.config.ignore_problems_packet {
            return;
        }
        let set: std::collections::HashSet<String> = problems.into_iter().map(|(p,)| p).collect();
        self.registry.set_capabilities(&self.name, Capabilities {
            problems: set,
            executors: Default::default(),
        });
    }

    async fn on_executors(&mut self, executors: common::capabilities::ExecutorVersions) {
        let runtimes: Vec<(String, String, String, i32)> = executors
            .iter()
            .flat_map(|(language, versions)| {
                versions.iter().enumerate().map(move |(rank, (name, version))| {
                    (
                        language.clone(),
                        name.clone(),
                        version.iter().map(|n| n.to_string()).collect::<Vec<_>>().join("."),
                        rank as i32,
                    )
                })
            })
            .collect();
        let _ = self.store.replace_runtimes(&self.name, &runtimes).await;
    }

    /// Unlike the ordinary testcase path, which keys its topic by the outer
    /// `submission-id`, IDE-mode packets carry the submission id nested
    /// inside the envelope (§4.3, §9 open question — preserved as-is).
    fn on_test_case_ide(&self, result: serde_json::Value) {
        let Some(id) = result.get("current_submission_id").and_then(|v| v.as_i64()) else {
            return;
        };
        self.publisher.publish(id, "testcase-ide", serde_json::json!({ "result": result }));
    }

    async fn on_grading_end_internal(&mut self, submission_id: i64) {
        let Some(job) = &self.working else { return };
        if let Err(err) = self
            .store
            .finalize_grading(submission_id, job.case_points, job.case_total, job.time_used, job.memory_used)
            .await
        {
            warn!(worker = %self.name, %err, "failed to finalize grading");
        }
        self.publisher.publish_terminal(submission_id, "grading-end", serde_json::json!({ "submission-id": submission_id }));
        self.free_to_idle();
    }

    fn owns(&self, submission_id: i64) -> bool {
        self.working.as_ref().is_some_and(|w| w.submission_id == submission_id)
    }

    fn working_id(&self) -> Option<i64> {
        self.working.as_ref().map(|w| w.submission_id)
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn writes_summary(cases: &[TestCaseReport]) -> serde_json::Value {
    serde_json::json!(cases
        .iter()
        .map(|c| serde_json::json!({
            "position": c.position,
            "status": c.status,
            "time": c.time,
            "memory": c.memory,
            "points": c.points,
            "total-points": c.total_points,
        }))
        .collect::<Vec<_>>())
}
