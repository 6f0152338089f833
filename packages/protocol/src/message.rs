//! Typed decode of the `name`-discriminated wire messages (§4.3, §6).

use common::capabilities::ExecutorVersions;
use serde::{Deserialize, Serialize};

use crate::error::MessageError;

/// One reported testcase result inside a `test-case-status` packet.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestCaseReport {
    pub position: u32,
    /// Bitmask; decode with [`common::status::Result::from_testcase_bitmask`].
    pub status: u32,
    pub time: f64,
    pub memory: i64,
    pub points: f64,
    #[serde(rename = "total-points")]
    pub total_points: f64,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default, rename = "extended-feedback")]
    pub extended_feedback: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
}

/// Messages a worker may send (Worker -> Server, §6).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum WorkerMessage {
    #[serde(rename_all = "kebab-case")]
    Handshake {
        id: String,
        key: String,
        #[serde(default)]
        problems: Vec<(String,)>,
        #[serde(default)]
        executors: ExecutorVersions,
    },
    #[serde(rename_all = "kebab-case")]
    SubmissionAcknowledged {
        #[serde(rename = "submission-id")]
        submission_id: i64,
    },
    #[serde(rename_all = "kebab-case")]
    GradingBegin {
        #[serde(rename = "submission-id")]
        submission_id: i64,
    },
    #[serde(rename_all = "kebab-case")]
    GradingEnd {
        #[serde(rename = "submission-id")]
        submission_id: i64,
    },
    #[serde(rename_all = "kebab-case")]
    CompileMessage { log: String },
    #[serde(rename_all = "kebab-case")]
    CompileError { log: String },
    #[serde(rename_all = "kebab-case")]
    BatchBegin {},
    #[serde(rename_all = "kebab-case")]
    BatchEnd {},
    #[serde(rename_all = "kebab-case")]
    TestCaseStatus { cases: Vec<TestCaseReport> },
    #[serde(rename_all = "kebab-case")]
    InternalError { message: String },
    #[serde(rename_all = "kebab-case")]
    SubmissionTerminated {},
    #[serde(rename_all = "kebab-case")]
    PingResponse { when: f64, time: f64, load: f64 },
    #[serde(rename_all = "kebab-case")]
    SupportedProblems {
        #[serde(default)]
        problems: Vec<(String,)>,
    },
    #[serde(rename_all = "kebab-case")]
    Executors { executors: ExecutorVersions },
    #[serde(rename_all = "kebab-case")]
    TestcaseIde { result: serde_json::Value },
}

impl WorkerMessage {
    /// Decode a decompressed JSON frame body. Errors here are non-fatal to
    /// the connection (§4.3: "logged as malformed; session is NOT
    /// terminated").
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        if value.get("name").is_none() {
            return Err(MessageError::UnknownName("<missing>".to_string()));
        }
        match serde_json::from_value::<Self>(value.clone()) {
            Ok(msg) => Ok(msg),
            Err(e) => {
                if let Some(name) = value.get("name").and_then(|n| n.as_str()) {
                    if !KNOWN_NAMES.contains(&name) {
                        return Err(MessageError::UnknownName(name.to_string()));
                    }
                }
                Err(MessageError::Json(e))
            }
        }
    }
}

const KNOWN_NAMES: &[&str] = &[
    "handshake",
    "submission-acknowledged",
    "grading-begin",
    "grading-end",
    "compile-message",
    "compile-error",
    "batch-begin",
    "batch-end",
    "test-case-status",
    "internal-error",
    "submission-terminated",
    "ping-response",
    "supported-problems",
    "executors",
    "testcase-ide",
];

/// Metadata describing a dispatched submission (§4.2, Idle -> Dispatched).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SubmissionMeta {
    #[serde(rename = "pretests-only")]
    pub pretests_only: bool,
    #[serde(rename = "in-contest")]
    pub in_contest: bool,
    #[serde(rename = "attempt-no")]
    pub attempt_no: u32,
    pub user: String,
    #[serde(rename = "file-only")]
    pub file_only: bool,
    #[serde(rename = "file-size-limit")]
    pub file_size_limit: Option<i64>,
    /// Preserved verbatim as `ide_input` (not kebab-case) per the source format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ide_input: Option<String>,
}

/// The submitted source: inline text, or a URL when the language is file-only.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SubmissionSource {
    Inline { source: String },
    Url {
        #[serde(rename = "source-url")]
        source_url: String,
    },
}

/// Messages the server may send (Server -> Worker, §6).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "kebab-case")]
    HandshakeSuccess {},
    SubmissionRequest {
        #[serde(rename = "submission-id")]
        submission_id: i64,
        #[serde(rename = "problem-id")]
        problem_id: String,
        language: String,
        #[serde(flatten)]
        source: SubmissionSource,
        #[serde(rename = "time-limit")]
        time_limit: f64,
        #[serde(rename = "memory-limit")]
        memory_limit: i64,
        #[serde(rename = "short-circuit")]
        short_circuit: bool,
        meta: SubmissionMeta,
    },
    #[serde(rename_all = "kebab-case")]
    TerminateSubmission {
        #[serde(rename = "submission-id")]
        submission_id: i64,
    },
    Ping {
        when: f64,
    },
    #[serde(rename_all = "kebab-case")]
    Disconnect {},
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_handshake() {
        let json = br#"{"name":"handshake","id":"j1","key":"K","problems":[["p1"]],"executors":{"py3":[["CPython",[3,11,5]]]}}"#;
        let msg = WorkerMessage::decode(json).unwrap();
        match msg {
            WorkerMessage::Handshake {
                id,
                key,
                problems,
                executors,
            } => {
                assert_eq!(id, "j1");
                assert_eq!(key, "K");
                assert_eq!(problems, vec![("p1".to_string(),)]);
                assert_eq!(
                    executors.get("py3").unwrap()[0],
                    ("CPython".to_string(), vec![3, 11, 5])
                );
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn decodes_test_case_status() {
        let json = br#"{"name":"test-case-status","cases":[{"position":1,"status":0,"time":0.01,"memory":1024,"points":1.0,"total-points":1.0}]}"#;
        let msg = WorkerMessage::decode(json).unwrap();
        match msg {
            WorkerMessage::TestCaseStatus { cases } => {
                assert_eq!(cases.len(), 1);
                assert_eq!(cases[0].position, 1);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_name_is_non_fatal() {
        let json = br#"{"name":"not-a-real-packet"}"#;
        let err = WorkerMessage::decode(json).unwrap_err();
        assert!(matches!(err, MessageError::UnknownName(_)));
    }

    #[test]
    fn missing_name_is_non_fatal() {
        let json = br#"{"foo":"bar"}"#;
        let err = WorkerMessage::decode(json).unwrap_err();
        assert!(matches!(err, MessageError::UnknownName(_)));
    }

    #[test]
    fn server_message_encodes_kebab_fields() {
        let msg = ServerMessage::SubmissionRequest {
            submission_id: 42,
            problem_id: "p1".into(),
            language: "py3".into(),
            source: SubmissionSource::Inline {
                source: "print(1)".into(),
            },
            time_limit: 2.0,
            memory_limit: 262144,
            short_circuit: false,
            meta: SubmissionMeta {
                pretests_only: false,
                in_contest: false,
                attempt_no: 1,
                user: "alice".into(),
                file_only: false,
                file_size_limit: None,
                ide_input: None,
            },
        };
        let bytes = msg.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["name"], "submission-request");
        assert_eq!(value["submission-id"], 42);
        assert_eq!(value["meta"]["pretests-only"], false);
        assert_eq!(value["meta"]["ide_input"], serde_json::Value::Null);
    }
}
