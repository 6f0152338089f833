pub mod error;
pub mod frame;
pub mod message;

pub use error::{MessageError, ProtocolError};
pub use frame::{Transport, TransportReader, TransportWriter};
pub use message::{ServerMessage, SubmissionMeta, SubmissionSource, TestCaseReport, WorkerMessage};
