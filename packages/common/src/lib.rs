pub mod capabilities;
pub mod config;
pub mod event;
pub mod status;

pub use capabilities::{Capabilities, ExecutorVersions, ProblemSet};
pub use config::BridgeConfig;
pub use status::{Result as Verdict, Status as SubmissionStatus};
