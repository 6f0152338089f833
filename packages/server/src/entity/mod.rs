pub mod problem;
pub mod submission;
pub mod test_case;
pub mod worker;
pub mod worker_runtime;
