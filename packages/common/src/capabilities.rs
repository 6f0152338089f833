//! Worker capability types shared between the wire protocol and the registry.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Problem codes a worker has data for.
pub type ProblemSet = HashSet<String>;

/// `language-key -> ordered runtime versions`, e.g. `{"py3": [("CPython",
/// [3, 11, 5])]}`. Order is worker-reported preference, lowest index first.
pub type ExecutorVersions = HashMap<String, Vec<(String, Vec<u32>)>>;

/// What a worker told us it can grade, from `handshake` or subsequent
/// `supported-problems` / `executors` packets.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    pub problems: ProblemSet,
    pub executors: ExecutorVersions,
}

impl Capabilities {
    pub fn new(problems: ProblemSet, executors: ExecutorVersions) -> Self {
        Self { problems, executors }
    }

    /// Whether this worker can grade a submission for `problem` in `language`.
    pub fn supports(&self, problem: &str, language: &str) -> bool {
        self.problems.contains(problem) && self.executors.contains_key(language)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supports_requires_both_problem_and_language() {
        let mut caps = Capabilities::default();
        caps.problems.insert("p1".into());
        caps.executors.insert("py3".into(), vec![("CPython".into(), vec![3, 11, 5])]);

        assert!(caps.supports("p1", "py3"));
        assert!(!caps.supports("p1", "cpp"));
        assert!(!caps.supports("p2", "py3"));
    }
}
