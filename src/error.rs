use crate::activity::ActivityKind;
use crate::case::CaseStatus;

#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("failed to encode {0}")]
    Encode(String),
    #[error("failed to decode stored record: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("journal for {execution} diverged at step {seq}: expected {expected}, found {found}")]
    NonDeterministicReplay {
        execution: String,
        seq: u64,
        expected: &'static str,
        found: &'static str,
    },
    #[error("status transition {from} -> {to} is not allowed")]
    InvalidTransition { from: CaseStatus, to: CaseStatus },
    #[error("no case with id {0}")]
    UnknownCase(String),
    #[error("case {0} is already running")]
    AlreadyRunning(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Error reported by a single attempt of an external operation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ActivityError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("non-retryable failure: {0}")]
    NonRetryable(String),
}

impl ActivityError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ActivityError::Transient(_))
    }
}

/// Terminal failure of an activity once its retry policy gave up.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{activity} failed after {attempts} attempt(s): {reason}")]
pub struct ActivityFailure {
    pub activity: ActivityKind,
    pub attempts: u32,
    pub reason: String,
}
