use uuid::Uuid;

use crate::ids::Stage;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error("ambiguous id: resolved to {}", .ids.join(", "))]
    AmbiguousId { ids: Vec<String> },
    #[error("concurrent modification of id {canonical_id} in stage {stage}")]
    Conflict { canonical_id: Uuid, stage: Stage },
    #[error("inconsistent state: {0}")]
    InconsistentState(String),
    #[error("document source error: {0}")]
    Source(String),
}

impl KernelError {
    /// Whether repeating the whole operation from a fresh read may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
