//! Error types for the engine and the event store.
//!
//! Step-level errors become events and flow through the projection;
//! only the retryable/non-retryable split matters to callers.

use thiserror::Error;

use crate::types::Sequence;

/// Event store failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// CAS append lost: the tail moved past the expected sequence.
    /// Recovered by re-projecting, never by blind retry.
    #[error("sequence conflict: expected tail {expected}, found {actual}")]
    Conflict { expected: Sequence, actual: Sequence },

    /// Transient backend failure; retryable with backoff.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Engine-level errors, per failure kind.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network-level failure reaching a step endpoint.
    #[error("transport error: {0}")]
    Transport(String),

    /// Step invocation exceeded its configured timeout.
    #[error("step timed out: {0}")]
    Timeout(String),

    /// The step itself reported failure, or returned a body the
    /// engine cannot interpret.
    #[error("step unsuccessful: {0}")]
    StepUnsuccessful(String),

    /// Plan rejected at submission.
    #[error("invalid plan: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Projection invariant violated; fatal for the workflow.
    #[error("inconsistent state: {0}")]
    InconsistentState(String),

    /// Execution aborted by the orchestrator; no terminal event is
    /// emitted on behalf of the step.
    #[error("cancelled")]
    Cancelled,

    /// Steps remain needed but none can ever run. An unsatisfiable
    /// plan should have been rejected at submission.
    #[error("deadlock: {0}")]
    Deadlock(String),
}

impl EngineError {
    /// Whether a failed step attempt may be rescheduled.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Transport(_)
                | EngineError::Timeout(_)
                | EngineError::Store(StoreError::Backend(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(EngineError::Transport("connection refused".into()).is_retryable());
        assert!(EngineError::Timeout("30s elapsed".into()).is_retryable());
        assert!(!EngineError::StepUnsuccessful("no".into()).is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
        assert!(!EngineError::Store(StoreError::Conflict {
            expected: 4,
            actual: 5
        })
        .is_retryable());
        assert!(EngineError::Store(StoreError::Backend("i/o".into())).is_retryable());
    }
}
