//! Error types for the dunning engine

use thiserror::Error;

/// Errors surfaced by dunning operations
#[derive(Debug, Error)]
pub enum DunningError {
    /// Bad policy parameters or an operation that contradicts campaign state
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration, campaign or attempt is absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// An active campaign already exists for the target.
    /// Callers must not blindly retry-create.
    #[error("Active campaign already exists for {0}")]
    CampaignAlreadyActive(String),

    /// Attempt numbers must be contiguous starting at 1
    #[error("Out-of-order attempt: expected {expected}, got {got}")]
    OutOfOrderAttempt { expected: i32, got: i32 },

    /// Final action value is not cancel/pause/downgrade
    #[error("Unknown final action: {0}")]
    UnknownFinalAction(String),

    /// The campaign was already marked failed but the terminal side effect
    /// could not be applied. Campaign state is NOT rolled back; the
    /// reconciliation job picks the campaign up later.
    #[error("Final action failed: {0}")]
    FinalActionFailed(String),

    /// The caller did not resolve required workspace/customer context
    #[error("Insufficient context: {0}")]
    InsufficientContext(String),

    /// Collaborator or storage failure, generally retryable by the caller
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for DunningError {
    fn from(e: sqlx::Error) -> Self {
        DunningError::Storage(e.to_string())
    }
}

pub type DunningResult<T> = Result<T, DunningError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DunningError::OutOfOrderAttempt {
            expected: 2,
            got: 4,
        };
        assert_eq!(err.to_string(), "Out-of-order attempt: expected 2, got 4");

        let err = DunningError::UnknownFinalAction("archive".to_string());
        assert_eq!(err.to_string(), "Unknown final action: archive");
    }
}
