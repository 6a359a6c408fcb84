//! Error types for the reconciliation engine
//!
//! Synchronous failures of a submission are returned to the caller as
//! [`SubmissionError`]. Asynchronous outcomes (on-chain revert, timeout) never
//! appear here: they are surfaced through the terminal operation state and the
//! completion callback.

use crate::types::{Handle, OperationState, RejectPayload};
use thiserror::Error;

/// Errors returned synchronously from `OperationSubmitter::submit`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    /// Malformed subject or amount, or no acting account
    ///
    /// Nothing is tracked when this is returned.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The dry-run against the ledger reverted
    ///
    /// Carries the decoded, human-readable reason.
    #[error("{0}")]
    SimulationRejected(String),

    /// The signer declined to authorize the write
    #[error("Transaction was rejected by user.")]
    UserRejected,

    /// Transport or RPC failure while simulating or submitting
    #[error("Submission transport error: {0}")]
    SubmissionTransportError(String),

    /// The acting account changed while the write was being submitted
    ///
    /// The write reached the ledger under the old account, but its handle is
    /// not tracked and its completion callback was dropped.
    #[error("Account changed during submission; transaction {0} is not tracked")]
    ContextChanged(Handle),
}

impl SubmissionError {
    /// Check if this error is potentially retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SubmissionTransportError(_) => true,
            // The caller may change their mind and sign the next time
            Self::UserRejected => true,
            Self::InvalidInput(_) => false,
            Self::SimulationRejected(_) => false,
            // The write is already on the ledger
            Self::ContextChanged(_) => false,
        }
    }

    /// Get the error category for metrics and observability
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::SimulationRejected(_) => "simulation",
            Self::UserRejected => "user_rejected",
            Self::SubmissionTransportError(_) => "transport",
            Self::ContextChanged(_) => "context_changed",
        }
    }

    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput(reason.into())
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::SubmissionTransportError(reason.into())
    }
}

/// Rejected or impossible state-tracker updates
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Illegal state transition {from} -> {to}")]
    Illegal {
        from: OperationState,
        to: OperationState,
    },

    #[error("Unknown handle {0}")]
    UnknownHandle(Handle),

    #[error("Handle {0} is already tracked")]
    DuplicateHandle(Handle),
}

/// Callback registry misuse
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("A completion callback is already bound to handle {0}")]
    AlreadyBound(Handle),
}

/// Failures reported by the ledger collaborators
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerRejection {
    /// Deterministic rejection carrying the raw revert payload
    #[error("Ledger rejected the call: {}", .0.message)]
    Reverted(RejectPayload),

    #[error("Signer declined the request")]
    UserRejected,

    #[error("Ledger transport error: {0}")]
    Transport(String),
}

impl LedgerRejection {
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SubmissionError::invalid_input("bad subject");
        assert_eq!(err.to_string(), "Invalid input: bad subject");

        let err = SubmissionError::SimulationRejected("Wallet is not whitelisted".to_string());
        assert_eq!(err.to_string(), "Wallet is not whitelisted");

        assert_eq!(
            SubmissionError::UserRejected.to_string(),
            "Transaction was rejected by user."
        );
    }

    #[test]
    fn test_error_retryability() {
        assert!(SubmissionError::transport("timeout").is_retryable());
        assert!(!SubmissionError::invalid_input("x").is_retryable());
        assert!(!SubmissionError::SimulationRejected("x".to_string()).is_retryable());
        assert!(!SubmissionError::ContextChanged(Handle::from_bytes([1; 32])).is_retryable());
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(SubmissionError::UserRejected.category(), "user_rejected");
        assert_eq!(SubmissionError::transport("x").category(), "transport");
        assert_eq!(
            SubmissionError::SimulationRejected("x".to_string()).category(),
            "simulation"
        );
        let err = SubmissionError::ContextChanged(Handle::from_bytes([0xab; 32]));
        assert_eq!(err.category(), "context_changed");
        assert!(err.to_string().starts_with("Account changed during submission; transaction 0xabab"));
    }

    #[test]
    fn test_transition_error_display() {
        let err = TransitionError::Illegal {
            from: OperationState::Confirmed,
            to: OperationState::Failed,
        };
        assert_eq!(err.to_string(), "Illegal state transition confirmed -> failed");
    }
}
