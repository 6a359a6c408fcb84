//! Reconciler - Ledger Write Reconciliation Engine
//!
//! Submits permissioned writes (authorize, revoke, purchase, reclaim) to a
//! remote ledger and reconciles each write's confirmation from two
//! independent signals, the notification feed and the receipt channel.
//! Every operation reaches exactly one terminal state, its completion
//! callback runs at most once, and only the read-state it touched is
//! invalidated.

pub mod abi;
pub mod callbacks;
pub mod config;
pub mod error_decoder;
pub mod errors;
pub mod invalidator;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod reconciler;
pub mod submitter;
pub mod tracker;
pub mod types;

// Re-export commonly used types
pub use errors::SubmissionError;
pub use invalidator::{Invalidation, ReadKey};
pub use reconciler::{ConfirmationReconciler, Signal, SignalOutcome};
pub use submitter::OperationSubmitter;
pub use types::{Completion, CompletionCallback, Handle, OperationKind, OperationState, SubjectKey};
