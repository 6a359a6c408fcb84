//! Per-handle operation state tracking
//!
//! Tracks every submitted operation by its handle so that concurrent subjects
//! never clobber each other's state. Reads are lock-free for observers; the
//! mutating methods are crate-private and only the reconciler calls them.
//!
//! ## Key Features
//!
//! - **Concurrent access**: `DashMap` keyed by handle, per-shard locking
//! - **Monotonic transitions**: every update goes through [`OperationState::transition`]
//! - **Observers**: a `watch` channel per handle for waiting on terminal states
//! - **Advisory exclusion**: [`TransactionStateTracker::any_busy`] covers in-flight
//!   submissions (no handle yet) and non-terminal operations
//! - **Retention**: terminal operations are pruned once acknowledged or expired

use crate::errors::TransitionError;
use crate::types::{Handle, OperationKind, OperationState, SubjectKey};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

/// Snapshot of one tracked operation
#[derive(Debug, Clone)]
pub struct TrackedOperation {
    pub handle: Handle,
    pub kind: OperationKind,
    pub subject: SubjectKey,
    pub state: OperationState,
    /// Decoded reason, set only on Failed or TimedOut
    pub error_reason: Option<String>,
    /// Context generation the operation was submitted under
    pub generation: u64,
    pub submitted_at: Instant,
    pub terminal_at: Option<Instant>,
    pub acknowledged: bool,
}

struct Entry {
    operation: TrackedOperation,
    state_tx: watch::Sender<OperationState>,
}

type InFlightKey = (SubjectKey, OperationKind);

pub struct TransactionStateTracker {
    operations: DashMap<Handle, Entry>,
    in_flight: Arc<DashMap<InFlightKey, usize>>,
}

impl TransactionStateTracker {
    pub fn new() -> Self {
        Self {
            operations: DashMap::new(),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Current state; handles we do not know are Idle
    pub fn state_of(&self, handle: &Handle) -> OperationState {
        self.operations
            .get(handle)
            .map(|e| e.operation.state)
            .unwrap_or(OperationState::Idle)
    }

    pub fn error_reason(&self, handle: &Handle) -> Option<String> {
        self.operations
            .get(handle)
            .and_then(|e| e.operation.error_reason.clone())
    }

    pub fn operation(&self, handle: &Handle) -> Option<TrackedOperation> {
        self.operations.get(handle).map(|e| e.operation.clone())
    }

    /// Subscribe to state changes of one handle
    pub fn watch(&self, handle: &Handle) -> Option<watch::Receiver<OperationState>> {
        self.operations.get(handle).map(|e| e.state_tx.subscribe())
    }

    /// Wait until `handle` is terminal. Returns `None` if the handle is unknown,
    /// or the last observed state if it is forgotten before finishing.
    pub async fn wait_terminal(&self, handle: &Handle) -> Option<OperationState> {
        let mut rx = self.watch(handle)?;
        let result = rx.wait_for(|state| state.is_terminal()).await.map(|s| *s);
        match result {
            Ok(state) => Some(state),
            Err(_) => Some(*rx.borrow()),
        }
    }

    /// Whether an action for (subject, kind) should currently be disabled
    pub fn any_busy(&self, subject: &SubjectKey, kind: OperationKind) -> bool {
        if self
            .in_flight
            .get(&(*subject, kind))
            .map_or(false, |count| *count > 0)
        {
            return true;
        }
        self.operations.iter().any(|e| {
            let op = &e.operation;
            op.subject == *subject && op.kind == kind && !op.state.is_terminal()
        })
    }

    /// Number of non-terminal operations
    pub fn active_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|e| !e.operation.state.is_terminal())
            .count()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Mark a submission for (subject, kind) as in flight until the guard drops
    pub fn begin_submission(&self, subject: SubjectKey, kind: OperationKind) -> SubmissionGuard {
        *self.in_flight.entry((subject, kind)).or_insert(0) += 1;
        SubmissionGuard {
            in_flight: Arc::clone(&self.in_flight),
            key: (subject, kind),
        }
    }

    /// Observer has read the terminal state; the entry may be pruned
    pub fn acknowledge(&self, handle: &Handle) -> bool {
        match self.operations.get_mut(handle) {
            Some(mut entry) if entry.operation.state.is_terminal() => {
                entry.operation.acknowledged = true;
                true
            }
            _ => false,
        }
    }

    /// Remove terminal operations that were acknowledged or outlived `retention`
    pub fn prune(&self, retention: Duration) -> usize {
        let before = self.operations.len();
        self.operations.retain(|_, entry| {
            let op = &entry.operation;
            match op.terminal_at {
                Some(at) => !(op.acknowledged || at.elapsed() >= retention),
                None => true,
            }
        });
        let pruned = before.saturating_sub(self.operations.len());
        if pruned > 0 {
            debug!(pruned, "Pruned terminal operations");
        }
        pruned
    }

    pub(crate) fn insert_submitted(
        &self,
        handle: Handle,
        kind: OperationKind,
        subject: SubjectKey,
        generation: u64,
    ) -> Result<(), TransitionError> {
        use dashmap::mapref::entry::Entry as MapEntry;

        match self.operations.entry(handle) {
            MapEntry::Occupied(_) => Err(TransitionError::DuplicateHandle(handle)),
            MapEntry::Vacant(slot) => {
                let state = OperationState::Idle.transition(OperationState::Submitted)?;
                let (state_tx, _) = watch::channel(state);
                slot.insert(Entry {
                    operation: TrackedOperation {
                        handle,
                        kind,
                        subject,
                        state,
                        error_reason: None,
                        generation,
                        submitted_at: Instant::now(),
                        terminal_at: None,
                        acknowledged: false,
                    },
                    state_tx,
                });
                Ok(())
            }
        }
    }

    /// Apply a forward transition atomically with respect to other transitions
    /// of the same handle. `reason` is recorded only for Failed and TimedOut.
    pub(crate) fn transition(
        &self,
        handle: &Handle,
        next: OperationState,
        reason: Option<String>,
    ) -> Result<TrackedOperation, TransitionError> {
        let mut entry = self
            .operations
            .get_mut(handle)
            .ok_or(TransitionError::UnknownHandle(*handle))?;
        let state = entry.operation.state.transition(next)?;

        let op = &mut entry.operation;
        op.state = state;
        if matches!(state, OperationState::Failed | OperationState::TimedOut) {
            op.error_reason = reason;
        }
        if state.is_terminal() {
            op.terminal_at = Some(Instant::now());
        }
        let snapshot = op.clone();
        entry.state_tx.send_replace(state);
        Ok(snapshot)
    }

    /// Drop every operation submitted under a generation older than `generation`
    pub(crate) fn forget_before(&self, generation: u64) -> Vec<TrackedOperation> {
        let stale: Vec<Handle> = self
            .operations
            .iter()
            .filter(|e| e.operation.generation < generation)
            .map(|e| *e.key())
            .collect();
        stale
            .iter()
            .filter_map(|handle| self.operations.remove(handle))
            .map(|(_, entry)| entry.operation)
            .collect()
    }
}

impl Default for TransactionStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Busy marker for a submission that has no handle yet
///
/// Released on drop, whichever way the submission ends.
pub struct SubmissionGuard {
    in_flight: Arc<DashMap<InFlightKey, usize>>,
    key: InFlightKey,
}

impl Drop for SubmissionGuard {
    fn drop(&mut self) {
        let emptied = match self.in_flight.get_mut(&self.key) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if emptied {
            self.in_flight.remove_if(&self.key, |_, count| *count == 0);
        }
    }
}
