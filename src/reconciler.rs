//! Confirmation reconciliation
//!
//! For every tracked handle a watcher task merges the two confirmation
//! channels (the notification feed and the receipt stream) with a deadline.
//! Whichever reports a completion first drives the single terminal transition;
//! the completion callback and the read-state invalidation follow it exactly
//! once. Anything arriving afterwards is a counted no-op.
//!
//! Switching the acting account bumps a generation counter. Watchers and
//! operations from older generations are dropped, and any signal still tagged
//! with an old generation is discarded.

use crate::abi::InterfaceDescription;
use crate::callbacks::CallbackRegistry;
use crate::error_decoder::ErrorDecoder;
use crate::errors::TransitionError;
use crate::invalidator::DerivedStateInvalidator;
use crate::ledger::{EventSource, LogRecord, ReceiptSource, ReceiptUpdate};
use crate::logging::OperationLogger;
use crate::metrics::{metrics, Timer};
use crate::tracker::TransactionStateTracker;
use crate::types::{
    Completion, CompletionCallback, Handle, OperationKind, OperationState, RejectPayload,
    SubjectKey,
};
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info};

/// Default time a submitted operation may stay unconfirmed
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(30);

/// A report from one of the confirmation channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Included in a block, awaiting finality
    Mined { block: u64 },
    /// A matching notification arrived on the event feed
    EventConfirmed,
    /// The receipt reached the confirmation depth with success status
    ReceiptConfirmed,
    /// The receipt reports a revert
    Reverted(RejectPayload),
    /// The confirmation window elapsed
    Expired,
}

/// What a reported signal did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Applied(OperationState),
    /// The handle was already at or past the signalled state
    Ignored,
    /// Tagged with a previous account context
    Stale,
    /// Never tracked, or forgotten by a context switch
    Unknown,
}

struct WatchEntry {
    generation: u64,
    logger: OperationLogger,
    abort: Option<AbortHandle>,
}

pub struct ConfirmationReconciler {
    tracker: Arc<TransactionStateTracker>,
    callbacks: CallbackRegistry,
    invalidator: Arc<DerivedStateInvalidator>,
    decoder: ErrorDecoder,
    interface: Arc<InterfaceDescription>,
    events: Arc<dyn EventSource>,
    receipts: Arc<dyn ReceiptSource>,
    generation: AtomicU64,
    /// Acting account; its lock also orders commits against context switches
    account: RwLock<Option<SubjectKey>>,
    watchers: DashMap<Handle, WatchEntry>,
    confirmation_timeout: Duration,
}

impl ConfirmationReconciler {
    pub fn new(
        events: Arc<dyn EventSource>,
        receipts: Arc<dyn ReceiptSource>,
        interface: Arc<InterfaceDescription>,
        decoder: ErrorDecoder,
        confirmation_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            tracker: Arc::new(TransactionStateTracker::new()),
            callbacks: CallbackRegistry::new(),
            invalidator: Arc::new(DerivedStateInvalidator::new()),
            decoder,
            interface,
            events,
            receipts,
            generation: AtomicU64::new(0),
            account: RwLock::new(None),
            watchers: DashMap::new(),
            confirmation_timeout,
        })
    }

    pub fn tracker(&self) -> &Arc<TransactionStateTracker> {
        &self.tracker
    }

    pub fn invalidator(&self) -> &Arc<DerivedStateInvalidator> {
        &self.invalidator
    }

    pub fn decoder(&self) -> &ErrorDecoder {
        &self.decoder
    }

    pub fn interface(&self) -> &Arc<InterfaceDescription> {
        &self.interface
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn account(&self) -> Option<SubjectKey> {
        *self.account.read()
    }

    /// Acting account and generation, read together
    pub fn context(&self) -> (Option<SubjectKey>, u64) {
        let account = self.account.read();
        (*account, self.generation())
    }

    /// Number of live watcher tasks
    pub fn watching(&self) -> usize {
        self.watchers.len()
    }

    /// Switch the acting account (or disconnect with `None`).
    ///
    /// Drops every pending callback, stops the old watchers and forgets their
    /// operations. Returns the new generation.
    pub fn switch_context(&self, account: Option<SubjectKey>) -> u64 {
        let mut current = self.account.write();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *current = account;

        let dropped_callbacks = self.callbacks.clear();
        self.watchers.retain(|_, entry| {
            if entry.generation < generation {
                if let Some(abort) = &entry.abort {
                    abort.abort();
                }
                false
            } else {
                true
            }
        });
        let forgotten = self.tracker.forget_before(generation);
        let unfinished = forgotten.iter().filter(|op| !op.state.is_terminal()).count();

        let m = metrics();
        m.operations_in_flight.sub(unfinished as i64);
        m.context_generation.set(generation as i64);
        info!(
            account = ?account.map(|a| a.to_string()),
            generation,
            dropped_callbacks,
            forgotten = forgotten.len(),
            "🔁 Account context switched"
        );
        generation
    }

    /// Register a freshly submitted handle and start watching it.
    ///
    /// Both channels are subscribed before this returns. Returns `Ok(false)`
    /// when `generation` is already stale, in which case nothing is tracked.
    pub(crate) fn track(
        self: &Arc<Self>,
        handle: Handle,
        kind: OperationKind,
        subject: SubjectKey,
        generation: u64,
        logger: OperationLogger,
        callback: Option<CompletionCallback>,
    ) -> Result<bool, TransitionError> {
        let (events, receipts) = {
            let _context = self.account.read();
            let current = self.generation();
            if generation != current {
                logger.log_stale_signal(&handle, generation, current);
                metrics().stale_generation_signals.inc();
                return Ok(false);
            }

            self.tracker.insert_submitted(handle, kind, subject, generation)?;
            if let Some(callback) = callback {
                if let Err(e) = self.callbacks.register(handle, callback) {
                    logger.warn(&e.to_string());
                }
            }
            metrics().record_submission(kind);
            logger.log_submitted(&handle, generation);

            let events = self.events.subscribe(kind.notification());
            let receipts = self.receipts.watch_receipt(&handle);
            self.watchers.insert(
                handle,
                WatchEntry {
                    generation,
                    logger,
                    abort: None,
                },
            );
            (events, receipts)
        };

        let task = tokio::spawn(Arc::clone(self).watch(
            handle, kind, subject, generation, events, receipts,
        ));
        if let Some(mut entry) = self.watchers.get_mut(&handle) {
            entry.abort = Some(task.abort_handle());
        }
        Ok(true)
    }

    async fn watch(
        self: Arc<Self>,
        handle: Handle,
        kind: OperationKind,
        subject: SubjectKey,
        generation: u64,
        mut events: BoxStream<'static, Vec<LogRecord>>,
        mut receipts: BoxStream<'static, ReceiptUpdate>,
    ) {
        let deadline = tokio::time::sleep(self.confirmation_timeout);
        tokio::pin!(deadline);
        let mut events_open = true;
        let mut receipts_open = true;

        loop {
            let signal = tokio::select! {
                batch = events.next(), if events_open => match batch {
                    Some(records) if records.iter().any(|r| r.confirms(kind, &subject, &handle)) => {
                        Signal::EventConfirmed
                    }
                    Some(_) => continue,
                    None => {
                        events_open = false;
                        continue;
                    }
                },
                update = receipts.next(), if receipts_open => match update {
                    Some(ReceiptUpdate::Mined { block }) => Signal::Mined { block },
                    Some(ReceiptUpdate::Success { .. }) => Signal::ReceiptConfirmed,
                    Some(ReceiptUpdate::Reverted(payload)) => Signal::Reverted(payload),
                    None => {
                        receipts_open = false;
                        continue;
                    }
                },
                _ = &mut deadline => Signal::Expired,
            };

            match self.report(&handle, generation, signal) {
                SignalOutcome::Stale | SignalOutcome::Unknown => break,
                _ if self.tracker.state_of(&handle).is_terminal() => break,
                _ => {}
            }
        }
        debug!(handle = %handle, "Watcher finished");
    }

    /// Apply a signal for `handle` observed under `generation`
    pub fn report(&self, handle: &Handle, generation: u64, signal: Signal) -> SignalOutcome {
        let logger = self.watchers.get(handle).map(|entry| entry.logger.clone());

        let (next, reason) = match signal {
            Signal::Mined { .. } => (OperationState::Pending, None),
            Signal::EventConfirmed | Signal::ReceiptConfirmed => (OperationState::Confirmed, None),
            Signal::Reverted(payload) => (
                OperationState::Failed,
                Some(self.decoder.describe(&payload, Some(self.interface.as_ref()))),
            ),
            Signal::Expired => (
                OperationState::TimedOut,
                Some(timeout_reason(self.confirmation_timeout)),
            ),
        };

        let committed = {
            let _context = self.account.read();
            let current = self.generation();
            if generation != current {
                if let Some(logger) = &logger {
                    logger.log_stale_signal(handle, generation, current);
                }
                metrics().stale_generation_signals.inc();
                return SignalOutcome::Stale;
            }
            self.tracker.transition(handle, next, reason)
        };

        let op = match committed {
            Ok(op) => op,
            Err(TransitionError::Illegal { from, .. }) => {
                if from.is_terminal() {
                    metrics().duplicate_signals_ignored.inc();
                    debug!(handle = %handle, state = %from, signal = %next, "Ignoring signal for terminal handle");
                }
                return SignalOutcome::Ignored;
            }
            Err(_) => return SignalOutcome::Unknown,
        };

        if !op.state.is_terminal() {
            if let Some(logger) = &logger {
                logger.log_pending(handle);
            }
            return SignalOutcome::Applied(op.state);
        }

        if let Some((_, entry)) = self.watchers.remove(handle) {
            if let Some(abort) = entry.abort {
                abort.abort();
            }
        }
        let timer = Timer::since(op.submitted_at);
        let m = metrics();
        m.record_terminal(op.state);
        timer.observe_duration(&m.confirmation_latency);
        if let Some(logger) = &logger {
            logger.log_terminal(
                handle,
                op.state,
                op.error_reason.as_deref(),
                (timer.elapsed_secs() * 1000.0) as u64,
            );
        }

        let completion = Completion {
            handle: op.handle,
            kind: op.kind,
            subject: op.subject,
            state: op.state,
            error_reason: op.error_reason.clone(),
        };
        self.callbacks.fire(handle, &completion);
        let keys = self.invalidator.invalidate(&op.subject, op.kind);
        m.invalidations_published.inc_by(keys.len() as u64);

        SignalOutcome::Applied(op.state)
    }

    /// Periodically prune terminal operations; stops once the reconciler is dropped
    pub fn spawn_pruner(self: &Arc<Self>, interval: Duration, retention: Duration) -> JoinHandle<()> {
        let reconciler = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(reconciler) = reconciler.upgrade() else {
                    break;
                };
                reconciler.tracker.prune(retention);
            }
        })
    }
}

fn timeout_reason(timeout: Duration) -> String {
    format!("No confirmation received within {}s", timeout.as_secs())
}
