//! Write submission
//!
//! Validates input, dry-runs the write, submits it and hands the resulting
//! handle to the reconciler in one synchronous step. Everything that can go
//! wrong before a handle exists is returned as a [`SubmissionError`]; nothing
//! is tracked in that case. A handle that comes back after the acting account
//! changed is returned inside [`SubmissionError::ContextChanged`], untracked.

use crate::errors::{LedgerRejection, SubmissionError};
use crate::ledger::{Contracts, LedgerCall, LedgerWriter};
use crate::logging::OperationLogger;
use crate::metrics::{metrics, Timer};
use crate::reconciler::ConfirmationReconciler;
use crate::types::{Amount, CompletionCallback, Handle, OperationKind, SubjectKey};
use std::sync::Arc;
use tracing::instrument;

pub struct OperationSubmitter {
    writer: Arc<dyn LedgerWriter>,
    reconciler: Arc<ConfirmationReconciler>,
    contracts: Contracts,
}

impl OperationSubmitter {
    pub fn new(
        writer: Arc<dyn LedgerWriter>,
        reconciler: Arc<ConfirmationReconciler>,
        contracts: Contracts,
    ) -> Self {
        Self {
            writer,
            reconciler,
            contracts,
        }
    }

    pub fn reconciler(&self) -> &Arc<ConfirmationReconciler> {
        &self.reconciler
    }

    /// Whether the action for (subject, kind) should be offered right now.
    ///
    /// Malformed subjects are never busy.
    pub fn any_busy(&self, subject: &str, kind: OperationKind) -> bool {
        SubjectKey::parse(subject)
            .map(|subject| self.reconciler.tracker().any_busy(&subject, kind))
            .unwrap_or(false)
    }

    /// Submit `kind` on `subject`.
    ///
    /// `amount` is a decimal base-unit string and is required for Purchase and
    /// Reclaim only. On success the handle is already tracked as Submitted and
    /// `on_complete` is bound to it.
    ///
    /// If the account is switched while the write is in flight, the ledger may
    /// still have accepted it; the handle is then reported through
    /// [`SubmissionError::ContextChanged`] and `on_complete` never fires.
    #[instrument(skip(self, on_complete))]
    pub async fn submit(
        &self,
        kind: OperationKind,
        subject: &str,
        amount: Option<&str>,
        on_complete: Option<CompletionCallback>,
    ) -> Result<Handle, SubmissionError> {
        let result = self.submit_inner(kind, subject, amount, on_complete).await;
        if let Err(e) = &result {
            metrics().record_submission_error(e.category());
        }
        result
    }

    async fn submit_inner(
        &self,
        kind: OperationKind,
        subject: &str,
        amount: Option<&str>,
        on_complete: Option<CompletionCallback>,
    ) -> Result<Handle, SubmissionError> {
        let subject = SubjectKey::parse(subject)?;
        let amount = match (kind.requires_amount(), amount) {
            (true, Some(amount)) => Some(Amount::parse(amount)?),
            (true, None) => {
                return Err(SubmissionError::invalid_input(format!(
                    "{} requires an amount",
                    kind
                )))
            }
            (false, Some(_)) => {
                return Err(SubmissionError::invalid_input(format!(
                    "{} does not take an amount",
                    kind
                )))
            }
            (false, None) => None,
        };

        let (account, generation) = self.reconciler.context();
        let from = account
            .ok_or_else(|| SubmissionError::invalid_input("no acting account is connected"))?;
        if kind == OperationKind::Purchase && subject != from {
            return Err(SubmissionError::invalid_input(
                "purchases are made by the acting account",
            ));
        }

        let logger = OperationLogger::new(kind, subject);
        let _in_flight = self.reconciler.tracker().begin_submission(subject, kind);
        let call = LedgerCall::for_operation(kind, subject, amount, from, &self.contracts);

        let timer = Timer::new();
        let simulated = self.writer.simulate(&call).await;
        timer.observe_duration(&metrics().simulation_latency);
        let prepared = simulated.map_err(|rejection| self.classify(rejection, &logger))?;

        let handle = self
            .writer
            .submit(prepared)
            .await
            .map_err(|rejection| self.classify(rejection, &logger))?;

        // No suspension point between the handle and its registration
        match self
            .reconciler
            .track(handle, kind, subject, generation, logger.clone(), on_complete)
        {
            Ok(true) => Ok(handle),
            Ok(false) => {
                logger.warn("Account changed during submission; handle is not tracked");
                Err(SubmissionError::ContextChanged(handle))
            }
            Err(e) => {
                logger.error(&e.to_string());
                Err(SubmissionError::transport(e.to_string()))
            }
        }
    }

    fn classify(&self, rejection: LedgerRejection, logger: &OperationLogger) -> SubmissionError {
        match rejection {
            LedgerRejection::Reverted(payload) if payload.mentions_user_rejection() => {
                SubmissionError::UserRejected
            }
            LedgerRejection::Reverted(payload) => {
                let reason = self
                    .reconciler
                    .decoder()
                    .describe(&payload, Some(self.reconciler.interface().as_ref()));
                logger.log_simulation_rejected(&reason);
                metrics().simulation_rejections.inc();
                SubmissionError::SimulationRejected(reason)
            }
            LedgerRejection::UserRejected => SubmissionError::UserRejected,
            LedgerRejection::Transport(reason) => {
                logger.error(&reason);
                SubmissionError::SubmissionTransportError(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_decoder::ErrorDecoder;
    use crate::ledger::simulated::{DeliveryOrder, SimulatedLedger};
    use crate::ledger::PreparedRequest;
    use crate::reconciler::DEFAULT_CONFIRMATION_TIMEOUT;
    use crate::types::OperationState;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PROVIDER: &str = "0x0101010101010101010101010101010101010101";
    const INVESTOR: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";

    fn setup() -> (SimulatedLedger, OperationSubmitter) {
        let contracts = Contracts {
            token: SubjectKey::from_bytes([0xaa; 20]),
            manager: SubjectKey::from_bytes([0xbb; 20]),
        };
        let provider = SubjectKey::parse(PROVIDER).unwrap();
        let ledger = SimulatedLedger::new(contracts, provider).unwrap();
        let reconciler = ConfirmationReconciler::new(
            Arc::new(ledger.clone()),
            Arc::new(ledger.clone()),
            Arc::new(ledger.interface().clone()),
            ErrorDecoder::default(),
            DEFAULT_CONFIRMATION_TIMEOUT,
        );
        reconciler.switch_context(Some(provider));
        let submitter = OperationSubmitter::new(Arc::new(ledger.clone()), reconciler, contracts);
        (ledger, submitter)
    }

    #[tokio::test]
    async fn test_input_validation() {
        let (ledger, submitter) = setup();
        let cases = [
            (OperationKind::Authorize, "0x1234", None),
            (OperationKind::Authorize, INVESTOR, Some("5")),
            (OperationKind::Purchase, INVESTOR, None),
            (OperationKind::Purchase, INVESTOR, Some("0")),
            (OperationKind::Reclaim, INVESTOR, Some("-3")),
        ];
        for (kind, subject, amount) in cases {
            let err = submitter.submit(kind, subject, amount, None).await.unwrap_err();
            assert!(matches!(err, SubmissionError::InvalidInput(_)), "{:?}", err);
        }
        assert!(ledger.pending_handles().is_empty());
        assert!(submitter.reconciler().tracker().is_empty());
    }

    #[tokio::test]
    async fn test_no_account_is_invalid_input() {
        let (_ledger, submitter) = setup();
        submitter.reconciler().switch_context(None);
        let err = submitter
            .submit(OperationKind::Authorize, INVESTOR, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmissionError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_handle_is_tracked_on_return() {
        let (ledger, submitter) = setup();
        let handle = submitter
            .submit(OperationKind::Authorize, INVESTOR, None, None)
            .await
            .unwrap();
        assert_eq!(ledger.pending_handles(), vec![handle]);
        assert_eq!(
            submitter.reconciler().tracker().state_of(&handle),
            OperationState::Submitted
        );
        assert!(submitter.any_busy(&INVESTOR.to_lowercase(), OperationKind::Authorize));
        assert!(!submitter.any_busy(INVESTOR, OperationKind::Revoke));
        assert!(!submitter.any_busy("not an address", OperationKind::Authorize));
    }

    #[tokio::test]
    async fn test_rejections_are_classified() {
        let (ledger, submitter) = setup();

        ledger.fail_next_transport("connection refused");
        let err = submitter
            .submit(OperationKind::Authorize, INVESTOR, None, None)
            .await
            .unwrap_err();
        assert_eq!(err, SubmissionError::transport("connection refused"));

        ledger.reject_next_signature();
        let err = submitter
            .submit(OperationKind::Authorize, INVESTOR, None, None)
            .await
            .unwrap_err();
        assert_eq!(err, SubmissionError::UserRejected);
        assert_eq!(err.to_string(), "Transaction was rejected by user.");

        // Purchase from the provider account, which is not whitelisted
        let err = submitter
            .submit(OperationKind::Purchase, PROVIDER, Some("1000000000000000000"), None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SubmissionError::SimulationRejected("Wallet is not whitelisted".to_string())
        );
        assert!(submitter.reconciler().tracker().is_empty());
        assert!(!submitter.any_busy(PROVIDER, OperationKind::Purchase));
    }

    /// Writer that switches the acting account while `submit` is awaited
    struct SwitchingWriter {
        ledger: SimulatedLedger,
        reconciler: Mutex<Option<Arc<ConfirmationReconciler>>>,
        switch_to: SubjectKey,
    }

    #[async_trait]
    impl LedgerWriter for SwitchingWriter {
        async fn simulate(&self, call: &LedgerCall) -> Result<PreparedRequest, LedgerRejection> {
            self.ledger.simulate(call).await
        }

        async fn submit(&self, request: PreparedRequest) -> Result<Handle, LedgerRejection> {
            let handle = self.ledger.submit(request).await?;
            if let Some(reconciler) = self.reconciler.lock().as_ref() {
                reconciler.switch_context(Some(self.switch_to));
            }
            Ok(handle)
        }
    }

    #[tokio::test]
    async fn test_switch_during_submit_returns_untracked_handle() {
        let (ledger, submitter) = setup();
        let investor = SubjectKey::parse(INVESTOR).unwrap();
        let writer = Arc::new(SwitchingWriter {
            ledger: ledger.clone(),
            reconciler: Mutex::new(None),
            switch_to: investor,
        });
        let reconciler = submitter.reconciler().clone();
        *writer.reconciler.lock() = Some(reconciler.clone());
        let submitter = OperationSubmitter::new(writer, reconciler.clone(), ledger.contracts());

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let on_complete: CompletionCallback = Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let err = submitter
            .submit(OperationKind::Authorize, INVESTOR, None, Some(on_complete))
            .await
            .unwrap_err();

        let handle = match err {
            SubmissionError::ContextChanged(handle) => handle,
            other => panic!("expected ContextChanged, got {:?}", other),
        };
        assert!(!SubmissionError::ContextChanged(handle).is_retryable());
        assert_eq!(ledger.pending_handles(), vec![handle]);
        assert!(reconciler.tracker().is_empty());
        assert_eq!(reconciler.tracker().state_of(&handle), OperationState::Idle);
        assert!(!submitter.any_busy(INVESTOR, OperationKind::Authorize));

        ledger.mine(&handle, DeliveryOrder::EventFirst);
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
