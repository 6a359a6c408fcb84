//! Logging setup and structured operation logging

use crate::types::{Handle, OperationKind, OperationState, SubjectKey};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Initialize logging subsystem
///
/// `RUST_LOG` wins when set. Safe to call twice; the second call is a no-op.
pub fn init_logging(verbose: bool, json: bool) -> anyhow::Result<()> {
    let env_filter = if verbose {
        "reconciler=debug,info"
    } else {
        "reconciler=info,warn,error"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| env_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };
    if let Err(e) = result {
        tracing::debug!("Logging already initialized: {}", e);
    }
    Ok(())
}

/// Structured logger for one write operation's lifecycle
///
/// Every line carries the same `correlation_id` from submission request to
/// terminal state, so a single operation can be followed in aggregated logs.
#[derive(Debug, Clone)]
pub struct OperationLogger {
    correlation_id: String,
    kind: OperationKind,
    subject: SubjectKey,
}

impl OperationLogger {
    pub fn new(kind: OperationKind, subject: SubjectKey) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            kind,
            subject,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn log_simulation_rejected(&self, reason: &str) {
        tracing::info!(
            correlation_id = %self.correlation_id,
            kind = %self.kind,
            subject = %self.subject,
            reason = %reason,
            "Simulation rejected"
        );
    }

    pub fn log_submitted(&self, handle: &Handle, generation: u64) {
        tracing::info!(
            correlation_id = %self.correlation_id,
            kind = %self.kind,
            subject = %self.subject,
            handle = %handle,
            generation,
            "Operation submitted"
        );
    }

    pub fn log_pending(&self, handle: &Handle) {
        tracing::debug!(
            correlation_id = %self.correlation_id,
            handle = %handle,
            "Operation mined, awaiting finality"
        );
    }

    pub fn log_terminal(
        &self,
        handle: &Handle,
        state: OperationState,
        reason: Option<&str>,
        latency_ms: u64,
    ) {
        match state {
            OperationState::Confirmed => tracing::info!(
                correlation_id = %self.correlation_id,
                kind = %self.kind,
                subject = %self.subject,
                handle = %handle,
                latency_ms,
                "Operation confirmed"
            ),
            _ => tracing::warn!(
                correlation_id = %self.correlation_id,
                kind = %self.kind,
                subject = %self.subject,
                handle = %handle,
                state = %state,
                reason = ?reason,
                latency_ms,
                "Operation did not confirm"
            ),
        }
    }

    pub fn log_stale_signal(&self, handle: &Handle, generation: u64, current: u64) {
        tracing::debug!(
            correlation_id = %self.correlation_id,
            handle = %handle,
            generation,
            current,
            "Discarding signal from a previous account context"
        );
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(
            correlation_id = %self.correlation_id,
            message = %message,
            "Warning"
        );
    }

    pub fn error(&self, message: &str) {
        tracing::error!(
            correlation_id = %self.correlation_id,
            message = %message,
            "Error"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_ids_are_unique() {
        let subject = SubjectKey::from_bytes([1; 20]);
        let a = OperationLogger::new(OperationKind::Purchase, subject);
        let b = OperationLogger::new(OperationKind::Purchase, subject);
        assert_ne!(a.correlation_id(), b.correlation_id());
        assert!(Uuid::parse_str(a.correlation_id()).is_ok());
    }

    #[test]
    fn test_init_logging_twice_is_harmless() {
        init_logging(false, false).unwrap();
        init_logging(true, true).unwrap();
    }
}
