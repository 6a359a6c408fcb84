//! Scoped invalidation of derived read-state
//!
//! Each confirmed (or otherwise terminal) write publishes the read keys it may
//! have changed. Readers subscribe and refetch only what they are showing, so
//! many concurrent subjects do not cause broad refetch storms.

use crate::types::{OperationKind, SubjectKey};
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 1024;

/// A piece of ledger read-state that may be stale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadKey {
    /// The subject's authorization (whitelist) flag
    Authorization(SubjectKey),
    /// The subject's token balance
    Balance(SubjectKey),
    /// Balance of the shared recovery pool that reclaims drain into
    RecoveryPool,
}

impl ReadKey {
    pub fn subject(&self) -> Option<&SubjectKey> {
        match self {
            Self::Authorization(s) | Self::Balance(s) => Some(s),
            Self::RecoveryPool => None,
        }
    }

    /// Keys an operation of `kind` on `subject` invalidates
    pub fn affected_by(kind: OperationKind, subject: SubjectKey) -> Vec<ReadKey> {
        match kind {
            OperationKind::Authorize | OperationKind::Revoke => vec![Self::Authorization(subject)],
            OperationKind::Purchase => vec![Self::Balance(subject)],
            OperationKind::Reclaim => vec![Self::Balance(subject), Self::RecoveryPool],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    pub key: ReadKey,
    pub cause: OperationKind,
}

pub struct DerivedStateInvalidator {
    sender: broadcast::Sender<Invalidation>,
}

impl DerivedStateInvalidator {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish the read keys `kind` on `subject` affects. Returns the keys published.
    pub fn invalidate(&self, subject: &SubjectKey, kind: OperationKind) -> Vec<ReadKey> {
        let keys = ReadKey::affected_by(kind, *subject);
        for key in &keys {
            debug!(key = ?key, cause = %kind, "Invalidating read-state");
            // No subscribers is fine: nothing is showing that state
            let _ = self.sender.send(Invalidation { key: *key, cause: kind });
        }
        keys
    }

    /// Every invalidation, shared aggregates included
    pub fn subscribe(&self) -> InvalidationSubscription {
        InvalidationSubscription {
            receiver: self.sender.subscribe(),
            subject: None,
        }
    }

    /// Only invalidations scoped to `subject`
    pub fn subscribe_subject(&self, subject: SubjectKey) -> InvalidationSubscription {
        InvalidationSubscription {
            receiver: self.sender.subscribe(),
            subject: Some(subject),
        }
    }
}

impl Default for DerivedStateInvalidator {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InvalidationSubscription {
    receiver: broadcast::Receiver<Invalidation>,
    subject: Option<SubjectKey>,
}

impl InvalidationSubscription {
    fn wanted(&self, invalidation: &Invalidation) -> bool {
        match &self.subject {
            Some(subject) => invalidation.key.subject() == Some(subject),
            None => true,
        }
    }

    /// Next matching invalidation; `None` once the invalidator is gone.
    ///
    /// A lagging subscriber skips what it missed; the next received key still
    /// triggers a refetch.
    pub async fn recv(&mut self) -> Option<Invalidation> {
        loop {
            match self.receiver.recv().await {
                Ok(inv) if self.wanted(&inv) => return Some(inv),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Invalidation subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<Invalidation> {
        loop {
            match self.receiver.try_recv() {
                Ok(inv) if self.wanted(&inv) => return Some(inv),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Everything currently queued for this subscriber
    pub fn drain(&mut self) -> Vec<Invalidation> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(byte: u8) -> SubjectKey {
        SubjectKey::from_bytes([byte; 20])
    }

    #[test]
    fn test_purchase_only_touches_buyer_balance() {
        let invalidator = DerivedStateInvalidator::new();
        let mut x = invalidator.subscribe_subject(subject(1));
        let mut y = invalidator.subscribe_subject(subject(2));

        let keys = invalidator.invalidate(&subject(1), OperationKind::Purchase);
        assert_eq!(keys, vec![ReadKey::Balance(subject(1))]);

        assert_eq!(x.drain().len(), 1);
        assert!(y.drain().is_empty());
    }

    #[test]
    fn test_reclaim_also_invalidates_recovery_pool() {
        let invalidator = DerivedStateInvalidator::new();
        let mut all = invalidator.subscribe();
        let mut scoped = invalidator.subscribe_subject(subject(3));

        invalidator.invalidate(&subject(3), OperationKind::Reclaim);

        let keys: Vec<ReadKey> = all.drain().into_iter().map(|i| i.key).collect();
        assert_eq!(keys, vec![ReadKey::Balance(subject(3)), ReadKey::RecoveryPool]);
        // The shared pool is not scoped to the subject
        assert_eq!(scoped.drain().len(), 1);
    }

    #[test]
    fn test_authorization_kinds_share_a_key() {
        assert_eq!(
            ReadKey::affected_by(OperationKind::Revoke, subject(4)),
            ReadKey::affected_by(OperationKind::Authorize, subject(4))
        );
    }

    #[tokio::test]
    async fn test_recv_skips_foreign_subjects() {
        let invalidator = DerivedStateInvalidator::new();
        let mut sub = invalidator.subscribe_subject(subject(9));
        invalidator.invalidate(&subject(8), OperationKind::Authorize);
        invalidator.invalidate(&subject(9), OperationKind::Authorize);

        let inv = sub.recv().await.unwrap();
        assert_eq!(inv.key, ReadKey::Authorization(subject(9)));
        assert_eq!(inv.cause, OperationKind::Authorize);
    }
}
