//! Pending-call table: the concurrent correlation map at the heart of the
//! shim.
//!
//! Every outbound round trip registers a single-shot completion slot keyed
//! by `(channel_id, tx_id, seq)`; the dispatch loop resolves slots as
//! replies arrive, in whatever order the peer produces them. A single mutex
//! guards the map together with the closed flag, so `register` is atomic
//! with respect to a concurrent `resolve` for the same key and nothing can
//! register after teardown has cancelled the table.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::ShimError;

/// Correlation key for one outstanding request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallKey {
    /// Channel the transaction runs on.
    pub channel_id: String,
    /// Transaction id.
    pub tx_id: String,
    /// Per-call sub-sequence within the transaction.
    pub seq: u64,
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.channel_id, self.tx_id, self.seq)
    }
}

/// What a pending call resolves to: the reply payload, or the error the
/// dispatch loop (or teardown) attached to it.
pub(crate) type Outcome = Result<Vec<u8>, ShimError>;

struct Inner {
    waiters: HashMap<CallKey, oneshot::Sender<Outcome>>,
    /// Set by `cancel_all`; registrations after teardown fail with this
    /// cause instead of waiting forever on a dead connection.
    closed: Option<ShimError>,
}

/// Concurrent map from correlation key to a single-shot completion slot.
pub(crate) struct PendingCalls {
    inner: Mutex<Inner>,
    max_pending: usize,
}

impl PendingCalls {
    /// Create a table refusing registrations beyond `max_pending`.
    pub(crate) fn new(max_pending: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                waiters: HashMap::new(),
                closed: None,
            }),
            max_pending,
        }
    }

    /// Register a waiter for `key`.
    ///
    /// # Errors
    /// Fails when the table is closed, the in-flight bound is reached, or
    /// the key is already registered (keys are single-use).
    pub(crate) fn register(&self, key: CallKey) -> Result<oneshot::Receiver<Outcome>, ShimError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cause) = &inner.closed {
            return Err(cause.clone());
        }
        if inner.waiters.len() >= self.max_pending {
            return Err(ShimError::TooManyPendingCalls(self.max_pending));
        }
        if inner.waiters.contains_key(&key) {
            return Err(ShimError::protocol(format!(
                "correlation key {key} already in flight"
            )));
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(key, tx);
        Ok(rx)
    }

    /// Resolve the waiter for `key` with `outcome`. Returns false when the
    /// key is unknown (a late or duplicate reply) or the waiter has already
    /// gone away; the caller logs and drops such replies.
    pub(crate) fn resolve(&self, key: &CallKey, outcome: Outcome) -> bool {
        let sender = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.waiters.remove(key)
        };
        match sender {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Remove a waiter without resolving it. Used on call timeout so the
    /// peer's eventual late reply is dropped as unknown.
    pub(crate) fn discard(&self, key: &CallKey) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let _ = inner.waiters.remove(key);
    }

    /// Resolve every outstanding waiter with `cause` and close the table.
    /// Idempotent; the first cause wins.
    pub(crate) fn cancel_all(&self, cause: ShimError) {
        let drained: Vec<(CallKey, oneshot::Sender<Outcome>)> = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.closed.is_none() {
                inner.closed = Some(cause.clone());
            }
            inner.waiters.drain().collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), %cause, "cancelling pending calls");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(cause.clone()));
        }
    }

    /// Number of outstanding waiters.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .waiters
            .len()
    }
}
