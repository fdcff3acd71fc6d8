use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Peer-supplied id of one logical request.
pub type TransactionId = u32;

const NO_TRANSACTION: i64 = -1;

/// Single-slot record of the transaction the peer is currently waiting on.
///
/// Last writer wins. Streamers call [`TransactionAuthority::is_current`]
/// before every side-effecting step and wind down once it returns false.
#[derive(Debug)]
pub struct TransactionAuthority {
    current: AtomicI64,
}

impl TransactionAuthority {
    pub fn new() -> Self {
        Self {
            current: AtomicI64::new(NO_TRANSACTION),
        }
    }

    /// Make `id` current, returning the transaction it superseded.
    pub fn set_current(&self, id: TransactionId) -> Option<TransactionId> {
        let previous = self.current.swap(i64::from(id), Ordering::AcqRel);
        TransactionId::try_from(previous).ok()
    }

    pub fn is_current(&self, id: TransactionId) -> bool {
        self.current.load(Ordering::Acquire) == i64::from(id)
    }

    pub fn current(&self) -> Option<TransactionId> {
        TransactionId::try_from(self.current.load(Ordering::Acquire)).ok()
    }
}

impl Default for TransactionAuthority {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide relay state, shared between peer connections and the
/// status endpoint.
#[derive(Debug, Default)]
pub struct RelayState {
    pub transactions: TransactionAuthority,

    pub requests_handled: AtomicU64,
    pub messages_delivered: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub fetch_failures: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub current_transaction: Option<TransactionId>,
    pub requests_handled: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub fetch_failures: u64,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            current_transaction: self.transactions.current(),
            requests_handled: self.requests_handled.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
