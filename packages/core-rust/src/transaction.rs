//! Transactions: the unit of work whose identity is propagated across
//! asynchronous continuations.
//!
//! A [`Transaction`] is created synchronously, shared as a
//! [`TransactionHandle`] by every continuation that captured it, and ended
//! explicitly. Ending is bookkeeping only: code that already holds a handle
//! keeps a valid lookup target.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Shared reference to a transaction. Continuations and the context store
/// hold clones; the transaction is dropped with the last clone.
pub type TransactionHandle = Arc<Transaction>;

/// Process-lifetime source of transaction identifiers. Starts at 1 so that
/// 0 never names a real transaction.
static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// TransactionId
// ---------------------------------------------------------------------------

/// Unique identifier assigned to a transaction at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    fn next() -> Self {
        Self(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric identifier.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// TransactionState
// ---------------------------------------------------------------------------

/// Lifecycle state of a transaction.
///
/// State machine: Active -> Ended (terminal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// The transaction is in progress and may be captured by new continuations.
    Active,
    /// The transaction has ended. Existing holders may still look it up.
    Ended,
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

struct Lifecycle {
    state: TransactionState,
    duration: Option<Duration>,
    name: Option<String>,
}

/// A unit of work tracked across synchronous and asynchronous execution.
pub struct Transaction {
    id: TransactionId,
    started_at: Instant,
    lifecycle: Mutex<Lifecycle>,
}

impl Transaction {
    /// Creates a new active transaction with a fresh identifier.
    #[must_use]
    pub fn new() -> TransactionHandle {
        let transaction = Arc::new(Self {
            id: TransactionId::next(),
            started_at: Instant::now(),
            lifecycle: Mutex::new(Lifecycle {
                state: TransactionState::Active,
                duration: None,
                name: None,
            }),
        });
        tracing::debug!(transaction = %transaction.id, "transaction created");
        transaction
    }

    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.lifecycle.lock().state
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// Instant at which the transaction was created.
    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Wall-clock time between creation and `end()`, or `None` while active.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.lifecycle.lock().duration
    }

    /// Names the transaction for consumers that record it (e.g. a route).
    pub fn set_name(&self, name: impl Into<String>) {
        self.lifecycle.lock().name = Some(name.into());
    }

    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.lifecycle.lock().name.clone()
    }

    /// Ends the transaction.
    ///
    /// Idempotent: returns `true` only for the call that performed the
    /// Active -> Ended transition. Ending does not remove the transaction from
    /// any context store and does not cancel pending continuations.
    pub fn end(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == TransactionState::Ended {
            return false;
        }
        let elapsed = self.started_at.elapsed();
        lifecycle.state = TransactionState::Ended;
        lifecycle.duration = Some(elapsed);
        drop(lifecycle);

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = elapsed.as_millis() as u64;
        tracing::debug!(transaction = %self.id, duration_ms, "transaction ended");
        true
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lifecycle = self.lifecycle.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &lifecycle.state)
            .field("name", &lifecycle.name)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
