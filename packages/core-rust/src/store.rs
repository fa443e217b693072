//! Context store: the slot holding the transaction currently in effect.
//!
//! Every access that changes the slot is bracketed: [`ContextStore::run_with`]
//! and [`ContextStore::enter`] save the previous value and restore it when the
//! body returns or unwinds. One store belongs to one worker (event loop); it is
//! injected into whatever needs it rather than reached through a global.
//!
//! Inside [`ContextStore::scope`] the slot lives in tokio task-local storage,
//! so scoped futures on a multi-threaded runtime each see their own value.
//! Everywhere else the store's shared slot is used.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::transaction::{Transaction, TransactionHandle};

/// Per-store slots of the running task, keyed by store id.
type TaskSlots = RefCell<HashMap<u64, Option<TransactionHandle>>>;

tokio::task_local! {
    static TASK_SLOTS: TaskSlots;
}

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// ContextStore
// ---------------------------------------------------------------------------

/// Mutable slot holding "no context" or the current transaction.
///
/// The internal lock is only held while reading or swapping the slot, never
/// while a bracketed body runs, so bodies may freely nest further brackets.
#[derive(Debug)]
pub struct ContextStore {
    id: u64,
    shared: Mutex<Option<TransactionHandle>>,
}

impl Default for ContextStore {
    fn default() -> Self {
        Self {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            shared: Mutex::new(None),
        }
    }
}

impl ContextStore {
    /// Creates a store with no current transaction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the transaction currently in effect, or `None`.
    ///
    /// Ended transactions are still returned: they stay valid lookup targets
    /// for code running on their behalf.
    #[must_use]
    pub fn current(&self) -> Option<TransactionHandle> {
        TASK_SLOTS
            .try_with(|slots| slots.borrow().get(&self.id).cloned())
            .ok()
            .flatten()
            .unwrap_or_else(|| self.shared.lock().clone())
    }

    /// Returns the context a new continuation should capture: the current
    /// transaction if it is still active, otherwise `None`.
    #[must_use]
    pub fn snapshot(&self) -> Option<TransactionHandle> {
        self.current().filter(|transaction| transaction.is_active())
    }

    /// Creates a transaction and makes it current.
    ///
    /// The installation is not bracketed: the transaction stays current until
    /// the enclosing bracket (if any) restores its saved value.
    #[must_use]
    pub fn create_transaction(&self) -> TransactionHandle {
        let transaction = Transaction::new();
        self.replace(Some(Arc::clone(&transaction)));
        transaction
    }

    /// Runs `body` with `context` installed, then restores the previous value.
    ///
    /// The restore happens even if `body` panics; the panic itself continues
    /// to unwind to the caller untouched.
    pub fn run_with<R>(&self, context: Option<TransactionHandle>, body: impl FnOnce() -> R) -> R {
        let _guard = self.enter(context);
        body()
    }

    /// Installs `context` and returns a guard that restores the previous value
    /// when dropped.
    #[must_use]
    pub fn enter(&self, context: Option<TransactionHandle>) -> ContextGuard<'_> {
        if let Some(transaction) = &context {
            tracing::trace!(transaction = %transaction.id(), "enter context");
        }
        let previous = self.replace(context);
        ContextGuard {
            store: self,
            previous: Some(previous),
        }
    }

    /// Runs `future` with its own task-local slot for this store, starting
    /// at `context`.
    ///
    /// The async counterpart of [`run_with`](Self::run_with). Whatever the
    /// future installs stays inside it: other tasks, including ones polled
    /// concurrently on other worker threads, never observe it, and the shared
    /// slot is untouched when the future completes. Task-local slots of other
    /// stores visible at the call are carried into the future.
    pub fn scope<F: Future>(
        &self,
        context: Option<TransactionHandle>,
        future: F,
    ) -> impl Future<Output = F::Output> {
        let mut slots = TASK_SLOTS
            .try_with(|slots| slots.borrow().clone())
            .unwrap_or_default();
        slots.insert(self.id, context);
        TASK_SLOTS.scope(RefCell::new(slots), future)
    }

    fn task_scoped(&self) -> bool {
        TASK_SLOTS
            .try_with(|slots| slots.borrow().contains_key(&self.id))
            .unwrap_or(false)
    }

    fn replace(&self, context: Option<TransactionHandle>) -> Option<TransactionHandle> {
        if self.task_scoped() {
            TASK_SLOTS.with(|slots| slots.borrow_mut().insert(self.id, context).flatten())
        } else {
            std::mem::replace(&mut *self.shared.lock(), context)
        }
    }
}

// ---------------------------------------------------------------------------
// ContextGuard
// ---------------------------------------------------------------------------

/// RAII guard returned by [`ContextStore::enter`].
///
/// Restores the saved context on drop, including during unwinding, so a
/// panicking continuation never leaves its context installed.
#[derive(Debug)]
pub struct ContextGuard<'a> {
    store: &'a ContextStore,
    previous: Option<Option<TransactionHandle>>,
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            let exited = self.store.replace(previous);
            if let Some(transaction) = exited {
                tracing::trace!(transaction = %transaction.id(), "exit context");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
