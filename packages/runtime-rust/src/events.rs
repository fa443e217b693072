//! Named-event emitters with interceptable listener registration.
//!
//! Registration (`on`, `add_listener`, `once`) goes through methods on a
//! shared [`EmitterPrototype`], so wrapping the prototype affects every
//! emitter created from it. Emission is synchronous: `emit` invokes the
//! matching listeners in registration order before returning.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tether_core::MethodTable;

/// A registered listener. `A` is the argument payload passed to `emit`.
pub type Listener<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// Signature of the registration methods on an [`EmitterPrototype`].
pub type RegisterFn<A> = dyn Fn(&Subscriptions<A>, &str, Listener<A>) -> ListenerId + Send + Sync;

/// Member names of the prototype's interceptable registration methods.
pub mod methods {
    pub const ON: &str = "on";
    pub const ADD_LISTENER: &str = "add_listener";
    pub const ONCE: &str = "once";
}

/// Handle returned by registration, used by `remove_listener`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

struct Subscription<A> {
    id: ListenerId,
    event: String,
    listener: Listener<A>,
    once: bool,
}

/// Listener registry owned by one emitter.
pub struct Subscriptions<A> {
    entries: Mutex<Vec<Subscription<A>>>,
    next_id: AtomicU64,
}

impl<A> Subscriptions<A> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a persistent listener for `event`.
    pub fn add(&self, event: &str, listener: Listener<A>) -> ListenerId {
        self.push(event, listener, false)
    }

    /// Registers a listener that is removed before its first invocation.
    pub fn add_once(&self, event: &str, listener: Listener<A>) -> ListenerId {
        self.push(event, listener, true)
    }

    fn push(&self, event: &str, listener: Listener<A>, once: bool) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push(Subscription {
            id,
            event: event.to_string(),
            listener,
            once,
        });
        id
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|s| s.id != id);
        entries.len() != before
    }

    /// Snapshot of the listeners for `event`, dropping `once` entries from
    /// the registry as they are taken.
    fn take_for_emit(&self, event: &str) -> Vec<Listener<A>> {
        let mut entries = self.entries.lock();
        let listeners = entries
            .iter()
            .filter(|s| s.event == event)
            .map(|s| Arc::clone(&s.listener))
            .collect();
        entries.retain(|s| !(s.once && s.event == event));
        listeners
    }

    fn count(&self, event: &str) -> usize {
        self.entries.lock().iter().filter(|s| s.event == event).count()
    }
}

// ---------------------------------------------------------------------------
// EmitterPrototype
// ---------------------------------------------------------------------------

/// Shared registration methods for a family of emitters.
pub struct EmitterPrototype<A> {
    methods: Arc<MethodTable<RegisterFn<A>>>,
}

impl<A: 'static> EmitterPrototype<A> {
    #[must_use]
    pub fn new() -> Self {
        let table = MethodTable::<RegisterFn<A>>::new()
            .with_method(
                methods::ON,
                Arc::new(|subs: &Subscriptions<A>, event: &str, listener: Listener<A>| {
                    subs.add(event, listener)
                }),
            )
            .with_method(
                methods::ADD_LISTENER,
                Arc::new(|subs: &Subscriptions<A>, event: &str, listener: Listener<A>| {
                    subs.add(event, listener)
                }),
            )
            .with_method(
                methods::ONCE,
                Arc::new(|subs: &Subscriptions<A>, event: &str, listener: Listener<A>| {
                    subs.add_once(event, listener)
                }),
            );
        Self {
            methods: Arc::new(table),
        }
    }

    /// Interception target for the registration methods.
    #[must_use]
    pub fn methods(&self) -> &Arc<MethodTable<RegisterFn<A>>> {
        &self.methods
    }

    /// Creates an emitter bound to this prototype.
    #[must_use]
    pub fn emitter(&self) -> EventEmitter<A> {
        EventEmitter {
            methods: Arc::clone(&self.methods),
            subscriptions: Subscriptions::new(),
        }
    }
}

impl<A: 'static> Default for EmitterPrototype<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Clone for EmitterPrototype<A> {
    fn clone(&self) -> Self {
        Self {
            methods: Arc::clone(&self.methods),
        }
    }
}

impl<A> fmt::Debug for EmitterPrototype<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmitterPrototype")
            .field("methods", &self.methods)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EventEmitter
// ---------------------------------------------------------------------------

/// An emitter: its own listener registry plus the prototype's registration
/// methods.
pub struct EventEmitter<A> {
    methods: Arc<MethodTable<RegisterFn<A>>>,
    subscriptions: Subscriptions<A>,
}

impl<A: 'static> EventEmitter<A> {
    pub fn on(&self, event: &str, listener: impl Fn(&A) + Send + Sync + 'static) -> ListenerId {
        self.register(methods::ON, event, Arc::new(listener))
    }

    pub fn add_listener(
        &self,
        event: &str,
        listener: impl Fn(&A) + Send + Sync + 'static,
    ) -> ListenerId {
        self.register(methods::ADD_LISTENER, event, Arc::new(listener))
    }

    /// Registers a listener invoked by at most one emission.
    pub fn once(&self, event: &str, listener: impl Fn(&A) + Send + Sync + 'static) -> ListenerId {
        self.register(methods::ONCE, event, Arc::new(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.subscriptions.remove(id)
    }

    /// Invokes every listener registered for `event` with `args`, in
    /// registration order. Returns whether any listener was registered.
    ///
    /// Listeners registered while the emission runs are not invoked by it.
    /// A panicking listener unwinds out of `emit`; later listeners for the
    /// same emission do not run.
    pub fn emit(&self, event: &str, args: &A) -> bool {
        let listeners = self.subscriptions.take_for_emit(event);
        if listeners.is_empty() {
            return false;
        }
        for listener in &listeners {
            listener(args);
        }
        true
    }

    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.subscriptions.count(event)
    }

    fn register(&self, method: &str, event: &str, listener: Listener<A>) -> ListenerId {
        match self.methods.method(method) {
            Some(register) => register(&self.subscriptions, event, listener),
            None => {
                tracing::error!(method, "registration method missing, subscribing directly");
                if method == methods::ONCE {
                    self.subscriptions.add_once(event, listener)
                } else {
                    self.subscriptions.add(event, listener)
                }
            }
        }
    }
}

impl<A> fmt::Debug for EventEmitter<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.subscriptions.entries.lock().len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
