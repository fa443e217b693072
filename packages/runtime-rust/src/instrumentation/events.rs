//! Context propagation into event listeners.
//!
//! Wraps listener registration on an emitter prototype. A listener
//! registered under an active transaction runs under that transaction no
//! matter which context is current when the event is emitted. A listener
//! registered with no active transaction runs under the emitter's context.

use std::sync::Arc;

use tether_core::{ContextStore, Shimmer};

use super::installed;
use crate::events::{methods, EmitterPrototype, Listener, ListenerId, RegisterFn, Subscriptions};

/// Diagnostic label for emitter registration methods.
pub const LABEL: &str = "EventEmitter.prototype";

/// Wraps `on`, `add_listener` and `once` on `prototype`. Returns how many
/// were wrapped.
pub fn instrument<A: 'static>(
    shimmer: &Shimmer,
    store: &Arc<ContextStore>,
    prototype: &EmitterPrototype<A>,
) -> usize {
    let mut wrapped = 0;
    for method in [methods::ON, methods::ADD_LISTENER, methods::ONCE] {
        let store = Arc::clone(store);
        let result = shimmer.wrap(
            prototype.methods(),
            LABEL,
            method,
            move |original: Arc<RegisterFn<A>>| -> Arc<RegisterFn<A>> {
                Arc::new(
                    move |subs: &Subscriptions<A>,
                          event: &str,
                          listener: Listener<A>|
                          -> ListenerId {
                        original(subs, event, bind_listener(&store, listener))
                    },
                )
            },
        );
        if installed(result) {
            wrapped += 1;
        }
    }
    wrapped
}

fn bind_listener<A: 'static>(store: &Arc<ContextStore>, listener: Listener<A>) -> Listener<A> {
    let Some(context) = store.snapshot() else {
        return listener;
    };
    let store = Arc::clone(store);
    Arc::new(move |args: &A| {
        store.run_with(Some(Arc::clone(&context)), || listener(args));
    })
}
