//! Context propagation through `next_tick` and `set_immediate`.

use std::sync::Arc;

use tether_core::Shimmer;

use super::{bind, installed};
use crate::event_loop::{methods, Callback, DeferFn, EventLoop, LoopQueues};

/// Diagnostic label for the deferred-queue primitives.
pub const LABEL: &str = "process";

/// Wraps the loop's deferred primitives. Returns how many were wrapped.
pub fn instrument(shimmer: &Shimmer, event_loop: &EventLoop) -> usize {
    let mut wrapped = 0;
    for method in [methods::NEXT_TICK, methods::SET_IMMEDIATE] {
        let store = Arc::clone(event_loop.context_store());
        let result = shimmer.wrap(
            event_loop.process_table(),
            LABEL,
            method,
            move |original: Arc<DeferFn>| -> Arc<DeferFn> {
                Arc::new(move |queues: &LoopQueues, callback: Callback| {
                    original(queues, bind(&store, callback));
                })
            },
        );
        if installed(result) {
            wrapped += 1;
        }
    }
    wrapped
}
