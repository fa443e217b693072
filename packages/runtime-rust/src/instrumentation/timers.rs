//! Context propagation through `set_timeout` and `set_interval`.

use std::sync::Arc;
use std::time::Duration;

use tether_core::Shimmer;

use super::{bind, installed};
use crate::event_loop::{methods, Callback, EventLoop, LoopQueues, TimerFn, TimerId};

/// Diagnostic label for the timer primitives.
pub const LABEL: &str = "timers";

/// Wraps the loop's timer primitives. Returns how many were wrapped.
///
/// An interval is bound once, at registration, so every repetition runs
/// under the same transaction.
pub fn instrument(shimmer: &Shimmer, event_loop: &EventLoop) -> usize {
    let mut wrapped = 0;
    for method in [methods::SET_TIMEOUT, methods::SET_INTERVAL] {
        let store = Arc::clone(event_loop.context_store());
        let result = shimmer.wrap(
            event_loop.timers_table(),
            LABEL,
            method,
            move |original: Arc<TimerFn>| -> Arc<TimerFn> {
                Arc::new(
                    move |queues: &LoopQueues, callback: Callback, delay: Duration| -> TimerId {
                        original(queues, bind(&store, callback), delay)
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
