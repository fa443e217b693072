//! Interception layers that carry the current transaction into callbacks.
//!
//! Each submodule wraps one family of primitives. A wrapper takes a snapshot
//! of the context store when the callback is *registered* and installs that
//! snapshot around the callback when it is *invoked*. With no active
//! transaction at registration the callback is passed through unchanged and
//! sees whatever is current when it eventually runs.

pub mod deferred;
pub mod events;
pub mod timers;

use std::sync::Arc;

use tether_core::{ContextStore, ShimError};

use crate::event_loop::Callback;

/// Binds `callback` to the store's current snapshot, if there is one.
pub(crate) fn bind(store: &Arc<ContextStore>, callback: Callback) -> Callback {
    let Some(context) = store.snapshot() else {
        return callback;
    };
    let store = Arc::clone(store);
    let mut callback = callback;
    Box::new(move || store.run_with(Some(Arc::clone(&context)), &mut callback))
}

/// Logs a skipped wrap and reports whether the wrap was installed.
pub(crate) fn installed(result: Result<(), ShimError>) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(error = %err, "skipping instrumentation");
            false
        }
    }
}
