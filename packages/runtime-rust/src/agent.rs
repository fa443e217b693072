//! Agent facade: installs the interception layers on an event loop and
//! exposes transaction creation and lookup.

use std::sync::Arc;

use tether_core::{ContextStore, Shimmer, TransactionHandle};

use crate::config::AgentConfig;
use crate::event_loop::EventLoop;
use crate::events::EmitterPrototype;
use crate::instrumentation::{deferred, events, timers};

/// Context-propagation agent for one event loop.
///
/// Created with [`Agent::new`], which wraps the loop's primitives according
/// to the config. [`unload`](Agent::unload) reverses every wrap the agent
/// applied. Dropping the agent leaves the wraps in place.
#[derive(Debug)]
pub struct Agent {
    config: AgentConfig,
    store: Arc<ContextStore>,
    shimmer: Shimmer,
}

impl Agent {
    /// Creates an agent bound to `event_loop`'s context store and wraps the
    /// enabled primitive families.
    #[must_use]
    pub fn new(config: AgentConfig, event_loop: &EventLoop) -> Self {
        let agent = Self {
            store: Arc::clone(event_loop.context_store()),
            shimmer: Shimmer::new(),
            config,
        };

        if !agent.config.enabled {
            tracing::info!("agent disabled, no instrumentation installed");
            return agent;
        }
        if agent.config.instrument_deferred {
            deferred::instrument(&agent.shimmer, event_loop);
        }
        if agent.config.instrument_timers {
            timers::instrument(&agent.shimmer, event_loop);
        }
        tracing::info!(wrapped = agent.shimmer.active_count(), "agent instrumented event loop");
        agent
    }

    /// Wraps listener registration on `prototype`. Returns how many methods
    /// were wrapped, zero when event instrumentation is disabled.
    pub fn instrument_emitters<A: 'static>(&self, prototype: &EmitterPrototype<A>) -> usize {
        if !self.config.enabled || !self.config.instrument_events {
            return 0;
        }
        let wrapped = events::instrument(&self.shimmer, &self.store, prototype);
        tracing::info!(wrapped, "agent instrumented emitter prototype");
        wrapped
    }

    /// Creates a transaction and makes it current.
    #[must_use]
    pub fn create_transaction(&self) -> TransactionHandle {
        self.store.create_transaction()
    }

    /// The transaction current for the running code, if any.
    #[must_use]
    pub fn get_transaction(&self) -> Option<TransactionHandle> {
        self.store.current()
    }

    #[must_use]
    pub fn context_store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// `(label, method)` of every wrap currently recorded.
    #[must_use]
    pub fn instrumented(&self) -> Vec<(String, String)> {
        self.shimmer.recorded()
    }

    /// Reverses every wrap this agent applied, newest first. Returns how many
    /// layers were restored.
    pub fn unload(&self) -> usize {
        let restored = self.shimmer.unwrap_all();
        tracing::info!(restored, "agent unloaded");
        restored
    }
}
