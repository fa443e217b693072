//! `Tether` Runtime: an event loop with interceptable scheduling primitives,
//! event emitters, and the agent that propagates transactions through them.

pub mod agent;
pub mod config;
pub mod event_loop;
pub mod events;
pub mod instrumentation;
pub mod telemetry;

pub use agent::Agent;
pub use config::{AgentConfig, EventLoopConfig, LogFormat, LoggingConfig};
pub use event_loop::{Callback, EventLoop, LoopError, RunStats, TaskPanic, TimerId};
pub use events::{EmitterPrototype, EventEmitter, Listener, ListenerId};
pub use telemetry::{init_tracing, TelemetryError};
