//! Configuration for the agent, the event loop, and logging.

/// Which primitive families the agent intercepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Master switch. A disabled agent installs no wrappers.
    pub enabled: bool,
    /// Intercept `next_tick` and `set_immediate`.
    pub instrument_deferred: bool,
    /// Intercept `set_timeout` and `set_interval`.
    pub instrument_timers: bool,
    /// Intercept listener registration on emitter prototypes.
    pub instrument_events: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            instrument_deferred: true,
            instrument_timers: true,
            instrument_events: true,
        }
    }
}

impl AgentConfig {
    /// A config with every interception turned off.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Limits applied by the event loop drivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLoopConfig {
    /// Maximum macrotasks a single driver call may run. `None` means
    /// unbounded, in which case an uncleared interval never lets
    /// `run_until_idle` return.
    pub max_turns: Option<u64>,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            max_turns: Some(100_000),
        }
    }
}

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, multi-field lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Tracing subscriber settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive string, e.g. `"info,tether_core=debug"`.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl LoggingConfig {
    /// Reads the filter from `RUST_LOG` and the format from `TETHER_LOG_FORMAT`
    /// (`json` selects JSON; anything else is pretty). Missing variables fall
    /// back to the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let filter = lookup("RUST_LOG").unwrap_or(defaults.filter);
        let format = match lookup("TETHER_LOG_FORMAT") {
            Some(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => defaults.format,
        };
        Self { filter, format }
    }
}
