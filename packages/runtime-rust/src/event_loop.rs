//! Single-threaded event loop hosting the scheduling primitives.
//!
//! The loop owns a deferred-callback queue (`next_tick`), an immediate queue
//! (`set_immediate`) and a timer heap (`set_timeout` / `set_interval`), all
//! driven against a virtual millisecond clock. Each primitive is a named
//! member of a [`MethodTable`] and every call dispatches through whatever
//! layer is currently installed there, which is what makes the primitives
//! interceptable.
//!
//! Ordering per turn: the tick queue is drained completely, then one
//! macrotask runs (a due timer first, otherwise an immediate), then the tick
//! queue is drained again. With nothing runnable the clock jumps to the next
//! timer.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tether_core::{ContextStore, MethodTable};

use crate::config::EventLoopConfig;

/// A scheduled callback. Deferred callbacks and timeouts run once; interval
/// callbacks run once per period.
pub type Callback = Box<dyn FnMut() + Send>;

/// Signature of the deferred-queue primitives (`next_tick`, `set_immediate`).
pub type DeferFn = dyn Fn(&LoopQueues, Callback) + Send + Sync;

/// Signature of the timer primitives (`set_timeout`, `set_interval`).
pub type TimerFn = dyn Fn(&LoopQueues, Callback, Duration) -> TimerId + Send + Sync;

/// Handler invoked for panics escaping a scheduled callback.
pub type PanicHandler = Arc<dyn Fn(&TaskPanic) + Send + Sync>;

/// Member names of the loop's interceptable primitives.
pub mod methods {
    pub const NEXT_TICK: &str = "next_tick";
    pub const SET_IMMEDIATE: &str = "set_immediate";
    pub const SET_TIMEOUT: &str = "set_timeout";
    pub const SET_INTERVAL: &str = "set_interval";
}

// ---------------------------------------------------------------------------
// Errors and results
// ---------------------------------------------------------------------------

/// Errors returned by the loop drivers.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    /// A callback panicked and no uncaught-panic handler was registered.
    #[error("scheduled callback panicked: {message}")]
    TaskPanicked { message: String },
    /// The loop ran `limit` macrotasks without going idle.
    #[error("event loop exceeded {limit} turns without going idle")]
    TurnLimitExceeded { limit: u64 },
}

/// Panic captured from a scheduled callback.
#[derive(Debug, Clone)]
pub struct TaskPanic {
    pub message: String,
}

impl TaskPanic {
    fn from_payload(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self { message }
    }
}

/// Work done by one driver call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Macrotasks run (timers and immediates).
    pub turns: u64,
    /// Deferred callbacks run from the tick queue.
    pub ticks: u64,
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

/// Handle returned by `set_timeout` / `set_interval`, used to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

struct TimerEntry {
    due: u64,
    seq: u64,
    id: TimerId,
    period: Option<u64>,
    callback: Callback,
}

// BinaryHeap is a max-heap; invert so the earliest (due, seq) is on top.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

/// Delays are clamped to at least one millisecond, so a zero-delay timer
/// still yields to the tick queue and an interval always advances the clock.
fn clamp_delay(delay: Duration) -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    let millis = delay.as_millis().min(u128::from(u64::MAX)) as u64;
    millis.max(1)
}

// ---------------------------------------------------------------------------
// LoopQueues
// ---------------------------------------------------------------------------

#[derive(Default)]
struct QueueState {
    now: u64,
    ticks: VecDeque<Callback>,
    immediates: VecDeque<Callback>,
    timers: BinaryHeap<TimerEntry>,
    live_timers: HashSet<TimerId>,
    next_seq: u64,
    next_timer_id: u64,
}

impl QueueState {
    fn push_timer_entry(
        &mut self,
        id: TimerId,
        delay: u64,
        period: Option<u64>,
        callback: Callback,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timers.push(TimerEntry {
            due: self.now.saturating_add(delay),
            seq,
            id,
            period,
            callback,
        });
    }

    /// Drops cancelled entries sitting on top of the heap.
    fn discard_cancelled(&mut self) {
        while let Some(top) = self.timers.peek() {
            if self.live_timers.contains(&top.id) {
                break;
            }
            self.timers.pop();
        }
    }
}

/// The raw queues behind the loop's primitives.
///
/// Native primitive implementations push here directly; interception layers
/// receive it as the receiver argument and pass it through.
#[derive(Default)]
pub struct LoopQueues {
    state: Mutex<QueueState>,
}

impl LoopQueues {
    /// Appends to the tick queue.
    pub fn push_tick(&self, callback: Callback) {
        self.state.lock().ticks.push_back(callback);
    }

    /// Appends to the immediate queue.
    pub fn push_immediate(&self, callback: Callback) {
        self.state.lock().immediates.push_back(callback);
    }

    /// Arms a timer `delay` from now; with `repeat` it re-arms every `delay`.
    pub fn push_timer(&self, callback: Callback, delay: Duration, repeat: bool) -> TimerId {
        let delay = clamp_delay(delay);
        let mut state = self.state.lock();
        let id = TimerId(state.next_timer_id);
        state.next_timer_id += 1;
        state.live_timers.insert(id);
        state.push_timer_entry(id, delay, repeat.then_some(delay), callback);
        id
    }

    /// Cancels a timer. Returns `false` if it already fired or was cancelled.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.state.lock().live_timers.remove(&id)
    }

    /// Current virtual time in milliseconds.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.state.lock().now
    }

    fn set_now(&self, now: u64) {
        let mut state = self.state.lock();
        state.now = state.now.max(now);
    }

    fn pop_tick(&self) -> Option<Callback> {
        self.state.lock().ticks.pop_front()
    }

    fn pending(&self) -> usize {
        let state = self.state.lock();
        state.ticks.len() + state.immediates.len() + state.live_timers.len()
    }
}

impl fmt::Debug for LoopQueues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LoopQueues")
            .field("now", &state.now)
            .field("ticks", &state.ticks.len())
            .field("immediates", &state.immediates.len())
            .field("timers", &state.live_timers.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EventLoop
// ---------------------------------------------------------------------------

enum Macrotask {
    Immediate(Callback),
    Timer(TimerEntry),
}

enum Step {
    Run(Macrotask),
    Wait(u64),
    Idle,
}

/// Event loop with interceptable scheduling primitives and its own context
/// store.
///
/// Callbacks run one at a time on whichever thread drives the loop. Each
/// callback starts a fresh turn: it runs with no context installed unless an
/// interception layer bound one to it.
pub struct EventLoop {
    config: EventLoopConfig,
    queues: LoopQueues,
    process: Arc<MethodTable<DeferFn>>,
    timers: Arc<MethodTable<TimerFn>>,
    store: Arc<ContextStore>,
    uncaught: RwLock<Option<PanicHandler>>,
}

impl EventLoop {
    /// Creates an idle loop at virtual time zero with native primitives.
    #[must_use]
    pub fn new(config: EventLoopConfig) -> Self {
        let process = MethodTable::<DeferFn>::new()
            .with_method(
                methods::NEXT_TICK,
                Arc::new(|queues: &LoopQueues, callback: Callback| queues.push_tick(callback)),
            )
            .with_method(
                methods::SET_IMMEDIATE,
                Arc::new(|queues: &LoopQueues, callback: Callback| {
                    queues.push_immediate(callback);
                }),
            );
        let timers = MethodTable::<TimerFn>::new()
            .with_method(
                methods::SET_TIMEOUT,
                Arc::new(|queues: &LoopQueues, callback: Callback, delay: Duration| {
                    queues.push_timer(callback, delay, false)
                }),
            )
            .with_method(
                methods::SET_INTERVAL,
                Arc::new(|queues: &LoopQueues, callback: Callback, period: Duration| {
                    queues.push_timer(callback, period, true)
                }),
            );

        Self {
            config,
            queues: LoopQueues::default(),
            process: Arc::new(process),
            timers: Arc::new(timers),
            store: Arc::new(ContextStore::new()),
            uncaught: RwLock::new(None),
        }
    }

    /// The context store owned by this loop.
    #[must_use]
    pub fn context_store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    /// Interception target for `next_tick` and `set_immediate`.
    #[must_use]
    pub fn process_table(&self) -> &Arc<MethodTable<DeferFn>> {
        &self.process
    }

    /// Interception target for `set_timeout` and `set_interval`.
    #[must_use]
    pub fn timers_table(&self) -> &Arc<MethodTable<TimerFn>> {
        &self.timers
    }

    /// Current virtual time since the loop was created.
    #[must_use]
    pub fn now(&self) -> Duration {
        Duration::from_millis(self.queues.now_ms())
    }

    /// Number of queued callbacks plus armed timers.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queues.pending()
    }

    /// Runs `callback` after the current callback returns, before any timer
    /// or immediate.
    pub fn next_tick(&self, callback: impl FnMut() + Send + 'static) {
        self.defer(methods::NEXT_TICK, Box::new(callback));
    }

    /// Runs `callback` on a later turn, after due timers.
    pub fn set_immediate(&self, callback: impl FnMut() + Send + 'static) {
        self.defer(methods::SET_IMMEDIATE, Box::new(callback));
    }

    /// Runs `callback` once, no earlier than `delay` from now.
    pub fn set_timeout(&self, callback: impl FnMut() + Send + 'static, delay: Duration) -> TimerId {
        self.schedule_timer(methods::SET_TIMEOUT, Box::new(callback), delay)
    }

    /// Runs `callback` every `period` until cleared.
    pub fn set_interval(
        &self,
        callback: impl FnMut() + Send + 'static,
        period: Duration,
    ) -> TimerId {
        self.schedule_timer(methods::SET_INTERVAL, Box::new(callback), period)
    }

    /// Cancels a pending timeout. Returns whether it was still pending.
    pub fn clear_timeout(&self, id: TimerId) -> bool {
        self.queues.cancel_timer(id)
    }

    /// Cancels an interval. Safe to call from the interval's own callback.
    pub fn clear_interval(&self, id: TimerId) -> bool {
        self.queues.cancel_timer(id)
    }

    /// Routes panics escaping callbacks to `handler` instead of failing the
    /// driver.
    pub fn on_uncaught_panic(&self, handler: impl Fn(&TaskPanic) + Send + Sync + 'static) {
        *self.uncaught.write() = Some(Arc::new(handler));
    }

    /// Runs until no callbacks or timers remain, jumping the virtual clock
    /// forward to each next timer.
    ///
    /// Active intervals keep the loop busy forever; bound such runs with
    /// `EventLoopConfig::max_turns` or use [`advance`](Self::advance).
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::TaskPanicked`] if a callback panics with no
    /// uncaught-panic handler registered, or [`LoopError::TurnLimitExceeded`]
    /// if the configured turn limit is reached.
    pub fn run_until_idle(&self) -> Result<RunStats, LoopError> {
        let mut stats = RunStats::default();
        loop {
            self.drain_ticks(&mut stats)?;
            match self.next_step(u64::MAX) {
                Step::Run(task) => self.run_macrotask(task, &mut stats)?,
                Step::Wait(due) => self.queues.set_now(due),
                Step::Idle => break,
            }
        }
        tracing::debug!(turns = stats.turns, ticks = stats.ticks, "event loop idle");
        Ok(stats)
    }

    /// Runs everything due within `window` from now, then moves the clock to
    /// the end of the window.
    ///
    /// # Errors
    ///
    /// Same as [`run_until_idle`](Self::run_until_idle).
    pub fn advance(&self, window: Duration) -> Result<RunStats, LoopError> {
        #[allow(clippy::cast_possible_truncation)]
        let window_ms = window.as_millis().min(u128::from(u64::MAX)) as u64;
        let deadline = self.queues.now_ms().saturating_add(window_ms);

        let mut stats = RunStats::default();
        loop {
            self.drain_ticks(&mut stats)?;
            match self.next_step(deadline) {
                Step::Run(task) => self.run_macrotask(task, &mut stats)?,
                Step::Wait(due) => self.queues.set_now(due),
                Step::Idle => break,
            }
        }
        self.queues.set_now(deadline);
        Ok(stats)
    }

    /// Async driver: like [`run_until_idle`](Self::run_until_idle) but waits
    /// on `tokio::time` for each next timer instead of jumping the clock.
    ///
    /// # Errors
    ///
    /// Same as [`run_until_idle`](Self::run_until_idle).
    pub async fn run(&self) -> Result<RunStats, LoopError> {
        let mut stats = RunStats::default();
        loop {
            self.drain_ticks(&mut stats)?;
            match self.next_step(u64::MAX) {
                Step::Run(task) => self.run_macrotask(task, &mut stats)?,
                Step::Wait(due) => {
                    let wait = due.saturating_sub(self.queues.now_ms());
                    tokio::time::sleep(Duration::from_millis(wait)).await;
                    self.queues.set_now(due);
                }
                Step::Idle => break,
            }
        }
        tracing::debug!(turns = stats.turns, ticks = stats.ticks, "event loop idle");
        Ok(stats)
    }

    fn defer(&self, method: &str, callback: Callback) {
        match self.process.method(method) {
            Some(schedule) => schedule(&self.queues, callback),
            None => {
                tracing::error!(method, "deferred primitive missing, queueing directly");
                if method == methods::SET_IMMEDIATE {
                    self.queues.push_immediate(callback);
                } else {
                    self.queues.push_tick(callback);
                }
            }
        }
    }

    fn schedule_timer(&self, method: &str, callback: Callback, delay: Duration) -> TimerId {
        match self.timers.method(method) {
            Some(schedule) => schedule(&self.queues, callback, delay),
            None => {
                tracing::error!(method, "timer primitive missing, arming directly");
                self.queues
                    .push_timer(callback, delay, method == methods::SET_INTERVAL)
            }
        }
    }

    fn next_step(&self, deadline: u64) -> Step {
        let mut state = self.queues.state.lock();
        state.discard_cancelled();

        let now = state.now;
        if state.timers.peek().is_some_and(|top| top.due <= now) {
            if let Some(entry) = state.timers.pop() {
                if entry.period.is_none() {
                    state.live_timers.remove(&entry.id);
                }
                return Step::Run(Macrotask::Timer(entry));
            }
        }
        if let Some(callback) = state.immediates.pop_front() {
            return Step::Run(Macrotask::Immediate(callback));
        }
        match state.timers.peek() {
            Some(top) if top.due <= deadline => Step::Wait(top.due),
            _ => Step::Idle,
        }
    }

    fn run_macrotask(&self, task: Macrotask, stats: &mut RunStats) -> Result<(), LoopError> {
        if let Some(limit) = self.config.max_turns {
            if stats.turns >= limit {
                return Err(LoopError::TurnLimitExceeded { limit });
            }
        }
        stats.turns += 1;

        match task {
            Macrotask::Immediate(mut callback) => self.invoke(&mut callback),
            Macrotask::Timer(mut entry) => {
                let outcome = self.invoke(&mut entry.callback);
                if let Some(period) = entry.period {
                    let mut state = self.queues.state.lock();
                    if outcome.is_ok() && state.live_timers.contains(&entry.id) {
                        state.push_timer_entry(entry.id, period, Some(period), entry.callback);
                    } else {
                        state.live_timers.remove(&entry.id);
                    }
                }
                outcome
            }
        }
    }

    fn drain_ticks(&self, stats: &mut RunStats) -> Result<(), LoopError> {
        while let Some(mut callback) = self.queues.pop_tick() {
            stats.ticks += 1;
            self.invoke(&mut callback)?;
        }
        Ok(())
    }

    /// Runs one callback as the bottom of a fresh stack: no context
    /// installed, panics contained.
    fn invoke(&self, callback: &mut Callback) -> Result<(), LoopError> {
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.store.run_with(None, || callback());
        }));
        let Err(payload) = result else {
            return Ok(());
        };

        let panic = TaskPanic::from_payload(payload.as_ref());
        let handler = self.uncaught.read().clone();
        if let Some(handler) = handler {
            tracing::warn!(message = %panic.message, "uncaught panic routed to handler");
            handler(&panic);
            Ok(())
        } else {
            tracing::error!(message = %panic.message, "uncaught panic in scheduled callback");
            Err(LoopError::TaskPanicked {
                message: panic.message,
            })
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new(EventLoopConfig::default())
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("config", &self.config)
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
