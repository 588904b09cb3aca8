//! Keepalive policy for one transport link.
//!
//! The manager watches inbound traffic and decides when to send an
//! application-level ping and when to give up on the link. It never touches
//! the socket itself: it emits "send ping" and "close connection" through
//! callbacks, invoked outside its lock.
//!
//! | Option | Effect |
//! |--------|--------|
//! | `ping_interval` | Ping at a fixed rate |
//! | `ping_after_idle` | Ping once nothing was received for this long |
//! | `message_received_timeout` | Close once nothing was received for this long |
//! | `pong_received_timeout` | Close once the oldest unanswered ping is this old |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::context::{SharedContext, TaskHandle, cancel_task, duration_ms};

use super::options::PingOptions;

// ============================================================================
// Types
// ============================================================================

/// Sends a ping text over the link.
pub type PingFn = Arc<dyn Fn(String) + Send + Sync>;

/// Closes the link after a keepalive timeout.
pub type TimeoutFn = Arc<dyn Fn() + Send + Sync>;

/// Decision taken under the lock, carried out after it.
enum Action {
    Nothing,
    Ping(String),
    Close,
}

// ============================================================================
// PingManager
// ============================================================================

/// Schedules pings and keepalive timeouts for one link.
pub struct PingManager {
    inner: Arc<PingInner>,
}

struct PingInner {
    options: PingOptions,
    context: SharedContext,
    on_ping: PingFn,
    on_timeout: TimeoutFn,
    state: Mutex<PingState>,
}

#[derive(Default)]
struct PingState {
    active: bool,

    /// Bumped whenever the link goes down; stale timers bail out.
    generation: u64,

    last_received: Option<u64>,

    /// Time of the oldest unanswered ping.
    last_ping: Option<u64>,

    ping_task: Option<TaskHandle>,
    receive_task: Option<TaskHandle>,
    pong_task: Option<TaskHandle>,
}

impl fmt::Debug for PingManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("PingManager")
            .field("active", &state.active)
            .field("last_received", &state.last_received)
            .field("last_ping", &state.last_ping)
            .finish()
    }
}

impl PingManager {
    /// Creates an idle manager.
    #[must_use]
    pub fn new(
        options: PingOptions,
        context: SharedContext,
        on_ping: PingFn,
        on_timeout: TimeoutFn,
    ) -> Self {
        Self {
            inner: Arc::new(PingInner {
                options,
                context,
                on_ping,
                on_timeout,
                state: Mutex::new(PingState::default()),
            }),
        }
    }

    /// Returns `true` if `text` is the configured pong.
    #[inline]
    #[must_use]
    pub fn is_pong(&self, text: &str) -> bool {
        self.inner.options.is_pong(text)
    }

    /// Returns `true` while the link is considered up.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.state.lock().active
    }

    /// Starts watching a freshly opened link.
    pub fn on_connection_complete(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        inner.reset(&mut state);
        state.active = true;
        state.last_received = Some(inner.context.current_time());

        let interval = inner.options.ping_interval;
        if !interval.is_zero() {
            let weak = Arc::downgrade(inner);
            let generation = state.generation;
            state.ping_task = Some(inner.context.schedule_at_fixed_rate(
                interval,
                interval,
                Box::new(move || PingInner::on_ping_due(&weak, generation)),
            ));
        } else {
            inner.schedule_idle_ping(&mut state);
        }
        inner.schedule_receive_check(&mut state);
    }

    /// Stops every timer after the link went down.
    pub fn on_connection_closed(&self) {
        let mut state = self.inner.state.lock();
        self.inner.reset(&mut state);
    }

    /// Records inbound traffic; a pong also answers the pending pings.
    pub fn on_message_received(&self, is_pong: bool) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if !state.active {
            return;
        }
        state.last_received = Some(inner.context.current_time());

        if is_pong {
            state.last_ping = None;
            cancel_task(&mut state.pong_task);
        }
        if inner.options.ping_interval.is_zero() {
            inner.schedule_idle_ping(&mut state);
        }
        inner.schedule_receive_check(&mut state);
    }

    /// Stops every timer.
    pub fn release(&self) {
        self.on_connection_closed();
    }
}

impl Drop for PingManager {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        self.inner.reset(&mut state);
    }
}

// ============================================================================
// PingInner - Scheduling
// ============================================================================

impl PingInner {
    fn reset(&self, state: &mut PingState) {
        state.active = false;
        state.generation += 1;
        state.last_received = None;
        state.last_ping = None;
        cancel_task(&mut state.ping_task);
        cancel_task(&mut state.receive_task);
        cancel_task(&mut state.pong_task);
    }

    fn schedule(
        self: &Arc<Self>,
        state: &PingState,
        delay: Duration,
        check: fn(&Weak<Self>, u64),
    ) -> TaskHandle {
        let weak = Arc::downgrade(self);
        let generation = state.generation;
        self.context
            .schedule_delay(delay, Box::new(move || check(&weak, generation)))
    }

    fn schedule_idle_ping(self: &Arc<Self>, state: &mut PingState) {
        let idle = self.options.ping_after_idle;
        if idle.is_zero() {
            return;
        }
        cancel_task(&mut state.ping_task);
        state.ping_task = Some(self.schedule(state, idle, Self::on_idle_due));
    }

    fn schedule_receive_check(self: &Arc<Self>, state: &mut PingState) {
        let timeout = self.options.message_received_timeout;
        if timeout.is_zero() {
            return;
        }
        cancel_task(&mut state.receive_task);
        state.receive_task = Some(self.schedule(state, timeout, Self::on_receive_due));
    }

    /// Arms the pong check for the oldest unanswered ping.
    ///
    /// Returns `true` if that ping is already overdue.
    fn schedule_pong_check(self: &Arc<Self>, state: &mut PingState) -> bool {
        let timeout = duration_ms(self.options.pong_received_timeout);
        if timeout == 0 {
            return false;
        }

        let remaining = match state.last_ping {
            None => timeout,
            Some(sent) => {
                let elapsed = self.context.current_time().saturating_sub(sent);
                if elapsed >= timeout {
                    return true;
                }
                timeout - elapsed
            }
        };

        cancel_task(&mut state.pong_task);
        state.pong_task = Some(self.schedule(
            state,
            Duration::from_millis(remaining),
            Self::on_pong_due,
        ));
        false
    }

    /// Decides on a ping, arming the pong check.
    fn ping(self: &Arc<Self>, state: &mut PingState) -> Action {
        let Some(message) = self.options.ping_message.clone() else {
            return Action::Nothing;
        };

        if self.schedule_pong_check(state) {
            return self.close(state, "pong");
        }
        if state.last_ping.is_none() {
            state.last_ping = Some(self.context.current_time());
        }
        trace!(message = %message, "Sending ping");
        Action::Ping(message)
    }

    fn close(&self, state: &mut PingState, timer: &'static str) -> Action {
        debug!(timer, "Keepalive timeout");
        self.reset(state);
        Action::Close
    }
}

// ============================================================================
// PingInner - Timers
// ============================================================================

impl PingInner {
    fn on_ping_due(weak: &Weak<Self>, generation: u64) {
        Self::run(weak, generation, |inner, state| inner.ping(state));
    }

    fn on_idle_due(weak: &Weak<Self>, generation: u64) {
        Self::run(weak, generation, |inner, state| {
            let idle = duration_ms(inner.options.ping_after_idle);
            let now = inner.context.current_time();
            let quiet = state
                .last_received
                .is_some_and(|received| now.saturating_sub(received) >= idle);
            if quiet { inner.ping(state) } else { Action::Nothing }
        });
    }

    fn on_receive_due(weak: &Weak<Self>, generation: u64) {
        Self::run(weak, generation, |inner, state| {
            let timeout = duration_ms(inner.options.message_received_timeout);
            let now = inner.context.current_time();
            match state.last_received {
                Some(received) if now.saturating_sub(received) >= timeout => {
                    inner.close(state, "receive")
                }
                _ => Action::Nothing,
            }
        });
    }

    fn on_pong_due(weak: &Weak<Self>, generation: u64) {
        Self::run(weak, generation, |inner, state| {
            let timeout = duration_ms(inner.options.pong_received_timeout);
            let now = inner.context.current_time();
            match state.last_ping {
                Some(sent) if now.saturating_sub(sent) >= timeout => inner.close(state, "pong"),
                _ => Action::Nothing,
            }
        });
    }

    /// Runs a timer decision under the lock and its effect after it.
    fn run(
        weak: &Weak<Self>,
        generation: u64,
        decide: impl FnOnce(&Arc<Self>, &mut PingState) -> Action,
    ) {
        let Some(inner) = weak.upgrade() else {
            return;
        };

        let action = {
            let mut state = inner.state.lock();
            if !state.active || state.generation != generation {
                return;
            }
            decide(&inner, &mut *state)
        };

        match action {
            Action::Nothing => {}
            Action::Ping(message) => (inner.on_ping)(message),
            Action::Close => (inner.on_timeout)(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
