//! Prepare managers: rate limits for new connection attempts.
//!
//! A prepare manager decides how many connection attempts the pool may
//! start right now. Every operation returns that number ("launches"); the
//! pool starts the attempts after releasing its own lock, so a manager never
//! calls back into its owner while the owner is locked.
//!
//! | Policy | Limits |
//! |--------|--------|
//! | [`LimitSizePrepareManager`] | attempts in flight at once |
//! | [`LimitIntervalPrepareManager`] | one new attempt per interval |
//!
//! The interval policy defers work through the executor context and signals
//! the owner with a `wake(ticket)` closure; the owner then calls
//! [`PrepareManager::on_deferred_elapsed`] under its lock.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::context::{SharedContext, TaskHandle, cancel_task, duration_ms};

// ============================================================================
// Types
// ============================================================================

/// Callback fired when a deferred prepare window elapses.
pub type WakeFn = Arc<dyn Fn(u64) + Send + Sync>;

// ============================================================================
// PrepareManager
// ============================================================================

/// Rate limiter for connection attempts.
pub trait PrepareManager: Send {
    /// Attempts in flight plus attempts queued.
    fn request_size(&self) -> usize;

    /// Adds `size` attempts unconditionally.
    ///
    /// Returns the number of attempts to start now.
    fn append_connections(&mut self, size: usize) -> usize;

    /// Signals that one in-flight attempt finished (success or failure).
    ///
    /// Returns the number of attempts to start now.
    fn notify_prepare_complete(&mut self) -> usize;

    /// Resets all state and cancels pending tasks.
    fn release(&mut self);

    /// Raises the outstanding attempt level to at least `size`.
    ///
    /// Never lowers it: `size <= request_size()` is a no-op.
    /// Returns the number of attempts to start now.
    fn request_connections(&mut self, size: usize) -> usize {
        let append = size.saturating_sub(self.request_size());
        if append == 0 {
            return 0;
        }
        self.append_connections(append)
    }

    /// Handles a deferred window scheduled by this manager.
    ///
    /// Returns the number of attempts to start now.
    fn on_deferred_elapsed(&mut self, _ticket: u64) -> usize {
        0
    }
}

// ============================================================================
// LimitSizePrepareManager
// ============================================================================

/// Caps the number of simultaneously in-flight attempts.
#[derive(Debug, Clone, Default)]
pub struct LimitSizePrepareManager {
    /// Maximum attempts in flight (0 = unbounded).
    limit: usize,

    /// Attempts in flight.
    prepare_size: usize,

    /// Attempts queued behind the limit.
    wait_size: usize,
}

impl LimitSizePrepareManager {
    /// Creates a manager allowing `limit` attempts at once (0 = unbounded).
    #[inline]
    #[must_use]
    pub const fn new(limit: usize) -> Self {
        Self {
            limit,
            prepare_size: 0,
            wait_size: 0,
        }
    }

    /// Returns the number of attempts in flight.
    #[inline]
    #[must_use]
    pub fn prepare_size(&self) -> usize {
        self.prepare_size
    }

    /// Returns the number of queued attempts.
    #[inline]
    #[must_use]
    pub fn wait_size(&self) -> usize {
        self.wait_size
    }
}

impl PrepareManager for LimitSizePrepareManager {
    fn request_size(&self) -> usize {
        self.prepare_size + self.wait_size
    }

    fn append_connections(&mut self, size: usize) -> usize {
        if size == 0 {
            return 0;
        }

        // queued work keeps FIFO order behind the limit
        if self.wait_size > 0 {
            self.wait_size += size;
            return 0;
        }

        if self.limit == 0 {
            self.prepare_size += size;
            return size;
        }

        let free = self.limit.saturating_sub(self.prepare_size);
        let launches = size.min(free);
        self.prepare_size += launches;
        self.wait_size += size - launches;
        launches
    }

    fn notify_prepare_complete(&mut self) -> usize {
        if self.wait_size == 0 {
            self.prepare_size = self.prepare_size.saturating_sub(1);
            return 0;
        }
        self.wait_size -= 1;
        1
    }

    fn release(&mut self) {
        self.prepare_size = 0;
        self.wait_size = 0;
    }
}

// ============================================================================
// LimitIntervalPrepareManager
// ============================================================================

/// Allows at most one new attempt per interval.
///
/// Requests arriving within the interval are queued and released by a
/// single deferred task firing at `last_prepare + interval`.
pub struct LimitIntervalPrepareManager {
    /// Minimum spacing between attempts, in milliseconds.
    interval_ms: u64,

    context: SharedContext,
    wake: WakeFn,

    /// Start time of the most recent attempt.
    last_prepare: Option<u64>,

    prepare_size: usize,
    wait_size: usize,

    /// Pending deferred window and its ticket.
    wait_task: Option<TaskHandle>,
    ticket: u64,
}

impl fmt::Debug for LimitIntervalPrepareManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimitIntervalPrepareManager")
            .field("interval_ms", &self.interval_ms)
            .field("last_prepare", &self.last_prepare)
            .field("prepare_size", &self.prepare_size)
            .field("wait_size", &self.wait_size)
            .field("waiting", &self.wait_task.is_some())
            .finish_non_exhaustive()
    }
}

impl LimitIntervalPrepareManager {
    /// Creates a manager spacing attempts by `interval`.
    ///
    /// `wake(ticket)` is invoked from the executor when a deferred window
    /// elapses; the owner must forward the ticket to
    /// [`PrepareManager::on_deferred_elapsed`].
    #[must_use]
    pub fn new(interval: Duration, context: SharedContext, wake: WakeFn) -> Self {
        Self {
            interval_ms: duration_ms(interval),
            context,
            wake,
            last_prepare: None,
            prepare_size: 0,
            wait_size: 0,
            wait_task: None,
            ticket: 0,
        }
    }

    /// Returns the number of queued attempts.
    #[inline]
    #[must_use]
    pub fn wait_size(&self) -> usize {
        self.wait_size
    }

    /// Returns `true` while a deferred window is pending.
    #[inline]
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.wait_task.is_some()
    }

    /// Milliseconds left until a new attempt is allowed.
    fn remaining_ms(&self) -> u64 {
        match self.last_prepare {
            None => 0,
            Some(last) => {
                let elapsed = self.context.current_time().saturating_sub(last);
                self.interval_ms.saturating_sub(elapsed)
            }
        }
    }

    /// Starts one queued attempt now, or defers until the interval allows.
    fn try_prepare(&mut self) -> usize {
        let remaining = self.remaining_ms();
        if remaining == 0 {
            return self.do_prepare();
        }
        self.schedule_wait(remaining);
        0
    }

    fn do_prepare(&mut self) -> usize {
        self.last_prepare = Some(self.context.current_time());
        self.prepare_size += 1;
        self.wait_size -= 1;

        if self.wait_size > 0 && self.interval_ms > 0 {
            self.schedule_wait(self.interval_ms);
        }
        1
    }

    fn schedule_wait(&mut self, delay_ms: u64) {
        cancel_task(&mut self.wait_task);
        self.ticket += 1;

        let ticket = self.ticket;
        let wake = Arc::clone(&self.wake);

        trace!(delay_ms, ticket, wait = self.wait_size, "Deferring prepare");

        self.wait_task = Some(self.context.schedule_delay(
            Duration::from_millis(delay_ms),
            Box::new(move || wake(ticket)),
        ));
    }
}

impl PrepareManager for LimitIntervalPrepareManager {
    fn request_size(&self) -> usize {
        self.prepare_size + self.wait_size
    }

    fn append_connections(&mut self, size: usize) -> usize {
        if size == 0 {
            return 0;
        }
        self.wait_size += size;

        if self.wait_task.is_some() {
            return 0;
        }
        self.try_prepare()
    }

    fn notify_prepare_complete(&mut self) -> usize {
        self.prepare_size = self.prepare_size.saturating_sub(1);

        if self.wait_task.is_some() || self.wait_size == 0 {
            return 0;
        }
        self.try_prepare()
    }

    fn on_deferred_elapsed(&mut self, ticket: u64) -> usize {
        if ticket != self.ticket || self.wait_task.is_none() {
            return 0;
        }
        self.wait_task = None;

        if self.wait_size == 0 {
            return 0;
        }
        self.do_prepare()
    }

    fn release(&mut self) {
        cancel_task(&mut self.wait_task);
        self.ticket += 1;
        self.last_prepare = None;
        self.prepare_size = 0;
        self.wait_size = 0;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;
    use proptest::prelude::*;

    use crate::context::ManualExecutorContext;

    // ------------------------------------------------------------------------
    // Limit size
    // ------------------------------------------------------------------------

    #[test]
    fn test_limit_size_request_is_monotonic() {
        let mut manager = LimitSizePrepareManager::new(10);

        assert_eq!(manager.request_connections(1), 1);
        assert_eq!(manager.request_size(), 1);

        assert_eq!(manager.request_connections(1), 0);
        assert_eq!(manager.request_size(), 1);

        assert_eq!(manager.request_connections(2), 1);
        assert_eq!(manager.request_size(), 2);

        assert_eq!(manager.request_connections(1), 0);
        assert_eq!(manager.request_size(), 2);
    }

    #[test]
    fn test_limit_size_queues_beyond_limit() {
        let mut manager = LimitSizePrepareManager::new(2);

        assert_eq!(manager.request_connections(5), 2);
        assert_eq!(manager.prepare_size(), 2);
        assert_eq!(manager.wait_size(), 3);

        // each completion hands the slot to a queued attempt
        assert_eq!(manager.notify_prepare_complete(), 1);
        assert_eq!(manager.notify_prepare_complete(), 1);
        assert_eq!(manager.notify_prepare_complete(), 1);
        assert_eq!(manager.wait_size(), 0);

        assert_eq!(manager.notify_prepare_complete(), 0);
        assert_eq!(manager.request_size(), 1);
    }

    #[test]
    fn test_limit_size_unbounded() {
        let mut manager = LimitSizePrepareManager::new(0);
        assert_eq!(manager.request_connections(7), 7);
        assert_eq!(manager.append_connections(2), 2);
        assert_eq!(manager.request_size(), 9);
    }

    #[test]
    fn test_limit_size_append_is_unconditional() {
        let mut manager = LimitSizePrepareManager::new(0);
        manager.request_connections(3);
        assert_eq!(manager.append_connections(1), 1);
        assert_eq!(manager.request_size(), 4);
    }

    #[test]
    fn test_limit_size_release_resets() {
        let mut manager = LimitSizePrepareManager::new(1);
        manager.request_connections(3);
        manager.release();
        assert_eq!(manager.request_size(), 0);
        assert_eq!(manager.request_connections(1), 1);
    }

    proptest! {
        #[test]
        fn prop_request_level_never_decreases(
            limit in 0usize..4,
            requests in proptest::collection::vec(0usize..12, 1..20),
        ) {
            let mut manager = LimitSizePrepareManager::new(limit);
            let mut high = 0;
            for size in requests {
                manager.request_connections(size);
                high = high.max(size);
                prop_assert_eq!(manager.request_size(), high);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Limit interval
    // ------------------------------------------------------------------------

    type Shared = Arc<Mutex<LimitIntervalPrepareManager>>;

    /// Wires a manager to a launch counter the way a pool would.
    fn interval_manager(
        interval_ms: u64,
        context: &Arc<ManualExecutorContext>,
    ) -> (Shared, Arc<Mutex<usize>>) {
        let launches = Arc::new(Mutex::new(0));
        let slot: Arc<Mutex<Option<Shared>>> = Arc::new(Mutex::new(None));

        let wake_slot = Arc::clone(&slot);
        let wake_launches = Arc::clone(&launches);
        let wake: WakeFn = Arc::new(move |ticket| {
            let manager = wake_slot.lock().clone();
            if let Some(manager) = manager {
                let started = manager.lock().on_deferred_elapsed(ticket);
                *wake_launches.lock() += started;
            }
        });

        let context: SharedContext = context.clone();
        let manager = Arc::new(Mutex::new(LimitIntervalPrepareManager::new(
            Duration::from_millis(interval_ms),
            context,
            wake,
        )));
        *slot.lock() = Some(Arc::clone(&manager));
        (manager, launches)
    }

    #[test]
    fn test_limit_interval_request_is_monotonic() {
        let context = ManualExecutorContext::new();
        let (manager, launches) = interval_manager(2000, &context);

        *launches.lock() += manager.lock().request_connections(1);
        assert_eq!(manager.lock().request_size(), 1);
        assert_eq!(*launches.lock(), 1);

        *launches.lock() += manager.lock().request_connections(1);
        assert_eq!(manager.lock().request_size(), 1);
        assert_eq!(*launches.lock(), 1);

        *launches.lock() += manager.lock().request_connections(2);
        assert_eq!(manager.lock().request_size(), 2);
        assert_eq!(*launches.lock(), 1);

        *launches.lock() += manager.lock().request_connections(1);
        assert_eq!(manager.lock().request_size(), 2);
        assert_eq!(*launches.lock(), 1);
    }

    #[test]
    fn test_limit_interval_coalesces_deferred_requests() {
        let context = ManualExecutorContext::new();
        let (manager, launches) = interval_manager(100, &context);

        context.advance(Duration::from_millis(1000));

        // t: first attempt starts immediately
        *launches.lock() += manager.lock().append_connections(1);
        assert_eq!(*launches.lock(), 1);

        // t + 1 and t + I - 1: both deferred behind one task
        context.advance(Duration::from_millis(1));
        *launches.lock() += manager.lock().append_connections(1);
        context.advance(Duration::from_millis(98));
        *launches.lock() += manager.lock().append_connections(1);
        assert_eq!(*launches.lock(), 1);
        assert_eq!(context.pending_tasks(), 1);
        assert_eq!(context.next_due(), Some(1100));

        // t + I: exactly one deferred attempt fires
        context.advance(Duration::from_millis(1));
        assert_eq!(context.now(), 1100);
        assert_eq!(*launches.lock(), 2);

        // the remaining queued attempt keeps the rate limit
        context.advance(Duration::from_millis(99));
        assert_eq!(*launches.lock(), 2);
        context.advance(Duration::from_millis(1));
        assert_eq!(*launches.lock(), 3);
        assert_eq!(manager.lock().wait_size(), 0);
        assert_eq!(context.pending_tasks(), 0);
    }

    #[test]
    fn test_limit_interval_allows_attempt_after_interval() {
        let context = ManualExecutorContext::new();
        let (manager, launches) = interval_manager(50, &context);

        *launches.lock() += manager.lock().append_connections(1);
        context.advance(Duration::from_millis(50));
        *launches.lock() += manager.lock().append_connections(1);

        assert_eq!(*launches.lock(), 2);
        assert!(!manager.lock().is_waiting());
    }

    #[test]
    fn test_limit_interval_release_cancels_wait() {
        let context = ManualExecutorContext::new();
        let (manager, launches) = interval_manager(100, &context);

        *launches.lock() += manager.lock().append_connections(3);
        assert_eq!(*launches.lock(), 1);
        assert!(manager.lock().is_waiting());

        manager.lock().release();
        assert_eq!(manager.lock().request_size(), 0);

        context.advance(Duration::from_millis(500));
        assert_eq!(*launches.lock(), 1);
    }

    #[test]
    fn test_limit_interval_ignores_stale_ticket() {
        let context = ManualExecutorContext::new();
        let (manager, _) = interval_manager(100, &context);

        manager.lock().append_connections(2);
        assert_eq!(manager.lock().on_deferred_elapsed(0), 0);
        assert!(manager.lock().is_waiting());
    }
}
