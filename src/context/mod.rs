//! Executor context: clock and task scheduling.
//!
//! Every timed behavior in the crate (retry backoff, prepare rate limits,
//! batch windows, ping/keepalive) goes through an [`ExecutorContext`], so
//! the whole engine can run on tokio in production and on a virtual clock
//! in tests.
//!
//! # Implementations
//!
//! | Type | Description |
//! |------|-------------|
//! | [`TokioExecutorContext`] | tokio timers plus the blocking worker pool |
//! | [`ManualExecutorContext`] | virtual clock advanced explicitly by tests |
//!
//! Scheduled work is returned as a [`TaskHandle`]. Cancelling a handle
//! prevents a task that has not started yet from running; code that may
//! race with an already-running task guards itself with a generation
//! counter.

// ============================================================================
// Submodules
// ============================================================================

/// Virtual-clock executor for deterministic tests.
pub mod manual;

/// Tokio-backed executor.
pub mod runtime;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

// ============================================================================
// Re-exports
// ============================================================================

pub use manual::ManualExecutorContext;
pub use runtime::TokioExecutorContext;

// ============================================================================
// Types
// ============================================================================

/// One-shot task.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Task run repeatedly at a fixed rate.
pub type RepeatingTask = Box<dyn FnMut() + Send + 'static>;

/// Shared executor context.
pub type SharedContext = Arc<dyn ExecutorContext>;

// ============================================================================
// ExecutorContext
// ============================================================================

/// Clock and scheduler used by pools, channels and transports.
///
/// Implementations must never run a task synchronously inside
/// `schedule_delay`/`schedule_at_fixed_rate`: callers schedule while holding
/// their own locks.
pub trait ExecutorContext: Send + Sync {
    /// Returns the current time in milliseconds.
    ///
    /// Only differences between two readings are meaningful.
    fn current_time(&self) -> u64;

    /// Runs `task` once after `delay`.
    fn schedule_delay(&self, delay: Duration, task: Task) -> TaskHandle;

    /// Runs `task` after `delay`, then every `period`.
    fn schedule_at_fixed_rate(
        &self,
        delay: Duration,
        period: Duration,
        task: RepeatingTask,
    ) -> TaskHandle;

    /// Runs `task` on a background worker, fire-and-forget.
    fn run_async(&self, task: Task);
}

// ============================================================================
// TaskHandle
// ============================================================================

/// Canceller hook installed by an executor.
type Canceller = Box<dyn FnOnce() + Send + 'static>;

struct TaskState {
    cancelled: AtomicBool,
    finished: AtomicBool,
    canceller: Mutex<Option<Canceller>>,
}

/// Cancellable handle to scheduled work.
///
/// Cloning a handle shares the underlying task.
#[derive(Clone)]
pub struct TaskHandle {
    state: Arc<TaskState>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("cancelled", &self.is_cancelled())
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

impl Default for TaskHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskHandle {
    /// Creates a pending handle.
    ///
    /// Used by [`ExecutorContext`] implementations.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(TaskState {
                cancelled: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                canceller: Mutex::new(None),
            }),
        }
    }

    /// Cancels the task.
    ///
    /// Idempotent. A task already running is not interrupted.
    pub fn cancel(&self) {
        if self.state.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let canceller = self.state.canceller.lock().take();
        if let Some(canceller) = canceller {
            canceller();
        }
    }

    /// Returns `true` once [`cancel`](Self::cancel) was called.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `true` once a one-shot task has run.
    #[inline]
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::SeqCst)
    }

    /// Returns `true` while the task may still run.
    #[inline]
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.is_cancelled() && !self.is_finished()
    }

    /// Marks a one-shot task as run.
    pub fn mark_finished(&self) {
        self.state.finished.store(true, Ordering::SeqCst);
        self.state.canceller.lock().take();
    }

    /// Installs a hook invoked on cancellation.
    ///
    /// Runs immediately when the handle is already cancelled.
    pub fn set_canceller(&self, canceller: impl FnOnce() + Send + 'static) {
        if self.is_cancelled() {
            canceller();
            return;
        }
        *self.state.canceller.lock() = Some(Box::new(canceller));
        // cancel() may have raced between the check and the store
        if self.is_cancelled()
            && let Some(canceller) = self.state.canceller.lock().take()
        {
            canceller();
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Converts a duration to whole milliseconds, saturating.
#[inline]
#[must_use]
pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Cancels and clears an optional task slot.
#[inline]
pub(crate) fn cancel_task(slot: &mut Option<TaskHandle>) {
    if let Some(task) = slot.take() {
        task.cancel();
    }
}

// ============================================================================
// Tests
// ============================================================================
