//! Tokio-backed executor context.
//!
//! Delayed and periodic tasks run as tokio timer tasks; `run_async` work
//! goes to the blocking worker pool, which suits transports whose sends
//! block on network I/O.

// ============================================================================
// Imports
// ============================================================================

use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::time::{MissedTickBehavior, interval_at, sleep};
use tracing::trace;

use crate::error::{Error, Result};

use super::{ExecutorContext, RepeatingTask, Task, TaskHandle, duration_ms};

// ============================================================================
// Constants
// ============================================================================

/// Lower bound for fixed-rate periods (tokio rejects a zero period).
const MIN_PERIOD: Duration = Duration::from_millis(1);

// ============================================================================
// TokioExecutorContext
// ============================================================================

/// Executor context driven by a tokio runtime.
///
/// # Example
///
/// ```ignore
/// let context = TokioExecutorContext::current()?;
/// let task = context.schedule_delay(Duration::from_secs(1), Box::new(|| println!("tick")));
/// task.cancel();
/// ```
#[derive(Debug, Clone)]
pub struct TokioExecutorContext {
    /// Runtime the tasks are spawned on.
    handle: Handle,

    /// Clock origin for [`ExecutorContext::current_time`].
    origin: Instant,
}

impl TokioExecutorContext {
    /// Creates a context spawning onto `handle`.
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            origin: Instant::now(),
        }
    }

    /// Creates a context for the runtime of the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when called outside a tokio runtime.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| Error::config(format!("No tokio runtime available: {e}")))
    }

    /// Returns the runtime handle.
    #[inline]
    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl ExecutorContext for TokioExecutorContext {
    fn current_time(&self) -> u64 {
        duration_ms(self.origin.elapsed())
    }

    fn schedule_delay(&self, delay: Duration, task: Task) -> TaskHandle {
        let handle = TaskHandle::new();
        let task_handle = handle.clone();

        trace!(delay_ms = duration_ms(delay), "Scheduling delayed task");

        let join = self.handle.spawn(async move {
            sleep(delay).await;
            if task_handle.is_cancelled() {
                return;
            }
            task();
            task_handle.mark_finished();
        });

        let abort = join.abort_handle();
        handle.set_canceller(move || abort.abort());
        handle
    }

    fn schedule_at_fixed_rate(
        &self,
        delay: Duration,
        period: Duration,
        mut task: RepeatingTask,
    ) -> TaskHandle {
        let handle = TaskHandle::new();
        let task_handle = handle.clone();
        let period = period.max(MIN_PERIOD);

        trace!(
            delay_ms = duration_ms(delay),
            period_ms = duration_ms(period),
            "Scheduling fixed-rate task"
        );

        let join = self.handle.spawn(async move {
            let start = tokio::time::Instant::now() + delay;
            let mut ticker = interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

            loop {
                ticker.tick().await;
                if task_handle.is_cancelled() {
                    break;
                }
                task();
            }
        });

        let abort = join.abort_handle();
        handle.set_canceller(move || abort.abort());
        handle
    }

    fn run_async(&self, task: Task) {
        drop(self.handle.spawn_blocking(task));
    }
}

// ============================================================================
// Tests
// ============================================================================
