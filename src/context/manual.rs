//! Virtual-clock executor context.
//!
//! Time only moves when the owner calls [`ManualExecutorContext::advance`].
//! Tasks due within the advanced window run in due-time order on the
//! calling thread, with the clock set to each task's due time while it runs.
//! Background work from `run_async` is queued until
//! [`ManualExecutorContext::run_io`].

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{ExecutorContext, RepeatingTask, Task, TaskHandle, duration_ms};

// ============================================================================
// Types
// ============================================================================

enum Job {
    Once(Task),
    Repeat { task: RepeatingTask, period_ms: u64 },
}

struct Scheduled {
    due: u64,
    seq: u64,
    job: Job,
    handle: TaskHandle,
}

#[derive(Default)]
struct ManualState {
    now: u64,
    next_seq: u64,
    scheduled: Vec<Scheduled>,
    io: VecDeque<Task>,
}

impl ManualState {
    fn push(&mut self, due: u64, job: Job, handle: TaskHandle) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.scheduled.push(Scheduled {
            due,
            seq,
            job,
            handle,
        });
    }

    /// Removes the earliest live task due at or before `target`.
    fn pop_due(&mut self, target: u64) -> Option<Scheduled> {
        self.scheduled.retain(|item| !item.handle.is_cancelled());

        let index = self
            .scheduled
            .iter()
            .enumerate()
            .filter(|(_, item)| item.due <= target)
            .min_by_key(|(_, item)| (item.due, item.seq))
            .map(|(index, _)| index)?;

        Some(self.scheduled.swap_remove(index))
    }
}

// ============================================================================
// ManualExecutorContext
// ============================================================================

/// Executor context with a manually advanced clock.
///
/// # Example
///
/// ```ignore
/// let context = ManualExecutorContext::new();
/// context.schedule_delay(Duration::from_millis(20), Box::new(|| println!("fired")));
/// context.advance(Duration::from_millis(20)); // prints "fired"
/// ```
#[derive(Default)]
pub struct ManualExecutorContext {
    state: Mutex<ManualState>,
}

impl std::fmt::Debug for ManualExecutorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualExecutorContext")
            .field("now", &state.now)
            .field("scheduled", &state.scheduled.len())
            .field("io", &state.io.len())
            .finish()
    }
}

impl ManualExecutorContext {
    /// Creates a shared context with the clock at zero.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the virtual time in milliseconds.
    #[inline]
    #[must_use]
    pub fn now(&self) -> u64 {
        self.state.lock().now
    }

    /// Advances the clock by `duration`, running every task that falls due.
    ///
    /// Returns the number of task runs.
    pub fn advance(&self, duration: Duration) -> usize {
        let target = self.state.lock().now.saturating_add(duration_ms(duration));
        let mut runs = 0;

        loop {
            let next = {
                let mut state = self.state.lock();
                let next = state.pop_due(target);
                if let Some(item) = &next {
                    state.now = state.now.max(item.due);
                }
                next
            };

            let Some(item) = next else {
                break;
            };

            runs += 1;
            match item.job {
                Job::Once(task) => {
                    task();
                    item.handle.mark_finished();
                }
                Job::Repeat {
                    mut task,
                    period_ms,
                } => {
                    task();
                    if !item.handle.is_cancelled() {
                        let mut state = self.state.lock();
                        let due = item.due + period_ms;
                        state.push(due, Job::Repeat { task, period_ms }, item.handle);
                    }
                }
            }
        }

        let mut state = self.state.lock();
        state.now = state.now.max(target);
        runs
    }

    /// Runs tasks already due without moving the clock.
    pub fn run_due(&self) -> usize {
        self.advance(Duration::ZERO)
    }

    /// Runs queued `run_async` work, including work queued while running.
    ///
    /// Returns the number of tasks run.
    pub fn run_io(&self) -> usize {
        let mut runs = 0;
        loop {
            let next = self.state.lock().io.pop_front();
            let Some(task) = next else {
                return runs;
            };
            task();
            runs += 1;
        }
    }

    /// Returns the number of scheduled tasks that may still run.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.state
            .lock()
            .scheduled
            .iter()
            .filter(|item| item.handle.is_pending())
            .count()
    }

    /// Returns the due time of the earliest live task.
    #[must_use]
    pub fn next_due(&self) -> Option<u64> {
        self.state
            .lock()
            .scheduled
            .iter()
            .filter(|item| item.handle.is_pending())
            .map(|item| item.due)
            .min()
    }
}

impl ExecutorContext for ManualExecutorContext {
    fn current_time(&self) -> u64 {
        self.now()
    }

    fn schedule_delay(&self, delay: Duration, task: Task) -> TaskHandle {
        let handle = TaskHandle::new();
        let mut state = self.state.lock();
        let due = state.now.saturating_add(duration_ms(delay));
        state.push(due, Job::Once(task), handle.clone());
        handle
    }

    fn schedule_at_fixed_rate(
        &self,
        delay: Duration,
        period: Duration,
        task: RepeatingTask,
    ) -> TaskHandle {
        let handle = TaskHandle::new();
        let period_ms = duration_ms(period).max(1);
        let mut state = self.state.lock();
        let due = state.now.saturating_add(duration_ms(delay));
        state.push(due, Job::Repeat { task, period_ms }, handle.clone());
        handle
    }

    fn run_async(&self, task: Task) {
        self.state.lock().io.push_back(task);
    }
}

// ============================================================================
// Tests
// ============================================================================
