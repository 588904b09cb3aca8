//! Time-window batching of accepted items.
//!
//! The first item accepted into an empty window schedules one dispatch
//! `interval` later; everything accepted until then rides along. Items are
//! unique: accepting an item already pending moves it to the end, so the
//! dispatched list reflects the latest order of intent.
//!
//! ```text
//! accept(a) accept(b) accept(a)          dispatch([b, a])
//!    │         │         │                     │
//!    ├─────────┴─────────┴──── interval ───────┤
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::context::{SharedContext, TaskHandle, cancel_task, duration_ms};

// ============================================================================
// Types
// ============================================================================

/// Receives each dispatched batch.
pub type DispatchFn<T> = Arc<dyn Fn(Vec<T>) + Send + Sync>;

// ============================================================================
// BatchManager
// ============================================================================

/// Coalesces accepted items into delayed batches.
///
/// Dropping the manager releases it.
///
/// # Example
///
/// ```ignore
/// let batch = BatchManager::new(Duration::from_millis(20), context, Arc::new(|items: Vec<u32>| {
///     println!("{items:?}");
/// }));
/// batch.accept(1);
/// batch.accept(2);
/// // 20ms later: [1, 2]
/// ```
pub struct BatchManager<T> {
    inner: Arc<BatchInner<T>>,
}

struct BatchInner<T> {
    interval: Duration,
    context: SharedContext,
    on_dispatch: DispatchFn<T>,
    state: Mutex<BatchState<T>>,
}

struct BatchState<T> {
    items: Vec<T>,
    task: Option<TaskHandle>,

    /// Bumped by `release()`; an already-running dispatch task bails out.
    generation: u64,
}

impl<T> fmt::Debug for BatchManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("BatchManager")
            .field("interval", &self.inner.interval)
            .field("pending", &state.items.len())
            .field("scheduled", &state.task.is_some())
            .finish()
    }
}

impl<T> BatchManager<T>
where
    T: PartialEq + Send + 'static,
{
    /// Creates a manager dispatching every `interval`.
    #[must_use]
    pub fn new(interval: Duration, context: SharedContext, on_dispatch: DispatchFn<T>) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                interval,
                context,
                on_dispatch,
                state: Mutex::new(BatchState {
                    items: Vec::new(),
                    task: None,
                    generation: 0,
                }),
            }),
        }
    }

    /// Accepts one item.
    pub fn accept(&self, item: T) {
        self.accept_all(std::iter::once(item));
    }

    /// Accepts several items, in order.
    pub fn accept_all(&self, items: impl IntoIterator<Item = T>) {
        let mut state = self.inner.state.lock();
        for item in items {
            if let Some(index) = state.items.iter().position(|pending| *pending == item) {
                state.items.remove(index);
            }
            state.items.push(item);
        }

        if state.task.is_none() && !state.items.is_empty() {
            let generation = state.generation;
            let batch = Arc::downgrade(&self.inner);

            trace!(
                delay_ms = duration_ms(self.inner.interval),
                pending = state.items.len(),
                "Scheduling batch"
            );

            state.task = Some(self.inner.context.schedule_delay(
                self.inner.interval,
                Box::new(move || BatchInner::fire(&batch, generation)),
            ));
        }
    }

}

impl<T> BatchManager<T> {
    /// Drops pending items and cancels the scheduled dispatch.
    pub fn release(&self) {
        let mut state = self.inner.state.lock();
        state.generation += 1;
        cancel_task(&mut state.task);
        state.items.clear();
    }

    /// Returns the number of items waiting for dispatch.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    /// Returns the batching window.
    #[inline]
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.inner.interval
    }
}

impl<T> BatchInner<T> {
    fn fire(batch: &Weak<Self>, generation: u64) {
        let Some(inner) = batch.upgrade() else {
            return;
        };

        let items = {
            let mut state = inner.state.lock();
            if state.generation != generation {
                return;
            }
            state.task = None;
            mem::take(&mut state.items)
        };

        if !items.is_empty() {
            (inner.on_dispatch)(items);
        }
    }
}

impl<T> Drop for BatchManager<T> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.generation += 1;
        cancel_task(&mut state.task);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::context::ManualExecutorContext;

    type Batches = Arc<Mutex<Vec<Vec<&'static str>>>>;

    fn recording_batch(
        interval_ms: u64,
    ) -> (BatchManager<&'static str>, Batches, Arc<ManualExecutorContext>) {
        let context = ManualExecutorContext::new();
        let batches: Batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        let batch = BatchManager::new(
            Duration::from_millis(interval_ms),
            context.clone(),
            Arc::new(move |items: Vec<&'static str>| sink.lock().push(items)),
        );
        (batch, batches, context)
    }

    #[test]
    fn test_window_dispatches_once() {
        let (batch, batches, context) = recording_batch(20);

        batch.accept("a");
        context.advance(Duration::from_millis(10));
        batch.accept_all(["b", "c"]);
        assert_eq!(context.pending_tasks(), 1);

        context.advance(Duration::from_millis(9));
        assert!(batches.lock().is_empty());

        context.advance(Duration::from_millis(1));
        assert_eq!(*batches.lock(), vec![vec!["a", "b", "c"]]);
        assert_eq!(batch.pending_len(), 0);
    }

    #[test]
    fn test_duplicates_move_to_end() {
        let (batch, batches, context) = recording_batch(20);

        batch.accept_all(["a", "b", "a"]);
        assert_eq!(batch.pending_len(), 2);

        context.advance(Duration::from_millis(20));
        assert_eq!(*batches.lock(), vec![vec!["b", "a"]]);
    }

    #[test]
    fn test_next_window_starts_after_dispatch() {
        let (batch, batches, context) = recording_batch(20);

        batch.accept("a");
        context.advance(Duration::from_millis(20));
        batch.accept("b");
        context.advance(Duration::from_millis(20));

        assert_eq!(*batches.lock(), vec![vec!["a"], vec!["b"]]);
    }

    #[test]
    fn test_release_drops_pending() {
        let (batch, batches, context) = recording_batch(20);

        batch.accept_all(["a", "b"]);
        batch.release();
        assert_eq!(batch.pending_len(), 0);
        assert_eq!(context.pending_tasks(), 0);

        context.advance(Duration::from_millis(50));
        assert!(batches.lock().is_empty());

        batch.accept("c");
        context.advance(Duration::from_millis(20));
        assert_eq!(*batches.lock(), vec![vec!["c"]]);
    }

    /// Owners without item bounds (drop paths) still release.
    fn release_unbounded<T>(batch: &BatchManager<T>) -> usize {
        batch.release();
        batch.pending_len()
    }

    #[test]
    fn test_release_without_item_bounds() {
        let (batch, batches, context) = recording_batch(20);

        batch.accept_all(["a", "b"]);
        assert_eq!(release_unbounded(&batch), 0);
        assert_eq!(batch.interval(), Duration::from_millis(20));

        context.advance(Duration::from_millis(50));
        assert!(batches.lock().is_empty());
    }

    #[test]
    fn test_drop_cancels_task() {
        let (batch, batches, context) = recording_batch(20);
        batch.accept("a");
        drop(batch);

        context.advance(Duration::from_millis(50));
        assert!(batches.lock().is_empty());
    }

    #[test]
    fn test_dispatch_may_accept_again() {
        let context = ManualExecutorContext::new();
        let batches: Arc<Mutex<Vec<Vec<u32>>>> = Arc::new(Mutex::new(Vec::new()));
        let slot: Arc<Mutex<Option<Arc<BatchManager<u32>>>>> = Arc::new(Mutex::new(None));

        let sink = Arc::clone(&batches);
        let again = Arc::clone(&slot);
        let batch = Arc::new(BatchManager::new(
            Duration::from_millis(10),
            context.clone(),
            Arc::new(move |items: Vec<u32>| {
                let first = items.first().copied();
                sink.lock().push(items);
                let batch = again.lock().clone();
                if let (Some(batch), Some(1)) = (batch, first) {
                    batch.accept(2);
                }
            }),
        ));
        *slot.lock() = Some(Arc::clone(&batch));

        batch.accept(1);
        context.advance(Duration::from_millis(20));
        assert_eq!(*batches.lock(), vec![vec![1], vec![2]]);

        slot.lock().take();
    }
}
