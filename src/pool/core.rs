//! Connection pool: prepare, retry and membership tracking.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                  ConnectionPool                  │
//! │                                                  │
//! │  request_connections(n)                          │
//! │        │                                         │
//! │        ▼                                         │
//! │  PrepareManager ──launches──► idle / factory     │
//! │                                   │              │
//! │                                   ▼              │
//! │  preparing ──complete──► active ──closed──┐      │
//! │      │                                    │      │
//! │      └────failure──────► backoff ◄────────┘      │
//! │                             │ retry_intervals    │
//! │                             ▼                    │
//! │                      request again               │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! All state sits behind one mutex. Work with side effects (transport
//! `prepare`/`release`, listener notification) is collected into an
//! effects batch while the lock is held and executed after it is
//! released, so transports may call back synchronously from `prepare`.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::context::{SharedContext, TaskHandle, cancel_task, duration_ms};
use crate::error::Error;
use crate::identifiers::{ConnectionId, ListenerId};
use crate::transport::{Connection, ConnectionListener};

use super::builder::PoolBuilder;
use super::config::PoolConfig;
use super::listener::{
    ConnectionChangedListener, ConnectionEvent, ListenerSet, PoolStateEvent, PoolStateListener,
};
use super::pooled::{ConnectionFactory, PooledConnection};
use super::prepare::{PrepareManager, WakeFn};

// ============================================================================
// PoolMetrics
// ============================================================================

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    /// Active connections.
    pub active_size: usize,
    /// Demand not yet satisfied by an active connection.
    pub request_size: usize,
    /// Attempts in flight.
    pub preparing: usize,
    /// Consecutive failed retries.
    pub retry_count: usize,
    /// `true` while backing off after every attempt failed.
    pub retry_busy: bool,
}

// ============================================================================
// ConnectionPool
// ============================================================================

/// Pool of interchangeable connections to one logical endpoint.
///
/// Cloning is cheap; clones share the same pool.
///
/// # Example
///
/// ```ignore
/// let pool = ConnectionPool::builder(factory)
///     .config(PoolConfig::new().with_limit_prepare_size(2))
///     .build()?;
///
/// pool.add_state_listener(Arc::new(|event: &PoolStateEvent| println!("{event:?}")));
/// pool.request_connections(1);
/// ```
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}

struct PoolInner {
    config: PoolConfig,
    context: SharedContext,
    factory: Arc<dyn ConnectionFactory>,
    state: Mutex<PoolState>,
    connection_listeners: ListenerSet<dyn ConnectionChangedListener>,
    state_listeners: ListenerSet<dyn PoolStateListener>,
}

struct PoolState {
    /// Active connections in activation order.
    active: Vec<PooledConnection>,

    /// Attempts in flight.
    preparing: Vec<PooledConnection>,

    /// Released connection objects available for reuse.
    idle: Vec<Arc<dyn Connection>>,

    /// Launches waiting for the factory, which runs unlocked.
    creating: usize,

    prepare: Box<dyn PrepareManager>,

    active_size: usize,
    request_size: usize,

    retry_count: usize,
    retry_busy: bool,
    retry_task: Option<TaskHandle>,

    /// Bumped by `release()`; callbacks of older attempts are dropped.
    generation: u64,
}

impl PoolState {
    /// `true` when nothing is active, preparing or being created.
    fn is_empty(&self) -> bool {
        self.active.is_empty() && self.preparing.is_empty() && self.creating == 0
    }
}

/// Side effects collected under the pool lock.
#[derive(Default)]
struct Effects {
    /// Attempts granted by the prepare manager.
    launches: usize,

    /// Attempts to hand to `Connection::prepare`.
    prepares: Vec<PooledConnection>,

    /// Launches with no idle connection left; the factory fills them.
    creates: usize,

    /// Connections to release, then return to the idle list.
    recycle: Vec<Arc<dyn Connection>>,

    /// Connections to release without reuse.
    destroy: Vec<Arc<dyn Connection>>,

    connection_events: Vec<ConnectionEvent>,
    state_events: Vec<PoolStateEvent>,

    /// Emit `Idle` if nothing is active or preparing at the end.
    check_idle: bool,

    generation: u64,
}

// ============================================================================
// ConnectionPool - Constructor
// ============================================================================

impl ConnectionPool {
    /// Creates a pool.
    ///
    /// The configuration is normalized with [`PoolConfig::verified`].
    #[must_use]
    pub fn new(
        config: PoolConfig,
        context: SharedContext,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        let config = config.verified();

        let inner = Arc::new_cyclic(|weak: &Weak<PoolInner>| {
            let wake_pool = weak.clone();
            let wake: WakeFn = Arc::new(move |ticket| {
                if let Some(inner) = wake_pool.upgrade() {
                    inner.on_prepare_wake(ticket);
                }
            });

            let prepare = config.prepare_manager(Arc::clone(&context), wake);

            PoolInner {
                config,
                context,
                factory,
                state: Mutex::new(PoolState {
                    active: Vec::new(),
                    preparing: Vec::new(),
                    idle: Vec::new(),
                    creating: 0,
                    prepare,
                    active_size: 0,
                    request_size: 0,
                    retry_count: 0,
                    retry_busy: false,
                    retry_task: None,
                    generation: 0,
                }),
                connection_listeners: ListenerSet::default(),
                state_listeners: ListenerSet::default(),
            }
        });

        Self { inner }
    }

    /// Returns a builder for a pool using `factory`.
    #[inline]
    #[must_use]
    pub fn builder(factory: Arc<dyn ConnectionFactory>) -> PoolBuilder {
        PoolBuilder::new(factory)
    }
}

// ============================================================================
// ConnectionPool - Public API
// ============================================================================

impl ConnectionPool {
    /// Ensures at least `size` connections are active or preparing.
    ///
    /// While backing off, the request only raises the pending demand; the
    /// next retry picks it up.
    pub fn request_connections(&self, size: usize) {
        self.inner.with_state(|state, effects| {
            if state.retry_busy {
                state.request_size = state.request_size.max(size);
                trace!(size, "Request deferred while backing off");
                return;
            }

            let missing = size.saturating_sub(state.active.len());
            effects.launches += state.prepare.request_connections(missing);
            state.request_size = state.prepare.request_size();
        });
    }

    /// Returns up to `size` active connections in activation order.
    #[must_use]
    pub fn get_active_connections(&self, size: usize) -> Vec<PooledConnection> {
        let state = self.inner.state.lock();
        state.active.iter().take(size).cloned().collect()
    }

    /// Releases every connection and resets the pool.
    ///
    /// Listeners observe `Inactive` for each previously active connection,
    /// then `Idle`. The pool can be used again afterwards.
    pub fn release(&self) {
        let active = self.inner.with_state(|state, effects| {
            state.generation += 1;
            cancel_task(&mut state.retry_task);
            state.retry_busy = false;
            state.retry_count = 0;
            state.prepare.release();

            let active = mem::take(&mut state.active);
            let preparing = mem::take(&mut state.preparing);
            state.idle.clear();
            state.creating = 0;
            state.active_size = 0;
            state.request_size = 0;

            effects.destroy.extend(
                active
                    .iter()
                    .chain(preparing.iter())
                    .map(|pooled| Arc::clone(pooled.connection())),
            );
            effects
                .connection_events
                .extend(active.iter().cloned().map(ConnectionEvent::Inactive));
            effects.state_events.push(PoolStateEvent::Idle);

            active.len() + preparing.len()
        });

        info!(connections = active, "Pool released");
    }

    /// Returns a snapshot of the pool counters.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let state = self.inner.state.lock();
        PoolMetrics {
            active_size: state.active_size,
            request_size: state.request_size,
            preparing: state.preparing.len() + state.creating,
            retry_count: state.retry_count,
            retry_busy: state.retry_busy,
        }
    }

    /// Returns the pool configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Returns the executor context.
    #[inline]
    #[must_use]
    pub fn context(&self) -> &SharedContext {
        &self.inner.context
    }
}

// ============================================================================
// ConnectionPool - Listeners
// ============================================================================

impl ConnectionPool {
    /// Registers a connection change listener.
    pub fn add_connection_change_listener(
        &self,
        listener: Arc<dyn ConnectionChangedListener>,
    ) -> ListenerId {
        self.inner.connection_listeners.add(listener)
    }

    /// Unregisters a connection change listener.
    ///
    /// Returns `false` if `id` was not registered.
    pub fn remove_connection_change_listener(&self, id: ListenerId) -> bool {
        self.inner.connection_listeners.remove(id)
    }

    /// Registers a pool state listener.
    pub fn add_state_listener(&self, listener: Arc<dyn PoolStateListener>) -> ListenerId {
        self.inner.state_listeners.add(listener)
    }

    /// Unregisters a pool state listener.
    ///
    /// Returns `false` if `id` was not registered.
    pub fn remove_state_listener(&self, id: ListenerId) -> bool {
        self.inner.state_listeners.remove(id)
    }

    /// Returns the number of registered connection change listeners.
    #[inline]
    #[must_use]
    pub fn connection_listener_count(&self) -> usize {
        self.inner.connection_listeners.len()
    }
}

// ============================================================================
// PoolInner - Transitions
// ============================================================================

impl PoolInner {
    /// Runs `f` under the pool lock, then executes the collected effects.
    fn with_state<R>(
        self: &Arc<Self>,
        f: impl FnOnce(&mut PoolState, &mut Effects) -> R,
    ) -> R {
        let mut effects = Effects::default();
        let result = {
            let mut state = self.state.lock();
            let result = f(&mut *state, &mut effects);
            self.launch(&mut *state, &mut effects);

            if effects.check_idle && state.is_empty() {
                effects.state_events.push(PoolStateEvent::Idle);
            }
            effects.generation = state.generation;
            result
        };
        self.apply(effects);
        result
    }

    /// Turns granted launches into preparing attempts.
    ///
    /// Idle connections are reused here; the shortfall is left to
    /// [`apply`](Self::apply), which calls the factory without the lock.
    fn launch(&self, state: &mut PoolState, effects: &mut Effects) {
        let launches = mem::take(&mut effects.launches);
        if launches == 0 {
            return;
        }
        if state.is_empty() {
            effects.state_events.push(PoolStateEvent::Begin);
        }

        for _ in 0..launches {
            match state.idle.pop() {
                Some(connection) => {
                    let pooled = PooledConnection::new(ConnectionId::next(), connection);
                    state.preparing.push(pooled.clone());
                    effects.prepares.push(pooled);
                }
                None => effects.creates += 1,
            }
        }
        state.creating += effects.creates;
    }

    /// Executes side effects outside the pool lock.
    fn apply(self: &Arc<Self>, effects: Effects) {
        for connection in effects.destroy.iter().chain(effects.recycle.iter()) {
            connection.release();
        }

        if !effects.connection_events.is_empty() {
            let listeners = self.connection_listeners.snapshot();
            for event in &effects.connection_events {
                for listener in &listeners {
                    listener.on_connection_changed(event);
                }
            }
        }

        if !effects.state_events.is_empty() {
            let listeners = self.state_listeners.snapshot();
            for event in &effects.state_events {
                trace!(?event, "Pool state");
                for listener in &listeners {
                    listener.on_state_changed(event);
                }
            }
        }

        let created: Vec<Arc<dyn Connection>> =
            (0..effects.creates).map(|_| self.factory.create()).collect();

        let mut prepares = effects.prepares;
        let mut stale = Vec::new();

        // reuse only after observers saw the connection go inactive
        if !effects.recycle.is_empty() || !created.is_empty() {
            let mut state = self.state.lock();
            if state.generation == effects.generation {
                state.idle.extend(effects.recycle);
                state.creating = state.creating.saturating_sub(created.len());
                for connection in created {
                    let pooled = PooledConnection::new(ConnectionId::next(), connection);
                    state.preparing.push(pooled.clone());
                    prepares.push(pooled);
                }
            } else {
                stale = created;
            }
        }

        for connection in stale {
            connection.release();
        }

        for pooled in prepares {
            debug!(
                connection = %pooled.id(),
                name = pooled.display_name(),
                "Preparing connection"
            );
            let listener = Arc::new(PrepareListener {
                pool: Arc::downgrade(self),
                id: pooled.id(),
                generation: effects.generation,
            });
            pooled.connection().prepare(listener);
        }
    }

    fn on_complete(self: &Arc<Self>, id: ConnectionId, generation: u64) {
        self.with_state(|state, effects| {
            if state.generation != generation {
                return;
            }
            let Some(index) = state.preparing.iter().position(|item| item.id() == id) else {
                return;
            };

            let pooled = state.preparing.remove(index);
            debug!(connection = %id, name = pooled.display_name(), "Connection active");

            state.active.push(pooled.clone());
            state.request_size = state.request_size.saturating_sub(1);
            state.active_size += 1;
            effects.launches += state.prepare.notify_prepare_complete();

            if state.retry_busy {
                state.retry_busy = false;
                state.retry_count = 0;
                cancel_task(&mut state.retry_task);
                let request = state.request_size;
                effects.launches += state.prepare.request_connections(request);
            }

            effects.connection_events.push(ConnectionEvent::Active(pooled));
            effects.state_events.push(PoolStateEvent::Succeed {
                active: state.active_size,
            });
        });
    }

    fn on_inactive(self: &Arc<Self>, id: ConnectionId, generation: u64) {
        self.with_state(|state, effects| {
            if state.generation != generation {
                return;
            }

            let pooled = if let Some(index) = state.active.iter().position(|item| item.id() == id)
            {
                let pooled = state.active.remove(index);
                state.active_size = state.active_size.saturating_sub(1);
                state.request_size += 1;
                pooled
            } else if let Some(index) = state.preparing.iter().position(|item| item.id() == id) {
                let pooled = state.preparing.remove(index);
                effects.launches += state.prepare.notify_prepare_complete();
                pooled
            } else {
                return;
            };

            debug!(connection = %id, name = pooled.display_name(), "Connection inactive");
            effects.recycle.push(Arc::clone(pooled.connection()));

            if state.retry_busy {
                state.retry_count += 1;
                self.schedule_retry(state, effects);
            } else if !state.active.is_empty() {
                effects.launches += state.prepare.append_connections(1);
            } else if state.prepare.request_size() == 0 && state.request_size > 0 {
                state.retry_busy = true;
                self.schedule_retry(state, effects);
            }

            effects.connection_events.push(ConnectionEvent::Inactive(pooled));
            effects.check_idle = true;
        });
    }

    /// Schedules the next retry from the backoff ladder.
    fn schedule_retry(self: &Arc<Self>, state: &mut PoolState, effects: &mut Effects) {
        let delay = self.config.retry_delay(state.retry_count);
        effects.state_events.push(PoolStateEvent::Failed {
            retry_count: state.retry_count,
            delay,
        });

        cancel_task(&mut state.retry_task);

        if delay.is_zero() {
            let request = state.request_size;
            effects.launches += state.prepare.request_connections(request);
            return;
        }

        trace!(
            retry_count = state.retry_count,
            delay_ms = duration_ms(delay),
            "Scheduling retry"
        );

        let pool = Arc::downgrade(self);
        let generation = state.generation;
        state.retry_task = Some(self.context.schedule_delay(
            delay,
            Box::new(move || {
                if let Some(inner) = pool.upgrade() {
                    inner.on_retry(generation);
                }
            }),
        ));
    }

    fn on_retry(self: &Arc<Self>, generation: u64) {
        self.with_state(|state, effects| {
            if state.generation != generation || !state.retry_busy {
                return;
            }
            state.retry_task = None;

            let request = state.request_size;
            debug!(
                retry_count = state.retry_count,
                request, "Retrying connections"
            );
            effects.launches += state.prepare.request_connections(request);
        });
    }

    fn on_prepare_wake(self: &Arc<Self>, ticket: u64) {
        self.with_state(|state, effects| {
            effects.launches += state.prepare.on_deferred_elapsed(ticket);
        });
    }
}

// ============================================================================
// PrepareListener
// ============================================================================

/// Lifecycle listener for one prepare attempt.
struct PrepareListener {
    pool: Weak<PoolInner>,
    id: ConnectionId,
    generation: u64,
}

impl ConnectionListener for PrepareListener {
    fn on_connection_complete(&self) {
        if let Some(inner) = self.pool.upgrade() {
            inner.on_complete(self.id, self.generation);
        }
    }

    fn on_connection_failure(&self, error: Error) {
        warn!(connection = %self.id, error = %error, "Connection failed");
        if let Some(inner) = self.pool.upgrade() {
            inner.on_inactive(self.id, self.generation);
        }
    }

    fn on_connection_closed(&self, reason: String, error: Option<Error>) {
        match &error {
            Some(error) => {
                warn!(connection = %self.id, reason = %reason, error = %error, "Connection closed");
            }
            None => debug!(connection = %self.id, reason = %reason, "Connection closed"),
        }
        if let Some(inner) = self.pool.upgrade() {
            inner.on_inactive(self.id, self.generation);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::context::ManualExecutorContext;
    use crate::testing::{MockConnection, MockFactory};

    struct Fixture {
        context: Arc<ManualExecutorContext>,
        factory: Arc<MockFactory>,
        pool: ConnectionPool,
        events: Arc<Mutex<Vec<ConnectionEvent>>>,
        states: Arc<Mutex<Vec<PoolStateEvent>>>,
    }

    impl Fixture {
        fn new(config: PoolConfig) -> Self {
            let context = ManualExecutorContext::new();
            let factory = MockFactory::new();
            let pool = ConnectionPool::new(config, context.clone(), factory.clone());

            let events = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&events);
            pool.add_connection_change_listener(Arc::new(move |event: &ConnectionEvent| {
                sink.lock().push(event.clone());
            }));

            let states = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&states);
            pool.add_state_listener(Arc::new(move |event: &PoolStateEvent| {
                sink.lock().push(*event);
            }));

            Self {
                context,
                factory,
                pool,
                events,
                states,
            }
        }

        fn preparing(&self) -> Vec<Arc<MockConnection>> {
            self.factory
                .created()
                .into_iter()
                .filter(|mock| mock.is_preparing())
                .collect()
        }
    }

    fn fast_retry() -> PoolConfig {
        PoolConfig::new().with_retry_intervals([
            Duration::ZERO,
            Duration::from_millis(100),
            Duration::from_millis(200),
        ])
    }

    #[test]
    fn test_request_prepares_connections() {
        let fx = Fixture::new(PoolConfig::new());
        fx.pool.request_connections(2);

        assert_eq!(fx.factory.len(), 2);
        assert_eq!(fx.preparing().len(), 2);

        let metrics = fx.pool.metrics();
        assert_eq!(metrics.preparing, 2);
        assert_eq!(metrics.request_size, 2);
        assert_eq!(*fx.states.lock(), vec![PoolStateEvent::Begin]);
    }

    #[test]
    fn test_request_is_idempotent() {
        let fx = Fixture::new(PoolConfig::new());
        fx.pool.request_connections(1);
        fx.pool.request_connections(1);
        assert_eq!(fx.factory.len(), 1);
    }

    #[test]
    fn test_complete_activates_connection() {
        let fx = Fixture::new(PoolConfig::new());
        fx.pool.request_connections(1);
        fx.factory.get(0).notify_complete();

        let active = fx.pool.get_active_connections(1);
        assert_eq!(active.len(), 1);
        assert!(active[0].is_active());

        let metrics = fx.pool.metrics();
        assert_eq!(metrics.active_size, 1);
        assert_eq!(metrics.request_size, 0);
        assert_eq!(metrics.preparing, 0);

        assert_eq!(*fx.events.lock(), vec![ConnectionEvent::Active(active[0].clone())]);
        assert_eq!(
            fx.states.lock().last(),
            Some(&PoolStateEvent::Succeed { active: 1 })
        );
    }

    #[test]
    fn test_request_counts_active_connections() {
        let fx = Fixture::new(PoolConfig::new());
        fx.pool.request_connections(1);
        fx.factory.get(0).notify_complete();

        fx.pool.request_connections(1);
        assert_eq!(fx.factory.len(), 1);

        fx.pool.request_connections(2);
        assert_eq!(fx.factory.len(), 2);
    }

    #[test]
    fn test_active_order_is_activation_order() {
        let fx = Fixture::new(PoolConfig::new());
        fx.pool.request_connections(2);
        fx.factory.get(1).notify_complete();
        fx.factory.get(0).notify_complete();

        let names: Vec<String> = fx
            .pool
            .get_active_connections(2)
            .iter()
            .map(|pooled| pooled.display_name().to_string())
            .collect();
        assert_eq!(names, vec!["mock-1".to_string(), "mock-0".to_string()]);
    }

    #[test]
    fn test_inactive_emits_inactive_not_active() {
        let fx = Fixture::new(PoolConfig::new());
        fx.pool.request_connections(2);
        fx.factory.get(0).notify_complete();
        fx.factory.get(1).notify_complete();
        fx.events.lock().clear();

        let closed = fx.pool.get_active_connections(1)[0].clone();
        fx.factory.get(0).notify_closed("bye");

        let events = fx.events.lock().clone();
        assert_eq!(events, vec![ConnectionEvent::Inactive(closed)]);
        assert_eq!(fx.pool.metrics().active_size, 1);
        assert_eq!(fx.factory.get(0).release_count(), 1);
    }

    #[test]
    fn test_inactive_with_others_active_appends_one() {
        let fx = Fixture::new(PoolConfig::new());
        fx.pool.request_connections(2);
        fx.factory.get(0).notify_complete();
        fx.factory.get(1).notify_complete();

        fx.factory.get(0).notify_closed("bye");
        assert_eq!(fx.factory.len(), 3);
        assert!(fx.factory.get(2).is_preparing());
        assert!(!fx.pool.metrics().retry_busy);

        // the released object is reused for the next attempt
        fx.factory.get(2).notify_failure(Error::connection("refused"));
        assert_eq!(fx.factory.len(), 3);
        assert!(fx.factory.get(0).is_preparing());
        assert_eq!(fx.factory.get(0).prepare_count(), 2);
    }

    #[test]
    fn test_failures_follow_retry_ladder() {
        let fx = Fixture::new(fast_retry());
        fx.pool.request_connections(1);

        // first failure retries immediately
        fx.factory.get(0).notify_failure(Error::connection("refused"));
        let metrics = fx.pool.metrics();
        assert!(metrics.retry_busy);
        assert_eq!(metrics.retry_count, 0);
        assert_eq!(metrics.preparing, 1);

        // second failure waits for the next step of the ladder
        fx.preparing()[0].notify_failure(Error::connection("refused"));
        let metrics = fx.pool.metrics();
        assert_eq!(metrics.retry_count, 1);
        assert_eq!(metrics.preparing, 0);
        assert!(fx.states.lock().contains(&PoolStateEvent::Failed {
            retry_count: 1,
            delay: Duration::from_millis(100),
        }));

        fx.context.advance(Duration::from_millis(99));
        assert!(fx.preparing().is_empty());
        fx.context.advance(Duration::from_millis(1));
        assert_eq!(fx.preparing().len(), 1);

        fx.preparing()[0].notify_complete();
        let metrics = fx.pool.metrics();
        assert!(!metrics.retry_busy);
        assert_eq!(metrics.retry_count, 0);
        assert_eq!(metrics.active_size, 1);
        assert_eq!(fx.context.pending_tasks(), 0);
    }

    #[test]
    fn test_retry_ladder_wraps() {
        let fx = Fixture::new(fast_retry());
        fx.pool.request_connections(1);
        fx.factory.get(0).notify_failure(Error::connection("refused"));

        for step in 1..=3usize {
            fx.preparing()[0].notify_failure(Error::connection("refused"));
            fx.context.advance(Duration::from_millis(200));
            assert_eq!(fx.pool.metrics().retry_count, step);
        }

        let delays: Vec<Duration> = fx
            .states
            .lock()
            .iter()
            .filter_map(|event| match event {
                PoolStateEvent::Failed { delay, .. } => Some(*delay),
                _ => None,
            })
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::ZERO,
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::ZERO,
            ]
        );
    }

    #[test]
    fn test_request_while_backing_off_raises_demand() {
        let fx = Fixture::new(fast_retry());
        fx.pool.request_connections(1);
        fx.factory.get(0).notify_failure(Error::connection("refused"));
        fx.preparing()[0].notify_failure(Error::connection("refused"));
        assert!(fx.pool.metrics().retry_busy);

        fx.pool.request_connections(3);
        assert!(fx.preparing().is_empty());
        assert_eq!(fx.pool.metrics().request_size, 3);

        fx.context.advance(Duration::from_millis(100));
        assert_eq!(fx.preparing().len(), 3);
    }

    #[test]
    fn test_sole_active_close_reconnects() {
        let fx = Fixture::new(PoolConfig::new());
        fx.pool.request_connections(1);
        fx.factory.get(0).notify_complete();
        fx.states.lock().clear();

        fx.factory.get(0).notify_closed("server restart");

        let metrics = fx.pool.metrics();
        assert!(metrics.retry_busy);
        assert_eq!(metrics.preparing, 1);
        assert_eq!(
            *fx.states.lock(),
            vec![
                PoolStateEvent::Failed {
                    retry_count: 0,
                    delay: Duration::ZERO
                },
                PoolStateEvent::Begin,
            ]
        );
    }

    #[test]
    fn test_idle_emitted_when_nothing_left() {
        let fx = Fixture::new(fast_retry());
        fx.pool.request_connections(1);
        fx.factory.get(0).notify_failure(Error::connection("refused"));
        fx.preparing()[0].notify_failure(Error::connection("refused"));

        assert_eq!(fx.states.lock().last(), Some(&PoolStateEvent::Idle));
    }

    #[test]
    fn test_release_destroys_each_connection_once() {
        let fx = Fixture::new(PoolConfig::new());
        fx.pool.request_connections(3);
        fx.factory.get(0).notify_complete();
        fx.factory.get(1).notify_complete();
        let active = fx.pool.get_active_connections(2);
        fx.events.lock().clear();

        fx.pool.release();

        for mock in fx.factory.created() {
            assert_eq!(mock.release_count(), 1);
        }
        assert_eq!(fx.pool.metrics(), PoolMetrics::default());
        assert!(fx.pool.get_active_connections(5).is_empty());

        let events = fx.events.lock().clone();
        assert_eq!(
            events,
            active.into_iter().map(ConnectionEvent::Inactive).collect::<Vec<_>>()
        );
        assert_eq!(fx.states.lock().last(), Some(&PoolStateEvent::Idle));
    }

    #[test]
    fn test_late_callbacks_after_release_are_ignored() {
        let fx = Fixture::new(PoolConfig::new());
        fx.pool.request_connections(1);
        let mock = fx.factory.get(0);
        let listener = mock.listener().expect("prepared");

        fx.pool.release();
        listener.on_connection_complete();

        assert_eq!(fx.pool.metrics().active_size, 0);
        assert!(fx.pool.get_active_connections(1).is_empty());
    }

    #[test]
    fn test_late_callbacks_do_not_touch_next_generation() {
        let fx = Fixture::new(PoolConfig::new());
        fx.pool.request_connections(1);
        let stale = fx.factory.get(0).listener().expect("prepared");

        fx.pool.release();
        fx.pool.request_connections(1);
        let before = fx.pool.metrics();
        fx.events.lock().clear();

        stale.on_connection_complete();
        stale.on_connection_failure(Error::connection("late"));

        let after = fx.pool.metrics();
        assert_eq!(after, before);
        assert_eq!(after.active_size, 0);
        assert_eq!(after.preparing, 1);
        assert_eq!(after.retry_count, 0);
        assert!(!after.retry_busy);
        assert_eq!(fx.context.pending_tasks(), 0);
        assert!(fx.events.lock().is_empty());

        // the fresh attempt still completes normally
        fx.factory.get(1).notify_complete();
        assert_eq!(fx.pool.metrics().active_size, 1);
    }

    #[test]
    fn test_factory_may_call_into_pool() {
        let context = ManualExecutorContext::new();
        let slot: Arc<Mutex<Option<ConnectionPool>>> = Arc::new(Mutex::new(None));
        let seen: Arc<Mutex<Vec<PoolMetrics>>> = Arc::new(Mutex::new(Vec::new()));

        let pool_slot = Arc::clone(&slot);
        let sink = Arc::clone(&seen);
        let pool = ConnectionPool::new(
            PoolConfig::new(),
            context,
            Arc::new(move || -> Arc<dyn Connection> {
                let pool = pool_slot.lock().clone();
                if let Some(pool) = pool {
                    sink.lock().push(pool.metrics());
                    pool.add_state_listener(Arc::new(|_: &PoolStateEvent| {}));
                }
                MockConnection::new("reentrant")
            }),
        );
        *slot.lock() = Some(pool.clone());

        pool.request_connections(2);

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|metrics| metrics.preparing == 2));
        assert_eq!(pool.metrics().preparing, 2);
        assert_eq!(pool.metrics().request_size, 2);

        slot.lock().take();
        pool.release();
    }

    #[test]
    fn test_release_cancels_retry() {
        let fx = Fixture::new(fast_retry());
        fx.pool.request_connections(1);
        fx.factory.get(0).notify_failure(Error::connection("refused"));
        fx.preparing()[0].notify_failure(Error::connection("refused"));
        assert_eq!(fx.context.pending_tasks(), 1);

        fx.pool.release();
        assert_eq!(fx.context.pending_tasks(), 0);

        fx.context.advance(Duration::from_secs(1));
        assert_eq!(fx.pool.metrics().preparing, 0);
    }

    #[test]
    fn test_pool_usable_after_release() {
        let fx = Fixture::new(PoolConfig::new());
        fx.pool.request_connections(1);
        fx.pool.release();

        fx.pool.request_connections(1);
        assert_eq!(fx.pool.metrics().preparing, 1);
    }

    #[test]
    fn test_limit_size_caps_attempts() {
        let fx = Fixture::new(PoolConfig::new().with_limit_prepare_size(1));
        fx.pool.request_connections(3);
        assert_eq!(fx.preparing().len(), 1);

        fx.factory.get(0).notify_complete();
        assert_eq!(fx.preparing().len(), 1);
        assert_eq!(fx.pool.metrics().active_size, 1);
    }

    #[test]
    fn test_limit_interval_spaces_attempts() {
        let fx = Fixture::new(
            PoolConfig::new().with_limit_prepare_interval(Duration::from_millis(500)),
        );
        fx.pool.request_connections(2);
        assert_eq!(fx.factory.len(), 1);

        fx.context.advance(Duration::from_millis(499));
        assert_eq!(fx.factory.len(), 1);
        fx.context.advance(Duration::from_millis(1));
        assert_eq!(fx.factory.len(), 2);
    }

    #[test]
    fn test_remove_listener_stops_events() {
        let fx = Fixture::new(PoolConfig::new());
        let count = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&count);
        let id = fx
            .pool
            .add_connection_change_listener(Arc::new(move |_: &ConnectionEvent| {
                *counter.lock() += 1;
            }));

        assert!(fx.pool.remove_connection_change_listener(id));
        fx.pool.request_connections(1);
        fx.factory.get(0).notify_complete();
        assert_eq!(*count.lock(), 0);
    }

    #[test]
    fn test_synchronous_complete_inside_prepare() {
        let context = ManualExecutorContext::new();
        let factory = MockFactory::auto_complete();
        let pool = ConnectionPool::new(PoolConfig::new(), context, factory.clone());

        pool.request_connections(2);
        assert_eq!(pool.metrics().active_size, 2);
        assert_eq!(pool.get_active_connections(5).len(), 2);
    }
}
