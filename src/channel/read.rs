//! Receive-only channel.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::identifiers::ListenerId;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::transport::SharedHandler;

use super::{Binding, Channel, PoolObserver, watch_pool};

// ============================================================================
// ReadChannel
// ============================================================================

/// Keeps a message handler attached to one active pooled connection.
///
/// On construction the channel binds to an already active connection or
/// requests one. After a reconnect it rebinds to the next connection that
/// becomes active. Dropping the channel releases it.
pub struct ReadChannel {
    inner: Arc<ReadInner>,
}

struct ReadInner {
    pool: ConnectionPool,
    state: Mutex<ReadState>,
}

struct ReadState {
    binding: Binding,
    listener: Option<ListenerId>,
    released: bool,
}

impl fmt::Debug for ReadChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ReadChannel")
            .field("bound", &state.binding.bound_id())
            .field("released", &state.released)
            .finish()
    }
}

impl ReadChannel {
    /// Creates the channel and starts receiving into `handler`.
    #[must_use]
    pub fn new(pool: ConnectionPool, handler: SharedHandler) -> Self {
        let inner = Arc::new(ReadInner {
            pool,
            state: Mutex::new(ReadState {
                binding: Binding::new(handler),
                listener: None,
                released: false,
            }),
        });

        let listener = watch_pool(&inner.pool, &inner);
        let request = {
            let mut state = inner.state.lock();
            state.listener = Some(listener);
            match inner.pool.get_active_connections(1).pop() {
                Some(connection) => {
                    if state.binding.live().is_none() {
                        state.binding.bind(&connection);
                    }
                    false
                }
                None => state.binding.live().is_none(),
            }
        };

        if request {
            inner.pool.request_connections(1);
        }
        Self { inner }
    }
}

impl Channel for ReadChannel {
    fn release(&self) {
        self.inner.release();
    }

    fn is_bound(&self) -> bool {
        self.inner.state.lock().binding.is_live()
    }
}

impl Drop for ReadChannel {
    fn drop(&mut self) {
        self.inner.release();
    }
}

impl ReadInner {
    fn release(&self) {
        let listener = {
            let mut state = self.state.lock();
            if state.released {
                return;
            }
            state.released = true;
            state.binding.unbind();
            state.listener.take()
        };

        if let Some(listener) = listener {
            self.pool.remove_connection_change_listener(listener);
        }
    }
}

impl PoolObserver for ReadInner {
    fn on_active(&self, connection: &PooledConnection) {
        let mut state = self.state.lock();
        if state.released || state.binding.live().is_some() {
            return;
        }
        state.binding.bind(connection);
    }

    fn on_inactive(&self, connection: &PooledConnection) {
        self.state.lock().binding.unbind_if(connection.id());
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::context::ManualExecutorContext;
    use crate::pool::PoolConfig;
    use crate::testing::MockFactory;
    use crate::transport::Payload;

    fn counting_handler() -> (SharedHandler, Arc<Mutex<Vec<Payload>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let handler: SharedHandler = Arc::new(move |_: u64, message: &Payload| {
            sink.lock().push(message.clone());
            true
        });
        (handler, received)
    }

    fn pool() -> (ConnectionPool, Arc<MockFactory>) {
        let factory = MockFactory::new();
        let pool = ConnectionPool::new(
            PoolConfig::new(),
            ManualExecutorContext::new(),
            factory.clone(),
        );
        (pool, factory)
    }

    #[test]
    fn test_construction_requests_connection() {
        let (pool, factory) = pool();
        let (handler, received) = counting_handler();
        let channel = ReadChannel::new(pool.clone(), handler);

        assert_eq!(pool.metrics().preparing, 1);
        assert!(!channel.is_bound());

        factory.get(0).notify_complete();
        assert!(channel.is_bound());
        assert!(factory.get(0).notify_message(1, "hello"));
        assert_eq!(*received.lock(), vec![Payload::text("hello")]);
    }

    #[test]
    fn test_construction_binds_to_active_connection() {
        let (pool, factory) = pool();
        pool.request_connections(1);
        factory.get(0).notify_complete();

        let (handler, _) = counting_handler();
        let channel = ReadChannel::new(pool.clone(), handler);

        assert!(channel.is_bound());
        assert_eq!(factory.len(), 1);
        assert_eq!(factory.get(0).handler_count(), 1);
    }

    #[test]
    fn test_rebinds_after_reconnect() {
        let (pool, factory) = pool();
        let (handler, received) = counting_handler();
        let channel = ReadChannel::new(pool.clone(), handler);
        factory.get(0).notify_complete();

        factory.get(0).notify_closed("restart");
        assert!(!channel.is_bound());

        let retry = factory.get(1);
        retry.notify_complete();
        assert!(channel.is_bound());
        assert!(retry.notify_message(2, "again"));
        assert_eq!(*received.lock(), vec![Payload::text("again")]);
    }

    #[test]
    fn test_release_detaches_handler() {
        let (pool, factory) = pool();
        let (handler, _) = counting_handler();
        let channel = ReadChannel::new(pool.clone(), handler);
        factory.get(0).notify_complete();
        assert_eq!(factory.get(0).handler_count(), 1);

        channel.release();
        assert_eq!(factory.get(0).handler_count(), 0);
        assert_eq!(pool.connection_listener_count(), 0);
        assert!(!channel.is_bound());
    }
}
