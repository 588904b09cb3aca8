//! Outbound message channel with an offline cache.
//!
//! # Example
//!
//! ```ignore
//! let channel: MessageChannel<String> = MessageChannel::new(pool.clone(), handler);
//! channel.send("hello".to_string()); // cached until a connection is active
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::Error;
use crate::identifiers::ListenerId;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::transport::{Payload, SharedHandler};

use super::{
    Binding, Channel, ErrorHandler, PoolObserver, default_error_handler, report_all,
    report_released, send_collecting, watch_pool,
};

// ============================================================================
// MessageChannel
// ============================================================================

/// Sends messages over one pooled connection, caching them while offline.
///
/// Messages sent while unbound are kept in FIFO order and flushed, in
/// order, as soon as the channel binds. Dropping the channel releases it.
pub struct MessageChannel<T> {
    inner: Arc<MessageInner<T>>,
}

struct MessageInner<T> {
    pool: ConnectionPool,
    on_error: ErrorHandler,
    state: Mutex<MessageState<T>>,
}

struct MessageState<T> {
    binding: Binding,
    cache: VecDeque<T>,
    listener: Option<ListenerId>,
    released: bool,
}

impl<T> fmt::Debug for MessageChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MessageChannel")
            .field("bound", &state.binding.bound_id())
            .field("cached", &state.cache.len())
            .field("released", &state.released)
            .finish()
    }
}

// ============================================================================
// MessageChannel - Constructor
// ============================================================================

impl<T> MessageChannel<T>
where
    T: Into<Payload> + Send + 'static,
{
    /// Creates a channel logging errors at `warn`.
    #[must_use]
    pub fn new(pool: ConnectionPool, handler: SharedHandler) -> Self {
        Self::with_error_handler(pool, handler, default_error_handler())
    }

    /// Creates a channel reporting send errors to `on_error`.
    #[must_use]
    pub fn with_error_handler(
        pool: ConnectionPool,
        handler: SharedHandler,
        on_error: ErrorHandler,
    ) -> Self {
        let inner = Arc::new(MessageInner {
            pool,
            on_error,
            state: Mutex::new(MessageState {
                binding: Binding::new(handler),
                cache: VecDeque::new(),
                listener: None,
                released: false,
            }),
        });

        let listener = watch_pool(&inner.pool, &inner);
        inner.state.lock().listener = Some(listener);

        Self { inner }
    }
}

// ============================================================================
// MessageChannel - Public API
// ============================================================================

impl<T> MessageChannel<T>
where
    T: Into<Payload> + Send + 'static,
{
    /// Sends `message`, or caches it until a connection is active.
    pub fn send(&self, message: T) {
        let mut errors = Vec::new();
        let request = {
            let mut state = self.inner.state.lock();
            if state.released {
                drop(state);
                report_released("message", &self.inner.on_error);
                return;
            }

            if let Some(connection) = state.binding.live() {
                send_collecting(&connection, message.into(), &mut errors);
                false
            } else if let Some(connection) = self.inner.pool.get_active_connections(1).pop() {
                state.binding.bind(&connection);
                flush(&mut *state, &connection, &mut errors);
                send_collecting(&connection, message.into(), &mut errors);
                false
            } else {
                state.cache.push_back(message);
                true
            }
        };

        if request {
            self.inner.pool.request_connections(1);
        }
        report_all(errors, &self.inner.on_error);
    }

    /// Returns the number of cached messages.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.inner.state.lock().cache.len()
    }
}

impl<T> Channel for MessageChannel<T>
where
    T: Into<Payload> + Send + 'static,
{
    fn release(&self) {
        self.inner.release();
    }

    fn is_bound(&self) -> bool {
        self.inner.state.lock().binding.is_live()
    }
}

impl<T> Drop for MessageChannel<T> {
    fn drop(&mut self) {
        self.inner.release();
    }
}

// ============================================================================
// MessageInner
// ============================================================================

/// Sends every cached message on `connection`, in order.
fn flush<T: Into<Payload>>(
    state: &mut MessageState<T>,
    connection: &PooledConnection,
    errors: &mut Vec<Error>,
) {
    if state.cache.is_empty() {
        return;
    }
    debug!(
        connection = %connection.id(),
        cached = state.cache.len(),
        "Flushing cached messages"
    );
    for message in state.cache.drain(..) {
        send_collecting(connection, message.into(), errors);
    }
}

impl<T> MessageInner<T> {
    fn release(&self) {
        let listener = {
            let mut state = self.state.lock();
            if state.released {
                return;
            }
            state.released = true;
            state.cache.clear();
            state.binding.unbind();
            state.listener.take()
        };

        if let Some(listener) = listener {
            self.pool.remove_connection_change_listener(listener);
        }
    }
}

impl<T> PoolObserver for MessageInner<T>
where
    T: Into<Payload> + Send,
{
    fn on_active(&self, connection: &PooledConnection) {
        let mut errors = Vec::new();
        {
            let mut state = self.state.lock();
            if state.released || state.binding.live().is_some() {
                return;
            }
            state.binding.bind(connection);
            flush(&mut *state, connection, &mut errors);
        }
        report_all(errors, &self.on_error);
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

    use std::panic::{self, AssertUnwindSafe};

    use crate::context::ManualExecutorContext;
    use crate::pool::PoolConfig;
    use crate::testing::{MockConnection, MockFactory};
    use crate::transport::Connection;

    struct Fixture {
        factory: Arc<MockFactory>,
        pool: ConnectionPool,
        received: Arc<Mutex<Vec<Payload>>>,
        errors: Arc<Mutex<Vec<String>>>,
        channel: MessageChannel<String>,
    }

    fn fixture() -> Fixture {
        let factory = MockFactory::new();
        let pool = ConnectionPool::new(
            PoolConfig::new(),
            ManualExecutorContext::new(),
            factory.clone(),
        );

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let handler: SharedHandler = Arc::new(move |_: u64, message: &Payload| {
            sink.lock().push(message.clone());
            true
        });

        let errors = Arc::new(Mutex::new(Vec::new()));
        let error_sink = Arc::clone(&errors);
        let channel = MessageChannel::with_error_handler(
            pool.clone(),
            handler,
            Arc::new(move |error: &Error| error_sink.lock().push(error.to_string())),
        );

        Fixture {
            factory,
            pool,
            received,
            errors,
            channel,
        }
    }

    #[test]
    fn test_offline_sends_flush_in_order() {
        let fx = fixture();
        fx.channel.send("m1".into());
        fx.channel.send("m2".into());
        fx.channel.send("m3".into());

        assert_eq!(fx.channel.cached_len(), 3);
        assert_eq!(fx.factory.len(), 1);
        assert!(!fx.channel.is_bound());

        let mock = fx.factory.get(0);
        mock.notify_complete();

        assert_eq!(mock.sent_texts(), vec!["m1", "m2", "m3"]);
        assert_eq!(fx.channel.cached_len(), 0);
        assert!(fx.channel.is_bound());
    }

    #[test]
    fn test_bound_send_is_immediate() {
        let fx = fixture();
        fx.pool.request_connections(1);
        let mock = fx.factory.get(0);
        mock.notify_complete();
        assert!(fx.channel.is_bound());

        fx.channel.send("now".into());
        assert_eq!(mock.sent_texts(), vec!["now"]);
    }

    #[test]
    fn test_send_binds_to_existing_active_connection() {
        let factory = MockFactory::new();
        let pool = ConnectionPool::new(
            PoolConfig::new(),
            ManualExecutorContext::new(),
            factory.clone(),
        );
        pool.request_connections(1);
        factory.get(0).notify_complete();

        let handler: SharedHandler = Arc::new(|_: u64, _: &Payload| false);
        let channel: MessageChannel<String> = MessageChannel::new(pool, handler);
        assert!(!channel.is_bound());

        channel.send("hi".into());
        assert!(channel.is_bound());
        assert_eq!(factory.get(0).sent_texts(), vec!["hi"]);
        assert_eq!(factory.get(0).handler_count(), 1);
    }

    #[test]
    fn test_inbound_messages_reach_handler() {
        let fx = fixture();
        fx.channel.send("sub".into());
        let mock = fx.factory.get(0);
        mock.notify_complete();

        assert!(mock.notify_message(5, "tick"));
        assert_eq!(*fx.received.lock(), vec![Payload::text("tick")]);
    }

    #[test]
    fn test_inactive_unbinds_and_caches_again() {
        let fx = fixture();
        fx.channel.send("first".into());
        let mock = fx.factory.get(0);
        mock.notify_complete();

        mock.notify_closed("bye");
        assert!(!fx.channel.is_bound());
        assert_eq!(mock.handler_count(), 0);

        fx.channel.send("second".into());
        assert_eq!(fx.channel.cached_len(), 1);

        // the pool's immediate retry produced a fresh attempt
        let retry = fx
            .factory
            .created()
            .into_iter()
            .find(|mock| mock.is_preparing())
            .expect("retry attempt");
        retry.notify_complete();
        assert_eq!(retry.sent_texts(), vec!["second"]);
    }

    #[test]
    fn test_unsupported_payload_goes_to_error_handler() {
        let mock = MockConnection::text_only("text");
        let factory_mock = Arc::clone(&mock);
        let pool = ConnectionPool::new(
            PoolConfig::new(),
            ManualExecutorContext::new(),
            Arc::new(move || -> Arc<dyn Connection> { factory_mock.clone() }),
        );

        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let channel: MessageChannel<Vec<u8>> = MessageChannel::with_error_handler(
            pool.clone(),
            Arc::new(|_: u64, _: &Payload| false),
            Arc::new(move |error: &Error| sink.lock().push(error.to_string())),
        );

        pool.request_connections(1);
        mock.notify_complete();
        channel.send(vec![1, 2, 3]);

        let errors = errors.lock().clone();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("binary"));
        assert!(mock.sent().is_empty());
    }

    #[test]
    fn test_send_error_reported() {
        let fx = fixture();
        fx.channel.send("a".into());
        let mock = fx.factory.get(0);
        mock.notify_complete();

        // link dropped without the pool noticing yet
        mock.release();
        fx.channel.send("b".into());

        let errors = fx.errors.lock().clone();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("not active"));
        assert_eq!(fx.channel.cached_len(), 0);
    }

    #[test]
    fn test_release_reports_later_use() {
        let fx = fixture();
        fx.channel.send("cached".into());
        fx.channel.release();
        fx.channel.release();

        assert_eq!(fx.pool.connection_listener_count(), 0);
        let late = panic::catch_unwind(AssertUnwindSafe(|| fx.channel.send("late".into())));
        assert_eq!(late.is_err(), cfg!(debug_assertions));
        assert_eq!(*fx.errors.lock(), vec![Error::ChannelReleased.to_string()]);

        fx.factory.get(0).notify_complete();
        assert!(fx.factory.get(0).sent_texts().is_empty());
    }

    #[test]
    fn test_drop_unregisters_listener() {
        let fx = fixture();
        assert_eq!(fx.pool.connection_listener_count(), 1);
        drop(fx.channel);
        assert_eq!(fx.pool.connection_listener_count(), 0);
    }
}
