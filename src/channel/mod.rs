//! Channels: application-facing views over a connection pool.
//!
//! A channel binds to at most one active pool connection at a time,
//! registers its message handler on it, and replays its state whenever it
//! binds again after a reconnect.
//!
//! # Binding lifecycle
//!
//! ```text
//!   unbound ──Active event / active conn found──► bound
//!      ▲                                            │
//!      └────────Inactive event (same id)────────────┘
//! ```
//!
//! Channels hold only a weak handle to the bound connection; the pool owns
//! it. A channel never calls the pool's mutating operations while holding
//! its own lock.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `message` | Outbound messages with offline cache |
//! | `read` | Receive-only binding |
//! | `subscribe` | Subscription set with batched (un)subscribe |

// ============================================================================
// Submodules
// ============================================================================

/// Outbound message channel.
pub mod message;

/// Receive-only channel.
pub mod read;

/// Subscription channel.
pub mod subscribe;

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::error::Error;
use crate::identifiers::{ConnectionId, ListenerId};
use crate::pool::{ConnectionEvent, ConnectionPool, PooledConnection, WeakConnection};
use crate::transport::{Payload, SharedHandler};

// ============================================================================
// Re-exports
// ============================================================================

pub use message::MessageChannel;
pub use read::ReadChannel;
pub use subscribe::{
    MapFn, MergeFn, Operation, SubscribeChannel, SubscribeChannelBuilder, SubscribeOptions,
};

// ============================================================================
// Types
// ============================================================================

/// Receives errors a channel cannot return to its caller.
pub type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

/// Returns the handler used when none is supplied: logs at `warn`.
#[must_use]
pub fn default_error_handler() -> ErrorHandler {
    Arc::new(|error: &Error| warn!(error = %error, "Channel error"))
}

// ============================================================================
// Channel
// ============================================================================

/// Operations shared by every channel.
pub trait Channel: Send + Sync {
    /// Clears state, stops watching the pool and unbinds.
    ///
    /// Idempotent. Later operations are reported as
    /// [`Error::ChannelReleased`] and panic in debug builds.
    fn release(&self);

    /// Returns `true` while bound to an active connection.
    fn is_bound(&self) -> bool;
}

// ============================================================================
// Binding
// ============================================================================

/// Weak attachment of a channel handler to one pooled connection.
pub(crate) struct Binding {
    connection: Option<WeakConnection>,
    handler: SharedHandler,
}

impl Binding {
    pub(crate) fn new(handler: SharedHandler) -> Self {
        Self {
            connection: None,
            handler,
        }
    }

    /// Attaches the handler to `connection`, detaching from any previous one.
    pub(crate) fn bind(&mut self, connection: &PooledConnection) {
        self.unbind();
        connection.add_message_handler(Arc::clone(&self.handler));
        self.connection = Some(connection.downgrade());
    }

    /// Detaches the handler.
    pub(crate) fn unbind(&mut self) {
        if let Some(weak) = self.connection.take()
            && let Some(connection) = weak.upgrade()
        {
            connection.remove_message_handler(&self.handler);
        }
    }

    /// Detaches the handler if bound to `id`.
    pub(crate) fn unbind_if(&mut self, id: ConnectionId) -> bool {
        if self.bound_id() != Some(id) {
            return false;
        }
        self.unbind();
        true
    }

    /// Returns the bound connection if it is still active, else unbinds.
    pub(crate) fn live(&mut self) -> Option<PooledConnection> {
        let connection = self.connection.as_ref()?.upgrade();
        match connection {
            Some(connection) if connection.is_active() => Some(connection),
            _ => {
                self.unbind();
                None
            }
        }
    }

    /// Returns the id of the bound connection.
    pub(crate) fn bound_id(&self) -> Option<ConnectionId> {
        self.connection.as_ref().map(WeakConnection::id)
    }

    /// Returns `true` if bound to an active connection, without unbinding.
    pub(crate) fn is_live(&self) -> bool {
        self.connection
            .as_ref()
            .and_then(WeakConnection::upgrade)
            .is_some_and(|connection| connection.is_active())
    }
}

// ============================================================================
// Pool Observation
// ============================================================================

/// Channel side of the pool's connection events.
pub(crate) trait PoolObserver: Send + Sync {
    fn on_active(&self, connection: &PooledConnection);
    fn on_inactive(&self, connection: &PooledConnection);
}

/// Registers `observer` for the pool's connection events.
///
/// The listener holds a weak reference, so it never keeps the channel alive.
pub(crate) fn watch_pool<O>(pool: &ConnectionPool, observer: &Arc<O>) -> ListenerId
where
    O: PoolObserver + 'static,
{
    let weak = Arc::downgrade(observer);
    pool.add_connection_change_listener(Arc::new(move |event: &ConnectionEvent| {
        let Some(observer) = weak.upgrade() else {
            return;
        };
        match event {
            ConnectionEvent::Active(connection) => observer.on_active(connection),
            ConnectionEvent::Inactive(connection) => observer.on_inactive(connection),
        }
    }))
}

/// Reports an operation on a released channel.
///
/// Use after release is a lifecycle bug: debug builds panic once the error
/// handler has seen it.
pub(crate) fn report_released(channel: &'static str, on_error: &ErrorHandler) {
    error!(channel, "Operation on released channel");
    on_error(&Error::ChannelReleased);
    if cfg!(debug_assertions) {
        panic!("{channel} channel used after release");
    }
}

/// Sends one payload, collecting the failure for the error handler.
pub(crate) fn send_collecting(
    connection: &PooledConnection,
    payload: Payload,
    errors: &mut Vec<Error>,
) {
    if let Err(error) = connection.send(payload) {
        debug!(connection = %connection.id(), error = %error, "Send failed");
        errors.push(error);
    }
}

/// Hands collected errors to the error handler.
pub(crate) fn report_all(errors: Vec<Error>, on_error: &ErrorHandler) {
    for error in &errors {
        on_error(error);
    }
}
