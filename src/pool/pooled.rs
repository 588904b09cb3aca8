//! Pool-stamped connection handles and the connection factory.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};

use crate::error::Result;
use crate::identifiers::ConnectionId;
use crate::transport::{Connection, Payload, SharedHandler};

// ============================================================================
// ConnectionFactory
// ============================================================================

/// Creates transport connections for a pool.
///
/// Called when the pool needs a new attempt and its idle list is empty.
/// The pool lock is not held, so a factory may call back into the pool.
pub trait ConnectionFactory: Send + Sync {
    /// Creates a new, unprepared connection.
    fn create(&self) -> Arc<dyn Connection>;
}

impl<F> ConnectionFactory for F
where
    F: Fn() -> Arc<dyn Connection> + Send + Sync,
{
    fn create(&self) -> Arc<dyn Connection> {
        self()
    }
}

// ============================================================================
// PooledConnection
// ============================================================================

/// A connection as tracked by the pool.
///
/// Each prepare attempt gets a fresh [`ConnectionId`], so a reused
/// connection object is a different `PooledConnection` after every
/// reconnect. Equality is by id.
#[derive(Clone)]
pub struct PooledConnection {
    id: ConnectionId,
    connection: Arc<dyn Connection>,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("name", &self.connection.display_name())
            .field("active", &self.connection.is_active())
            .finish()
    }
}

impl PartialEq for PooledConnection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PooledConnection {}

impl PooledConnection {
    pub(crate) fn new(id: ConnectionId, connection: Arc<dyn Connection>) -> Self {
        Self { id, connection }
    }

    /// Returns the attempt id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the underlying connection.
    #[inline]
    #[must_use]
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Returns the connection display name.
    #[inline]
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.connection.display_name()
    }

    /// Returns `true` while the link is active.
    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.connection.is_active()
    }

    /// Sends `message` on the link.
    ///
    /// # Errors
    ///
    /// Propagates the transport's send error.
    #[inline]
    pub fn send(&self, message: Payload) -> Result<()> {
        self.connection.send(message)
    }

    /// Registers an inbound message handler.
    #[inline]
    pub fn add_message_handler(&self, handler: SharedHandler) {
        self.connection.add_message_handler(handler);
    }

    /// Unregisters an inbound message handler.
    #[inline]
    pub fn remove_message_handler(&self, handler: &SharedHandler) {
        self.connection.remove_message_handler(handler);
    }

    /// Creates a weak handle that does not keep the connection alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            id: self.id,
            connection: Arc::downgrade(&self.connection),
        }
    }
}

// ============================================================================
// WeakConnection
// ============================================================================

/// Non-owning handle to a pooled connection.
#[derive(Clone)]
pub struct WeakConnection {
    id: ConnectionId,
    connection: Weak<dyn Connection>,
}

impl fmt::Debug for WeakConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakConnection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl WeakConnection {
    /// Returns the attempt id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Upgrades to a strong handle if the connection still exists.
    #[must_use]
    pub fn upgrade(&self) -> Option<PooledConnection> {
        self.connection
            .upgrade()
            .map(|connection| PooledConnection::new(self.id, connection))
    }
}
