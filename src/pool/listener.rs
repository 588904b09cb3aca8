//! Pool events and listener registries.
//!
//! | Event | Observers |
//! |-------|-----------|
//! | [`ConnectionEvent`] | [`ConnectionChangedListener`], usually channels |
//! | [`PoolStateEvent`] | [`PoolStateListener`], usually logging/monitoring |
//!
//! Listeners are invoked after the pool lock is released, from whichever
//! thread caused the transition. Closures implement both traits.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::identifiers::ListenerId;

use super::pooled::PooledConnection;

// ============================================================================
// Events
// ============================================================================

/// Membership change of a pooled connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection completed its prepare and is usable.
    Active(PooledConnection),
    /// The connection closed, failed, or was released.
    Inactive(PooledConnection),
}

impl ConnectionEvent {
    /// Returns the connection the event is about.
    #[inline]
    #[must_use]
    pub fn connection(&self) -> &PooledConnection {
        match self {
            Self::Active(connection) | Self::Inactive(connection) => connection,
        }
    }

    /// Returns `true` for [`ConnectionEvent::Active`].
    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }
}

/// Aggregate pool state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStateEvent {
    /// First attempt started while nothing was active or preparing.
    Begin,
    /// A connection became active.
    Succeed {
        /// Active connections after the transition.
        active: usize,
    },
    /// Every attempt failed; a retry is scheduled.
    Failed {
        /// Consecutive retry number.
        retry_count: usize,
        /// Backoff before the retry.
        delay: Duration,
    },
    /// Nothing is active or preparing.
    Idle,
}

// ============================================================================
// Listener Traits
// ============================================================================

/// Observes [`ConnectionEvent`]s.
pub trait ConnectionChangedListener: Send + Sync {
    /// Handles one event.
    fn on_connection_changed(&self, event: &ConnectionEvent);
}

impl<F> ConnectionChangedListener for F
where
    F: Fn(&ConnectionEvent) + Send + Sync,
{
    fn on_connection_changed(&self, event: &ConnectionEvent) {
        self(event);
    }
}

/// Observes [`PoolStateEvent`]s.
pub trait PoolStateListener: Send + Sync {
    /// Handles one event.
    fn on_state_changed(&self, event: &PoolStateEvent);
}

impl<F> PoolStateListener for F
where
    F: Fn(&PoolStateEvent) + Send + Sync,
{
    fn on_state_changed(&self, event: &PoolStateEvent) {
        self(event);
    }
}

// ============================================================================
// ListenerSet
// ============================================================================

/// Registration list handing out [`ListenerId`]s.
///
/// Dispatch iterates a snapshot so listeners may register or unregister
/// while being notified.
pub(crate) struct ListenerSet<L: ?Sized> {
    entries: RwLock<Vec<(ListenerId, Arc<L>)>>,
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<L: ?Sized> ListenerSet<L> {
    pub(crate) fn add(&self, listener: Arc<L>) -> ListenerId {
        let id = ListenerId::next();
        self.entries.write().push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
