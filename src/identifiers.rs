//! Type-safe identifiers for pool entities.
//!
//! Newtype wrappers prevent mixing incompatible IDs at compile time.
//! All identifiers are allocated from process-wide monotonic counters and
//! are never reused.
//!
//! | Type | Identifies |
//! |------|------------|
//! | [`ConnectionId`] | One prepare attempt of a pooled connection |
//! | [`ListenerId`] | A listener registration on a pool |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Counters
// ============================================================================

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// ConnectionId
// ============================================================================

/// Identifier stamped on a connection each time the pool prepares it.
///
/// A connection object reused from the idle list receives a fresh id, so
/// callbacks from an earlier attempt never match the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates the next connection ID.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ============================================================================
// ListenerId
// ============================================================================

/// Handle returned when registering a listener on a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Allocates the next listener ID.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::next();
        assert_eq!(id.to_string(), format!("conn-{}", id.as_u64()));
    }

    #[test]
    fn test_listener_ids_are_unique() {
        assert_ne!(ListenerId::next(), ListenerId::next());
    }
}
