//! Error types for socket-pool.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! Fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use socket_pool::{Payload, Result};
//!
//! fn forward(connection: &PooledConnection, text: &str) -> Result<()> {
//!     connection.send(Payload::text(text))?;
//!     Ok(())
//! }
//! ```
//!
//! Transport failures never surface through this type on the pool path:
//! they arrive as listener callbacks and drive the retry ladder. Channels
//! route send errors to their error handler instead of returning them.
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`] |
//! | Message | [`Error::InactiveConnection`], [`Error::UnsupportedMessage`] |
//! | Channel | [`Error::ChannelReleased`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::Http`], [`Error::Url`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when pool, channel or transport configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport connection failed.
    ///
    /// Reported to connection listeners when an attempt cannot be established.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connection attempt timed out.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Connection closed while an operation was in flight.
    #[error("Connection closed: {reason}")]
    ConnectionClosed {
        /// Close reason reported by the transport.
        reason: String,
    },

    // ========================================================================
    // Message Errors
    // ========================================================================
    /// Send attempted on a connection that is not active.
    #[error("Connection not active: {name}")]
    InactiveConnection {
        /// Display name of the connection.
        name: String,
    },

    /// Payload kind not supported by the transport.
    #[error("Unrecognized message type {kind} for connection {name}")]
    UnsupportedMessage {
        /// Payload kind that was rejected.
        kind: &'static str,
        /// Display name of the connection.
        name: String,
    },

    // ========================================================================
    // Channel Errors
    // ========================================================================
    /// Operation on a channel after `release()`.
    ///
    /// Indicates a lifecycle bug in the caller.
    #[error("Channel already released")]
    ChannelReleased,

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid endpoint URL.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a connection closed error.
    #[inline]
    pub fn connection_closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }

    /// Creates an inactive connection error.
    #[inline]
    pub fn inactive_connection(name: impl Into<String>) -> Self {
        Self::InactiveConnection { name: name.into() }
    }

    /// Creates an unsupported message error.
    #[inline]
    pub fn unsupported_message(kind: &'static str, name: impl Into<String>) -> Self {
        Self::UnsupportedMessage {
            kind,
            name: name.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::ConnectionTimeout { .. } => true,
            Self::Http(e) => e.is_timeout(),
            _ => false,
        }
    }

    /// Returns `true` if this is a transport-level connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed { .. }
                | Self::WebSocket(_)
                | Self::Http(_)
                | Self::Io(_)
        )
    }

    /// Returns `true` if this is an invalid send.
    #[inline]
    #[must_use]
    pub fn is_send_error(&self) -> bool {
        matches!(
            self,
            Self::InactiveConnection { .. } | Self::UnsupportedMessage { .. }
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors are healed by the pool's reconnection.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.is_connection_error() || matches!(self, Self::InactiveConnection { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================
