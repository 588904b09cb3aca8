//! Connection contract shared by all transports.
//!
//! A [`Connection`] is one physical link (a WebSocket, a long-poll HTTP
//! session, ...). The pool drives it through [`Connection::prepare`] and
//! learns about its lifecycle through the [`ConnectionListener`] it passes
//! in; channels send [`Payload`]s through it and receive inbound messages by
//! registering a [`MessageHandler`].
//!
//! # Lifecycle
//!
//! ```text
//! prepare(listener) ──► on_connection_complete ──► on_connection_closed / on_connection_failure
//!        │                                                   │
//!        └──────────────► on_connection_failure              └─► prepare(...) again (reuse)
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{Error, Result};

// ============================================================================
// Payload
// ============================================================================

/// Message unit crossing the connection boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// JSON document, serialized to text by text transports.
    Json(Value),
}

impl Payload {
    /// Creates a text payload.
    #[inline]
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Returns the payload kind name used in error messages.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
            Self::Json(_) => "json",
        }
    }

    /// Returns the text content, if this is a text payload.
    #[inline]
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Renders the payload as text.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the JSON document fails to serialize
    /// - [`Error::UnsupportedMessage`] for binary payloads
    pub(crate) fn into_text(self, connection: &str) -> Result<String> {
        match self {
            Self::Text(text) => Ok(text),
            Self::Json(value) => Ok(serde_json::to_string(&value)?),
            Self::Binary(_) => Err(Error::unsupported_message("binary", connection)),
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

// ============================================================================
// MessageHandler
// ============================================================================

/// Receives inbound messages from a connection.
///
/// Handlers are tried in registration order; the first one returning `true`
/// consumes the message and stops the chain.
pub trait MessageHandler: Send + Sync {
    /// Handles `message` received at `receive_time` (executor milliseconds).
    fn dispatch_message(&self, receive_time: u64, message: &Payload) -> bool;
}

impl<F> MessageHandler for F
where
    F: Fn(u64, &Payload) -> bool + Send + Sync,
{
    fn dispatch_message(&self, receive_time: u64, message: &Payload) -> bool {
        self(receive_time, message)
    }
}

/// Shared message handler.
pub type SharedHandler = Arc<dyn MessageHandler>;

/// Returns `true` if both handles point at the same handler.
#[inline]
#[must_use]
pub fn same_handler(a: &SharedHandler, b: &SharedHandler) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

// ============================================================================
// HandlerRegistry
// ============================================================================

/// Copy-on-write handler list for transport implementations.
///
/// Dispatch works on a snapshot, so handlers may add or remove handlers
/// while a message is being dispatched.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<Arc<Vec<SharedHandler>>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.len())
            .finish()
    }
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `handler` unless already present.
    pub fn add(&self, handler: SharedHandler) {
        let mut guard = self.handlers.write();
        if guard.iter().any(|item| same_handler(item, &handler)) {
            return;
        }
        let mut items = guard.as_ref().clone();
        items.push(handler);
        *guard = Arc::new(items);
    }

    /// Removes `handler` if present.
    pub fn remove(&self, handler: &SharedHandler) {
        let mut guard = self.handlers.write();
        if !guard.iter().any(|item| same_handler(item, handler)) {
            return;
        }
        let items = guard
            .iter()
            .filter(|item| !same_handler(item, handler))
            .cloned()
            .collect();
        *guard = Arc::new(items);
    }

    /// Removes every handler.
    pub fn clear(&self) {
        *self.handlers.write() = Arc::new(Vec::new());
    }

    /// Returns the number of registered handlers.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Returns `true` if no handler is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatches `message` along the handler chain.
    ///
    /// Returns `true` if a handler consumed it.
    pub fn dispatch(&self, receive_time: u64, message: &Payload) -> bool {
        let snapshot = Arc::clone(&self.handlers.read());
        snapshot
            .iter()
            .any(|handler| handler.dispatch_message(receive_time, message))
    }
}

// ============================================================================
// ConnectionListener
// ============================================================================

/// Lifecycle callbacks for one prepare attempt.
///
/// Exactly one of the three methods follows each `prepare`; after
/// `on_connection_complete`, a later `on_connection_closed` or
/// `on_connection_failure` reports the end of the link.
pub trait ConnectionListener: Send + Sync {
    /// The connection became active.
    fn on_connection_complete(&self);

    /// The attempt or the active link failed.
    fn on_connection_failure(&self, error: Error);

    /// The link was closed, by the peer or by a keepalive timeout.
    fn on_connection_closed(&self, reason: String, error: Option<Error>);
}

// ============================================================================
// Connection
// ============================================================================

/// One physical transport link.
///
/// # Contract
///
/// - `prepare` may invoke the listener synchronously or from any thread.
/// - `send` is a non-blocking hand-off (or schedules blocking work through
///   the executor context) and never invokes the listener synchronously.
/// - `release` is idempotent, drops every handler, and suppresses callbacks
///   from the attempt it tears down. A released connection can be prepared
///   again.
pub trait Connection: Send + Sync {
    /// Human-readable name (usually the endpoint URL).
    fn display_name(&self) -> &str;

    /// Returns `true` while the link can send and receive.
    fn is_active(&self) -> bool;

    /// Starts establishing the link.
    fn prepare(&self, listener: Arc<dyn ConnectionListener>);

    /// Tears the link down.
    fn release(&self);

    /// Sends `message`.
    ///
    /// # Errors
    ///
    /// - [`Error::InactiveConnection`] if the link is not active
    /// - [`Error::UnsupportedMessage`] if the transport cannot carry the payload kind
    fn send(&self, message: Payload) -> Result<()>;

    /// Registers an inbound message handler.
    fn add_message_handler(&self, handler: SharedHandler);

    /// Unregisters an inbound message handler.
    fn remove_message_handler(&self, handler: &SharedHandler);
}

// ============================================================================
// Tests
// ============================================================================
