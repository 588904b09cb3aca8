//! Scriptable connections for deterministic tests.
//!
//! [`MockConnection`] records everything the pool and channels do to it
//! and lets the test drive its lifecycle (`notify_complete`,
//! `notify_failure`, `notify_closed`) and inbound traffic
//! (`notify_message`). Callbacks always run outside the mock's own lock.
//!
//! # Example
//!
//! ```ignore
//! let factory = MockFactory::new();
//! let pool = ConnectionPool::new(PoolConfig::new(), ManualExecutorContext::new(), factory.clone());
//!
//! pool.request_connections(1);
//! factory.get(0).notify_complete();
//! assert_eq!(pool.metrics().active_size, 1);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::pool::ConnectionFactory;
use crate::transport::{Connection, ConnectionListener, HandlerRegistry, Payload, SharedHandler};

// ============================================================================
// MockConnection
// ============================================================================

/// In-memory [`Connection`] driven by the test.
pub struct MockConnection {
    name: String,
    text_only: bool,
    auto_complete: bool,
    handlers: HandlerRegistry,
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    active: bool,
    listener: Option<Arc<dyn ConnectionListener>>,
    sent: Vec<Payload>,
    prepare_count: usize,
    release_count: usize,
}

impl fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockConnection")
            .field("name", &self.name)
            .field("active", &state.active)
            .field("sent", &state.sent.len())
            .finish_non_exhaustive()
    }
}

impl MockConnection {
    /// Creates a mock accepting every payload kind.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(name.into(), false, false))
    }

    /// Creates a mock that rejects binary payloads.
    #[must_use]
    pub fn text_only(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(name.into(), true, false))
    }

    /// Creates a mock that completes synchronously inside `prepare`.
    #[must_use]
    pub fn auto_complete(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(name.into(), false, true))
    }

    fn build(name: String, text_only: bool, auto_complete: bool) -> Self {
        Self {
            name,
            text_only,
            auto_complete,
            handlers: HandlerRegistry::new(),
            state: Mutex::new(MockState::default()),
        }
    }
}

// ============================================================================
// MockConnection - Scripting
// ============================================================================

impl MockConnection {
    /// Completes the pending attempt.
    pub fn notify_complete(&self) {
        let listener = {
            let mut state = self.state.lock();
            state.active = true;
            state.listener.clone()
        };
        if let Some(listener) = listener {
            listener.on_connection_complete();
        }
    }

    /// Fails the pending attempt or the active link.
    pub fn notify_failure(&self, error: Error) {
        if let Some(listener) = self.deactivate() {
            listener.on_connection_failure(error);
        }
    }

    /// Closes the link.
    pub fn notify_closed(&self, reason: &str) {
        if let Some(listener) = self.deactivate() {
            listener.on_connection_closed(reason.to_string(), None);
        }
    }

    /// Delivers an inbound message to the registered handlers.
    ///
    /// Returns `true` if a handler consumed it.
    pub fn notify_message(&self, receive_time: u64, message: impl Into<Payload>) -> bool {
        self.handlers.dispatch(receive_time, &message.into())
    }

    fn deactivate(&self) -> Option<Arc<dyn ConnectionListener>> {
        let mut state = self.state.lock();
        state.active = false;
        state.listener.take()
    }
}

// ============================================================================
// MockConnection - Inspection
// ============================================================================

impl MockConnection {
    /// Returns `true` while an attempt is pending.
    #[must_use]
    pub fn is_preparing(&self) -> bool {
        let state = self.state.lock();
        state.listener.is_some() && !state.active
    }

    /// Returns the listener of the current attempt.
    #[must_use]
    pub fn listener(&self) -> Option<Arc<dyn ConnectionListener>> {
        self.state.lock().listener.clone()
    }

    /// Returns every payload sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<Payload> {
        self.state.lock().sent.clone()
    }

    /// Returns the text of every text payload sent so far.
    #[must_use]
    pub fn sent_texts(&self) -> Vec<String> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|payload| payload.as_text().map(str::to_string))
            .collect()
    }

    /// Forgets recorded payloads.
    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    /// Returns how many times `prepare` was called.
    #[must_use]
    pub fn prepare_count(&self) -> usize {
        self.state.lock().prepare_count
    }

    /// Returns how many times `release` was called.
    #[must_use]
    pub fn release_count(&self) -> usize {
        self.state.lock().release_count
    }

    /// Returns the number of registered message handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

// ============================================================================
// MockConnection - Connection
// ============================================================================

impl Connection for MockConnection {
    fn display_name(&self) -> &str {
        &self.name
    }

    fn is_active(&self) -> bool {
        self.state.lock().active
    }

    fn prepare(&self, listener: Arc<dyn ConnectionListener>) {
        {
            let mut state = self.state.lock();
            state.prepare_count += 1;
            state.listener = Some(listener);
        }
        if self.auto_complete {
            self.notify_complete();
        }
    }

    fn release(&self) {
        {
            let mut state = self.state.lock();
            state.active = false;
            state.listener = None;
            state.release_count += 1;
        }
        self.handlers.clear();
    }

    fn send(&self, message: Payload) -> Result<()> {
        let mut state = self.state.lock();
        if !state.active {
            return Err(Error::inactive_connection(&self.name));
        }
        if self.text_only && matches!(message, Payload::Binary(_)) {
            return Err(Error::unsupported_message(message.kind(), &self.name));
        }
        state.sent.push(message);
        Ok(())
    }

    fn add_message_handler(&self, handler: SharedHandler) {
        self.handlers.add(handler);
    }

    fn remove_message_handler(&self, handler: &SharedHandler) {
        self.handlers.remove(handler);
    }
}

// ============================================================================
// MockFactory
// ============================================================================

/// [`ConnectionFactory`] producing [`MockConnection`]s named `mock-N`.
#[derive(Debug, Default)]
pub struct MockFactory {
    auto_complete: bool,
    created: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockFactory {
    /// Creates a factory of manually driven mocks.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a factory of mocks that complete inside `prepare`.
    #[must_use]
    pub fn auto_complete() -> Arc<Self> {
        Arc::new(Self {
            auto_complete: true,
            created: Mutex::new(Vec::new()),
        })
    }

    /// Returns every mock created so far, in creation order.
    #[must_use]
    pub fn created(&self) -> Vec<Arc<MockConnection>> {
        self.created.lock().clone()
    }

    /// Returns the `index`-th created mock.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `index + 1` mocks were created.
    #[must_use]
    pub fn get(&self, index: usize) -> Arc<MockConnection> {
        Arc::clone(&self.created.lock()[index])
    }

    /// Returns the number of mocks created.
    #[must_use]
    pub fn len(&self) -> usize {
        self.created.lock().len()
    }

    /// Returns `true` if no mock was created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConnectionFactory for MockFactory {
    fn create(&self) -> Arc<dyn Connection> {
        let mut created = self.created.lock();
        let name = format!("mock-{}", created.len());
        let mock = if self.auto_complete {
            MockConnection::auto_complete(name)
        } else {
            MockConnection::new(name)
        };
        created.push(Arc::clone(&mock));
        mock
    }
}
