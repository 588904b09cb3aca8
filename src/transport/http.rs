//! HTTP long-poll transport.
//!
//! An [`HttpConnection`] has no socket to hold open: it is active between a
//! successful `prepare` and the first failed request. Every `send` is one
//! request whose response body is dispatched as an inbound text message.
//! With [`HttpOptions::with_long_poll`], a poll loop keeps one request in
//! flight while the connection is active.
//!
//! A failed request is kept and replayed by the next `prepare`; the
//! connection turns active again only once the replay succeeds.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::context::SharedContext;
use crate::error::{Error, Result};

use super::connection::{
    Connection, ConnectionListener, HandlerRegistry, Payload, SharedHandler,
};
use super::options::{HttpMethod, HttpOptions};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Replaying a failed request.
    Connecting,
    Active,
}

// ============================================================================
// HttpConnection
// ============================================================================

/// HTTP [`Connection`] with optional long polling.
///
/// Dropping the connection releases it.
///
/// # Example
///
/// ```ignore
/// let options = HttpOptions::new("https://api.example.com/updates")?
///     .with_long_poll("", Duration::from_secs(1));
/// let context: SharedContext = Arc::new(TokioExecutorContext::current()?);
/// let connection = HttpConnection::new(options, context, Handle::current());
/// ```
pub struct HttpConnection {
    inner: Arc<HttpInner>,
}

struct HttpInner {
    name: String,
    options: HttpOptions,
    client: Client,
    context: SharedContext,
    runtime: Handle,
    handlers: HandlerRegistry,
    state: Mutex<HttpState>,
}

struct HttpState {
    phase: Phase,

    /// Bumped by every `prepare` and `release`.
    generation: u64,

    listener: Option<Arc<dyn ConnectionListener>>,

    /// Body of the last failed request, replayed by the next `prepare`.
    failed: Option<String>,

    /// In-flight exchanges and the poll loop.
    tasks: Vec<JoinHandle<()>>,
}

impl fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("HttpConnection")
            .field("url", &self.inner.name)
            .field("phase", &state.phase)
            .field("in_flight", &state.tasks.len())
            .field("replay_pending", &state.failed.is_some())
            .finish()
    }
}

// ============================================================================
// HttpConnection - Constructor
// ============================================================================

impl HttpConnection {
    /// Creates an idle connection; requests run on `runtime`.
    #[must_use]
    pub fn new(options: HttpOptions, context: SharedContext, runtime: Handle) -> Self {
        let client = Client::builder()
            .timeout(options.request_timeout)
            .build()
            .unwrap_or_default();

        Self {
            inner: Arc::new(HttpInner {
                name: options.url.to_string(),
                options,
                client,
                context,
                runtime,
                handlers: HandlerRegistry::new(),
                state: Mutex::new(HttpState {
                    phase: Phase::Idle,
                    generation: 0,
                    listener: None,
                    failed: None,
                    tasks: Vec::new(),
                }),
            }),
        }
    }

    /// Returns the transport options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &HttpOptions {
        &self.inner.options
    }
}

// ============================================================================
// Connection Implementation
// ============================================================================

impl Connection for HttpConnection {
    fn display_name(&self) -> &str {
        &self.inner.name
    }

    fn is_active(&self) -> bool {
        self.inner.state.lock().phase == Phase::Active
    }

    fn prepare(&self, listener: Arc<dyn ConnectionListener>) {
        {
            let mut state = self.inner.state.lock();
            if state.phase != Phase::Idle {
                return;
            }

            state.generation += 1;
            let generation = state.generation;
            state.listener = Some(Arc::clone(&listener));

            if let Some(body) = state.failed.take() {
                debug!(url = %self.inner.name, generation, "Replaying failed request");
                state.phase = Phase::Connecting;
                self.inner.spawn_exchange(&mut *state, generation, body);
                return;
            }

            state.phase = Phase::Active;
            self.inner.spawn_poll(&mut *state, generation);
        }

        debug!(url = %self.inner.name, "HTTP connection active");
        listener.on_connection_complete();
    }

    fn release(&self) {
        self.inner.release();
    }

    fn send(&self, message: Payload) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.phase != Phase::Active {
            return Err(Error::inactive_connection(&self.inner.name));
        }

        let body = message.into_text(&self.inner.name)?;
        let generation = state.generation;
        trace!(url = %self.inner.name, bytes = body.len(), "Sending HTTP request");
        self.inner.spawn_exchange(&mut *state, generation, body);
        Ok(())
    }

    fn add_message_handler(&self, handler: SharedHandler) {
        self.inner.handlers.add(handler);
    }

    fn remove_message_handler(&self, handler: &SharedHandler) {
        self.inner.handlers.remove(handler);
    }
}

impl Drop for HttpConnection {
    fn drop(&mut self) {
        self.inner.release();
    }
}

// ============================================================================
// HttpInner - Lifecycle
// ============================================================================

impl HttpInner {
    /// Stops every request. A pending replay survives for the next `prepare`.
    fn release(&self) {
        {
            let mut state = self.state.lock();
            state.generation += 1;
            state.phase = Phase::Idle;
            state.listener = None;
            for task in state.tasks.drain(..) {
                task.abort();
            }
        }

        self.handlers.clear();
    }

    fn request(&self, body: &str) -> RequestBuilder {
        let url = self.options.url.clone();
        match self.options.method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url).body(body.to_owned()),
        }
    }

    fn spawn_exchange(self: &Arc<Self>, state: &mut HttpState, generation: u64, body: String) {
        let request = self.request(&body);
        let task = self.runtime.spawn(Self::exchange(
            Arc::downgrade(self),
            generation,
            request,
            body,
            self.name.clone(),
        ));

        state.tasks.retain(|task| !task.is_finished());
        state.tasks.push(task);
    }

    fn spawn_poll(self: &Arc<Self>, state: &mut HttpState, generation: u64) {
        let Some(message) = self.options.poll_message.clone() else {
            return;
        };

        let task = self.runtime.spawn(Self::poll(
            Arc::downgrade(self),
            generation,
            message,
            self.options.poll_interval,
            self.name.clone(),
        ));
        state.tasks.push(task);
    }

    /// Handles a response; `false` if the attempt was torn down meanwhile.
    fn on_response(self: &Arc<Self>, generation: u64, text: String) -> bool {
        let completed = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return false;
            }
            match state.phase {
                Phase::Idle => return false,
                Phase::Connecting => {
                    state.phase = Phase::Active;
                    self.spawn_poll(&mut *state, generation);
                    state.listener.clone()
                }
                Phase::Active => None,
            }
        };

        if let Some(listener) = completed {
            info!(url = %self.name, "HTTP connection restored");
            listener.on_connection_complete();
        }

        if !text.is_empty() {
            let receive_time = self.context.current_time();
            if !self.handlers.dispatch(receive_time, &Payload::Text(text)) {
                trace!(url = %self.name, "Unhandled response");
            }
        }
        true
    }

    /// Deactivates after a failed request; `body` is kept for replay.
    fn on_failure(&self, generation: u64, body: Option<String>, error: Error) {
        let listener = {
            let mut state = self.state.lock();
            if state.generation != generation || state.phase == Phase::Idle {
                return;
            }
            state.phase = Phase::Idle;
            if body.is_some() {
                state.failed = body;
            }
            for task in state.tasks.drain(..) {
                task.abort();
            }
            state.listener.take()
        };

        warn!(url = %self.name, error = %error, "HTTP request failed");
        if let Some(listener) = listener {
            listener.on_connection_failure(error);
        }
    }
}

// ============================================================================
// HttpInner - Requests
// ============================================================================

impl HttpInner {
    async fn exchange(
        weak: Weak<Self>,
        generation: u64,
        request: RequestBuilder,
        body: String,
        name: String,
    ) {
        let outcome = fetch(request, &name).await;

        let Some(inner) = weak.upgrade() else {
            return;
        };
        match outcome {
            Ok(text) => {
                inner.on_response(generation, text);
            }
            Err(error) => inner.on_failure(generation, Some(body), error),
        }
    }

    /// Repeats the poll request until the attempt ends.
    async fn poll(
        weak: Weak<Self>,
        generation: u64,
        message: String,
        interval: Duration,
        name: String,
    ) {
        loop {
            let Some(request) = weak.upgrade().map(|inner| inner.request(&message)) else {
                return;
            };

            let outcome = fetch(request, &name).await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            match outcome {
                Ok(text) => {
                    if !inner.on_response(generation, text) {
                        return;
                    }
                }
                Err(error) => {
                    inner.on_failure(generation, None, error);
                    return;
                }
            }
            drop(inner);

            if !interval.is_zero() {
                sleep(interval).await;
            }
        }
    }
}

/// Runs one exchange; non-success statuses count as failures.
async fn fetch(request: RequestBuilder, name: &str) -> Result<String> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::connection(format!("HTTP {status} from {name}")));
    }
    Ok(response.text().await?)
}

// ============================================================================
// Tests
// ============================================================================
