//! WebSocket transport.
//!
//! Each [`WebSocketConnection`] owns at most one socket at a time. `prepare`
//! spawns a task on the runtime that connects and then runs the event loop:
//!
//! - Incoming frames: pong detection, message dispatch, keepalive bookkeeping
//! - Outgoing commands: payload sends, keepalive close, shutdown
//!
//! The task reports the outcome of every attempt to the listener passed to
//! `prepare`. A generation counter drops reports from attempts that were
//! torn down by `release`.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

use crate::context::{SharedContext, duration_ms};
use crate::error::{Error, Result};

use super::connection::{
    Connection, ConnectionListener, HandlerRegistry, Payload, SharedHandler,
};
use super::options::WebSocketOptions;
use super::ping::PingManager;

// ============================================================================
// Constants
// ============================================================================

/// Close reason reported after a keepalive timeout.
const KEEPALIVE_TIMEOUT_REASON: &str = "message received timeout";

/// Close reason when the peer ends the stream without a close frame.
const STREAM_ENDED_REASON: &str = "stream ended";

// ============================================================================
// Types
// ============================================================================

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Active,
}

/// Commands for the event loop.
enum Command {
    /// Write one frame.
    Send(Message),
    /// Close the socket and report the link as closed.
    Close(&'static str),
    /// Close the socket without reporting.
    Shutdown,
}

/// Why the event loop stopped.
enum LoopEnd {
    Closed(String),
    Failed(Error),
    Released,
}

// ============================================================================
// WebSocketConnection
// ============================================================================

/// WebSocket [`Connection`] with keepalive.
///
/// Dropping the connection releases it.
///
/// # Example
///
/// ```ignore
/// let options = WebSocketOptions::new("ws://127.0.0.1:9001")?;
/// let context: SharedContext = Arc::new(TokioExecutorContext::current()?);
/// let connection = WebSocketConnection::new(options, context, Handle::current());
/// ```
pub struct WebSocketConnection {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    name: String,
    options: WebSocketOptions,
    context: SharedContext,
    runtime: Handle,
    handlers: HandlerRegistry,
    ping: PingManager,
    state: Mutex<SocketState>,
}

struct SocketState {
    phase: Phase,

    /// Bumped by every `prepare` and `release`.
    generation: u64,

    commands: Option<mpsc::UnboundedSender<Command>>,
    task: Option<JoinHandle<()>>,
}

impl fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("WebSocketConnection")
            .field("url", &self.inner.name)
            .field("phase", &state.phase)
            .field("handlers", &self.inner.handlers.len())
            .finish()
    }
}

// ============================================================================
// WebSocketConnection - Constructor
// ============================================================================

impl WebSocketConnection {
    /// Creates an idle connection; sockets are opened on `runtime`.
    #[must_use]
    pub fn new(options: WebSocketOptions, context: SharedContext, runtime: Handle) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<SocketInner>| {
            let pinger = weak.clone();
            let closer = weak.clone();
            let ping = PingManager::new(
                options.ping.clone(),
                Arc::clone(&context),
                Arc::new(move |message: String| {
                    if let Some(inner) = pinger.upgrade() {
                        inner.command(Command::Send(Message::Text(message.into())));
                    }
                }),
                Arc::new(move || {
                    if let Some(inner) = closer.upgrade() {
                        inner.command(Command::Close(KEEPALIVE_TIMEOUT_REASON));
                    }
                }),
            );

            SocketInner {
                name: options.url.to_string(),
                options,
                context,
                runtime,
                handlers: HandlerRegistry::new(),
                ping,
                state: Mutex::new(SocketState {
                    phase: Phase::Idle,
                    generation: 0,
                    commands: None,
                    task: None,
                }),
            }
        });

        Self { inner }
    }

    /// Returns the transport options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &WebSocketOptions {
        &self.inner.options
    }
}

// ============================================================================
// Connection Implementation
// ============================================================================

impl Connection for WebSocketConnection {
    fn display_name(&self) -> &str {
        &self.inner.name
    }

    fn is_active(&self) -> bool {
        self.inner.state.lock().phase == Phase::Active
    }

    fn prepare(&self, listener: Arc<dyn ConnectionListener>) {
        let mut state = self.inner.state.lock();
        if state.phase != Phase::Idle {
            return;
        }

        state.phase = Phase::Connecting;
        state.generation += 1;
        let generation = state.generation;

        debug!(url = %self.inner.name, generation, "Connecting WebSocket");

        let weak = Arc::downgrade(&self.inner);
        state.task = Some(
            self.inner
                .runtime
                .spawn(SocketInner::run(weak, generation, listener)),
        );
    }

    fn release(&self) {
        self.inner.release();
    }

    fn send(&self, message: Payload) -> Result<()> {
        let state = self.inner.state.lock();
        let commands = match (state.phase, &state.commands) {
            (Phase::Active, Some(commands)) => commands,
            _ => return Err(Error::inactive_connection(&self.inner.name)),
        };

        let frame = match message {
            Payload::Text(text) => Message::Text(text.into()),
            Payload::Binary(bytes) => Message::Binary(bytes.into()),
            Payload::Json(value) => Message::Text(serde_json::to_string(&value)?.into()),
        };

        commands
            .send(Command::Send(frame))
            .map_err(|_| Error::inactive_connection(&self.inner.name))
    }

    fn add_message_handler(&self, handler: SharedHandler) {
        self.inner.handlers.add(handler);
    }

    fn remove_message_handler(&self, handler: &SharedHandler) {
        self.inner.handlers.remove(handler);
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        self.inner.release();
    }
}

// ============================================================================
// SocketInner - Lifecycle
// ============================================================================

impl SocketInner {
    fn release(&self) {
        {
            let mut state = self.state.lock();
            state.generation += 1;

            match state.phase {
                Phase::Connecting => {
                    if let Some(task) = state.task.take() {
                        task.abort();
                    }
                }
                Phase::Active => {
                    if let Some(commands) = state.commands.take() {
                        let _ = commands.send(Command::Shutdown);
                    }
                }
                Phase::Idle => {}
            }

            state.phase = Phase::Idle;
            state.commands = None;
            state.task = None;
            self.ping.release();
        }

        self.handlers.clear();
    }

    /// Hands a command to the event loop, if one is running.
    fn command(&self, command: Command) -> bool {
        let state = self.state.lock();
        state
            .commands
            .as_ref()
            .is_some_and(|commands| commands.send(command).is_ok())
    }

    /// Marks the attempt active; `false` if it was torn down meanwhile.
    fn activate(&self, generation: u64, commands: mpsc::UnboundedSender<Command>) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        state.phase = Phase::Active;
        state.commands = Some(commands);
        self.ping.on_connection_complete();
        true
    }

    /// Marks the attempt finished; `false` if it was torn down meanwhile.
    fn finish(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        state.phase = Phase::Idle;
        state.commands = None;
        state.task = None;
        self.ping.on_connection_closed();
        true
    }
}

// ============================================================================
// SocketInner - Event Loop
// ============================================================================

impl SocketInner {
    /// Connects, then runs the event loop until the link ends.
    async fn run(weak: Weak<Self>, generation: u64, listener: Arc<dyn ConnectionListener>) {
        let Some((url, connect_timeout)) = weak
            .upgrade()
            .map(|inner| (inner.name.clone(), inner.options.connect_timeout))
        else {
            return;
        };

        let connected = match timeout(connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((socket, _))) => Ok(socket),
            Ok(Err(e)) => Err(Error::from(e)),
            Err(_) => Err(Error::connection_timeout(duration_ms(connect_timeout))),
        };

        let socket = match connected {
            Ok(socket) => socket,
            Err(error) => {
                if let Some(inner) = weak.upgrade()
                    && inner.finish(generation)
                {
                    warn!(url = %url, error = %error, "WebSocket connect failed");
                    listener.on_connection_failure(error);
                }
                return;
            }
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let activated = weak
            .upgrade()
            .is_some_and(|inner| inner.activate(generation, commands_tx));
        if !activated {
            debug!(url = %url, "Dropping socket of released attempt");
            return;
        }

        info!(url = %url, "WebSocket connected");
        listener.on_connection_complete();

        let end = Self::event_loop(&weak, socket, commands_rx).await;

        let Some(inner) = weak.upgrade() else {
            return;
        };
        if !inner.finish(generation) {
            return;
        }
        drop(inner);

        match end {
            LoopEnd::Closed(reason) => {
                debug!(url = %url, reason = %reason, "WebSocket closed");
                listener.on_connection_closed(reason, None);
            }
            LoopEnd::Failed(error) => {
                warn!(url = %url, error = %error, "WebSocket failed");
                listener.on_connection_failure(error);
            }
            LoopEnd::Released => {}
        }
    }

    async fn event_loop(
        weak: &Weak<Self>,
        socket: Socket,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) -> LoopEnd {
        let (mut ws_write, mut ws_read) = socket.split();

        loop {
            tokio::select! {
                // Incoming frames
                frame = ws_read.next() => {
                    let Some(inner) = weak.upgrade() else {
                        return LoopEnd::Released;
                    };

                    match frame {
                        Some(Ok(Message::Text(text))) => inner.on_text(text.as_str()),

                        Some(Ok(Message::Binary(bytes))) => inner.on_binary(bytes.to_vec()),

                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                            inner.ping.on_message_received(false);
                        }

                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|frame| frame.reason.as_str().to_owned())
                                .unwrap_or_default();
                            return LoopEnd::Closed(reason);
                        }

                        Some(Ok(Message::Frame(_))) => {}

                        Some(Err(e)) => return LoopEnd::Failed(e.into()),

                        None => return LoopEnd::Closed(STREAM_ENDED_REASON.to_string()),
                    }
                }

                // Commands from the connection
                command = commands.recv() => {
                    match command {
                        Some(Command::Send(message)) => {
                            if let Err(e) = ws_write.send(message).await {
                                return LoopEnd::Failed(e.into());
                            }
                        }

                        Some(Command::Close(reason)) => {
                            let _ = ws_write.close().await;
                            return LoopEnd::Closed(reason.to_string());
                        }

                        Some(Command::Shutdown) | None => {
                            let _ = ws_write.close().await;
                            return LoopEnd::Released;
                        }
                    }
                }
            }
        }
    }

    fn on_text(&self, text: &str) {
        let receive_time = self.context.current_time();
        if self.ping.is_pong(text) {
            self.ping.on_message_received(true);
            return;
        }

        self.ping.on_message_received(false);
        if !self
            .handlers
            .dispatch(receive_time, &Payload::Text(text.to_string()))
        {
            trace!(url = %self.name, "Unhandled text message");
        }
    }

    fn on_binary(&self, bytes: Vec<u8>) {
        let receive_time = self.context.current_time();
        self.ping.on_message_received(false);
        if !self.handlers.dispatch(receive_time, &Payload::Binary(bytes)) {
            trace!(url = %self.name, "Unhandled binary message");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
