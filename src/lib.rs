//! Socket Pool - Resilient connections and message channels.
//!
//! This library keeps a pool of persistent transport links (WebSockets or
//! HTTP long polls) to one logical endpoint alive, and exposes channels that
//! bind to whichever link is currently up.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐  request / events  ┌────────────────┐  prepare   ┌──────────────┐
//! │ Channels       │◄──────────────────►│ ConnectionPool │───────────►│ Connection   │
//! │ Message / Read │                    │ prepare limits │◄───────────│ (WebSocket)  │
//! │ Subscribe      │──── send ─────────────────────────────────────────►│              │
//! └────────────────┘                    └────────────────┘  listener  └──────────────┘
//! ```
//!
//! Key design principles:
//!
//! - The pool owns every connection; channels hold weak handles
//! - All timing goes through an [`ExecutorContext`], so the engine runs on
//!   tokio in production and on a virtual clock in tests
//! - Pool state changes are computed under one lock; transport calls and
//!   listener notifications run after it is released
//! - Retry backoff never gives up; requests while backing off only raise
//!   demand
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use socket_pool::transport::{
//!     Connection, Payload, SharedHandler, WebSocketConnection, WebSocketOptions,
//! };
//! use socket_pool::{Channel, ConnectionPool, MessageChannel, Result, TokioExecutorContext};
//! use tokio::runtime::Handle;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let options = WebSocketOptions::new("ws://127.0.0.1:9001")?;
//!     let context = Arc::new(TokioExecutorContext::current()?);
//!     let factory_context = context.clone();
//!
//!     let pool = ConnectionPool::builder(Arc::new(move || -> Arc<dyn Connection> {
//!         Arc::new(WebSocketConnection::new(
//!             options.clone(),
//!             factory_context.clone(),
//!             Handle::current(),
//!         ))
//!     }))
//!     .context(context)
//!     .build()?;
//!
//!     let handler: SharedHandler = Arc::new(|_: u64, message: &Payload| {
//!         println!("received {message:?}");
//!         true
//!     });
//!     let channel: MessageChannel<String> = MessageChannel::new(pool.clone(), handler);
//!     channel.send("hello".to_string());
//!
//!     channel.release();
//!     pool.release();
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`batch`] | Time-window batching |
//! | [`channel`] | [`MessageChannel`], [`ReadChannel`], [`SubscribeChannel`] |
//! | [`context`] | Clock and scheduler abstraction |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`pool`] | [`ConnectionPool`], prepare limits, retry ladder |
//! | [`testing`] | Scriptable mock connections |
//! | [`transport`] | Connection contract, WebSocket and HTTP transports |

// ============================================================================
// Modules
// ============================================================================

/// Time-window batching.
pub mod batch;

/// Channels bound to pooled connections.
///
/// - [`MessageChannel`] - Outbound messages with offline cache
/// - [`ReadChannel`] - Receive-only binding
/// - [`SubscribeChannel`] - Batched subscription set
pub mod channel;

/// Clock and task scheduling.
pub mod context;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Connection pool.
///
/// Use [`ConnectionPool::builder()`] to create a pool.
pub mod pool;

/// Scriptable mock connections for tests and benchmarks.
pub mod testing;

/// Transport layer.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Batching
pub use batch::BatchManager;

// Channel types
pub use channel::{
    Channel, ErrorHandler, MessageChannel, Operation, ReadChannel, SubscribeChannel,
    SubscribeOptions,
};

// Context types
pub use context::{
    ExecutorContext, ManualExecutorContext, SharedContext, TaskHandle, TokioExecutorContext,
};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ConnectionId, ListenerId};

// Pool types
pub use pool::{
    ConnectionEvent, ConnectionFactory, ConnectionPool, PoolBuilder, PoolConfig, PoolRegistry,
    PoolStateEvent, PooledConnection,
};
