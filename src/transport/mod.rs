//! Transport layer.
//!
//! Defines the [`Connection`] contract the pool drives, and its WebSocket
//! and HTTP long-poll implementations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐   prepare / release   ┌──────────────────────┐
//! │ ConnectionPool  │──────────────────────►│ WebSocketConnection  │
//! │                 │◄──────────────────────│  ├─ event loop task  │◄──► peer
//! │                 │  ConnectionListener   │  └─ PingManager      │
//! └─────────────────┘                       └──────────────────────┘
//!                                              │ MessageHandler
//!                                              ▼
//!                                           channels
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | Connection contract, payloads, handler registry |
//! | `http` | HTTP long-poll connection |
//! | `options` | WebSocket, HTTP and keepalive options |
//! | `ping` | Keepalive policy |
//! | `websocket` | WebSocket connection and event loop |

// ============================================================================
// Submodules
// ============================================================================

/// Connection contract shared by all transports.
pub mod connection;

/// HTTP long-poll transport.
pub mod http;

/// Transport options.
pub mod options;

/// Keepalive policy.
pub mod ping;

/// WebSocket connection and event loop.
pub mod websocket;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{
    Connection, ConnectionListener, HandlerRegistry, MessageHandler, Payload, SharedHandler,
    same_handler,
};
pub use http::HttpConnection;
pub use options::{HttpMethod, HttpOptions, PingOptions, WebSocketOptions};
pub use ping::{PingFn, PingManager, TimeoutFn};
pub use websocket::WebSocketConnection;
