//! Connection pool and its prepare/retry engine.
//!
//! A [`ConnectionPool`] keeps a set of interchangeable connections to one
//! logical endpoint alive. Callers state demand with
//! [`ConnectionPool::request_connections`]; the pool starts attempts under
//! the limits of its [`PrepareManager`], backs off along the retry ladder
//! when every attempt fails, and reports membership changes to listeners.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `core` | Pool state machine |
//! | `prepare` | Attempt rate limiting |
//! | `config` | Limits and retry ladder |
//! | `listener` | Events and listener traits |
//! | `pooled` | Pool-stamped connection handles, factory |
//! | `builder` | Fluent construction |
//! | `registry` | Keyed pool registry |

// ============================================================================
// Submodules
// ============================================================================

/// Fluent pool construction.
pub mod builder;

/// Pool configuration.
pub mod config;

/// Pool state machine.
pub mod core;

/// Pool events and listeners.
pub mod listener;

/// Pooled connection handles.
pub mod pooled;

/// Prepare rate limiting.
pub mod prepare;

/// Keyed pool registry.
pub mod registry;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::PoolBuilder;
pub use config::{PoolConfig, default_retry_intervals};
pub use core::{ConnectionPool, PoolMetrics};
pub use listener::{
    ConnectionChangedListener, ConnectionEvent, PoolStateEvent, PoolStateListener,
};
pub use pooled::{ConnectionFactory, PooledConnection, WeakConnection};
pub use prepare::{
    LimitIntervalPrepareManager, LimitSizePrepareManager, PrepareManager, WakeFn,
};
pub use registry::{PoolCreator, PoolRegistry};
