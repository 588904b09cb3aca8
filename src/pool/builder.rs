//! Builder pattern for pool construction.
//!
//! # Example
//!
//! ```ignore
//! use socket_pool::{ConnectionPool, PoolConfig};
//!
//! let pool = ConnectionPool::builder(factory)
//!     .config(PoolConfig::new().with_limit_prepare_size(2))
//!     .build()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use crate::context::{SharedContext, TokioExecutorContext};
use crate::error::Result;

use super::config::PoolConfig;
use super::core::ConnectionPool;
use super::pooled::ConnectionFactory;

// ============================================================================
// PoolBuilder
// ============================================================================

/// Builder for a [`ConnectionPool`].
///
/// Use [`ConnectionPool::builder()`] to create one.
pub struct PoolBuilder {
    factory: Arc<dyn ConnectionFactory>,
    config: PoolConfig,
    context: Option<SharedContext>,
}

impl fmt::Debug for PoolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("config", &self.config)
            .field("context", &self.context.is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// PoolBuilder Implementation
// ============================================================================

impl PoolBuilder {
    /// Creates a builder with the default configuration.
    #[must_use]
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            config: PoolConfig::default(),
            context: None,
        }
    }

    /// Sets the pool configuration.
    #[inline]
    #[must_use]
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the executor context.
    ///
    /// Defaults to a [`TokioExecutorContext`] for the current runtime.
    #[inline]
    #[must_use]
    pub fn context(mut self, context: SharedContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Builds the pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) if no context was set
    /// and the caller is not inside a tokio runtime.
    pub fn build(self) -> Result<ConnectionPool> {
        let context = match self.context {
            Some(context) => context,
            None => Arc::new(TokioExecutorContext::current()?),
        };
        Ok(ConnectionPool::new(self.config, context, self.factory))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::context::ManualExecutorContext;
    use crate::error::Error;
    use crate::testing::MockFactory;

    #[test]
    fn test_build_with_context() {
        let pool = ConnectionPool::builder(MockFactory::new())
            .config(PoolConfig::new().with_limit_prepare_size(3))
            .context(ManualExecutorContext::new())
            .build()
            .expect("context provided");

        assert_eq!(pool.config().limit_prepare_size, 3);
    }

    #[test]
    fn test_build_normalizes_config() {
        let pool = ConnectionPool::builder(MockFactory::new())
            .config(
                PoolConfig::new()
                    .with_limit_prepare_interval(Duration::ZERO)
                    .with_retry_intervals([]),
            )
            .context(ManualExecutorContext::new())
            .build()
            .expect("context provided");

        assert!(pool.config().limit_prepare_interval.is_none());
        assert_eq!(pool.config().retry_intervals.len(), 10);
    }

    #[test]
    fn test_build_without_runtime_fails() {
        let result = ConnectionPool::builder(MockFactory::new()).build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[tokio::test]
    async fn test_build_uses_current_runtime() {
        let result = ConnectionPool::builder(MockFactory::new()).build();
        assert!(result.is_ok());
    }
}
