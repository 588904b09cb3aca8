//! Pool configuration.
//!
//! Controls the prepare policy and the retry ladder of a
//! [`ConnectionPool`](super::ConnectionPool).
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use socket_pool::PoolConfig;
//!
//! let config = PoolConfig::new()
//!     .with_limit_prepare_size(2)
//!     .with_retry_intervals([Duration::ZERO, Duration::from_secs(1)]);
//! ```
//!
//! Durations serialize as milliseconds:
//!
//! ```json
//! { "limit_prepare_size": 2, "limit_prepare_interval": 500, "retry_intervals": [0, 1000] }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::context::{SharedContext, duration_ms};
use crate::error::Result;

use super::prepare::{
    LimitIntervalPrepareManager, LimitSizePrepareManager, PrepareManager, WakeFn,
};

// ============================================================================
// Constants
// ============================================================================

/// Default retry ladder, in seconds.
const DEFAULT_RETRY_SECS: [u64; 10] = [0, 1, 2, 4, 8, 16, 32, 64, 128, 128];

// ============================================================================
// PoolConfig
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum simultaneously in-flight attempts (0 = unbounded).
    pub limit_prepare_size: usize,

    /// Minimum spacing between attempts. Takes precedence over the size limit.
    #[serde(with = "millis_option")]
    pub limit_prepare_interval: Option<Duration>,

    /// Backoff ladder; attempt `n` waits `retry_intervals[n % len]`.
    #[serde(with = "millis_list")]
    pub retry_intervals: Vec<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            limit_prepare_size: 0,
            limit_prepare_interval: None,
            retry_intervals: default_retry_intervals(),
        }
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl PoolConfig {
    /// Creates the default configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from JSON.
    ///
    /// Missing fields take their defaults. The result is normalized with
    /// [`verified`](Self::verified).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if the document is malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config.verified())
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl PoolConfig {
    /// Caps simultaneously in-flight attempts (0 = unbounded).
    #[inline]
    #[must_use]
    pub fn with_limit_prepare_size(mut self, limit: usize) -> Self {
        self.limit_prepare_size = limit;
        self
    }

    /// Spaces attempts by at least `interval`.
    #[inline]
    #[must_use]
    pub fn with_limit_prepare_interval(mut self, interval: Duration) -> Self {
        self.limit_prepare_interval = Some(interval);
        self
    }

    /// Replaces the retry ladder.
    #[inline]
    #[must_use]
    pub fn with_retry_intervals(mut self, intervals: impl IntoIterator<Item = Duration>) -> Self {
        self.retry_intervals = intervals.into_iter().collect();
        self
    }
}

// ============================================================================
// Normalization
// ============================================================================

impl PoolConfig {
    /// Returns the normalized configuration.
    ///
    /// A zero prepare interval disables the interval policy and an empty
    /// retry ladder falls back to the default one.
    #[must_use]
    pub fn verified(mut self) -> Self {
        if self.limit_prepare_interval == Some(Duration::ZERO) {
            self.limit_prepare_interval = None;
        }
        if self.retry_intervals.is_empty() {
            self.retry_intervals = default_retry_intervals();
        }
        self
    }

    /// Returns the backoff delay for retry attempt `retry_count`.
    #[must_use]
    pub fn retry_delay(&self, retry_count: usize) -> Duration {
        if self.retry_intervals.is_empty() {
            return Duration::ZERO;
        }
        self.retry_intervals[retry_count % self.retry_intervals.len()]
    }

    /// Creates the prepare manager selected by this configuration.
    pub(crate) fn prepare_manager(
        &self,
        context: SharedContext,
        wake: WakeFn,
    ) -> Box<dyn PrepareManager> {
        match self.limit_prepare_interval {
            Some(interval) if !interval.is_zero() => {
                Box::new(LimitIntervalPrepareManager::new(interval, context, wake))
            }
            _ => Box::new(LimitSizePrepareManager::new(self.limit_prepare_size)),
        }
    }
}

/// Returns the default retry ladder.
#[must_use]
pub fn default_retry_intervals() -> Vec<Duration> {
    DEFAULT_RETRY_SECS
        .iter()
        .map(|secs| Duration::from_secs(*secs))
        .collect()
}

// ============================================================================
// Serde Helpers
// ============================================================================

mod millis_option {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        value.map(duration_ms).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

mod millis_list {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &[Duration],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        let millis: Vec<u64> = value.iter().copied().map(duration_ms).collect();
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Vec<Duration>, D::Error> {
        let millis = Vec::<u64>::deserialize(deserializer)?;
        Ok(millis.into_iter().map(Duration::from_millis).collect())
    }
}

// ============================================================================
// Tests
// ============================================================================
