//! Keyed registry of connection pools.
//!
//! The caller owns the registry; there is no process-wide instance. Pools
//! are constructed lazily on first [`PoolRegistry::get`], at most once per
//! key even under concurrent lookups.
//!
//! # Example
//!
//! ```ignore
//! let registry = PoolRegistry::new();
//! registry.register("market", move || ConnectionPool::new(config.clone(), context.clone(), factory.clone()));
//!
//! let pool = registry.get("market").expect("registered");
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use super::core::ConnectionPool;

// ============================================================================
// Types
// ============================================================================

/// Constructor registered for a key.
pub type PoolCreator = Arc<dyn Fn() -> ConnectionPool + Send + Sync>;

// ============================================================================
// PoolRegistry
// ============================================================================

/// Map from key to lazily constructed [`ConnectionPool`].
pub struct PoolRegistry<K = String> {
    inner: Mutex<RegistryState<K>>,
}

struct RegistryState<K> {
    creators: FxHashMap<K, PoolCreator>,
    pools: FxHashMap<K, ConnectionPool>,
}

impl<K> Default for PoolRegistry<K> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(RegistryState {
                creators: FxHashMap::default(),
                pools: FxHashMap::default(),
            }),
        }
    }
}

impl<K> fmt::Debug for PoolRegistry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("PoolRegistry")
            .field("creators", &state.creators.len())
            .field("pools", &state.pools.len())
            .finish()
    }
}

impl<K> PoolRegistry<K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the constructor for `key`, replacing any previous one.
    ///
    /// A pool already constructed for `key` is kept.
    pub fn register<F>(&self, key: K, creator: F)
    where
        F: Fn() -> ConnectionPool + Send + Sync + 'static,
    {
        self.inner.lock().creators.insert(key, Arc::new(creator));
    }

    /// Returns the pool for `key`, constructing it on first use.
    ///
    /// Returns `None` if no constructor is registered.
    pub fn get<Q>(&self, key: &Q) -> Option<ConnectionPool>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let mut state = self.inner.lock();
        if let Some(pool) = state.pools.get(key) {
            return Some(pool.clone());
        }

        let (key, creator) = state
            .creators
            .get_key_value(key)
            .map(|(key, creator)| (key.clone(), Arc::clone(creator)))?;

        debug!(key = ?key, "Creating pool");
        let pool = creator();
        state.pools.insert(key, pool.clone());
        Some(pool)
    }

    /// Removes `key` and releases its pool.
    ///
    /// Returns `true` if anything was registered.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let (creator, pool) = {
            let mut state = self.inner.lock();
            (state.creators.remove(key), state.pools.remove(key))
        };

        if let Some(pool) = &pool {
            pool.release();
        }
        creator.is_some() || pool.is_some()
    }

    /// Releases every constructed pool.
    ///
    /// Constructors stay registered; the next `get` builds a fresh pool.
    pub fn release_all(&self) {
        let pools: Vec<ConnectionPool> = {
            let mut state = self.inner.lock();
            state.pools.drain().map(|(_, pool)| pool).collect()
        };

        for pool in pools {
            pool.release();
        }
    }

    /// Returns the number of constructed pools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().pools.len()
    }

    /// Returns `true` if no pool is constructed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Tests
// ============================================================================
