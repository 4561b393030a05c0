//! Typed read-through cache with invalidate-on-write.
//!
//! [`CacheAside`] sits between a store and its [`CacheBackend`]. Reads go
//! through [`get_or_load`](CacheAside::get_or_load); writers call
//! [`invalidate`](CacheAside::invalidate) for every key their mutation could
//! affect before reporting success.
//!
//! # Design
//!
//! - **Values are JSON**: entries are serialized with `serde_json`, so any
//!   backend that stores strings can hold them.
//! - **Failed loads cache nothing**: the loader's error is returned as is.
//! - **No single-flight**: concurrent misses on the same key may each run the
//!   loader. Loaders must be read-only.
//! - **Stale-load guard**: a generation counter is bumped on every
//!   invalidation. A load that overlaps an invalidation is returned to its
//!   caller but not written back, so a write is never shadowed by an older read.
//! - **Fill lock**: the generation check and the write-back run under a shared
//!   guard; invalidation takes it exclusively. An invalidation therefore waits
//!   for an in-flight write-back and removes what it wrote before returning.
//!
//! ```text
//! get_or_load(key) ──► backend.get ──hit──► decode ──► value
//!                         │
//!                        miss
//!                         ▼
//!            gen₀ = generation ──► loader() ──► [fill lock] gen == gen₀ ? backend.set : skip
//! ```
//!
//! # Usage
//!
//! ```no_run
//! # use std::{sync::Arc, time::Duration};
//! # use signgate_storage::{CacheAside, CacheConfig, MemoryCacheBackend, StorageError};
//! # async fn example() -> Result<(), StorageError> {
//! let backend = Arc::new(MemoryCacheBackend::new(&CacheConfig::default()));
//! let cache = CacheAside::new(backend);
//!
//! let names: Vec<String> = cache
//!     .get_or_load("names", Duration::from_secs(60), || async {
//!         Ok::<_, StorageError>(vec!["a".to_owned()])
//!     })
//!     .await?;
//! cache.invalidate("names").await?;
//! # Ok(())
//! # }
//! ```

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::{
    cache::CacheBackend,
    error::{StorageError, StorageResult},
};

/// Read-through cache over a shared [`CacheBackend`].
///
/// # Cloning
///
/// Clones share the backend, the invalidation generation, and the fill lock.
#[derive(Clone)]
pub struct CacheAside {
    backend: Arc<dyn CacheBackend>,
    generation: Arc<AtomicU64>,
    fill: Arc<RwLock<()>>,
}

impl CacheAside {
    /// Wraps `backend`.
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            generation: Arc::new(AtomicU64::new(0)),
            fill: Arc::new(RwLock::new(())),
        }
    }

    /// Returns the underlying backend.
    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Returns the cached value for `key`, loading and caching it on a miss.
    ///
    /// An entry that fails to decode is treated as a miss and dropped.
    ///
    /// # Errors
    ///
    /// Returns the loader's error unchanged, or a converted [`StorageError`]
    /// if the backend or serialization fails.
    #[tracing::instrument(skip(self, loader))]
    pub async fn get_or_load<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        loader: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send,
        E: From<StorageError> + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        if let Some(value) = self.peek::<T>(key).await? {
            trace!(key, "cache hit");
            return Ok(value);
        }
        trace!(key, "cache miss");

        let generation = self.generation.load(Ordering::SeqCst);
        let value = loader().await?;

        let encoded = serde_json::to_string(&value).map_err(|e| {
            StorageError::serialization_with_source(format!("encode cache entry {key}"), e)
        })?;

        // The generation only moves under the exclusive guard, so it cannot
        // change between this check and the write-back.
        let _fill = self.fill.read().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(key, "invalidated during load, not caching");
            return Ok(value);
        }
        self.backend.set(key, encoded, ttl).await?;

        Ok(value)
    }

    /// Returns the cached value for `key` without loading on a miss.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the backend fails.
    pub async fn peek<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        let Some(raw) = self.backend.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key, error = %e, "dropping undecodable cache entry");
                self.backend.remove(key).await?;
                Ok(None)
            },
        }
    }

    /// Removes `key` so the next read reloads it.
    ///
    /// Waits for any in-flight write-back to finish first, so no value loaded
    /// before this call is left in the backend once it returns.
    ///
    /// Emits an audit event at INFO level.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the backend fails.
    pub async fn invalidate(&self, key: &str) -> StorageResult<()> {
        let _fill = self.fill.write().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.backend.remove(key).await?;
        tracing::info!(
            audit.action = "invalidate_cache",
            audit.resource = key,
            audit.result = "success",
            "audit_event"
        );
        Ok(())
    }

    /// Removes every cached entry.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the backend fails.
    pub async fn clear(&self) -> StorageResult<()> {
        let _fill = self.fill.write().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.backend.flush().await?;
        tracing::info!(
            audit.action = "clear_cache",
            audit.resource = "*",
            audit.result = "success",
            "audit_event"
        );
        Ok(())
    }
}

impl std::fmt::Debug for CacheAside {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheAside")
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
