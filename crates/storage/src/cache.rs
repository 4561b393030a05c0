//! Cache backend contract and its moka-backed implementation.
//!
//! [`CacheBackend`] is a string-keyed, string-valued store with per-entry
//! expiry. [`MemoryCacheBackend`] implements it with a [`moka`] future cache.
//! Typed access and the invalidate-on-write discipline live in
//! [`CacheAside`](crate::CacheAside).
//!
//! # Usage
//!
//! ```no_run
//! # use std::time::Duration;
//! # use signgate_storage::{CacheBackend, CacheConfig, MemoryCacheBackend};
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CacheConfig::builder()
//!     .max_entries(10_000)
//!     .ttl(Duration::from_secs(60))
//!     .build()?;
//! let cache = MemoryCacheBackend::new(&config);
//!
//! cache.set("AllowedIPs.All", "[]".to_owned(), Duration::from_secs(30)).await?;
//! assert!(cache.exists("AllowedIPs.All").await?);
//! # Ok(())
//! # }
//! ```

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use moka::{Expiry, future::Cache};
use tracing::trace;

use crate::{ConfigError, error::StorageResult};

// ───────────────────────────────────────────────────────────────────────────
// CacheConfig
// ───────────────────────────────────────────────────────────────────────────

/// Default maximum number of cache entries.
const DEFAULT_MAX_ENTRIES: u64 = 10_000;

/// Default upper bound on an entry's lifetime.
const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Minimum allowed cache TTL.
const MIN_TTL: Duration = Duration::from_secs(1);

/// Configuration for [`MemoryCacheBackend`].
///
/// `ttl` caps every entry's lifetime: an entry written with a longer TTL
/// expires after `ttl` instead.
///
/// # Validation
///
/// - `max_entries` must be >= 1
/// - `ttl` must be >= 1 second
///
/// Use [`CacheConfig::disabled()`] to turn caching off entirely.
///
/// # Examples
///
/// ```no_run
/// # use std::time::Duration;
/// # use signgate_storage::CacheConfig;
/// let config = CacheConfig::builder()
///     .max_entries(5_000)
///     .ttl(Duration::from_secs(120))
///     .build()
///     .expect("valid config");
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    max_entries: u64,
    ttl: Duration,
    enabled: bool,
}

impl CacheConfig {
    /// Starts a builder populated with defaults.
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder { max_entries: DEFAULT_MAX_ENTRIES, ttl: DEFAULT_TTL }
    }

    /// Creates a disabled cache configuration.
    ///
    /// A backend built from it stores nothing and reports every key absent.
    pub fn disabled() -> Self {
        Self { max_entries: 0, ttl: Duration::ZERO, enabled: false }
    }

    /// Returns the maximum number of cache entries.
    pub fn max_entries(&self) -> u64 {
        self.max_entries
    }

    /// Returns the entry lifetime cap.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns whether caching is enabled.
    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: DEFAULT_MAX_ENTRIES, ttl: DEFAULT_TTL, enabled: true }
    }
}

/// Builder for [`CacheConfig`].
pub struct CacheConfigBuilder {
    max_entries: u64,
    ttl: Duration,
}

impl CacheConfigBuilder {
    /// Sets the maximum number of entries in the cache.
    pub fn max_entries(mut self, max_entries: u64) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Sets the entry lifetime cap.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Builds the [`CacheConfig`], validating all fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if:
    /// - `max_entries` is 0
    /// - `ttl` is less than 1 second
    pub fn build(self) -> Result<CacheConfig, ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_entries",
                value: self.max_entries.to_string(),
                min: "1".to_owned(),
            });
        }
        if self.ttl < MIN_TTL {
            return Err(ConfigError::BelowMinimum {
                field: "ttl",
                value: format!("{}ms", self.ttl.as_millis()),
                min: "1s".to_owned(),
            });
        }
        Ok(CacheConfig { max_entries: self.max_entries, ttl: self.ttl, enabled: true })
    }
}

// ───────────────────────────────────────────────────────────────────────────
// CacheBackend
// ───────────────────────────────────────────────────────────────────────────

/// String key/value cache with per-entry expiry.
///
/// Expired entries must behave exactly like absent ones.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Returns `true` if `key` holds an unexpired entry.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Returns the entry stored under `key`, if any.
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Stores `value` under `key` for at most `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> StorageResult<()>;

    /// Removes `key`. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> StorageResult<()>;

    /// Removes every entry.
    async fn flush(&self) -> StorageResult<()>;
}

#[derive(Clone)]
struct Entry {
    value: Arc<str>,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// [`CacheBackend`] backed by a bounded moka cache.
///
/// # Cloning
///
/// Clones share the same cache.
#[derive(Clone)]
pub struct MemoryCacheBackend {
    cache: Option<Cache<String, Entry>>,
    config: CacheConfig,
}

impl MemoryCacheBackend {
    /// Creates a backend from `config`.
    ///
    /// A disabled config allocates no cache.
    pub fn new(config: &CacheConfig) -> Self {
        let cache = config.enabled.then(|| {
            Cache::builder().max_capacity(config.max_entries).expire_after(PerEntryTtl).build()
        });
        Self { cache, config: config.clone() }
    }

    /// Returns cache statistics: `(current_entries, max_entries)`.
    pub fn cache_stats(&self) -> (u64, u64) {
        let count = self.cache.as_ref().map_or(0, |c| c.entry_count());
        (count, self.config.max_entries)
    }
}

impl std::fmt::Debug for MemoryCacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCacheBackend").field("config", &self.config).finish_non_exhaustive()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.cache.as_ref().is_some_and(|c| c.contains_key(key)))
    }

    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };
        let hit = cache.get(key).await.map(|entry| entry.value.to_string());
        trace!(key, hit = hit.is_some(), "cache get");
        Ok(hit)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> StorageResult<()> {
        if let Some(cache) = &self.cache {
            let ttl = ttl.min(self.config.ttl);
            cache.insert(key.to_owned(), Entry { value: value.into(), ttl }).await;
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        if let Some(cache) = &self.cache {
            cache.invalidate(key).await;
        }
        Ok(())
    }

    async fn flush(&self) -> StorageResult<()> {
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
        Ok(())
    }
}
