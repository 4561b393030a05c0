//! The gate's produced interface.
//!
//! [`GateService`] wires validated settings, a repository, and a cache
//! backend into the stores and the engine, and exposes the operations the
//! API layer and the [`pipeline`](crate::pipeline) call.
//!
//! ```no_run
//! use std::sync::Arc;
//! use signgate_authn::{GateService, GateSettings};
//! use signgate_storage::{MemoryCacheBackend, MemoryRepository};
//!
//! # async fn example() -> signgate_authn::Result<()> {
//! let settings = GateSettings::default();
//! let backend = Arc::new(MemoryCacheBackend::new(&settings.cache.cache_config()?));
//! let service = GateService::new(settings, Arc::new(MemoryRepository::new()), backend)?;
//! service.warm().await?;
//!
//! let issued = service.issue_token("release pipeline").await?;
//! let header = format!("Bearer {}", issued.token.as_str());
//! assert!(service.authenticate(Some(header.as_str())).await?.is_some());
//! # Ok(())
//! # }
//! ```

use std::{net::IpAddr, sync::Arc};

use signgate_storage::{
    AllowListRange, AuthToken, CacheAside, CacheBackend, GateRepository, TokenId,
};

use crate::{
    allow_list::{AllowListStore, AllowOutcome, RangeRevocation},
    engine::{Decision, GateEngine},
    error::Result,
    settings::GateSettings,
    tokens::{Identity, IssuedToken, TokenStore},
};

/// How a token to revoke is referenced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenRef {
    /// By record id.
    Id(TokenId),
    /// By credential value.
    Token(String),
}

/// Facade over the stores and the engine.
///
/// # Cloning
///
/// Clones share every component.
#[derive(Debug, Clone)]
pub struct GateService {
    settings: Arc<GateSettings>,
    allow_list: AllowListStore,
    tokens: TokenStore,
    engine: GateEngine,
}

impl GateService {
    /// Builds the service.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::InvalidConfiguration`](crate::GateError::InvalidConfiguration)
    /// if `settings` fail validation; the service must not start.
    pub fn new(
        settings: GateSettings,
        repo: Arc<dyn GateRepository>,
        cache_backend: Arc<dyn CacheBackend>,
    ) -> Result<Self> {
        settings.validate()?;
        let settings = Arc::new(settings);
        let cache = CacheAside::new(cache_backend);

        let allow_list =
            AllowListStore::new(Arc::clone(&repo), cache.clone(), settings.cache.range_list_ttl);
        let tokens = TokenStore::new(repo, cache, settings.cache.token_list_ttl);
        let engine = GateEngine::new(Arc::clone(&settings), allow_list.clone(), tokens.clone());

        tracing::info!(
            whitelist = settings.enable_ips_whitelist,
            authentication = settings.enable_authentication,
            "gate service configured"
        );
        Ok(Self { settings, allow_list, tokens, engine })
    }

    /// Settings the service runs with.
    #[must_use]
    pub fn settings(&self) -> &GateSettings {
        &self.settings
    }

    /// The engine, for callers composing their own stages.
    #[must_use]
    pub fn engine(&self) -> &GateEngine {
        &self.engine
    }

    /// Loads both active lists into the cache before traffic is accepted.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Storage`](crate::GateError::Storage) if either
    /// list cannot be loaded.
    #[tracing::instrument(skip(self))]
    pub async fn warm(&self) -> Result<()> {
        let tokens = self.tokens.warm().await?;
        let ranges = self.allow_list.warm().await?;
        tracing::info!(tokens, ranges, "gate caches warmed");
        Ok(())
    }

    /// See [`GateEngine::check_whitelist`].
    ///
    /// # Errors
    ///
    /// Storage failures only.
    pub async fn check_whitelist(&self, addr: IpAddr) -> Result<Decision> {
        self.engine.check_whitelist(addr).await
    }

    /// See [`GateEngine::authenticate`].
    ///
    /// # Errors
    ///
    /// [`GateError::Unauthorized`](crate::GateError::Unauthorized) on any
    /// credential failure.
    pub async fn authenticate(&self, header: Option<&str>) -> Result<Option<Identity>> {
        self.engine.authenticate(header).await
    }

    /// See [`TokenStore::issue`].
    ///
    /// # Errors
    ///
    /// See [`TokenStore::issue`].
    pub async fn issue_token(&self, description: &str) -> Result<IssuedToken> {
        self.tokens.issue(description).await
    }

    /// Revokes a token by id or by value.
    ///
    /// # Errors
    ///
    /// See [`TokenStore::revoke_by_id`] and [`TokenStore::revoke_by_token`].
    pub async fn revoke_token(&self, token: TokenRef) -> Result<AuthToken> {
        match token {
            TokenRef::Id(id) => self.tokens.revoke_by_id(id).await,
            TokenRef::Token(value) => self.tokens.revoke_by_token(&value).await,
        }
    }

    /// See [`AllowListStore::add`].
    ///
    /// # Errors
    ///
    /// See [`AllowListStore::add`].
    pub async fn allow_ranges<S: AsRef<str>>(
        &self,
        literals: &[S],
        description: &str,
    ) -> Result<AllowOutcome> {
        self.allow_list.add(literals, description).await
    }

    /// See [`AllowListStore::add_from_lines`].
    ///
    /// # Errors
    ///
    /// See [`AllowListStore::add`].
    pub async fn allow_ranges_from_lines(
        &self,
        text: &str,
        description: &str,
    ) -> Result<AllowOutcome> {
        self.allow_list.add_from_lines(text, description).await
    }

    /// See [`AllowListStore::revoke`].
    ///
    /// # Errors
    ///
    /// See [`AllowListStore::revoke`].
    pub async fn revoke_range(&self, address: &str) -> Result<RangeRevocation> {
        self.allow_list.revoke(address).await
    }

    /// Usable tokens, ordered by id.
    ///
    /// # Errors
    ///
    /// Storage failures only.
    pub async fn list_tokens(&self) -> Result<Vec<AuthToken>> {
        self.tokens.list_active().await
    }

    /// Active ranges, ordered by id.
    ///
    /// # Errors
    ///
    /// Storage failures only.
    pub async fn list_ranges(&self) -> Result<Vec<AllowListRange>> {
        self.allow_list.list_active().await
    }

    /// Membership check for a textual address.
    ///
    /// # Errors
    ///
    /// [`GateError::InvalidFormat`](crate::GateError::InvalidFormat) for a
    /// malformed address.
    pub async fn is_allowed(&self, address: &str) -> Result<bool> {
        self.allow_list.is_allowed(address).await
    }
}
