//! Bearer-token lifecycle: issue, revoke, list, validate.
//!
//! [`TokenStore`] owns every path that reads or writes [`AuthToken`]
//! records. The list of usable tokens is cached under [`TOKEN_LIST_KEY`] and
//! invalidated by every write before the write reports success.
//!
//! Token values are secrets: they are held in [`Zeroizing`] buffers, compared
//! in constant time, and never logged.

use std::{fmt, sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use fail::fail_point;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use signgate_storage::{
    AuthToken, CacheAside, GateRepository, SYSTEM_TOKEN_DESCRIPTION, SYSTEM_TOKEN_ID,
    StorageError, TokenId, Zeroizing,
};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::error::{GateError, Result};

/// Cache key of the usable-token list.
pub const TOKEN_LIST_KEY: &str = "AuthTokens.All";

/// Bytes of OS randomness behind every issued token.
pub const TOKEN_BYTES: usize = 32;

const TOKEN_NOT_FOUND: &str = "Token not found";

/// The authenticated principal attached to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Id of the presented token.
    pub token_id: TokenId,
    /// Description of the presented token.
    pub token_description: String,
}

impl From<&AuthToken> for Identity {
    fn from(token: &AuthToken) -> Self {
        Self { token_id: token.id, token_description: token.description.clone() }
    }
}

/// A newly issued token.
///
/// This is the only time the token value is handed out.
#[derive(Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    /// Assigned id.
    pub id: TokenId,
    /// The bearer credential.
    pub token: Zeroizing<String>,
    /// Holder label.
    pub description: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("id", &self.id)
            .field("token", &"[REDACTED]")
            .field("description", &self.description)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Generates a standard-base64 token from `len` bytes of OS randomness.
///
/// # Errors
///
/// Returns [`GateError::Crypto`] if `len` is below [`TOKEN_BYTES`] or the
/// OS randomness source fails. There is no fallback source.
pub fn generate_token_value(len: usize) -> Result<Zeroizing<String>> {
    if len < TOKEN_BYTES {
        return Err(GateError::crypto(format!(
            "token entropy must be at least {TOKEN_BYTES} bytes, got {len}"
        )));
    }

    fail_point!("token-issue-rng", |_| { Err(GateError::crypto("injected rng failure")) });

    let mut raw = Zeroizing::new(vec![0u8; len]);
    OsRng
        .try_fill_bytes(raw.as_mut_slice())
        .map_err(|e| GateError::crypto(format!("OS randomness unavailable: {e}")))?;
    Ok(Zeroizing::new(STANDARD.encode(raw.as_slice())))
}

/// Compares a stored token value with a presented one without an early exit
/// on the first differing byte.
fn token_matches(stored: &str, presented: &str) -> bool {
    bool::from(stored.as_bytes().ct_eq(presented.as_bytes()))
}

/// Issues, revokes, and validates bearer tokens.
///
/// # Cloning
///
/// Clones share the repository and the cache.
#[derive(Clone)]
pub struct TokenStore {
    repo: Arc<dyn GateRepository>,
    cache: CacheAside,
    ttl: Duration,
}

impl TokenStore {
    /// Creates a store over `repo`, caching the usable list for `ttl`.
    pub fn new(repo: Arc<dyn GateRepository>, cache: CacheAside, ttl: Duration) -> Self {
        Self { repo, cache, ttl }
    }

    /// Creates and persists a new token for `description`.
    ///
    /// # Errors
    ///
    /// - [`GateError::Validation`] if `description` is blank
    /// - [`GateError::Crypto`] if randomness is unavailable
    /// - [`GateError::Conflict`] on the (negligible) chance of a duplicate value
    #[tracing::instrument(skip(self))]
    pub async fn issue(&self, description: &str) -> Result<IssuedToken> {
        let description = description.trim();
        if description.is_empty() {
            return Err(GateError::validation("Description is required"));
        }

        let value = generate_token_value(TOKEN_BYTES)?;
        let record = AuthToken::builder().token(value).description(description).build();
        let stored = self.repo.insert_token(record).await?;
        self.invalidate_and_rewarm().await?;

        tracing::info!(
            audit.action = "issue_token",
            audit.resource = %format_args!("token:{}", stored.id),
            audit.result = "success",
            "audit_event"
        );

        Ok(IssuedToken {
            id: stored.id,
            token: stored.token,
            description: stored.description,
            created_at: stored.created_at,
        })
    }

    /// Revokes the usable token with `id`.
    ///
    /// Of several concurrent revocations of the same token exactly one
    /// succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::NotFound`] if `id` is not positive, unknown,
    /// already revoked, or the system token.
    #[tracing::instrument(skip(self))]
    pub async fn revoke_by_id(&self, id: TokenId) -> Result<AuthToken> {
        if id.0 <= 0 {
            return Err(GateError::not_found(TOKEN_NOT_FOUND));
        }
        let found = self.repo.find_token(&|t| t.id == id).await?;
        self.revoke(found).await
    }

    /// Revokes the usable token whose value is `token`.
    ///
    /// # Errors
    ///
    /// - [`GateError::Validation`] if `token` is blank
    /// - [`GateError::NotFound`] if no usable token has that value
    #[tracing::instrument(skip_all)]
    pub async fn revoke_by_token(&self, token: &str) -> Result<AuthToken> {
        if token.trim().is_empty() {
            return Err(GateError::validation("Token is required"));
        }
        let found = self.repo.find_token(&|t| token_matches(&t.token, token)).await?;
        self.revoke(found).await
    }

    async fn revoke(&self, found: Option<AuthToken>) -> Result<AuthToken> {
        let mut token = found
            .filter(AuthToken::is_usable)
            .ok_or_else(|| GateError::not_found(TOKEN_NOT_FOUND))?;
        let at = Utc::now();

        fail_point!("token-revoke-before-save", |_| {
            Err(GateError::from(StorageError::timeout()))
        });
        match self.repo.revoke_token(token.id, at).await {
            Ok(()) => {},
            // Lost a race with another revocation.
            Err(StorageError::NotFound { .. }) => {
                return Err(GateError::not_found(TOKEN_NOT_FOUND));
            },
            Err(e) => return Err(e.into()),
        }
        token.is_revoked = true;
        token.revoked_at = Some(at);
        self.invalidate_and_rewarm().await?;

        tracing::info!(
            audit.action = "revoke_token",
            audit.resource = %format_args!("token:{}", token.id),
            audit.result = "success",
            "audit_event"
        );
        Ok(token)
    }

    /// Every usable token (not revoked, not the system token), ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Storage`] if the repository or cache fails.
    #[tracing::instrument(skip(self))]
    pub async fn list_active(&self) -> Result<Vec<AuthToken>> {
        let repo = Arc::clone(&self.repo);
        self.cache
            .get_or_load(TOKEN_LIST_KEY, self.ttl, || async move {
                repo.list_tokens(&|t| t.is_usable()).await.map_err(GateError::from)
            })
            .await
    }

    /// Returns the usable token whose value is `token`.
    ///
    /// Scans the cached list when it is populated and falls back to a direct
    /// repository lookup otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::NotFound`] when no usable token matches.
    #[tracing::instrument(skip_all)]
    pub async fn validate(&self, token: &str) -> Result<AuthToken> {
        if token.is_empty() {
            return Err(GateError::not_found(TOKEN_NOT_FOUND));
        }

        let cached: Option<Vec<AuthToken>> = self.cache.peek(TOKEN_LIST_KEY).await?;
        let found = match cached {
            Some(list) => list.into_iter().find(|t| token_matches(&t.token, token)),
            None => {
                debug!("token list not cached, querying repository");
                self.repo.find_token(&|t| t.is_usable() && token_matches(&t.token, token)).await?
            },
        };

        found.filter(AuthToken::is_usable).ok_or_else(|| GateError::not_found(TOKEN_NOT_FOUND))
    }

    /// Identity of the reserved system token, for internal operations that
    /// do not present a bearer credential.
    #[must_use]
    pub fn system_identity() -> Identity {
        Identity {
            token_id: SYSTEM_TOKEN_ID,
            token_description: SYSTEM_TOKEN_DESCRIPTION.to_owned(),
        }
    }

    /// Loads the usable list into the cache.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Storage`] if the repository or cache fails.
    pub async fn warm(&self) -> Result<usize> {
        self.list_active().await.map(|list| list.len())
    }

    async fn invalidate_and_rewarm(&self) -> Result<()> {
        self.cache.invalidate(TOKEN_LIST_KEY).await?;
        if let Err(e) = self.warm().await {
            warn!(error = %e, "token list re-warm failed; next read reloads");
        }
        Ok(())
    }
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenStore").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashSet;

    use signgate_storage::{
        CacheConfig, MemoryCacheBackend, SYSTEM_TOKEN_VALUE, testutil::CountingRepository,
    };

    use super::*;

    const TTL: Duration = Duration::from_secs(3600);

    fn store() -> (TokenStore, CountingRepository) {
        let repo = CountingRepository::new();
        let cache = CacheAside::new(Arc::new(MemoryCacheBackend::new(&CacheConfig::default())));
        (TokenStore::new(Arc::new(repo.clone()), cache, TTL), repo)
    }

    #[test]
    fn generated_value_is_44_base64_chars() {
        let value = generate_token_value(TOKEN_BYTES).unwrap();
        assert_eq!(value.len(), 44);
        assert_eq!(STANDARD.decode(value.as_bytes()).unwrap().len(), TOKEN_BYTES);
    }

    #[test]
    fn token_matching_is_exact() {
        assert!(token_matches("dG9rZW4=", "dG9rZW4="));
        assert!(!token_matches("dG9rZW4=", "dG9rZW4"));
        assert!(!token_matches("dG9rZW4=", "dG9rZW5="));
        assert!(!token_matches("dG9rZW4=", ""));
    }

    #[test]
    fn short_entropy_is_rejected() {
        assert!(matches!(generate_token_value(16), Err(GateError::Crypto(_))));
    }

    #[tokio::test]
    async fn issue_returns_record_with_id() {
        let (store, _) = store();
        let issued = store.issue("  release pipeline ").await.unwrap();
        assert_eq!(issued.id, TokenId(2));
        assert_eq!(issued.description, "release pipeline");
        assert_eq!(issued.token.len(), 44);
    }

    #[tokio::test]
    async fn blank_description_is_rejected() {
        let (store, repo) = store();
        let err = store.issue("   ").await.unwrap_err();
        assert_eq!(err.to_string(), "Description is required");
        assert_eq!(repo.saves(), 0);
    }

    #[tokio::test]
    async fn issued_values_are_distinct() {
        let (store, _) = store();
        let mut seen = HashSet::new();
        for i in 0..50 {
            let issued = store.issue(&format!("holder {i}")).await.unwrap();
            assert!(seen.insert(issued.token.as_str().to_owned()));
        }
    }

    #[tokio::test]
    async fn issued_token_debug_is_redacted() {
        let (store, _) = store();
        let issued = store.issue("ci").await.unwrap();
        let debug = format!("{issued:?}");
        assert!(!debug.contains(issued.token.as_str()));
        assert!(debug.contains("REDACTED"));
    }

    #[tokio::test]
    async fn validate_accepts_issued_token() {
        let (store, _) = store();
        let issued = store.issue("ci").await.unwrap();
        let found = store.validate(&issued.token).await.unwrap();
        assert_eq!(found.id, issued.id);
    }

    #[tokio::test]
    async fn validate_is_served_from_cache_after_warm() {
        let (store, repo) = store();
        let issued = store.issue("ci").await.unwrap();
        store.warm().await.unwrap();
        let reads = repo.token_reads();

        for _ in 0..5 {
            store.validate(&issued.token).await.unwrap();
        }
        assert_eq!(repo.token_reads(), reads, "hot path must not touch the repository");
    }

    #[tokio::test]
    async fn validate_rejects_unknown_and_empty() {
        let (store, _) = store();
        assert!(matches!(store.validate("nope").await, Err(GateError::NotFound(_))));
        assert!(matches!(store.validate("").await, Err(GateError::NotFound(_))));
    }

    #[tokio::test]
    async fn system_token_is_neither_listed_nor_valid() {
        let (store, _) = store();
        assert!(store.list_active().await.unwrap().is_empty());
        assert!(store.validate(SYSTEM_TOKEN_VALUE).await.is_err());
        assert_eq!(TokenStore::system_identity().token_id, SYSTEM_TOKEN_ID);
    }

    #[tokio::test]
    async fn revoke_by_id_invalidates_immediately() {
        let (store, _) = store();
        let issued = store.issue("ci").await.unwrap();
        store.validate(&issued.token).await.unwrap();

        let revoked = store.revoke_by_id(issued.id).await.unwrap();
        assert!(revoked.is_revoked);
        assert!(revoked.revoked_at.is_some());
        assert!(matches!(store.validate(&issued.token).await, Err(GateError::NotFound(_))));
        assert!(store.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_revoke_is_not_found() {
        let (store, _) = store();
        let issued = store.issue("ci").await.unwrap();
        store.revoke_by_id(issued.id).await.unwrap();
        let err = store.revoke_by_id(issued.id).await.unwrap_err();
        assert_eq!(err.to_string(), "Token not found");
    }

    #[tokio::test]
    async fn revoke_of_stale_record_is_not_found() {
        let (store, repo) = store();
        let issued = store.issue("ci").await.unwrap();
        let stale = repo.inner().find_token(&|t| t.id == issued.id).await.unwrap();

        store.revoke_by_id(issued.id).await.unwrap();
        let err = store.revoke(stale).await.unwrap_err();
        assert!(matches!(err, GateError::NotFound(_)));
    }

    #[tokio::test]
    async fn non_positive_and_system_ids_are_not_found() {
        let (store, _) = store();
        for id in [0, -4, SYSTEM_TOKEN_ID.0, 999] {
            assert!(matches!(store.revoke_by_id(TokenId(id)).await, Err(GateError::NotFound(_))));
        }
    }

    #[tokio::test]
    async fn revoke_by_token_value() {
        let (store, _) = store();
        let issued = store.issue("ci").await.unwrap();
        let revoked = store.revoke_by_token(&issued.token).await.unwrap();
        assert_eq!(revoked.id, issued.id);
        assert!(matches!(store.revoke_by_token("  ").await, Err(GateError::Validation(_))));
    }

    #[tokio::test]
    async fn failed_save_leaves_cache_intact() {
        let (store, repo) = store();
        let issued = store.issue("ci").await.unwrap();
        repo.set_fail_saves(true);
        assert!(matches!(store.revoke_by_id(issued.id).await, Err(GateError::Storage(_))));
        repo.set_fail_saves(false);
        store.validate(&issued.token).await.unwrap();
    }
}
