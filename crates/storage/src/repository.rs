//! Persistence contract for tokens and allow-list ranges.
//!
//! [`GateRepository`] is the only way the gate touches durable state. Reads
//! take a predicate and return records in ascending id order; writes are
//! staged in a [`ChangeSet`] and applied atomically by
//! [`save_changes`](GateRepository::save_changes).
//!
//! # Implementing a Repository
//!
//! 1. Implement the four required methods
//! 2. Enforce uniqueness of token values and range literals, reporting
//!    violations as [`StorageError::Conflict`](crate::StorageError::Conflict)
//! 3. Seed the reserved system token (see [`SYSTEM_TOKEN_ID`](crate::SYSTEM_TOKEN_ID))
//!
//! See the [`memory`](crate::memory) module source for a reference implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::{StorageError, StorageResult},
    transaction::{ChangeSet, SaveOutcome},
    types::{AllowListRange, AuthToken, TokenId},
};

/// Borrowed filter over token records.
pub type TokenPredicate<'a> = &'a (dyn Fn(&AuthToken) -> bool + Send + Sync);

/// Borrowed filter over range records.
pub type RangePredicate<'a> = &'a (dyn Fn(&AllowListRange) -> bool + Send + Sync);

/// Durable store for [`AuthToken`] and [`AllowListRange`] records.
///
/// # Error Handling
///
/// Implementations map their internal failures onto
/// [`StorageError`]. A failed [`save_changes`](Self::save_changes) must leave
/// no staged change applied.
#[async_trait]
pub trait GateRepository: Send + Sync {
    /// Returns the first token (lowest id) matching `predicate`.
    async fn find_token(&self, predicate: TokenPredicate<'_>) -> StorageResult<Option<AuthToken>>;

    /// Returns every token matching `predicate`, ordered by id.
    async fn list_tokens(&self, predicate: TokenPredicate<'_>) -> StorageResult<Vec<AuthToken>>;

    /// Returns every range matching `predicate`, ordered by id.
    async fn list_ranges(
        &self,
        predicate: RangePredicate<'_>,
    ) -> StorageResult<Vec<AllowListRange>>;

    /// Applies every staged change as one atomic write.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Conflict`] if a token value or range literal would
    ///   be duplicated
    /// - [`StorageError::NotFound`] if an update targets a missing id, or a
    ///   revocation targets a token that is no longer usable
    async fn save_changes(&self, changes: ChangeSet) -> StorageResult<SaveOutcome>;

    /// Inserts a single token and returns it with its assigned id.
    async fn insert_token(&self, token: AuthToken) -> StorageResult<AuthToken> {
        let mut changes = ChangeSet::new();
        changes.insert_token(token);
        let outcome = self.save_changes(changes).await?;
        outcome
            .inserted_tokens
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::internal("insert returned no token"))
    }

    /// Replaces a single token by id.
    async fn update_token(&self, token: AuthToken) -> StorageResult<()> {
        let mut changes = ChangeSet::new();
        changes.update_token(token);
        self.save_changes(changes).await.map(|_| ())
    }

    /// Revokes a usable token. The usability check and the write are one
    /// atomic step, so of two racing revocations exactly one succeeds.
    async fn revoke_token(&self, id: TokenId, at: DateTime<Utc>) -> StorageResult<()> {
        let mut changes = ChangeSet::new();
        changes.revoke_token(id, at);
        self.save_changes(changes).await.map(|_| ())
    }

    /// Inserts a batch of ranges and returns them with their assigned ids.
    async fn insert_ranges(
        &self,
        ranges: Vec<AllowListRange>,
    ) -> StorageResult<Vec<AllowListRange>> {
        let mut changes = ChangeSet::new();
        changes.insert_ranges(ranges);
        Ok(self.save_changes(changes).await?.inserted_ranges)
    }

    /// Replaces a single range by id.
    async fn update_range(&self, range: AllowListRange) -> StorageResult<()> {
        let mut changes = ChangeSet::new();
        changes.update_range(range);
        self.save_changes(changes).await.map(|_| ())
    }
}
