//! Buffered change sets for atomic repository writes.
//!
//! A [`ChangeSet`] collects inserts and updates for tokens and ranges and is
//! handed to [`GateRepository::save_changes`](crate::GateRepository::save_changes)
//! as a single unit. Either every staged change is applied or none is.
//!
//! # Example
//!
//! ```
//! use signgate_storage::{AuthToken, ChangeSet};
//!
//! let mut changes = ChangeSet::new();
//! changes.insert_token(
//!     AuthToken::builder().token("dG9rZW4=".to_owned()).description("ci").build(),
//! );
//! assert_eq!(changes.len(), 1);
//! ```

use chrono::{DateTime, Utc};

use crate::types::{AllowListRange, AuthToken, TokenId};

/// A single staged write.
#[derive(Debug, Clone)]
pub enum Change {
    /// Insert a new token; its id is assigned on save.
    InsertToken(AuthToken),
    /// Replace the token with the same id.
    UpdateToken(AuthToken),
    /// Mark a usable token revoked at `at`. Fails with
    /// [`StorageError::NotFound`](crate::StorageError::NotFound) when the
    /// token is missing, already revoked, or the system token.
    RevokeToken {
        /// Target token.
        id: TokenId,
        /// Revocation time.
        at: DateTime<Utc>,
    },
    /// Insert a new range; its id is assigned on save.
    InsertRange(AllowListRange),
    /// Replace the range with the same id.
    UpdateRange(AllowListRange),
}

/// Ordered collection of staged writes.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    /// Creates an empty change set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a token insert.
    pub fn insert_token(&mut self, token: AuthToken) -> &mut Self {
        self.changes.push(Change::InsertToken(token));
        self
    }

    /// Stages a token update.
    pub fn update_token(&mut self, token: AuthToken) -> &mut Self {
        self.changes.push(Change::UpdateToken(token));
        self
    }

    /// Stages a conditional revocation of the token with `id`.
    pub fn revoke_token(&mut self, id: TokenId, at: DateTime<Utc>) -> &mut Self {
        self.changes.push(Change::RevokeToken { id, at });
        self
    }

    /// Stages a batch of range inserts, preserving order.
    pub fn insert_ranges(&mut self, ranges: impl IntoIterator<Item = AllowListRange>) -> &mut Self {
        self.changes.extend(ranges.into_iter().map(Change::InsertRange));
        self
    }

    /// Stages a range update.
    pub fn update_range(&mut self, range: AllowListRange) -> &mut Self {
        self.changes.push(Change::UpdateRange(range));
        self
    }

    /// Number of staged writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Returns `true` if nothing is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Consumes the set, yielding staged writes in order.
    pub fn into_changes(self) -> Vec<Change> {
        self.changes
    }
}

/// Result of a successful [`save_changes`](crate::GateRepository::save_changes).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveOutcome {
    /// Number of records written.
    pub rows_affected: usize,
    /// Inserted tokens with their assigned ids, in staging order.
    pub inserted_tokens: Vec<AuthToken>,
    /// Inserted ranges with their assigned ids, in staging order.
    pub inserted_ranges: Vec<AllowListRange>,
}
