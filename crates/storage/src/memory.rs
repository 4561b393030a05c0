//! In-memory repository implementation.
//!
//! [`MemoryRepository`] implements [`GateRepository`] on top of ordered maps
//! guarded by a [`parking_lot::RwLock`]. It is used by tests and by
//! single-process deployments that rebuild state at startup.
//!
//! # Example
//!
//! ```
//! use signgate_storage::{GateRepository, MemoryRepository, SYSTEM_TOKEN_ID};
//!
//! #[tokio::main]
//! async fn main() {
//!     let repo = MemoryRepository::new();
//!     let system = repo.find_token(&|t| t.id == SYSTEM_TOKEN_ID).await.unwrap();
//!     assert!(system.is_some(), "system token is seeded");
//! }
//! ```
//!
//! # Atomicity
//!
//! [`save_changes`](GateRepository::save_changes) applies a change set to a
//! scratch copy of the state under the write lock and swaps it in only when
//! every change succeeded.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::{
    error::{StorageError, StorageResult},
    repository::{GateRepository, RangePredicate, TokenPredicate},
    transaction::{Change, ChangeSet, SaveOutcome},
    types::{
        AllowListRange, AuthToken, RangeId, SYSTEM_TOKEN_DESCRIPTION, SYSTEM_TOKEN_ID,
        SYSTEM_TOKEN_VALUE, TokenId,
    },
};

#[derive(Debug, Clone)]
struct State {
    tokens: BTreeMap<TokenId, AuthToken>,
    ranges: BTreeMap<RangeId, AllowListRange>,
    next_token_id: i64,
    next_range_id: i64,
}

impl State {
    fn seeded() -> Self {
        let system = AuthToken::builder()
            .id(SYSTEM_TOKEN_ID)
            .token(SYSTEM_TOKEN_VALUE.to_owned())
            .description(SYSTEM_TOKEN_DESCRIPTION)
            .created_at(Utc::now())
            .build();
        let mut tokens = BTreeMap::new();
        tokens.insert(SYSTEM_TOKEN_ID, system);
        Self {
            tokens,
            ranges: BTreeMap::new(),
            next_token_id: SYSTEM_TOKEN_ID.0 + 1,
            next_range_id: 1,
        }
    }

    fn token_value_taken(&self, value: &str, except: Option<TokenId>) -> bool {
        self.tokens.values().any(|t| Some(t.id) != except && t.token.as_str() == value)
    }

    fn literal_taken(&self, literal: &str, except: Option<RangeId>) -> bool {
        self.ranges.values().any(|r| Some(r.id) != except && r.literal == literal)
    }

    fn apply(&mut self, change: Change, outcome: &mut SaveOutcome) -> StorageResult<()> {
        match change {
            Change::InsertToken(mut token) => {
                if self.token_value_taken(&token.token, None) {
                    return Err(StorageError::conflict("auth_tokens.token"));
                }
                token.id = TokenId(self.next_token_id);
                self.next_token_id += 1;
                self.tokens.insert(token.id, token.clone());
                outcome.inserted_tokens.push(token);
            },
            Change::UpdateToken(token) => {
                if !self.tokens.contains_key(&token.id) {
                    return Err(StorageError::not_found(format!("token:{}", token.id)));
                }
                if self.token_value_taken(&token.token, Some(token.id)) {
                    return Err(StorageError::conflict("auth_tokens.token"));
                }
                self.tokens.insert(token.id, token);
            },
            Change::RevokeToken { id, at } => {
                let token = self
                    .tokens
                    .get_mut(&id)
                    .filter(|t| t.is_usable())
                    .ok_or_else(|| StorageError::not_found(format!("token:{id}")))?;
                token.is_revoked = true;
                token.revoked_at = Some(at);
            },
            Change::InsertRange(mut range) => {
                if self.literal_taken(&range.literal, None) {
                    return Err(StorageError::conflict(range.literal));
                }
                range.id = RangeId(self.next_range_id);
                self.next_range_id += 1;
                self.ranges.insert(range.id, range.clone());
                outcome.inserted_ranges.push(range);
            },
            Change::UpdateRange(range) => {
                if !self.ranges.contains_key(&range.id) {
                    return Err(StorageError::not_found(format!("range:{}", range.id)));
                }
                if self.literal_taken(&range.literal, Some(range.id)) {
                    return Err(StorageError::conflict(range.literal));
                }
                self.ranges.insert(range.id, range);
            },
        }
        outcome.rows_affected += 1;
        Ok(())
    }
}

/// In-memory implementation of [`GateRepository`].
///
/// # Cloning
///
/// Clones share the same underlying state via [`Arc`].
#[derive(Debug, Clone)]
pub struct MemoryRepository {
    state: Arc<RwLock<State>>,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self { state: Arc::new(RwLock::new(State::seeded())) }
    }
}

impl MemoryRepository {
    /// Creates a repository holding only the seeded system token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tokens, the system token included.
    #[must_use]
    pub fn token_count(&self) -> usize {
        self.state.read().tokens.len()
    }

    /// Number of stored ranges, active or not.
    #[must_use]
    pub fn range_count(&self) -> usize {
        self.state.read().ranges.len()
    }
}

#[async_trait]
impl GateRepository for MemoryRepository {
    #[tracing::instrument(skip(self, predicate))]
    async fn find_token(&self, predicate: TokenPredicate<'_>) -> StorageResult<Option<AuthToken>> {
        let state = self.state.read();
        Ok(state.tokens.values().find(|t| predicate(t)).cloned())
    }

    #[tracing::instrument(skip(self, predicate))]
    async fn list_tokens(&self, predicate: TokenPredicate<'_>) -> StorageResult<Vec<AuthToken>> {
        let state = self.state.read();
        Ok(state.tokens.values().filter(|t| predicate(t)).cloned().collect())
    }

    #[tracing::instrument(skip(self, predicate))]
    async fn list_ranges(
        &self,
        predicate: RangePredicate<'_>,
    ) -> StorageResult<Vec<AllowListRange>> {
        let state = self.state.read();
        Ok(state.ranges.values().filter(|r| predicate(r)).cloned().collect())
    }

    #[tracing::instrument(skip(self, changes), fields(changes = changes.len()))]
    async fn save_changes(&self, changes: ChangeSet) -> StorageResult<SaveOutcome> {
        let mut state = self.state.write();
        let mut scratch = state.clone();
        let mut outcome = SaveOutcome::default();

        for change in changes.into_changes() {
            scratch.apply(change, &mut outcome)?;
        }

        *state = scratch;
        Ok(outcome)
    }
}
