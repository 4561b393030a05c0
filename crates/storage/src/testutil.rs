//! Shared test utilities for repository and cache testing.
//!
//! Feature-gated behind `testutil` so none of it reaches production builds.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! signgate-storage = { path = "../storage", features = ["testutil"] }
//! ```
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use signgate_storage::testutil::{CountingRepository, make_range};
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;

use crate::{
    error::{StorageError, StorageResult},
    memory::MemoryRepository,
    repository::{GateRepository, RangePredicate, TokenPredicate},
    transaction::{ChangeSet, SaveOutcome},
    types::{AllowListRange, AuthToken},
};

/// Builds an unsaved range record with the given literal and numeric bounds.
///
/// Text bounds are filled with placeholders; use this only where the gate's
/// own bound computation is not under test.
#[must_use]
pub fn make_range(literal: &str, first: u128, last: u128) -> AllowListRange {
    AllowListRange::builder()
        .literal(literal)
        .description(format!("test range {literal}"))
        .first_usable(first.to_string())
        .last_usable(last.to_string())
        .first_usable_numeric(first)
        .last_usable_numeric(last)
        .build()
}

/// Builds an unsaved, non-revoked token record.
#[must_use]
pub fn make_token(value: &str, description: &str) -> AuthToken {
    AuthToken::builder().token(value.to_owned()).description(description).build()
}

/// [`GateRepository`] wrapper that counts reads and can be told to fail writes.
///
/// Used to observe whether a read was served from cache and to check that a
/// failed write leaves nothing behind.
#[derive(Debug, Clone, Default)]
pub struct CountingRepository {
    inner: MemoryRepository,
    token_reads: Arc<AtomicUsize>,
    range_reads: Arc<AtomicUsize>,
    saves: Arc<AtomicUsize>,
    fail_saves: Arc<AtomicBool>,
    fail_reads: Arc<AtomicBool>,
}

impl CountingRepository {
    /// Creates a wrapper around a fresh [`MemoryRepository`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The wrapped repository.
    #[must_use]
    pub fn inner(&self) -> &MemoryRepository {
        &self.inner
    }

    /// Number of `find_token` and `list_tokens` calls so far.
    #[must_use]
    pub fn token_reads(&self) -> usize {
        self.token_reads.load(Ordering::SeqCst)
    }

    /// Number of `list_ranges` calls so far.
    #[must_use]
    pub fn range_reads(&self) -> usize {
        self.range_reads.load(Ordering::SeqCst)
    }

    /// Number of successful `save_changes` calls so far.
    #[must_use]
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Makes every subsequent `save_changes` fail with a connection error.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent read fail with a connection error.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check_reads(&self) -> StorageResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::connection("injected read failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl GateRepository for CountingRepository {
    async fn find_token(&self, predicate: TokenPredicate<'_>) -> StorageResult<Option<AuthToken>> {
        self.token_reads.fetch_add(1, Ordering::SeqCst);
        self.check_reads()?;
        self.inner.find_token(predicate).await
    }

    async fn list_tokens(&self, predicate: TokenPredicate<'_>) -> StorageResult<Vec<AuthToken>> {
        self.token_reads.fetch_add(1, Ordering::SeqCst);
        self.check_reads()?;
        self.inner.list_tokens(predicate).await
    }

    async fn list_ranges(
        &self,
        predicate: RangePredicate<'_>,
    ) -> StorageResult<Vec<AllowListRange>> {
        self.range_reads.fetch_add(1, Ordering::SeqCst);
        self.check_reads()?;
        self.inner.list_ranges(predicate).await
    }

    async fn save_changes(&self, changes: ChangeSet) -> StorageResult<SaveOutcome> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StorageError::connection("injected save failure"));
        }
        let outcome = self.inner.save_changes(changes).await?;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(outcome)
    }
}

/// Assert that a [`StorageResult`] is a [`StorageError::Conflict`].
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use signgate_storage::{assert_conflict, StorageError, StorageResult};
///
/// let result: StorageResult<()> = Err(StorageError::conflict("token"));
/// assert_conflict!(result);
/// ```
#[macro_export]
macro_rules! assert_conflict {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::Conflict { .. })),
            "expected StorageError::Conflict, got: {:?}",
            $result,
        );
    };
    ($result:expr, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::Conflict { .. })),
            "{}: expected StorageError::Conflict, got: {:?}",
            $msg,
            $result,
        );
    };
}

/// Assert that a [`StorageResult`] is a [`StorageError::NotFound`].
#[macro_export]
macro_rules! assert_not_found {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::NotFound { .. })),
            "expected StorageError::NotFound, got: {:?}",
            $result,
        );
    };
    ($result:expr, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::NotFound { .. })),
            "{}: expected StorageError::NotFound, got: {:?}",
            $msg,
            $result,
        );
    };
}

/// Assert that a [`StorageResult`] is `Ok`, returning the inner value.
#[macro_export]
macro_rules! assert_storage_ok {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("expected Ok, got StorageError: {e:?}"),
        }
    };
    ($result:expr, $msg:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("{}: expected Ok, got StorageError: {e:?}", $msg),
        }
    };
}
