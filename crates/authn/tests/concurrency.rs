//! Concurrent writers and readers against one service.
//!
//! Every task shares a single [`GateService`]; after the writers finish, the
//! cached views must agree with what the repository holds.

#![allow(clippy::expect_used, clippy::panic)]

use std::{net::IpAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use signgate_authn::{
    Decision, GateError, GateService, GateSettings, TokenRef,
    testutil::{GateFixture, fixture, whitelist_settings},
};
use signgate_storage::{
    AllowListRange, AuthToken, CacheConfig, ChangeSet, GateRepository, MemoryCacheBackend,
    MemoryRepository, RangePredicate, SaveOutcome, StorageResult, TokenPredicate,
};
use tokio::task::JoinSet;

/// Holds every `find_token` answer back for a while, so that racing callers
/// all observe the same snapshot before any of them writes.
struct SlowLookups {
    inner: MemoryRepository,
    delay: Duration,
}

#[async_trait]
impl GateRepository for SlowLookups {
    async fn find_token(&self, predicate: TokenPredicate<'_>) -> StorageResult<Option<AuthToken>> {
        let found = self.inner.find_token(predicate).await?;
        tokio::time::sleep(self.delay).await;
        Ok(found)
    }

    async fn list_tokens(&self, predicate: TokenPredicate<'_>) -> StorageResult<Vec<AuthToken>> {
        self.inner.list_tokens(predicate).await
    }

    async fn list_ranges(
        &self,
        predicate: RangePredicate<'_>,
    ) -> StorageResult<Vec<AllowListRange>> {
        self.inner.list_ranges(predicate).await
    }

    async fn save_changes(&self, changes: ChangeSet) -> StorageResult<SaveOutcome> {
        self.inner.save_changes(changes).await
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_issues_are_all_usable() {
    let GateFixture { service, repo, .. } = fixture(GateSettings::default());
    let service = Arc::new(service);

    let mut set = JoinSet::new();
    for i in 0..32 {
        let service = Arc::clone(&service);
        set.spawn(async move { service.issue_token(&format!("worker-{i}")).await });
    }

    let mut issued = Vec::new();
    while let Some(result) = set.join_next().await {
        issued.push(result.expect("task panicked").expect("issue"));
    }

    let listed = service.list_tokens().await.expect("list");
    assert_eq!(listed.len(), 32);
    assert_eq!(repo.inner().token_count(), 33, "32 issued plus the system token");

    for token in &issued {
        let header = format!("Bearer {}", token.token.as_str());
        let identity = service.authenticate(Some(header.as_str())).await.expect("authenticate");
        assert_eq!(identity.map(|i| i.token_id), Some(token.id));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn revocation_races_with_validation() {
    let fx = fixture(GateSettings::default());
    let service = Arc::new(fx.service);

    let mut tokens = Vec::new();
    for i in 0..16 {
        tokens.push(service.issue_token(&format!("t{i}")).await.expect("issue"));
    }
    let headers: Vec<String> =
        tokens.iter().map(|t| format!("Bearer {}", t.token.as_str())).collect();

    let mut set = JoinSet::new();
    for token in tokens.iter().step_by(2) {
        let service = Arc::clone(&service);
        let id = token.id;
        set.spawn(async move { service.revoke_token(TokenRef::Id(id)).await.map(|_| ()) });
    }
    for header in headers.iter().skip(1).step_by(2).cloned() {
        let service = Arc::clone(&service);
        set.spawn(async move { service.authenticate(Some(header.as_str())).await.map(|_| ()) });
    }

    while let Some(result) = set.join_next().await {
        result.expect("task panicked").expect("operation");
    }

    for (i, header) in headers.iter().enumerate() {
        let outcome = service.authenticate(Some(header.as_str())).await;
        if i % 2 == 0 {
            assert!(matches!(outcome, Err(GateError::Unauthorized)), "token {i} still valid");
        } else {
            assert!(outcome.expect("authenticate").is_some(), "token {i} lost");
        }
    }
    assert_eq!(service.list_tokens().await.expect("list").len(), 8);
}

async fn race_revocations(service: Arc<GateService>, id: TokenRef, racers: usize) -> usize {
    let mut set = JoinSet::new();
    for _ in 0..racers {
        let service = Arc::clone(&service);
        let id = id.clone();
        set.spawn(async move { service.revoke_token(id).await });
    }

    let mut succeeded = 0;
    while let Some(result) = set.join_next().await {
        match result.expect("task panicked") {
            Ok(token) => {
                assert!(token.is_revoked);
                succeeded += 1;
            },
            Err(GateError::NotFound(_)) => {},
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    succeeded
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn double_revoke_succeeds_exactly_once() {
    let fx = fixture(GateSettings::default());
    let service = Arc::new(fx.service);
    let issued = service.issue_token("contended").await.expect("issue");

    let succeeded = race_revocations(Arc::clone(&service), TokenRef::Id(issued.id), 2).await;
    assert_eq!(succeeded, 1);
    assert!(service.list_tokens().await.expect("list").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn revokes_that_both_saw_a_usable_token_succeed_once() {
    let inner = MemoryRepository::new();
    let repo = SlowLookups { inner: inner.clone(), delay: Duration::from_millis(50) };
    let backend = Arc::new(MemoryCacheBackend::new(&CacheConfig::default()));
    let service =
        Arc::new(GateService::new(GateSettings::default(), Arc::new(repo), backend).expect("new"));
    let issued = service.issue_token("contended").await.expect("issue");

    let succeeded = race_revocations(Arc::clone(&service), TokenRef::Id(issued.id), 2).await;
    assert_eq!(succeeded, 1, "both lookups saw a usable token; only one write may win");

    let stored = inner.find_token(&|t| t.id == issued.id).await.expect("find").expect("stored");
    assert!(stored.is_revoked);
    assert!(stored.revoked_at.is_some());
}

// ---------------------------------------------------------------------------
// Allow-list
// ---------------------------------------------------------------------------

fn worker_range(i: u8) -> String {
    format!("198.51.{i}.0/24")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_adds_and_membership_checks() {
    let fx = fixture(whitelist_settings());
    let service: Arc<GateService> = Arc::new(fx.service);

    let mut set = JoinSet::new();
    for i in 0..16u8 {
        let service = Arc::clone(&service);
        let literal = worker_range(i);
        set.spawn(async move { service.allow_ranges(&[literal], "bulk").await.map(|_| ()) });
    }
    for i in 0..16u8 {
        let service = Arc::clone(&service);
        set.spawn(async move { service.is_allowed(&format!("198.51.{i}.1")).await.map(|_| ()) });
    }

    while let Some(result) = set.join_next().await {
        result.expect("task panicked").expect("operation");
    }

    assert_eq!(service.list_ranges().await.expect("list").len(), 16);
    for i in 0..16u8 {
        let addr: IpAddr = format!("198.51.{i}.200").parse().expect("address");
        let decision = service.check_whitelist(addr).await.expect("check");
        assert_eq!(decision, Decision::Allow, "{addr}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn revocations_are_visible_after_concurrent_writes() {
    let fx = fixture(whitelist_settings());
    let service = Arc::new(fx.service);
    let ranges: Vec<String> = (0..16u8).map(worker_range).collect();
    service.allow_ranges(&ranges, "bulk").await.expect("add");

    let mut set = JoinSet::new();
    for i in (0..16u8).filter(|i| i % 2 == 0) {
        let service = Arc::clone(&service);
        set.spawn(async move {
            service.revoke_range(&format!("198.51.{i}.9")).await.map(|r| r.rows_affected)
        });
    }

    let mut affected = 0;
    while let Some(result) = set.join_next().await {
        affected += result.expect("task panicked").expect("revoke");
    }
    assert_eq!(affected, 8);

    for i in 0..16u8 {
        let allowed = service.is_allowed(&format!("198.51.{i}.9")).await.expect("check");
        assert_eq!(allowed, i % 2 == 1, "198.51.{i}.9");
    }
}
