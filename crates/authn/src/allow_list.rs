//! Explicit IP allow-list.
//!
//! [`AllowListStore`] adds, revokes, and checks membership of operator
//! supplied ranges. Reserved networks (loopback, private blocks, CGNAT) are
//! not special here; their bypass lives in the [`engine`](crate::engine).
//!
//! # Membership
//!
//! [`is_allowed`](AllowListStore::is_allowed) scans the cached active list
//! linearly: O(n) per request in the number of active ranges. Allow-lists in
//! this domain hold tens to low thousands of entries, where a scan over a
//! contiguous `Vec` is cheaper than maintaining a sorted interval index.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    net::IpAddr,
    sync::Arc,
    time::Duration,
};

use fail::fail_point;
use serde::{Deserialize, Serialize};
use signgate_storage::{AllowListRange, CacheAside, ChangeSet, GateRepository};
use tracing::{trace, warn};

use crate::{
    error::{GateError, Result},
    range::{self, IpRange},
};

/// Cache key of the active-range list.
pub const RANGE_LIST_KEY: &str = "AllowedIPs.All";

/// Result of an allow request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowOutcome {
    /// Literals stored as new records.
    pub imported: usize,
    /// Literals that already had a record and were reactivated.
    pub already_allowed: usize,
}

/// Result of a revoke request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeRevocation {
    /// The address as submitted.
    pub address: String,
    /// `true` when at least one range was deactivated.
    pub is_revoked: bool,
    /// Number of ranges deactivated.
    pub rows_affected: usize,
}

/// Stores and checks allowed ranges.
///
/// # Cloning
///
/// Clones share the repository and the cache.
#[derive(Clone)]
pub struct AllowListStore {
    repo: Arc<dyn GateRepository>,
    cache: CacheAside,
    ttl: Duration,
}

impl AllowListStore {
    /// Creates a store over `repo`, caching the active list for `ttl`.
    pub fn new(repo: Arc<dyn GateRepository>, cache: CacheAside, ttl: Duration) -> Self {
        Self { repo, cache, ttl }
    }

    /// Every active range, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Storage`] if the repository or cache fails.
    #[tracing::instrument(skip(self))]
    pub async fn list_active(&self) -> Result<Vec<AllowListRange>> {
        let repo = Arc::clone(&self.repo);
        self.cache
            .get_or_load(RANGE_LIST_KEY, self.ttl, || async move {
                repo.list_ranges(&|r| r.is_active).await.map_err(GateError::from)
            })
            .await
    }

    /// Allows every literal in `literals` under `description`.
    ///
    /// The batch is validated as a whole before anything is written; the
    /// first malformed entry is reported with its 1-based position. A literal
    /// that already has a record (active or not) is reactivated with the new
    /// description. Repeats within one batch count once.
    ///
    /// # Errors
    ///
    /// - [`GateError::Validation`] if `literals` is empty or `description`
    ///   is blank
    /// - [`GateError::InvalidFormat`] naming the first bad entry
    #[tracing::instrument(skip(self, literals), fields(count = literals.len()))]
    pub async fn add<S: AsRef<str>>(
        &self,
        literals: &[S],
        description: &str,
    ) -> Result<AllowOutcome> {
        let entries =
            literals.iter().enumerate().map(|(i, literal)| (i + 1, literal.as_ref())).collect();
        self.add_entries(entries, description).await
    }

    /// Allows one literal per line of `text`.
    ///
    /// Lines are trimmed and blank lines skipped; reported positions are
    /// physical line numbers.
    ///
    /// # Errors
    ///
    /// Same as [`add`](Self::add).
    #[tracing::instrument(skip(self, text))]
    pub async fn add_from_lines(&self, text: &str, description: &str) -> Result<AllowOutcome> {
        let entries = text
            .lines()
            .enumerate()
            .filter_map(|(i, line)| {
                let line = line.trim();
                (!line.is_empty()).then_some((i + 1, line))
            })
            .collect();
        self.add_entries(entries, description).await
    }

    async fn add_entries(
        &self,
        entries: Vec<(usize, &str)>,
        description: &str,
    ) -> Result<AllowOutcome> {
        if entries.is_empty() {
            return Err(GateError::validation("IPs are required"));
        }
        let description = description.trim();
        if description.is_empty() {
            return Err(GateError::validation("Description is required"));
        }

        let mut parsed: Vec<(&str, IpRange)> = Vec::with_capacity(entries.len());
        let mut seen = HashSet::new();
        for (line, literal) in entries {
            let literal = literal.trim();
            let network = IpRange::parse(literal)
                .map_err(|_| GateError::invalid_format_at(literal, line))?;
            if seen.insert(literal) {
                parsed.push((literal, network));
            }
        }

        let existing: HashMap<String, AllowListRange> = self
            .repo
            .list_ranges(&|r| seen.contains(r.literal.as_str()))
            .await?
            .into_iter()
            .map(|r| (r.literal.clone(), r))
            .collect();

        let mut changes = ChangeSet::new();
        let mut outcome = AllowOutcome::default();
        let mut fresh = Vec::new();
        for (literal, network) in parsed {
            match existing.get(literal) {
                Some(record) => {
                    let mut record = record.clone();
                    record.is_active = true;
                    record.description = description.to_owned();
                    changes.update_range(record);
                    outcome.already_allowed += 1;
                },
                None => {
                    fresh.push(new_record(literal, &network, description));
                    outcome.imported += 1;
                },
            }
        }
        changes.insert_ranges(fresh);

        fail_point!("allow-list-before-save", |_| {
            let injected = signgate_storage::StorageError::connection("injected save failure");
            Err(GateError::from(injected))
        });
        self.repo.save_changes(changes).await?;
        self.invalidate_and_rewarm().await?;

        tracing::info!(
            audit.action = "allow_ranges",
            audit.resource = "allow_list",
            audit.result = "success",
            audit.imported = outcome.imported,
            audit.already_allowed = outcome.already_allowed,
            "audit_event"
        );
        Ok(outcome)
    }

    /// Deactivates every active range containing `address`, plus any active
    /// range whose literal equals it.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::InvalidFormat`] if `address` is not a single
    /// address.
    #[tracing::instrument(skip(self))]
    pub async fn revoke(&self, address: &str) -> Result<RangeRevocation> {
        let addr = range::parse_address(address)?;
        let (numeric, is_ipv6) = (range::to_numeric(addr), addr.is_ipv6());
        let literal = address.trim();

        let matching = self
            .repo
            .list_ranges(&|r| {
                r.is_active && (r.contains_numeric(numeric, is_ipv6) || r.literal == literal)
            })
            .await?;

        let mut rows_affected = 0;
        if !matching.is_empty() {
            let mut changes = ChangeSet::new();
            for mut record in matching {
                record.is_active = false;
                changes.update_range(record);
            }
            rows_affected = self.repo.save_changes(changes).await?.rows_affected;
        }
        self.cache.invalidate(RANGE_LIST_KEY).await?;

        tracing::info!(
            audit.action = "revoke_range",
            audit.resource = %addr,
            audit.result = "success",
            audit.rows_affected = rows_affected,
            "audit_event"
        );
        Ok(RangeRevocation {
            address: literal.to_owned(),
            is_revoked: rows_affected > 0,
            rows_affected,
        })
    }

    /// Returns `true` if some active range contains `address`.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::InvalidFormat`] if `address` is not a single
    /// address.
    pub async fn is_allowed(&self, address: &str) -> Result<bool> {
        let addr = range::parse_address(address)?;
        self.contains(addr).await
    }

    /// Returns `true` if some active range contains `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Storage`] if the repository or cache fails.
    #[tracing::instrument(skip(self))]
    pub async fn contains(&self, addr: IpAddr) -> Result<bool> {
        let addr = addr.to_canonical();
        let (numeric, is_ipv6) = (range::to_numeric(addr), addr.is_ipv6());
        let active = self.list_active().await?;
        let allowed = active.iter().any(|r| r.contains_numeric(numeric, is_ipv6));
        trace!(%addr, allowed, "allow-list lookup");
        Ok(allowed)
    }

    /// Loads the active list into the cache.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Storage`] if the repository or cache fails.
    pub async fn warm(&self) -> Result<usize> {
        self.list_active().await.map(|list| list.len())
    }

    async fn invalidate_and_rewarm(&self) -> Result<()> {
        self.cache.invalidate(RANGE_LIST_KEY).await?;
        if let Err(e) = self.warm().await {
            warn!(error = %e, "range list re-warm failed; next read reloads");
        }
        Ok(())
    }
}

impl fmt::Debug for AllowListStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllowListStore").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

fn new_record(literal: &str, network: &IpRange, description: &str) -> AllowListRange {
    let (first, last) = network.bounds();
    let (first_numeric, last_numeric) = network.numeric_bounds();
    AllowListRange::builder()
        .literal(literal)
        .description(description)
        .first_usable(first.to_string())
        .last_usable(last.to_string())
        .first_usable_numeric(first_numeric)
        .last_usable_numeric(last_numeric)
        .is_ipv6(network.is_ipv6())
        .build()
}
