//! Persistence and cache layer for the signgate access-control gateway.
//!
//! This crate owns the records the gate decides on and the discipline that
//! keeps hot reads off durable storage.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 signgate-authn (gate)                       │
//! │        AllowListStore │ TokenStore │ GateEngine             │
//! ├─────────────────────────────────────────────────────────────┤
//! │                      CacheAside                             │
//! │     get_or_load / peek / invalidate (JSON over strings)     │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │        CacheBackend          │        GateRepository        │
//! │   MemoryCacheBackend (moka)  │  MemoryRepository (testing)  │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use signgate_storage::{AuthToken, GateRepository, MemoryRepository};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let repo = MemoryRepository::new();
//!
//!     let token = AuthToken::builder()
//!         .token("b3BhcXVlLXZhbHVl".to_owned())
//!         .description("release pipeline")
//!         .build();
//!     let stored = repo.insert_token(token).await?;
//!
//!     let found = repo.find_token(&|t| t.id == stored.id).await?;
//!     assert_eq!(found.map(|t| t.description), Some("release pipeline".to_owned()));
//!     Ok(())
//! }
//! ```
//!
//! # Error Handling
//!
//! All operations return [`StorageResult<T>`]. Backends map their internal
//! errors to [`StorageError`] variants.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module with record builders, a
//!   read-counting repository wrapper, and assertion macros.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod cache_aside;
pub mod error;
pub mod memory;
pub mod repository;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod transaction;
pub mod types;

pub use cache::{CacheBackend, CacheConfig, CacheConfigBuilder, MemoryCacheBackend};
pub use cache_aside::CacheAside;
pub use error::{BoxError, ConfigError, StorageError, StorageResult};
pub use memory::MemoryRepository;
pub use repository::{GateRepository, RangePredicate, TokenPredicate};
pub use transaction::{Change, ChangeSet, SaveOutcome};
pub use types::{
    AllowListRange, AuthToken, RangeId, SYSTEM_TOKEN_DESCRIPTION, SYSTEM_TOKEN_ID,
    SYSTEM_TOKEN_VALUE, TokenId,
};
pub use zeroize::Zeroizing;
