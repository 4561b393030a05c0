//! # signgate access-control gate
//!
//! Decides, for every request to the file-signing service, whether the
//! caller's address is allowed and whether it presented a valid bearer
//! token, and manages the allow-list and the tokens themselves.
//!
//! This crate provides:
//! - **Range math**: CIDR parsing, usable bounds, numeric membership ([`range`])
//! - **Allow-list store**: add, revoke, and check ranges ([`AllowListStore`])
//! - **Token store**: issue, revoke, and validate tokens ([`TokenStore`])
//! - **Gate engine**: the whitelist and token stages ([`GateEngine`])
//! - **Request pipeline**: guard, logging, stages, downstream ([`RequestPipeline`])
//!
//! Records and caching live in `signgate-storage`.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use signgate_authn::{GateService, GateSettings, RequestPipeline};
//! use signgate_authn::pipeline::{GateRequest, SigningOperation};
//! use signgate_storage::{MemoryCacheBackend, MemoryRepository};
//!
//! # async fn example(signer: Arc<dyn SigningOperation>) -> signgate_authn::Result<()> {
//! let settings: GateSettings = serde_json::from_str(r#"{ "EnableIPsWhitelist": true }"#)
//!     .map_err(|e| signgate_authn::GateError::invalid_configuration(e.to_string()))?;
//! let backend = Arc::new(MemoryCacheBackend::new(&settings.cache.cache_config()?));
//! let service = GateService::new(settings, Arc::new(MemoryRepository::new()), backend)?;
//! service.warm().await?;
//!
//! let pipeline = RequestPipeline::new(&service, signer);
//! let request = GateRequest::new("POST", "/api/sign", "203.0.113.7".parse().unwrap())
//!     .with_header("Authorization", "Bearer <token>");
//! let response = pipeline.handle(request).await;
//! assert_eq!(response.status, 401);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Explicit IP allow-list.
pub mod allow_list;
/// Per-request gate decisions.
pub mod engine;
/// Gate error types.
pub mod error;
/// Request pipeline.
pub mod pipeline;
/// Address and CIDR arithmetic.
pub mod range;
/// Produced interface facade.
pub mod service;
/// Gate configuration.
pub mod settings;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;
/// Bearer-token lifecycle.
pub mod tokens;

// Re-export key types for convenience
pub use allow_list::{AllowListStore, AllowOutcome, RANGE_LIST_KEY, RangeRevocation};
pub use engine::{Decision, GateEngine};
pub use error::{GateError, Result};
pub use pipeline::{ErrorBody, GateRequest, GateResponse, RequestContext, RequestPipeline};
pub use range::IpRange;
pub use service::{GateService, TokenRef};
pub use settings::{CacheSettings, GateSettings};
pub use tokens::{Identity, IssuedToken, TOKEN_LIST_KEY, TokenStore};
