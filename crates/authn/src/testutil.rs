//! Shared test utilities for gate testing.
//!
//! Builds a fully wired [`GateService`] over a read-counting repository and
//! provides a downstream operation that echoes what the pipeline resolved.
//! Feature-gated behind `testutil` to prevent leaking into production builds.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! signgate-authn = { path = "../authn", features = ["testutil"] }
//! ```
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use signgate_authn::testutil::{fixture, bearer};
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use signgate_storage::{CacheConfig, MemoryCacheBackend, testutil::CountingRepository};

use crate::{
    error::Result,
    pipeline::{GateRequest, GateResponse, RequestContext, RequestPipeline, SigningOperation},
    service::GateService,
    settings::GateSettings,
};

/// A service with handles on its collaborators.
#[derive(Debug, Clone)]
pub struct GateFixture {
    /// The service under test.
    pub service: GateService,
    /// The repository behind it, for read counts and fault switches.
    pub repo: CountingRepository,
    /// The cache backend behind it.
    pub backend: Arc<MemoryCacheBackend>,
}

impl GateFixture {
    /// A pipeline over this service in front of [`EchoOperation`].
    #[must_use]
    pub fn pipeline(&self) -> RequestPipeline {
        RequestPipeline::new(&self.service, Arc::new(EchoOperation))
    }
}

/// Builds a [`GateFixture`] for `settings`.
///
/// # Panics
///
/// Panics if `settings` fail validation.
#[must_use]
pub fn fixture(settings: GateSettings) -> GateFixture {
    let repo = CountingRepository::new();
    let backend = Arc::new(MemoryCacheBackend::new(&CacheConfig::default()));
    let service = GateService::new(settings, Arc::new(repo.clone()), backend.clone())
        .expect("fixture settings must be valid");
    GateFixture { service, repo, backend }
}

/// Whitelist on, authentication off.
#[must_use]
pub fn whitelist_settings() -> GateSettings {
    GateSettings {
        enable_ips_whitelist: true,
        enable_authentication: false,
        ..GateSettings::default()
    }
}

/// Formats a bearer `Authorization` header value.
#[must_use]
pub fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

/// Downstream operation that answers 200 with the resolved context:
/// `{ "caller": ..., "tokenId": ..., "tokenDescription": ... }`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoOperation;

#[async_trait]
impl SigningOperation for EchoOperation {
    async fn handle(
        &self,
        context: RequestContext,
        _request: GateRequest,
    ) -> Result<GateResponse> {
        let (token_id, description) = match context.identity {
            Some(identity) => (Some(identity.token_id.0), Some(identity.token_description)),
            None => (None, None),
        };
        Ok(GateResponse::ok(json!({
            "caller": context.caller.to_string(),
            "tokenId": token_id,
            "tokenDescription": description,
        })))
    }
}

/// Assert that a gate [`Result`](crate::Result) is an error matching a
/// pattern.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use signgate_authn::{assert_gate_err, GateError};
///
/// let result: signgate_authn::Result<()> = Err(GateError::Unauthorized);
/// assert_gate_err!(result, GateError::Unauthorized);
/// ```
#[macro_export]
macro_rules! assert_gate_err {
    ($result:expr, $pattern:pat) => {
        match $result {
            Err($pattern) => {},
            other => panic!("expected Err({}), got: {:?}", stringify!($pattern), other),
        }
    };
}
