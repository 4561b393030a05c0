//! Request pipeline in front of the signing operation.
//!
//! ```text
//! guard ─► request log ─► token stage ─► whitelist stage ─► SigningOperation
//! ```
//!
//! Every stage can end the chain with a [`GateError`]; only the guard turns
//! an error into a [`GateResponse`]. Transport (HTTP server, routing) stays
//! outside this crate: callers build a [`GateRequest`] from whatever they
//! receive and write the [`GateResponse`] back.

use std::{
    collections::HashMap,
    error::Error as _,
    fmt,
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    engine::GateEngine,
    error::{GateError, Result},
    range,
    service::GateService,
    tokens::Identity,
};

/// Header carrying the bearer credential.
pub const AUTHORIZATION: &str = "Authorization";

/// Header carrying the proxy chain.
pub const X_FORWARDED_FOR: &str = "X-Forwarded-For";

/// Requests slower than this are logged at WARN.
pub const SLOW_REQUEST_THRESHOLD: Duration = Duration::from_millis(1500);

/// An inbound request as seen by the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateRequest {
    /// Request method, for logging.
    pub method: String,
    /// Request path, for logging.
    pub path: String,
    /// Socket peer address.
    pub peer_addr: IpAddr,
    /// Request headers. Lookups are case-insensitive.
    pub headers: HashMap<String, String>,
    /// Opaque payload for the downstream operation.
    pub body: Vec<u8>,
}

impl GateRequest {
    /// Creates a request with no headers and an empty body.
    pub fn new(method: impl Into<String>, path: impl Into<String>, peer_addr: IpAddr) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            peer_addr,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// What the pipeline hands to the downstream operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Resolved caller address.
    pub caller: IpAddr,
    /// Authenticated principal; `None` when the token stage was disabled.
    pub identity: Option<Identity>,
}

/// The response written back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct GateResponse {
    /// Transport status code.
    pub status: u16,
    /// JSON body.
    pub body: serde_json::Value,
}

impl GateResponse {
    /// A 200 response with `body`.
    #[must_use]
    pub fn ok(body: serde_json::Value) -> Self {
        Self { status: 200, body }
    }

    /// Decodes the body as an [`ErrorBody`], if it is one.
    #[must_use]
    pub fn error_body(&self) -> Option<ErrorBody> {
        serde_json::from_value(self.body.clone()).ok()
    }
}

/// Body of every terminal error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Always `false`.
    pub success: bool,
    /// Caller-facing messages.
    pub errors: Vec<String>,
}

/// The operation the gate protects.
#[async_trait]
pub trait SigningOperation: Send + Sync {
    /// Handles a request that passed every gate stage.
    async fn handle(&self, context: RequestContext, request: GateRequest)
    -> Result<GateResponse>;
}

/// Composes the gate stages in front of a [`SigningOperation`].
#[derive(Clone)]
pub struct RequestPipeline {
    engine: GateEngine,
    downstream: Arc<dyn SigningOperation>,
    trust_forwarded_headers: bool,
    known_proxies: Vec<IpAddr>,
    debug_errors: bool,
}

impl RequestPipeline {
    /// Builds a pipeline from a configured service.
    pub fn new(service: &GateService, downstream: Arc<dyn SigningOperation>) -> Self {
        let settings = service.settings();
        Self {
            engine: service.engine().clone(),
            downstream,
            trust_forwarded_headers: settings.trust_forwarded_headers,
            known_proxies: settings.known_proxies.iter().map(|p| p.to_canonical()).collect(),
            debug_errors: settings.debug_errors,
        }
    }

    /// Runs the full chain. Never fails: errors become error responses.
    #[tracing::instrument(skip_all, fields(method = %request.method, path = %request.path))]
    pub async fn handle(&self, request: GateRequest) -> GateResponse {
        self.guard(request, None).await
    }

    /// Runs the full chain bounded by `deadline`.
    ///
    /// On expiry the chain is dropped and a 504 response returned. Every
    /// store write is a single atomic save, so nothing is half applied.
    #[tracing::instrument(skip_all, fields(method = %request.method, path = %request.path))]
    pub async fn handle_with_deadline(
        &self,
        request: GateRequest,
        deadline: Duration,
    ) -> GateResponse {
        self.guard(request, Some(deadline)).await
    }

    /// Resolves the caller address, honouring `X-Forwarded-For` when trusted.
    ///
    /// The header is read only when the peer is a known proxy, and then only
    /// its rightmost entry: the one that proxy appended itself. Entries to the
    /// left of it are client-supplied. A missing or malformed header falls
    /// back to the peer address.
    #[must_use]
    pub fn resolve_caller(&self, request: &GateRequest) -> IpAddr {
        let peer = request.peer_addr.to_canonical();
        if self.trust_forwarded_headers && self.known_proxies.contains(&peer) {
            let forwarded = request
                .header(X_FORWARDED_FOR)
                .and_then(|chain| chain.rsplit(',').next())
                .and_then(|last| range::parse_address(last).ok());
            if let Some(addr) = forwarded {
                return addr;
            }
        }
        peer
    }

    async fn guard(&self, request: GateRequest, deadline: Option<Duration>) -> GateResponse {
        let started = Instant::now();
        let method = request.method.clone();
        let path = request.path.clone();

        let outcome = match deadline {
            Some(deadline) => tokio::time::timeout(deadline, self.run(request))
                .await
                .unwrap_or(Err(GateError::Timeout)),
            None => self.run(request).await,
        };
        let response = match outcome {
            Ok(response) => response,
            Err(err) => self.error_response(&err),
        };

        log_request(&method, &path, response.status, started.elapsed());
        response
    }

    async fn run(&self, request: GateRequest) -> Result<GateResponse> {
        let caller = self.resolve_caller(&request);
        let identity = self.engine.authenticate(request.header(AUTHORIZATION)).await?;
        self.engine.enforce_whitelist(caller).await?;
        self.downstream.handle(RequestContext { caller, identity }, request).await
    }

    fn error_response(&self, err: &GateError) -> GateResponse {
        let status = err.status();
        if status >= 500 {
            error!(error = %err, status, "request failed");
        } else {
            debug!(error = %err, status, "request rejected");
        }

        let errors = match err.public_message() {
            Some(message) => vec![message],
            None if self.debug_errors => vec![error_chain(err)],
            None => Vec::new(),
        };
        let body = ErrorBody { success: false, errors };
        GateResponse {
            status,
            body: serde_json::to_value(body).unwrap_or(serde_json::Value::Null),
        }
    }
}

impl fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("trust_forwarded_headers", &self.trust_forwarded_headers)
            .field("known_proxies", &self.known_proxies)
            .field("debug_errors", &self.debug_errors)
            .finish_non_exhaustive()
    }
}

fn error_chain(err: &GateError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn log_request(method: &str, path: &str, status: u16, elapsed: Duration) {
    let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    if status > 499 {
        error!(
            method,
            path,
            status,
            elapsed_ms,
            "HTTP {method} {path} responded {status} in {elapsed_ms:.4} ms"
        );
    } else if elapsed > SLOW_REQUEST_THRESHOLD {
        warn!(
            method,
            path,
            status,
            elapsed_ms,
            "HTTP {method} {path} responded {status} in {elapsed_ms:.4} ms"
        );
    } else {
        info!(
            method,
            path,
            status,
            elapsed_ms,
            "HTTP {method} {path} responded {status} in {elapsed_ms:.4} ms"
        );
    }
}
