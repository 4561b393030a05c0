//! Integration test verifying the gate's spans, audit events, and request
//! logs.

#![allow(clippy::expect_used, clippy::panic)]

use std::{
    collections::HashMap,
    fmt,
    net::{IpAddr, Ipv4Addr},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use signgate_authn::{
    GateError, GateRequest, GateResponse, GateSettings, RequestContext, RequestPipeline, Result,
    TokenRef,
    pipeline::{AUTHORIZATION, SigningOperation},
    testutil::{bearer, fixture, whitelist_settings},
};
use signgate_storage::StorageError;
use tracing::{
    Event, Level, Subscriber,
    field::{Field, Visit},
};
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};

// ---------------------------------------------------------------------------
// Collecting layer: records span names and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CapturedEvent {
    level: Level,
    fields: HashMap<String, String>,
}

impl CapturedEvent {
    fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_owned(), value.to_owned());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_owned(), format!("{value:?}"));
    }
}

#[derive(Clone, Default)]
struct Collector {
    spans: Arc<Mutex<Vec<String>>>,
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl<S> tracing_subscriber::Layer<S> for Collector
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        _attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            self.spans.lock().expect("lock poisoned").push(span.name().to_owned());
        }
    }

    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut fields = HashMap::new();
        event.record(&mut FieldVisitor(&mut fields));
        let captured = CapturedEvent { level: *event.metadata().level(), fields };
        self.events.lock().expect("lock poisoned").push(captured);
    }
}

fn install() -> (Collector, tracing::subscriber::DefaultGuard) {
    let collector = Collector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    (collector, tracing::subscriber::set_default(subscriber))
}

fn audit_events(collector: &Collector, action: &str) -> Vec<CapturedEvent> {
    let events = collector.events.lock().expect("lock poisoned");
    events.iter().filter(|e| e.field("audit.action") == Some(action)).cloned().collect()
}

fn request_logs(collector: &Collector) -> Vec<CapturedEvent> {
    let events = collector.events.lock().expect("lock poisoned");
    events
        .iter()
        .filter(|e| e.field("message").is_some_and(|m| m.starts_with("HTTP ")))
        .cloned()
        .collect()
}

/// Fails every call with an internal storage error.
struct Broken;

#[async_trait]
impl SigningOperation for Broken {
    async fn handle(&self, _: RequestContext, _: GateRequest) -> Result<GateResponse> {
        Err(GateError::from(StorageError::internal("signing backend unreachable")))
    }
}

fn remote() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))
}

// ---------------------------------------------------------------------------
// Spans
// ---------------------------------------------------------------------------

#[tokio::test]
async fn issue_token_creates_store_and_repository_spans() {
    let (collector, _guard) = install();

    let fx = fixture(GateSettings::default());
    fx.service.issue_token("spans").await.expect("issue should succeed");

    let recorded = collector.spans.lock().expect("lock poisoned");
    for name in ["issue", "save_changes", "list_active", "get_or_load"] {
        assert!(
            recorded.iter().any(|s| s == name),
            "expected a '{name}' span, got: {recorded:?}"
        );
    }
}

#[tokio::test]
async fn pipeline_creates_handle_and_stage_spans() {
    let (collector, _guard) = install();

    let fx = fixture(GateSettings { enable_ips_whitelist: true, ..GateSettings::default() });
    let _ = fx.pipeline().handle(GateRequest::new("POST", "/api/sign", remote())).await;

    let recorded = collector.spans.lock().expect("lock poisoned");
    assert!(recorded.iter().any(|s| s == "handle"), "expected a 'handle' span, got: {recorded:?}");
    assert!(
        recorded.iter().any(|s| s == "authenticate"),
        "expected an 'authenticate' span, got: {recorded:?}"
    );
}

// ---------------------------------------------------------------------------
// Audit events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn token_writes_emit_audit_events() {
    let (collector, _guard) = install();

    let fx = fixture(GateSettings::default());
    let issued = fx.service.issue_token("audited").await.expect("issue");
    fx.service.revoke_token(TokenRef::Id(issued.id)).await.expect("revoke");

    let resource = format!("token:{}", issued.id);
    for action in ["issue_token", "revoke_token"] {
        let events = audit_events(&collector, action);
        assert_eq!(events.len(), 1, "expected one '{action}' audit event");
        assert_eq!(events[0].level, Level::INFO);
        assert_eq!(events[0].field("audit.resource"), Some(resource.as_str()));
        assert_eq!(events[0].field("audit.result"), Some("success"));
    }
}

#[tokio::test]
async fn range_writes_emit_audit_events() {
    let (collector, _guard) = install();

    let fx = fixture(whitelist_settings());
    fx.service.allow_ranges(&["198.51.100.0/24"], "office").await.expect("add");
    fx.service.revoke_range("198.51.100.1").await.expect("revoke");

    assert_eq!(audit_events(&collector, "allow_ranges").len(), 1);
    assert_eq!(audit_events(&collector, "revoke_range").len(), 1);
}

#[tokio::test]
async fn token_values_never_reach_logs() {
    let (collector, _guard) = install();

    let fx = fixture(GateSettings::default());
    let issued = fx.service.issue_token("secret holder").await.expect("issue");
    let request = GateRequest::new("POST", "/api/sign", remote())
        .with_header(AUTHORIZATION, bearer(&issued.token));
    assert_eq!(fx.pipeline().handle(request).await.status, 200);
    fx.service
        .revoke_token(TokenRef::Token(issued.token.as_str().to_owned()))
        .await
        .expect("revoke");

    let events = collector.events.lock().expect("lock poisoned");
    assert!(!events.is_empty());
    for event in events.iter() {
        for value in event.fields.values() {
            assert!(!value.contains(issued.token.as_str()), "token leaked into {event:?}");
        }
    }
}

// ---------------------------------------------------------------------------
// Request logs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn forbidden_caller_is_warned_and_logged_at_info() {
    let (collector, _guard) = install();

    let fx = fixture(whitelist_settings());
    let response = fx.pipeline().handle(GateRequest::new("POST", "/api/sign", remote())).await;
    assert_eq!(response.status, 401);

    {
        let events = collector.events.lock().expect("lock poisoned");
        let warning = events
            .iter()
            .find(|e| e.field("message") == Some("request from remote address is forbidden"))
            .expect("forbidden warning");
        assert_eq!(warning.level, Level::WARN);
        assert_eq!(warning.field("remote_addr"), Some("203.0.113.9"));
    }

    let logs = request_logs(&collector);
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].level, Level::INFO);
    let message = logs[0].field("message").unwrap_or_default();
    assert!(message.starts_with("HTTP POST /api/sign responded 401"), "got: {message}");
}

#[tokio::test]
async fn server_errors_are_logged_at_error() {
    let (collector, _guard) = install();

    let settings = GateSettings { enable_authentication: false, ..GateSettings::default() };
    let fx = fixture(settings);
    let pipeline = RequestPipeline::new(&fx.service, Arc::new(Broken));
    let response = pipeline.handle(GateRequest::new("GET", "/api/status", remote())).await;
    assert_eq!(response.status, 500);

    let logs = request_logs(&collector);
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].level, Level::ERROR);
    assert_eq!(logs[0].field("status"), Some("500"));
}
