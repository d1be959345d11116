use std::{
    collections::HashMap,
    fmt, io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use axum::{routing::get, Json, Router};
use once_cell::sync::OnceCell;
use serde_json::{json, Map, Value};
use tracing::{self, field::Visit, span};
use tracing_subscriber::{
    fmt::{self as tsfmt, format::Writer, FmtContext, FormatEvent, FormatFields, MakeWriter},
    layer::{Context, Layer, SubscriberExt},
    registry::{LookupSpan, SpanRef},
    filter::LevelFilter,
    EnvFilter, Registry,
};

#[derive(Debug, thiserror::Error)]
pub enum ObsInitError {
    #[error("tracing subscriber already initialized")]
    AlreadyInitialized,
    #[error("invalid log level {level:?}: {reason}")]
    InvalidLevel { level: String, reason: String },
    #[error("failed to install tracing subscriber: {0}")]
    Install(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Initialize observability for a service.
pub struct ObsInit;

impl ObsInit {
    /// Install a global tracing subscriber with JSON output, trace propagation,
    /// and the default metrics provider.
    pub fn init(service: &str) -> Result<(), ObsInitError> {
        Self::init_with_level(service, None)
    }

    /// Like [`ObsInit::init`], with a configured level used when `RUST_LOG` is
    /// not set. A configured level that does not parse is an error.
    pub fn init_with_level(service: &str, level: Option<&str>) -> Result<(), ObsInitError> {
        let filter = Self::env_filter(level)?;
        let subscriber = Self::subscriber_with_filter(service, filter, io::stderr);
        tracing::subscriber::set_global_default(subscriber).map_err(|err| {
            if tracing::dispatcher::has_been_set() {
                ObsInitError::AlreadyInitialized
            } else {
                ObsInitError::Install(err)
            }
        })
    }

    /// Build a tracing subscriber using the provided writer.
    pub fn subscriber_with_writer<W>(service: &str, writer: W) -> impl tracing::Subscriber
    where
        W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
    {
        let filter = Self::env_filter(None).unwrap_or_else(|_| EnvFilter::new("info"));
        Self::subscriber_with_filter(service, filter, writer)
    }

    fn subscriber_with_filter<W>(
        service: &str,
        filter: EnvFilter,
        writer: W,
    ) -> impl tracing::Subscriber
    where
        W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
    {
        metrics::init(service);

        let service_name: Arc<str> = Arc::from(service);
        let fmt_layer = tsfmt::layer()
            .with_ansi(false)
            .event_format(ObsJsonFormat { service: service_name })
            .with_writer(writer);

        Registry::default()
            .with(filter)
            .with(TraceLayer::new())
            .with(fmt_layer)
    }

    fn env_filter(level: Option<&str>) -> Result<EnvFilter, ObsInitError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }

        if let Some(level) = level.filter(|level| !level.trim().is_empty()) {
            let parsed = level
                .trim()
                .parse::<LevelFilter>()
                .map_err(|err| ObsInitError::InvalidLevel {
                    level: level.to_string(),
                    reason: err.to_string(),
                })?;
            return Ok(EnvFilter::default().add_directive(parsed.into()));
        }

        let fallback = std::env::var("LOG_LEVEL").unwrap_or_else(|_| {
            if cfg!(debug_assertions) {
                "debug".to_string()
            } else {
                "info".to_string()
            }
        });
        Ok(EnvFilter::try_new(fallback).unwrap_or_else(|_| EnvFilter::new("info")))
    }
}

/// Build a simple health and info router for services.
pub fn health_router(service: &'static str) -> Router {
    let health_handler =
        get(move || async move { Json(json!({ "status": "ok", "service": service })) });

    let info_handler = {
        let version = env!("CARGO_PKG_VERSION");
        get(move || async move { Json(json!({ "service": service, "version": version })) })
    };

    Router::new()
        .route("/health", health_handler.clone())
        .route("/v1/health", health_handler)
        .route("/info", info_handler.clone())
        .route("/v1/info", info_handler)
}

/// Helper trait for request scoped metadata.
pub trait SpanExt {
    /// Record a request identifier on the span so that subsequent logs emit it.
    fn with_req(&self, request_id: &str);

    /// Retrieve the active trace identifier for the span.
    fn trace_id(&self) -> Option<String>;
}

impl SpanExt for tracing::Span {
    fn with_req(&self, request_id: &str) {
        if let (Some(id), Some(state)) = (self.id(), TRACE_STATE.get()) {
            state.set_request_id(id.into_u64(), request_id);
        }
    }

    fn trace_id(&self) -> Option<String> {
        let id = self.id()?;
        TRACE_STATE.get()?.trace_id(id.into_u64())
    }
}

struct TraceLayer {
    state: Arc<TraceState>,
}

impl TraceLayer {
    fn new() -> Self {
        let state = TRACE_STATE
            .get_or_init(|| Arc::new(TraceState::default()))
            .clone();
        Self { state }
    }
}

impl<S> Layer<S> for TraceLayer
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_new_span(
        &self,
        _attrs: &tracing::span::Attributes<'_>,
        id: &span::Id,
        ctx: Context<'_, S>,
    ) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut inherited = None;
        if let Some(parent) = span.parent() {
            inherited = parent.extensions().get::<Arc<TraceContext>>().cloned();
        }
        let trace_ctx = inherited.unwrap_or_else(|| Arc::new(self.state.make_context()));

        span.extensions_mut().insert(trace_ctx.clone());
        self.state.insert(id.into_u64(), trace_ctx);
    }

    fn on_close(&self, id: span::Id, _: Context<'_, S>) {
        self.state.remove(id.into_u64());
    }
}

#[derive(Default)]
struct TraceState {
    counter: AtomicU64,
    contexts: Mutex<HashMap<u64, Arc<TraceContext>>>,
}

impl TraceState {
    fn make_context(&self) -> TraceContext {
        let id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        TraceContext {
            trace_id: format!("{:016x}", id),
            request_id: RwLock::new(None),
        }
    }

    fn insert(&self, span_id: u64, ctx: Arc<TraceContext>) {
        self.contexts
            .lock()
            .expect("lock poisoned")
            .insert(span_id, ctx);
    }

    fn remove(&self, span_id: u64) {
        self.contexts.lock().expect("lock poisoned").remove(&span_id);
    }

    fn get(&self, span_id: u64) -> Option<Arc<TraceContext>> {
        self.contexts
            .lock()
            .expect("lock poisoned")
            .get(&span_id)
            .cloned()
    }

    fn set_request_id(&self, span_id: u64, request_id: &str) {
        if let Some(ctx) = self.get(span_id) {
            *ctx.request_id.write().expect("lock poisoned") = Some(request_id.to_string());
        }
    }

    fn trace_id(&self, span_id: u64) -> Option<String> {
        self.get(span_id).map(|ctx| ctx.trace_id.clone())
    }
}

struct TraceContext {
    trace_id: String,
    request_id: RwLock<Option<String>>,
}

static TRACE_STATE: OnceCell<Arc<TraceState>> = OnceCell::new();

/// One JSON object per event: level, target, service, trace/request ids and
/// the event's fields.
struct ObsJsonFormat {
    service: Arc<str>,
}

impl<S, N> FormatEvent<S, N> for ObsJsonFormat
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let mut visitor = JsonFieldVisitor::default();
        event.record(&mut visitor);

        let mut trace_id = Value::Null;
        let mut request_id = Value::Null;
        if let Some(trace) = ctx.lookup_current().and_then(find_trace_ctx) {
            trace_id = Value::from(trace.trace_id.clone());
            let current = trace.request_id.read().expect("lock poisoned").clone();
            if let Some(id) = current {
                request_id = Value::from(id);
            }
        }

        let line = json!({
            "level": metadata.level().as_str().to_ascii_lowercase(),
            "target": metadata.target(),
            "service": &*self.service,
            "trace_id": trace_id,
            "request_id": request_id,
            "fields": Value::Object(visitor.fields),
        });
        writeln!(writer, "{}", line)
    }
}

fn find_trace_ctx<S>(span: SpanRef<'_, S>) -> Option<Arc<TraceContext>>
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
{
    for scope_span in span.scope().from_root() {
        let extensions = scope_span.extensions();
        if let Some(ctx) = extensions.get::<Arc<TraceContext>>() {
            return Some(ctx.clone());
        }
    }
    None
}

#[derive(Default)]
struct JsonFieldVisitor {
    fields: Map<String, Value>,
}

impl Visit for JsonFieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        self.fields
            .insert(field.name().to_string(), Value::from(format!("{:?}", value)));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.fields
            .insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), Value::from(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), Value::from(value));
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.fields
            .insert(field.name().to_string(), Value::from(value));
    }
}

mod metrics;

pub use metrics::{
    encode_prometheus as encode_prometheus_metrics, http_requests_total, register_counter,
    service_name, Counter, CounterVec, PROMETHEUS_CONTENT_TYPE,
};

#[macro_export]
macro_rules! http_request_observe {
    ($route:expr, $code:expr) => {{
        if let Some(service) = $crate::service_name() {
            $crate::http_requests_total().inc(&[service, $route, $code], 1);
        }
    }};
}
