pub mod check;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod tokens;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{connect_info::ConnectInfo, MatchedPath};
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::middleware::{from_fn, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use check::{check_token, session_valid};
use common_config::load;
use common_obs::{
    encode_prometheus_metrics, health_router, http_request_observe, ObsInit, SpanExt,
    PROMETHEUS_CONTENT_TYPE,
};
use common_session::{CosignClient, SessionValidator, ValidatorError};
use config::GatewayConfig;
use lifecycle::{shutdown_signal, Coordinator, Startup};
use tokens::TokenRegistry;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const SERVICE_NAME: &str = "auth-gateway";
const REQUEST_ID_HEADER: &str = "x-request-id";

const VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_SHA: &str = match option_env!("BUILD_SHA") {
    Some(value) => value,
    None => "dev",
};

/// Dependencies shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TokenRegistry>,
    pub validator: Arc<dyn SessionValidator>,
    /// Cookie that carries the caller's session identifier.
    pub session_cookie: String,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    check::register_metrics();

    let checks = Router::new()
        .route(
            "/check/:token_name/:token_key/:session_id",
            get(check_token),
        )
        .route("/session/valid", get(session_valid))
        .route("/cosign/valid", get(session_valid))
        .with_state(state);

    Router::new()
        .route("/metrics", get(metrics))
        .merge(health_router(SERVICE_NAME))
        .merge(checks)
        .layer(from_fn(request_context))
}

/// Load configuration, bring the gateway up and block until SIGINT/SIGTERM.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = load::<GatewayConfig>()?;
    ObsInit::init_with_level(SERVICE_NAME, config.log_level.as_deref())
        .map_err(|err| -> Box<dyn std::error::Error> { Box::new(err) })?;

    let addr = config.socket_addr()?;
    tracing::info!(
        event = "service_start",
        service = SERVICE_NAME,
        version = VERSION,
        build_sha = BUILD_SHA,
        listen_addr = %addr,
        cosign_addr = config.cosign.daemon_address.as_str(),
        "starting service"
    );

    let client_config = config.cosign.client_config();
    let startup = Startup {
        tokens: config.tokens.clone(),
        listen_addr: addr,
        session_cookie: client_config.cookie_name(),
    };
    let coordinator = Coordinator::new(config.shutdown_grace());
    let outcome = coordinator
        .run(
            startup,
            || async move {
                let client = CosignClient::connect(client_config).await?;
                Ok::<_, ValidatorError>(Arc::new(client) as Arc<dyn SessionValidator>)
            },
            shutdown_signal(),
        )
        .await
        .inspect_err(|err| tracing::error!(event = "service_failed", error = %err))?;

    tracing::info!(event = "service_stop", service = SERVICE_NAME, outcome = ?outcome);
    Ok(())
}

async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
        )],
        encode_prometheus_metrics(),
    )
}

/// Request id, span and access log for every request. Raw paths carry keys
/// and session ids, so only the matched route template is logged.
async fn request_context(mut req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let remote_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let request_id = match req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => value.to_string(),
        None => {
            let id = Uuid::new_v4().to_string();
            if let Ok(value) = HeaderValue::from_str(&id) {
                req.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
            id
        }
    };

    let span = info_span!(
        "http.request",
        method = %method,
        route = route.as_str(),
        remote_addr = remote_addr.as_str(),
        request_id = %request_id
    );
    span.with_req(&request_id);

    let start = Instant::now();
    let mut response = async {
        tracing::debug!(event = "request_start", method = %method, route = route.as_str());
        next.run(req).await
    }
    .instrument(span.clone())
    .await;

    let status = response.status();
    span.in_scope(|| {
        tracing::info!(
            event = "request_end",
            method = %method,
            route = route.as_str(),
            status = status.as_u16(),
            latency_ms = start.elapsed().as_secs_f64() * 1000.0,
            remote_addr = remote_addr.as_str()
        )
    });
    http_request_observe!(route.as_str(), status.as_str());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}
