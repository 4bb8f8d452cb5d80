//! HTTP proxy layer: axum router, route handlers, and error mapping.
//!
//! Forwards `/v1/*` to the Clash of Clans API with a pooled key, exposes
//! rolling traffic statistics on `/stats` and a liveness message on `/`.

mod error;
pub mod forward;
pub mod rewrite;

pub use error::ApiError;
pub use forward::{Forwarder, RequestTimer};

use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    http::{
        HeaderValue, Method, StatusCode,
        header::{
            ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
            ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION, CONTENT_TYPE,
        },
    },
    response::{IntoResponse, Response},
    routing::{any, get},
};
use clashgate_metrics::{MetricsRing, StatsSnapshot};
use clashgate_pool::{KeyPool, RateLimiter};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    decompression::RequestDecompressionLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

/// Shared application state passed to all route handlers.
pub struct AppState {
    /// Credentials in rotation; refreshed out of band.
    pub pool: Arc<KeyPool>,
    /// Aggregate admission control, when enabled.
    pub limiter: Option<Arc<RateLimiter>>,
    /// Per-second request counts and latencies for `/stats`.
    pub metrics: Arc<MetricsRing>,
    pub forwarder: Forwarder,
    /// Gzip responses for clients that accept it.
    pub compress_responses: bool,
}

impl AppState {
    /// Creates the shared state with a fresh metrics ring.
    pub fn new(
        pool: Arc<KeyPool>,
        limiter: Option<Arc<RateLimiter>>,
        forwarder: Forwarder,
        compress_responses: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            limiter,
            metrics: Arc::new(MetricsRing::new()),
            forwarder,
            compress_responses,
        })
    }
}

/// Build the full axum router.
///
/// Routes:
/// - GET  /            liveness message
/// - GET  /stats       rolling request statistics
/// - ANY  /v1/{*path}  forwarded upstream
pub fn make_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION]);

    let compress = state.compress_responses;
    let router = Router::new()
        .route("/", get(root))
        .route("/stats", get(stats))
        .route("/v1/{*path}", any(proxy))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(
                    TraceLayer::new_for_http().make_span_with(|req: &Request| {
                        let request_id = req
                            .headers()
                            .get("x-request-id")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default();
                        tracing::info_span!(
                            "request",
                            method = %req.method(),
                            path = req.uri().path(),
                            request_id,
                        )
                    }),
                )
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(cors)
                .layer(RequestDecompressionLayer::new()),
        );

    if compress {
        router.layer(CompressionLayer::new())
    } else {
        router
    }
}

async fn root() -> Json<Value> {
    Json(json!({ "message": "Clash of Clans proxy is running." }))
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsSnapshot> {
    Json(state.metrics.snapshot())
}

/// `OPTIONS` without a CORS preflight header still gets the CORS answer
/// and never reaches the upstream.
fn options_response() -> Response {
    (
        StatusCode::OK,
        [
            (ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*")),
            (
                ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("GET, POST, OPTIONS"),
            ),
            (
                ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("Content-Type, Authorization"),
            ),
        ],
    )
        .into_response()
}

/// Admission, key draw, forward. Rejected requests never touch the pool,
/// the upstream or the metrics.
async fn proxy(State(state): State<Arc<AppState>>, req: Request<Body>) -> Result<Response, ApiError> {
    if req.method() == Method::OPTIONS {
        return Ok(options_response());
    }
    if let Some(limiter) = &state.limiter {
        limiter.acquire().await.inspect_err(|_| {
            tracing::debug!(path = req.uri().path(), "rate limited");
        })?;
    }
    let key = state.pool.next();
    let timer = RequestTimer::start(Arc::clone(&state.metrics));
    state
        .forwarder
        .forward(req, &key, timer)
        .await
        .map_err(ApiError::from)
}
