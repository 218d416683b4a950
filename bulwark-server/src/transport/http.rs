//! HTTP guard and operational API
//!
//! [`guard`] is an axum middleware that puts every request through the
//! concurrency gate and then the rate limiter before the handler runs.
//! Applications mount their own routes behind it with [`protect`].
//!
//! # Rejections
//!
//! - `503 Service Unavailable` with `Retry-After` when too many requests are
//!   in flight
//! - `429 Too Many Requests` with `Retry-After`, `X-RateLimit-Limit`,
//!   `X-RateLimit-Remaining` and `X-RateLimit-Reset` when the caller's window
//!   is spent
//!
//! Admitted responses carry the `X-RateLimit-*` headers too.
//!
//! # API Endpoints
//!
//! ## GET /health
//!
//! Component status. Always `200`: the coordination store is not
//! authoritative, so losing it degrades the service without failing it.
//!
//! ```json
//! {
//!   "status": "degraded",
//!   "store": { "status": "reconnecting", "healthy": false, "reconnect_attempts": 3, "last_error": "..." },
//!   "cache": { "enabled": true, "healthy": false },
//!   "backpressure": { "active": 2, "max": 1000, "state": "normal", "rejected": 0 }
//! }
//! ```
//!
//! ## GET /metrics
//!
//! Prometheus text exposition.
//!
//! ## GET /ratelimit/{key}
//!
//! Current window for a tracking key without consuming budget. Optional
//! `limit` and `window` query parameters override the default policy.
//!
//! ## DELETE /ratelimit/{key}
//!
//! Forget a tracking key's window. Responds `{"reset": true|false}`.
//!
//! ## POST /cache/invalidate
//!
//! `{"pattern": "entity:7:*"}` → `{"removed": 3}`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::Router;
use axum::routing::{get, post};
use bulwark::{BackpressureController, KeyDeriver, RatePolicy};
use bulwark_client::SharedStore;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::CacheLayer;
use crate::config::Config;
use crate::limiter::{RateDecision, RateLimiter};
use crate::metrics::Metrics;
use crate::policy::RoutePolicies;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Authenticated caller, inserted as a request extension by the
/// authentication layer in front of the guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity(pub String);

/// Everything the guard and the operational endpoints share
pub struct AppState {
    pub store: SharedStore,
    pub cache: CacheLayer,
    pub limiter: RateLimiter,
    pub backpressure: BackpressureController,
    pub policies: RoutePolicies,
    pub keys: KeyDeriver,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn from_config(config: &Config, store: SharedStore) -> Self {
        let metrics = Arc::new(Metrics::new());

        Self {
            cache: CacheLayer::new(store.clone(), config.cache.clone()).with_metrics(metrics.clone()),
            limiter: RateLimiter::new(store.clone(), metrics.clone()),
            backpressure: BackpressureController::new(config.max_concurrent),
            policies: config.rate.policies(),
            keys: KeyDeriver::new(config.keys.salt.clone())
                .trust_forwarded(config.keys.trust_forwarded),
            store,
            metrics,
        }
    }
}

/// Outward-facing refusals, always with retry metadata
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    CapacityExceeded { retry_after: Duration },
    RateExceeded(RateDecision),
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct HttpErrorResponse {
    pub error: String,
    pub retry_after: u64,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Rejection::CapacityExceeded { retry_after } => {
                let secs = retry_after.as_secs().max(1);
                let mut response = (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(HttpErrorResponse {
                        error: "Server is at capacity".to_string(),
                        retry_after: secs,
                    }),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(secs));
                response
            }
            Rejection::RateExceeded(decision) => {
                let secs = decision.retry_after.unwrap_or(1);
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(HttpErrorResponse {
                        error: "Rate limit exceeded".to_string(),
                        retry_after: secs,
                    }),
                )
                    .into_response();
                let headers = response.headers_mut();
                headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
                insert_rate_headers(headers, &decision);
                response
            }
        }
    }
}

fn insert_rate_headers(headers: &mut HeaderMap, decision: &RateDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at));
}

/// Admission middleware: backpressure first, then the caller's rate window
///
/// The permit is held until the inner handler has produced its response and
/// is released on every path, including cancellation of the request future.
pub async fn guard(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, Rejection> {
    let permit = match state.backpressure.admit() {
        Ok(permit) => permit,
        Err(e) => {
            state.metrics.record_admission(false);
            return Err(Rejection::CapacityExceeded {
                retry_after: e.retry_after,
            });
        }
    };
    state.metrics.record_admission(true);

    let (key, policy) = {
        let route = state.policies.resolve(request.uri().path());
        let identity = request.extensions().get::<Identity>().map(|i| i.0.as_str());
        let forwarded = request
            .headers()
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok());
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip());

        let key = state.keys.derive(identity, forwarded, peer);
        let key = match route.scope {
            Some(scope) => format!("{key}:{scope}"),
            None => key,
        };
        (key, route.policy)
    };

    let decision = state.limiter.check_and_consume(&key, policy).await;
    if !decision.allowed {
        return Err(Rejection::RateExceeded(decision));
    }

    let mut response = next.run(request).await;
    insert_rate_headers(response.headers_mut(), &decision);
    permit.release();
    Ok(response)
}

/// Put `routes` behind the guard
pub fn protect(routes: Router<Arc<AppState>>, state: Arc<AppState>) -> Router<Arc<AppState>> {
    routes.route_layer(middleware::from_fn_with_state(state, guard))
}

/// Operational router: health and metrics unguarded, admin endpoints guarded
pub fn router(state: Arc<AppState>) -> Router {
    let admin = Router::new()
        .route("/ratelimit/{key}", get(peek_rate_limit).delete(reset_rate_limit))
        .route("/cache/invalidate", post(invalidate_cache));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(protect(admin, state.clone()))
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub store: StoreHealth,
    pub cache: CacheHealth,
    pub backpressure: BackpressureHealth,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreHealth {
    pub status: String,
    pub healthy: bool,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CacheHealth {
    pub enabled: bool,
    pub healthy: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BackpressureHealth {
    pub active: usize,
    pub max: usize,
    pub state: String,
    pub rejected: u64,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let store = state.store.state();
    let cache_healthy = state.cache.health_status();
    let cache_enabled = state.cache.settings().enabled;
    let stats = state.backpressure.stats();

    let degraded = !store.healthy || (cache_enabled && !cache_healthy);

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" }.to_string(),
        store: StoreHealth {
            status: store.status.as_str().to_string(),
            healthy: store.healthy,
            reconnect_attempts: store.reconnect_attempts,
            last_error: store.last_error.map(|e| e.message),
        },
        cache: CacheHealth {
            enabled: cache_enabled,
            healthy: cache_healthy,
        },
        backpressure: BackpressureHealth {
            active: stats.active,
            max: stats.max,
            state: stats.state.as_str().to_string(),
            rejected: stats.rejected,
        },
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state
        .metrics
        .export_prometheus(&state.backpressure.stats(), state.store.is_healthy());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

#[derive(Debug, Deserialize)]
pub struct PeekParams {
    pub limit: Option<u32>,
    pub window: Option<u64>,
}

async fn peek_rate_limit(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(params): Query<PeekParams>,
) -> Result<Json<RateDecision>, (StatusCode, Json<ApiError>)> {
    let default = state.policies.default_policy();
    let limit = params.limit.unwrap_or(default.limit);
    let window = params.window.map(Duration::from_secs).unwrap_or(default.window);
    if limit == 0 || window.is_zero() {
        return Err(bad_request("limit and window must be positive"));
    }

    Ok(Json(
        state
            .limiter
            .peek(&key, RatePolicy::new(limit, window))
            .await,
    ))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResetResponse {
    pub reset: bool,
}

async fn reset_rate_limit(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Json<ResetResponse> {
    let reset = state.limiter.reset(&key).await;
    info!(key = %key, reset, "Rate limit window reset");
    Json(ResetResponse { reset })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvalidateRequest {
    pub pattern: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvalidateResponse {
    pub removed: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
}

fn bad_request(message: &str) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError {
            error: message.to_string(),
        }),
    )
}

async fn invalidate_cache(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>, (StatusCode, Json<ApiError>)> {
    if req.pattern.trim().is_empty() {
        return Err(bad_request("pattern must not be empty"));
    }

    let removed = state.cache.invalidate_pattern(&req.pattern).await;
    Ok(Json(InvalidateResponse { removed }))
}

/// HTTP server for the operational router
pub struct HttpTransport {
    addr: SocketAddr,
}

impl HttpTransport {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let addr = format!("{host}:{port}")
            .parse()
            .with_context(|| format!("Invalid HTTP address {host}:{port}"))?;
        Ok(Self { addr })
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests
    pub async fn serve(
        self,
        state: Arc<AppState>,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let app = router(state);

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.addr))?;
        info!("HTTP server listening on {}", self.addr);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        info!("HTTP server stopped");
        Ok(())
    }
}
