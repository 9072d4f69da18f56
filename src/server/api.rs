//! Admin HTTP API over one cache registry.
//!
//! - GET /health
//! - GET /metrics
//! - GET /v1/caches
//! - GET /v1/caches/{name}/stats
//! - GET|PUT|DELETE /v1/caches/{name}/keys/{key}
//! - DELETE /v1/caches/{name}/keys?pattern=<glob>

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::cache::registry::{CacheHandle, CacheRegistry, GlobalStats};
use crate::cache::semantic::DedupOutcome;
use crate::cache::single_flight::FlightStats;
use crate::cache::store::CacheStats;
use crate::cache::tiered::TierStats;
use crate::cache::traits::{Cache, CacheExt, EnhancedCache};
use crate::config::CacheKind;
use crate::error::CacheError;
use crate::server::metrics::CacheMetrics;

/// Application state shared across handlers.
pub struct AppState {
    pub registry: Arc<CacheRegistry>,
    pub metrics: CacheMetrics,
    pub start_time: Instant,
}

/// Build the axum router with all admin routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/caches", get(list_caches))
        .route("/v1/caches/{name}/stats", get(cache_stats))
        .route("/v1/caches/{name}/keys", delete(delete_pattern))
        .route(
            "/v1/caches/{name}/keys/{key}",
            get(get_key).put(put_key).delete(delete_key),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Errors ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    UnknownCache(String),
    Cache(CacheError),
    Internal(String),
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        ApiError::Cache(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::UnknownCache(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Cache(err) => match err {
                CacheError::KeyNotFound(_) => StatusCode::NOT_FOUND,
                CacheError::InvalidConfiguration(_) => StatusCode::BAD_REQUEST,
                CacheError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                CacheError::ConnectionFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
                CacheError::Serialization(_) | CacheError::Deserialization(_) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                CacheError::CapacityExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
                CacheError::Compute(_) | CacheError::FlightAborted(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::UnknownCache(name) => format!("Unknown cache: {name}"),
            ApiError::Cache(err) => err.to_string(),
            ApiError::Internal(msg) => msg.clone(),
        };
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %message, "Request failed");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn lookup(state: &AppState, name: &str) -> ApiResult<CacheHandle> {
    state
        .registry
        .get(name)
        .ok_or_else(|| ApiError::UnknownCache(name.to_string()))
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub caches: usize,
}

#[derive(Debug, Serialize)]
pub struct CacheSummary {
    pub name: String,
    pub kind: CacheKind,
    pub stats: CacheStats,
}

#[derive(Debug, Serialize)]
pub struct CacheListResponse {
    pub global: GlobalStats,
    pub caches: Vec<CacheSummary>,
}

#[derive(Debug, Serialize)]
pub struct CacheDetailResponse {
    pub name: String,
    pub kind: CacheKind,
    pub stats: CacheStats,
    pub tiers: Vec<TierStats>,
    pub promotions: u64,
    pub degraded_operations: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flights: Option<FlightStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deduplicated: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PutParams {
    /// TTL in seconds; absent means the cache default.
    pub ttl_secs: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct PutResponse {
    pub stored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
}

#[derive(Debug, Deserialize)]
pub struct PatternParams {
    pub pattern: String,
}

#[derive(Debug, Serialize)]
pub struct PatternDeleteResponse {
    pub removed: usize,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        caches: state.registry.len(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    state.metrics.refresh(&state.registry);
    let body = state
        .metrics
        .render()
        .map_err(|e| ApiError::Internal(format!("Failed to encode metrics: {e}")))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    ))
}

async fn list_caches(State(state): State<Arc<AppState>>) -> Json<CacheListResponse> {
    let caches = state
        .registry
        .names()
        .into_iter()
        .filter_map(|name| state.registry.get(&name))
        .map(|handle| CacheSummary {
            name: handle.name().to_string(),
            kind: handle.kind(),
            stats: handle.stats(),
        })
        .collect();

    Json(CacheListResponse {
        global: state.registry.global_stats(),
        caches,
    })
}

async fn cache_stats(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<CacheDetailResponse>> {
    let handle = lookup(&state, &name)?;
    let tiered = handle.tiered();
    let (flights, deduplicated) = match &handle {
        CacheHandle::SingleFlight(cache) => (Some(cache.flight_stats()), None),
        CacheHandle::Semantic(cache) => (None, Some(cache.deduplicated())),
        CacheHandle::Basic(_) | CacheHandle::MultiTier(_) => (None, None),
    };

    Ok(Json(CacheDetailResponse {
        name,
        kind: handle.kind(),
        stats: handle.stats(),
        tiers: tiered.tier_stats(),
        promotions: tiered.promotions(),
        degraded_operations: tiered.degraded_operations(),
        flights,
        deduplicated,
    }))
}

async fn get_key(
    State(state): State<Arc<AppState>>,
    Path((name, key)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let cache = lookup(&state, &name)?.as_cache();
    cache
        .get::<Value>(&key)
        .await?
        .map(Json)
        .ok_or(ApiError::Cache(CacheError::KeyNotFound(key)))
}

async fn put_key(
    State(state): State<Arc<AppState>>,
    Path((name, key)): Path<(String, String)>,
    Query(params): Query<PutParams>,
    Json(value): Json<Value>,
) -> ApiResult<(StatusCode, Json<PutResponse>)> {
    let ttl = params
        .ttl_secs
        .map(|secs| {
            Duration::try_from_secs_f64(secs).map_err(|e| {
                CacheError::InvalidConfiguration(format!("invalid ttl_secs {secs}: {e}"))
            })
        })
        .transpose()?;

    let response = match lookup(&state, &name)? {
        CacheHandle::Semantic(cache) => {
            match cache.set_with_deduplication(&key, &value, ttl, None).await? {
                DedupOutcome::Stored => PutResponse {
                    stored: true,
                    duplicate_of: None,
                    similarity: None,
                },
                DedupOutcome::Duplicate {
                    existing_key,
                    similarity,
                } => PutResponse {
                    stored: false,
                    duplicate_of: Some(existing_key),
                    similarity: Some(similarity),
                },
            }
        }
        handle => {
            handle.as_cache().set(&key, &value, ttl).await?;
            PutResponse {
                stored: true,
                duplicate_of: None,
                similarity: None,
            }
        }
    };

    let status = if response.stored {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)))
}

async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path((name, key)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let cache = lookup(&state, &name)?.as_cache();
    cache.remove_strict(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_pattern(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<PatternParams>,
) -> ApiResult<Json<PatternDeleteResponse>> {
    let cache = lookup(&state, &name)?.as_cache();
    let removed = cache.delete_pattern(&params.pattern).await?;
    info!(cache = %name, pattern = %params.pattern, removed, "Pattern delete via API");
    Ok(Json(PatternDeleteResponse { removed }))
}
