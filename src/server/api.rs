//! Admin HTTP API over a registered cache engine.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::cache::engine::{CacheEngine, EngineStats};
use crate::cache::hasher::TokenId;
use crate::cache::registry::CacheEngineRegistry;
use crate::server::metrics::ServerMetrics;

/// Shared application state.
pub struct AppState {
    pub registry: Arc<CacheEngineRegistry>,
    /// Engine served when a request names none.
    pub instance_id: String,
    pub metrics: ServerMetrics,
    pub start_time: Instant,
}

impl AppState {
    fn engine(&self, instance_id: Option<&str>) -> Result<Arc<CacheEngine>, StatusCode> {
        let id = instance_id.unwrap_or(&self.instance_id);
        self.registry.get(id).ok_or(StatusCode::NOT_FOUND)
    }
}

/// Build the axum router with all admin routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/v1/cache/lookup", post(lookup))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub instances: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    pub instance_id: String,
    pub model_name: String,
    pub chunk_size: usize,
    pub engine: EngineStats,
    pub tiers: Vec<TierStatsResponse>,
}

#[derive(Debug, Serialize)]
pub struct TierStatsResponse {
    pub name: String,
    pub chunk_count: usize,
    pub bytes_used: usize,
    pub capacity: usize,
    pub utilization: f64,
}

#[derive(Debug, Deserialize)]
pub struct LookupRequest {
    pub tokens: Vec<TokenId>,
    #[serde(default)]
    pub instance_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LookupResponse {
    pub cached_tokens: usize,
    pub total_tokens: usize,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        instances: state.registry.instance_ids(),
    })
}

async fn cache_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CacheStatsResponse>, StatusCode> {
    let engine = state.engine(None)?;
    let tiers = engine
        .backend_stats()
        .iter()
        .map(|stats| TierStatsResponse {
            name: stats.tier.to_string(),
            chunk_count: stats.chunk_count,
            bytes_used: stats.bytes_used,
            capacity: stats.capacity,
            utilization: stats.usage_fraction(),
        })
        .collect();

    Ok(Json(CacheStatsResponse {
        instance_id: state.instance_id.clone(),
        model_name: engine.metadata().model_name.clone(),
        chunk_size: engine.chunk_size(),
        engine: engine.stats(),
        tiers,
    }))
}

async fn lookup(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LookupRequest>,
) -> Result<Json<LookupResponse>, StatusCode> {
    let engine = state.engine(req.instance_id.as_deref())?;
    let total_tokens = req.tokens.len();

    // Lookups touch the backend synchronously.
    let tokens = req.tokens;
    let cached = tokio::task::spawn_blocking(move || engine.lookup(&tokens))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map_err(|e| {
            warn!(error = %e, "Lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    info!(cached_tokens = cached, total_tokens, "Cache lookup");
    Ok(Json(LookupResponse {
        cached_tokens: cached,
        total_tokens,
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> String {
    let engine = state.registry.get(&state.instance_id);
    state.metrics.render(engine.as_deref())
}
