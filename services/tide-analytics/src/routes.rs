//! HTTP routes for the analytics service.
//!
//! Thin adapter: request parsing and status mapping only. Domain errors
//! convert into `tide_common::Error`, which owns the status codes; all
//! behavior lives behind the engine and the gateway.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::data::ProviderInfo;
use crate::engine::{ExecutionRequest, FinalResult, ProgressView};
use crate::indicators::IndicatorSet;
use crate::AppState;
use tide_common::Error;

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub service: String,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub execution_id: String,
    pub accepted_at: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct StrategyListResponse {
    pub strategies: Vec<serde_json::Value>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct ProvidersResponse {
    pub providers: Vec<ProviderInfo>,
    pub cache_entries: usize,
    pub cache_hits: u64,
    pub cache_loads: u64,
}

#[derive(Debug, Serialize)]
pub struct AnalysisResponse {
    pub code: String,
    pub close: f64,
    pub percent_change: f64,
    pub indicators: IndicatorSet,
    pub bullish_signals: u32,
}

type ErrorReply = (StatusCode, Json<ErrorResponse>);

fn error_reply(error: Error) -> ErrorReply {
    let status = StatusCode::from_u16(error.status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

// ============================================================================
// Route Handlers
// ============================================================================

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        service: "tide-analytics".to_string(),
    })
}

/// Start a strategy execution
pub async fn start_execution(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExecutionRequest>,
) -> Result<Json<StartResponse>, ErrorReply> {
    let execution_id = state
        .engine
        .start(request)
        .map_err(|e| error_reply(e.into()))?;

    Ok(Json(StartResponse {
        execution_id,
        accepted_at: Utc::now().to_rfc3339(),
    }))
}

/// Poll execution progress
pub async fn get_progress(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> Result<Json<ProgressView>, ErrorReply> {
    state
        .engine
        .progress(&execution_id)
        .map(Json)
        .ok_or_else(|| error_reply(Error::NotFound("execution".to_string())))
}

/// Fetch the sealed execution result
pub async fn get_result(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> Result<Json<FinalResult>, ErrorReply> {
    state
        .engine
        .result(&execution_id)
        .map(Json)
        .map_err(|e| error_reply(e.into()))
}

/// Cancel a running execution
pub async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> Result<Json<serde_json::Value>, ErrorReply> {
    state
        .engine
        .cancel(&execution_id)
        .map_err(|e| error_reply(e.into()))?;

    Ok(Json(serde_json::json!({
        "acknowledged": true,
        "execution_id": execution_id,
    })))
}

/// List the strategy registry
pub async fn list_strategies(State(state): State<Arc<AppState>>) -> Json<StrategyListResponse> {
    let strategies: Vec<serde_json::Value> = state
        .engine
        .registry()
        .list()
        .iter()
        .map(|s| serde_json::to_value(s).unwrap_or_default())
        .collect();
    let count = strategies.len();

    Json(StrategyListResponse { strategies, count })
}

/// Provider and cache status
pub async fn provider_status(State(state): State<Arc<AppState>>) -> Json<ProvidersResponse> {
    let cache = state.gateway.cache_stats();
    Json(ProvidersResponse {
        providers: state.gateway.providers_info(),
        cache_entries: cache.entries,
        cache_hits: cache.hits,
        cache_loads: cache.loads,
    })
}

/// Single-ticker indicator readout, no job machinery
pub async fn analyze_ticker(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<AnalysisResponse>, ErrorReply> {
    let snapshot = state
        .gateway
        .snapshot(&code)
        .await
        .map_err(|e| error_reply(e.into()))?;

    let to = Utc::now().date_naive();
    let from = to - chrono::Days::new(state.config.engine.history_days.max(1) as u64);
    let history = state
        .gateway
        .history(&code, from, to)
        .await
        .map_err(|e| error_reply(e.into()))?;

    let indicators = IndicatorSet::compute(&history);
    let bullish_signals = indicators.bullish_signal_count();

    Ok(Json(AnalysisResponse {
        code: snapshot.code.clone(),
        close: snapshot.close,
        percent_change: snapshot.percent_change(),
        indicators,
        bullish_signals,
    }))
}
