//! Tide Analytics
//!
//! Backend analytics service for the Chinese A-share market. The center of
//! the crate is the strategy execution engine: a long-running,
//! concurrency-bounded, progress-reportable job that resolves a ticker
//! universe, fans per-ticker data fetches out against two upstream
//! providers with caching and failover, scores each ticker against a
//! parameterized strategy, and seals a ranked report clients poll for.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    tide-analytics (:4510)                        │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────────────┐  │
//! │  │ Data Gateway │  │  Indicator   │  │      Job Engine        │  │
//! │  │ tushare      │→ │  Kernel      │→ │ workers · progress ·   │  │
//! │  │ eastmoney    │  │  + Evaluator │  │ ranking · retention    │  │
//! │  └──────────────┘  └──────────────┘  └────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod data;
pub mod engine;
pub mod indicators;
pub mod routes;
pub mod strategy;
pub mod universe;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::data::{DataGateway, EastmoneyProvider, GatewayConfig, TushareProvider};
use crate::engine::{JobEngine, ProgressStore};
use crate::strategy::StrategyRegistry;
use tide_common::config::Config;

/// Shared service state.
pub struct AppState {
    /// Configuration
    pub config: Config,
    /// Data gateway over both providers
    pub gateway: Arc<DataGateway>,
    /// Strategy execution engine
    pub engine: Arc<JobEngine>,
}

impl AppState {
    /// Wire the process-wide shared structures. They are built once here
    /// and never replaced.
    pub fn new(config: Config) -> Self {
        let token = config.data.tushare_token.clone().unwrap_or_default();
        if token.is_empty() {
            warn!(
                "TuShare token not configured (set data.tushare_token or TUSHARE_TOKEN); \
                 primary provider calls will fail over to Eastmoney"
            );
        }

        let primary = Arc::new(TushareProvider::new(token));
        let secondary = Arc::new(EastmoneyProvider::new(config.data.eastmoney_endpoint.clone()));
        let gateway = Arc::new(DataGateway::new(
            primary,
            secondary,
            GatewayConfig::from_data_config(&config.data),
        ));

        let registry = Arc::new(StrategyRegistry::builtin());
        let store = Arc::new(ProgressStore::new(config.engine.job_retention));
        let engine = Arc::new(JobEngine::new(
            Arc::clone(&gateway),
            registry,
            store,
            config.engine.clone(),
        ));

        Self {
            config,
            gateway,
            engine,
        }
    }
}

/// Main analytics service.
pub struct AnalyticsService {
    state: Arc<AppState>,
}

impl AnalyticsService {
    /// Create a new service from configuration.
    pub fn new(config: Config) -> Self {
        let state = Arc::new(AppState::new(config));
        Self { state }
    }

    /// Router over the service state, exposed for tests.
    pub fn router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/health", get(routes::health))
            // Strategy execution boundary
            .route("/api/v1/strategies", get(routes::list_strategies))
            .route("/api/v1/strategies/execute", post(routes::start_execution))
            .route(
                "/api/v1/strategies/progress/:execution_id",
                get(routes::get_progress),
            )
            .route(
                "/api/v1/strategies/result/:execution_id",
                get(routes::get_result),
            )
            .route(
                "/api/v1/strategies/cancel/:execution_id",
                post(routes::cancel_execution),
            )
            // Data layer surface
            .route("/api/v1/providers", get(routes::provider_status))
            .route("/api/v1/analysis/:code", get(routes::analyze_ticker))
            .with_state(state)
    }

    /// Start the HTTP server.
    pub async fn start(self) -> Result<()> {
        let host = self.state.config.server.host.clone();
        let port = self.state.config.server.port;

        let app = Self::router(self.state.clone());

        let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
        info!(address = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}
