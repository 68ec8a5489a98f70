//! Strategy execution engine.
//!
//! Accepts strategy-execution requests, validates them synchronously,
//! allocates a job and drives it on a background orchestrator. Clients poll
//! progress and fetch the sealed result through the same engine.

mod job;
mod orchestrator;
mod store;

pub use job::{ExecutionRequest, FinalResult, Job, JobState, ProgressView, Stage};
pub use store::ProgressStore;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::info;

use crate::data::DataGateway;
use crate::strategy::StrategyRegistry;

use orchestrator::{run_job, JobRuntime, OrchestratorCtx};
use tide_common::config::EngineConfig;

// ============================================================================
// Errors
// ============================================================================

/// Synchronous start failures: no job is created for any of these.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("bad filter: {0}")]
    BadFilter(String),
    #[error("too many concurrent executions (limit {limit})")]
    CapacityExceeded { limit: usize },
}

/// Result-read failures.
#[derive(Debug, Error)]
pub enum ResultError {
    #[error("execution not found")]
    NotFound,
    #[error("execution not finished")]
    NotReady,
}

/// Cancel failures.
#[derive(Debug, Error)]
pub enum CancelError {
    #[error("execution not found")]
    NotFound,
    #[error("execution already terminal")]
    AlreadyTerminal,
}

impl From<StartError> for tide_common::Error {
    fn from(error: StartError) -> Self {
        match error {
            StartError::UnknownStrategy(id) => Self::NotFound(format!("strategy '{}'", id)),
            StartError::InvalidParameters(msg) | StartError::BadFilter(msg) => {
                Self::InvalidInput(msg)
            }
            StartError::CapacityExceeded { limit } => {
                Self::RateLimited(format!("at most {} concurrent executions", limit))
            }
        }
    }
}

impl From<ResultError> for tide_common::Error {
    fn from(error: ResultError) -> Self {
        match error {
            ResultError::NotFound => Self::NotFound("execution".to_string()),
            ResultError::NotReady => Self::Conflict("execution not finished".to_string()),
        }
    }
}

impl From<CancelError> for tide_common::Error {
    fn from(error: CancelError) -> Self {
        match error {
            CancelError::NotFound => Self::NotFound("execution".to_string()),
            CancelError::AlreadyTerminal => {
                Self::Conflict("execution already terminal".to_string())
            }
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// The job engine: start / progress / result / cancel.
pub struct JobEngine {
    gateway: Arc<DataGateway>,
    registry: Arc<StrategyRegistry>,
    store: Arc<ProgressStore>,
    config: EngineConfig,
    /// Live runtimes, for delivering cancellation flags; orchestrators
    /// deregister themselves on completion
    running: Arc<Mutex<HashMap<String, Arc<JobRuntime>>>>,
    primary_source: String,
}

impl JobEngine {
    /// Build the engine over the shared gateway, registry and store.
    pub fn new(
        gateway: Arc<DataGateway>,
        registry: Arc<StrategyRegistry>,
        store: Arc<ProgressStore>,
        config: EngineConfig,
    ) -> Self {
        let primary_source = gateway
            .providers_info()
            .first()
            .map(|p| p.name.clone())
            .unwrap_or_default();

        Self {
            gateway,
            registry,
            store,
            config,
            running: Arc::new(Mutex::new(HashMap::new())),
            primary_source,
        }
    }

    /// Validate and start an execution; returns the execution id
    /// immediately while a background orchestrator does the work.
    pub fn start(&self, request: ExecutionRequest) -> Result<String, StartError> {
        let definition = self
            .registry
            .get(&request.strategy_id)
            .ok_or_else(|| StartError::UnknownStrategy(request.strategy_id.clone()))?;

        let filter = request.filter();
        filter.validate().map_err(StartError::BadFilter)?;

        if request.max_stocks == Some(0) {
            return Err(StartError::InvalidParameters(
                "max_stocks must be at least 1".to_string(),
            ));
        }
        let max_stocks = request.max_stocks.unwrap_or(usize::MAX);

        let strategy = definition
            .resolve(&request.parameters, request.min_score)
            .map_err(StartError::InvalidParameters)?;

        let worker_count = request
            .worker_count
            .unwrap_or(self.config.default_worker_count)
            .clamp(1, self.config.max_worker_count.max(1));

        if self.store.active_count() >= self.config.max_concurrent_jobs {
            return Err(StartError::CapacityExceeded {
                limit: self.config.max_concurrent_jobs,
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let job = Job::new(id.clone(), strategy.id.clone());
        self.store.put(job);

        let runtime = Arc::new(JobRuntime::new(
            id.clone(),
            strategy,
            filter,
            max_stocks,
            worker_count,
        ));
        self.running
            .lock()
            .expect("running lock poisoned")
            .insert(id.clone(), Arc::clone(&runtime));

        info!(
            execution_id = %id,
            strategy = %request.strategy_id,
            worker_count,
            "Execution accepted"
        );

        let ctx = OrchestratorCtx {
            gateway: Arc::clone(&self.gateway),
            store: Arc::clone(&self.store),
            runtime,
            history_days: self.config.history_days,
            top_list_size: self.config.top_list_size,
            primary_source: self.primary_source.clone(),
        };
        let running = Arc::clone(&self.running);
        let task_id = id.clone();
        tokio::spawn(async move {
            run_job(ctx).await;
            running
                .lock()
                .expect("running lock poisoned")
                .remove(&task_id);
        });

        Ok(id)
    }

    /// Poll the progress view for an execution.
    pub fn progress(&self, id: &str) -> Option<ProgressView> {
        let job = self.store.get(id)?;
        let mut view = job.progress;
        // Elapsed is computed at read time; stored snapshots lag by the
        // publish interval
        if !view.state.is_terminal() {
            view.elapsed_seconds =
                (chrono::Utc::now() - view.started_at).num_milliseconds() as f64 / 1000.0;
        }
        Some(view)
    }

    /// Fetch the sealed result for an execution.
    pub fn result(&self, id: &str) -> Result<FinalResult, ResultError> {
        let job = self.store.get(id).ok_or(ResultError::NotFound)?;
        job.result.ok_or(ResultError::NotReady)
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self, id: &str) -> Result<(), CancelError> {
        let job = self.store.get(id).ok_or(CancelError::NotFound)?;
        if job.state.is_terminal() {
            return Err(CancelError::AlreadyTerminal);
        }

        // Flip the worker-visible flag first, then the externally visible
        // state; workers observe the flag between pipeline stages
        if let Some(runtime) = self
            .running
            .lock()
            .expect("running lock poisoned")
            .get(id)
        {
            runtime.request_cancel();
        }

        self.store.update(id, |job| {
            job.advance(JobState::Cancelled);
        });

        info!(execution_id = %id, "Cancellation requested");
        Ok(())
    }

    /// The strategy registry backing this engine.
    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    /// The progress store backing this engine.
    pub fn store(&self) -> &ProgressStore {
        &self.store
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_error_status_mapping() {
        let status = |e: StartError| tide_common::Error::from(e).status_code();
        assert_eq!(status(StartError::UnknownStrategy("x".into())), 404);
        assert_eq!(status(StartError::InvalidParameters("bad".into())), 400);
        assert_eq!(status(StartError::BadFilter("bad".into())), 400);
        assert_eq!(status(StartError::CapacityExceeded { limit: 4 }), 429);
    }

    #[test]
    fn test_read_error_status_mapping() {
        assert_eq!(tide_common::Error::from(ResultError::NotFound).status_code(), 404);
        assert_eq!(tide_common::Error::from(ResultError::NotReady).status_code(), 409);
        assert_eq!(tide_common::Error::from(CancelError::NotFound).status_code(), 404);
        assert_eq!(
            tide_common::Error::from(CancelError::AlreadyTerminal).status_code(),
            409
        );
    }
}
