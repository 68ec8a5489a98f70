//! Job orchestration: universe fan-out over a bounded worker pool,
//! cooperative cancellation, skip accounting, throttled progress publishing
//! and result sealing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::data::{DataGateway, TickerRef};
use crate::strategy::evaluator::{self, StockProfile};
use crate::strategy::{ResolvedStrategy, ScoredStock};
use crate::indicators::IndicatorSet;
use crate::universe::{UniverseFilter, UniverseResolver};

use super::job::{source_tally, FinalResult, JobState, ProgressView, Stage};
use super::store::ProgressStore;

/// Progress writes are coalesced to this cadence.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Fixed setup budget added to the soft deadline.
const DEADLINE_SETUP_SECS: u64 = 60;

/// Per-ticker budget used to scale the soft deadline.
const DEADLINE_PER_TICKER_SECS: u64 = 10;

// ============================================================================
// Shared runtime state
// ============================================================================

/// Mutable state shared between the orchestrator and its workers.
pub struct JobRuntime {
    pub id: String,
    pub strategy: ResolvedStrategy,
    pub filter: UniverseFilter,
    pub max_stocks: usize,
    pub worker_count: usize,
    /// Cooperative cancellation flag, observed between pipeline stages
    pub cancel: AtomicBool,
    /// Set when the skip count breaches the data-quality threshold
    pub quality_failed: AtomicBool,
    /// Set when the soft deadline expires; stops work hand-out
    pub deadline_hit: AtomicBool,
    analyzed: AtomicUsize,
    qualified: AtomicUsize,
    skipped: AtomicUsize,
    total: AtomicUsize,
    /// Best-effort "currently on" sample; writers use try_lock
    current: Mutex<Option<String>>,
    queue: Mutex<VecDeque<TickerRef>>,
    accumulator: Mutex<Vec<ScoredStock>>,
}

impl JobRuntime {
    pub fn new(
        id: String,
        strategy: ResolvedStrategy,
        filter: UniverseFilter,
        max_stocks: usize,
        worker_count: usize,
    ) -> Self {
        Self {
            id,
            strategy,
            filter,
            max_stocks,
            worker_count,
            cancel: AtomicBool::new(false),
            quality_failed: AtomicBool::new(false),
            deadline_hit: AtomicBool::new(false),
            analyzed: AtomicUsize::new(0),
            qualified: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            current: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            accumulator: Mutex::new(Vec::new()),
        }
    }

    /// Request cancellation.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    fn should_stop(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
            || self.quality_failed.load(Ordering::Relaxed)
            || self.deadline_hit.load(Ordering::Relaxed)
    }

    fn skip_threshold(&self) -> usize {
        let total = self.total.load(Ordering::Relaxed);
        50.max(total / 2)
    }

    fn record_skip(&self) {
        let skipped = self.skipped.fetch_add(1, Ordering::Relaxed) + 1;
        if skipped > self.skip_threshold() {
            self.quality_failed.store(true, Ordering::Relaxed);
        }
    }

    fn set_current(&self, code: &str) {
        // Best-effort: a contended write is simply dropped
        if let Ok(mut current) = self.current.try_lock() {
            *current = Some(code.to_string());
        }
    }

    fn counters(&self) -> (usize, usize, usize, usize) {
        (
            self.analyzed.load(Ordering::Relaxed),
            self.qualified.load(Ordering::Relaxed),
            self.skipped.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Everything the background orchestrator needs, cloned out of the engine.
pub struct OrchestratorCtx {
    pub gateway: Arc<DataGateway>,
    pub store: Arc<ProgressStore>,
    pub runtime: Arc<JobRuntime>,
    pub history_days: i64,
    pub top_list_size: usize,
    pub primary_source: String,
}

/// Drive one job from universe resolution to a sealed result.
pub async fn run_job(ctx: OrchestratorCtx) {
    let id = ctx.runtime.id.clone();
    let started = Instant::now();

    // A cancel that landed while the job was still pending wins
    let advanced = ctx.store.update(&id, |job| {
        job.advance(JobState::Running);
    });
    if !advanced {
        warn!(execution_id = %id, "Job vanished before start");
        return;
    }
    if is_cancelled(&ctx, &id) {
        seal_with(&ctx, started, 0, SealKind::Cancelled);
        return;
    }

    publish(&ctx, Stage::ResolvingUniverse);

    // Universe resolution
    let resolver = UniverseResolver::new(Arc::clone(&ctx.gateway));
    let universe = match resolver.resolve(&ctx.runtime.filter).await {
        Ok(universe) => universe,
        Err(e) => {
            warn!(execution_id = %id, error = %e, "Universe resolution failed");
            ctx.store.update(&id, |job| {
                job.advance(JobState::Failed);
            });
            seal_failed(&ctx, started, 0, format!("universe resolution failed: {}", e));
            return;
        }
    };

    let total_universe = universe.len();
    let analysis_set: Vec<TickerRef> = universe
        .into_iter()
        .take(ctx.runtime.max_stocks)
        .collect();
    let total = analysis_set.len();

    info!(
        execution_id = %id,
        universe = total_universe,
        analysis_set = total,
        workers = ctx.runtime.worker_count,
        "Universe resolved, starting fan-out"
    );

    // Empty universe is a legal outcome: nothing to analyze
    if analysis_set.is_empty() {
        ctx.store.update(&id, |job| {
            job.advance(JobState::Completed);
        });
        seal_with(&ctx, started, total_universe, SealKind::Completed { truncated: false });
        return;
    }

    ctx.runtime.total.store(total, Ordering::Relaxed);
    {
        let mut queue = ctx.runtime.queue.lock().expect("queue lock poisoned");
        queue.extend(analysis_set);
    }

    publish(&ctx, Stage::FetchingData);

    // Soft deadline scaled by the analysis set and worker pool
    let batches = total.div_ceil(ctx.runtime.worker_count) as u64;
    let soft_deadline =
        Duration::from_secs(DEADLINE_PER_TICKER_SECS * batches + DEADLINE_SETUP_SECS);

    // Worker pool: a fixed task set consuming the shared queue is the hard
    // ceiling on this job's in-flight upstream calls
    let mut workers = JoinSet::new();
    for _ in 0..ctx.runtime.worker_count {
        let runtime = Arc::clone(&ctx.runtime);
        let gateway = Arc::clone(&ctx.gateway);
        let history_days = ctx.history_days;
        workers.spawn(async move {
            run_worker(runtime, gateway, history_days).await;
        });
    }

    publish(&ctx, Stage::Analyzing);

    // Progress loop: coalesced writes until the pool drains or the soft
    // deadline expires
    let deadline_sleep = tokio::time::sleep(soft_deadline);
    tokio::pin!(deadline_sleep);

    loop {
        tokio::select! {
            joined = workers.join_next() => {
                match joined {
                    Some(_) if !workers.is_empty() => {}
                    _ => break,
                }
            }
            _ = &mut deadline_sleep, if !ctx.runtime.deadline_hit.load(Ordering::Relaxed) => {
                warn!(execution_id = %id, "Soft deadline expired, sealing what we have");
                ctx.runtime.deadline_hit.store(true, Ordering::Relaxed);
            }
            _ = tokio::time::sleep(PROGRESS_INTERVAL) => {
                publish(&ctx, Stage::Analyzing);
            }
        }
    }

    // Tickers never handed to a worker count as skipped so terminal
    // accounting stays exact
    let leftover = {
        let mut queue = ctx.runtime.queue.lock().expect("queue lock poisoned");
        let n = queue.len();
        queue.clear();
        n
    };
    for _ in 0..leftover {
        ctx.runtime.skipped.fetch_add(1, Ordering::Relaxed);
    }

    // Terminal transition and sealing
    if ctx.runtime.cancel.load(Ordering::Relaxed) {
        seal_with(&ctx, started, total_universe, SealKind::Cancelled);
    } else if ctx.runtime.quality_failed.load(Ordering::Relaxed) {
        ctx.store.update(&id, |job| {
            job.advance(JobState::Failed);
        });
        seal_failed(
            &ctx,
            started,
            total_universe,
            "data_quality_below_threshold".to_string(),
        );
    } else {
        let truncated = ctx.runtime.deadline_hit.load(Ordering::Relaxed);
        ctx.store.update(&id, |job| {
            job.advance(JobState::Completed);
        });
        seal_with(&ctx, started, total_universe, SealKind::Completed { truncated });
    }
}

fn is_cancelled(ctx: &OrchestratorCtx, id: &str) -> bool {
    ctx.store
        .get(id)
        .map(|job| job.state == JobState::Cancelled)
        .unwrap_or(false)
        || ctx.runtime.cancel.load(Ordering::Relaxed)
}

// ============================================================================
// Worker
// ============================================================================

/// One worker: pop a ticker, run the per-ticker pipeline, commit the
/// outcome. Cancellation is observed between every stage; any error becomes
/// a per-ticker skip.
async fn run_worker(runtime: Arc<JobRuntime>, gateway: Arc<DataGateway>, history_days: i64) {
    let to = Utc::now().date_naive();
    let from = to - chrono::Days::new(history_days.max(1) as u64);

    loop {
        if runtime.should_stop() {
            break;
        }

        let Some(ticker) = runtime
            .queue
            .lock()
            .expect("queue lock poisoned")
            .pop_front()
        else {
            break;
        };

        runtime.set_current(&ticker.code);

        // Stage a: fetch through the gateway (cache + failover behind it)
        let snapshot = match gateway.snapshot(&ticker.code).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!(code = %ticker.code, error = %e, "Skipping ticker: snapshot");
                runtime.record_skip();
                continue;
            }
        };
        if runtime.should_stop() {
            runtime.record_skip();
            break;
        }

        let history = match gateway.history(&ticker.code, from, to).await {
            Ok(history) => history,
            Err(e) => {
                debug!(code = %ticker.code, error = %e, "Skipping ticker: history");
                runtime.record_skip();
                continue;
            }
        };
        if runtime.should_stop() {
            runtime.record_skip();
            break;
        }

        let fundamentals = match gateway.fundamentals(&ticker.code).await {
            Ok(fundamentals) => fundamentals,
            Err(e) => {
                debug!(code = %ticker.code, error = %e, "Skipping ticker: fundamentals");
                runtime.record_skip();
                continue;
            }
        };
        if runtime.should_stop() {
            runtime.record_skip();
            break;
        }

        // Stage b: indicators
        let indicators = IndicatorSet::compute(&history);
        if runtime.should_stop() {
            runtime.record_skip();
            break;
        }

        // Stage c: evaluation
        let profile = StockProfile {
            ticker,
            snapshot,
            fundamentals: fundamentals.value,
            indicators,
            data_source: fundamentals.source.to_string(),
        };
        let scored = evaluator::evaluate(&runtime.strategy, &profile);
        if runtime.should_stop() {
            runtime.record_skip();
            break;
        }

        // Stage d: commit under the single accumulator lock
        let qualified = scored.qualified;
        {
            let mut accumulator = runtime
                .accumulator
                .lock()
                .expect("accumulator lock poisoned");
            accumulator.push(scored);
        }

        runtime.analyzed.fetch_add(1, Ordering::Relaxed);
        if qualified {
            runtime.qualified.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ============================================================================
// Progress publishing
// ============================================================================

/// Publish a throttled progress snapshot. Terminal jobs are left untouched
/// so cancelled counters stay frozen.
fn publish(ctx: &OrchestratorCtx, stage: Stage) {
    let (analyzed, qualified, skipped, total) = ctx.runtime.counters();
    let current = ctx
        .runtime
        .current
        .try_lock()
        .ok()
        .and_then(|c| c.clone());

    ctx.store.update(&ctx.runtime.id, |job| {
        if job.state.is_terminal() {
            return;
        }
        let percent = ProgressView::derive_percent(stage, analyzed, skipped, total)
            .max(job.progress.percent);
        job.progress.stage = stage;
        job.progress.percent = percent;
        job.progress.total = total;
        job.progress.analyzed = analyzed;
        job.progress.qualified = qualified;
        job.progress.skipped = skipped;
        job.progress.current_ticker = current.clone();
        job.progress.elapsed_seconds =
            (Utc::now() - job.progress.started_at).num_milliseconds() as f64 / 1000.0;
    });
}

// ============================================================================
// Sealing
// ============================================================================

enum SealKind {
    Completed { truncated: bool },
    Cancelled,
}

/// Rank, assemble and atomically attach the final result.
fn seal_with(ctx: &OrchestratorCtx, started: Instant, total_universe: usize, kind: SealKind) {
    let id = &ctx.runtime.id;
    publish_stage_floor(ctx, Stage::Ranking);

    let mut scored = {
        let mut accumulator = ctx
            .runtime
            .accumulator
            .lock()
            .expect("accumulator lock poisoned");
        std::mem::take(&mut *accumulator)
    };

    // Seal-time momentum pass, then the deterministic ranking
    evaluator::apply_momentum_bonus(&mut scored, ctx.runtime.strategy.min_score);
    sort_ranked(&mut scored);

    publish_stage_floor(ctx, Stage::Finalizing);

    let (analyzed, _, skipped, total) = ctx.runtime.counters();
    let all_qualified: Vec<ScoredStock> =
        scored.iter().filter(|s| s.qualified).cloned().collect();
    let top_qualified: Vec<ScoredStock> = all_qualified
        .iter()
        .take(ctx.top_list_size.min(all_qualified.len()))
        .cloned()
        .collect();

    let avg_score = if scored.is_empty() {
        0.0
    } else {
        scored.iter().map(|s| s.score).sum::<f64>() / scored.len() as f64
    };
    let max_score = scored.iter().map(|s| s.score).fold(0.0, f64::max);
    let elapsed = started.elapsed().as_secs_f64();

    let (cancelled, truncated) = match kind {
        SealKind::Completed { truncated } => (false, truncated),
        SealKind::Cancelled => (true, false),
    };

    let result = FinalResult {
        execution_id: id.clone(),
        strategy_id: ctx.runtime.strategy.id.clone(),
        state: JobState::Completed,
        started_at: Utc::now(),
        completed_at: Utc::now(),
        total_universe,
        analysis_set_size: total,
        analyzed,
        qualified: all_qualified.len(),
        skipped,
        grade_distribution: FinalResult::grade_histogram(&scored),
        market_distribution: FinalResult::market_histogram(&scored),
        data_sources: source_tally(&scored, &ctx.primary_source),
        top_qualified,
        all_qualified,
        avg_score,
        max_score,
        avg_seconds_per_stock: if analyzed > 0 {
            elapsed / analyzed as f64
        } else {
            0.0
        },
        truncated,
        cancelled,
        failure_reason: None,
    };

    attach_result(ctx, result);

    info!(
        execution_id = %id,
        analyzed,
        skipped,
        elapsed_secs = format!("{:.1}", elapsed),
        cancelled,
        "Job sealed"
    );
}

/// Seal a failed job: the reason is a field on the result document, not an
/// exception surface.
fn seal_failed(ctx: &OrchestratorCtx, started: Instant, total_universe: usize, reason: String) {
    let (analyzed, _, skipped, total) = ctx.runtime.counters();
    let elapsed = started.elapsed().as_secs_f64();

    let result = FinalResult {
        execution_id: ctx.runtime.id.clone(),
        strategy_id: ctx.runtime.strategy.id.clone(),
        state: JobState::Failed,
        started_at: Utc::now(),
        completed_at: Utc::now(),
        total_universe,
        analysis_set_size: total,
        analyzed,
        qualified: 0,
        skipped,
        top_qualified: Vec::new(),
        all_qualified: Vec::new(),
        grade_distribution: FinalResult::grade_histogram(&[]),
        market_distribution: FinalResult::market_histogram(&[]),
        data_sources: source_tally(&[], &ctx.primary_source),
        avg_score: 0.0,
        max_score: 0.0,
        avg_seconds_per_stock: if analyzed > 0 {
            elapsed / analyzed as f64
        } else {
            0.0
        },
        truncated: false,
        cancelled: false,
        failure_reason: Some(reason),
    };

    attach_result(ctx, result);
}

fn attach_result(ctx: &OrchestratorCtx, mut result: FinalResult) {
    ctx.store.update(&ctx.runtime.id, |job| {
        result.state = job.state;
        if job.state == JobState::Cancelled {
            result.cancelled = true;
        }
        result.started_at = job.progress.started_at;
        result.completed_at = job.completed_at.unwrap_or_else(Utc::now);
        job.progress.stage = Stage::Done;
        job.progress.percent = 100.max(job.progress.percent);
        job.progress.total = result.analysis_set_size;
        job.progress.analyzed = result.analyzed;
        job.progress.qualified = result.qualified;
        job.progress.skipped = result.skipped;
        job.progress.elapsed_seconds =
            (Utc::now() - job.progress.started_at).num_milliseconds() as f64 / 1000.0;
        job.result = Some(result.clone());
    });
}

fn publish_stage_floor(ctx: &OrchestratorCtx, stage: Stage) {
    ctx.store.update(&ctx.runtime.id, |job| {
        if job.state.is_terminal() && job.state != JobState::Completed {
            return;
        }
        job.progress.stage = stage;
        job.progress.percent = stage.floor().max(job.progress.percent);
    });
}

/// Ranking order: score descending, market cap descending, ticker ascending.
fn sort_ranked(stocks: &mut [ScoredStock]) {
    stocks.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let cap_a = a.market_cap.unwrap_or(f64::NEG_INFINITY);
                let cap_b = b.market_cap.unwrap_or(f64::NEG_INFINITY);
                cap_b.partial_cmp(&cap_a).unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.code.cmp(&b.code))
    });
}

// ============================================================================
// Tests
// ============================================================================
