//! Job entity: lifecycle states, progress view and the sealed final result.
//!
//! A strategy execution is a first-class entity with an id, owned by the
//! orchestrator and read through the progress store. State only ever moves
//! forward; a sealed result is immutable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::data::SourceBreakdown;
use crate::strategy::{Grade, ScoredStock, StrategyParameters};
use crate::universe::UniverseFilter;

// ============================================================================
// Request
// ============================================================================

/// Start-job request accepted at the boundary.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionRequest {
    /// Strategy id from the registry
    pub strategy_id: String,
    /// Parameter overrides (defaults apply when omitted)
    #[serde(default)]
    pub parameters: StrategyParameters,
    /// Market tokens (`all`, `sh`, `sz`, `bj`, `main`, `star`, `gem`, `beijing`)
    #[serde(default)]
    pub markets: Option<Vec<String>>,
    /// Industry tags, exact match
    #[serde(default)]
    pub industries: Option<Vec<String>>,
    /// Analysis-set ceiling
    #[serde(default)]
    pub max_stocks: Option<usize>,
    /// Qualification threshold override
    #[serde(default)]
    pub min_score: Option<f64>,
    /// Worker pool size (clamped to [1, max_worker_count])
    #[serde(default)]
    pub worker_count: Option<usize>,
}

impl ExecutionRequest {
    /// Universe filter from the optional request axes.
    pub fn filter(&self) -> UniverseFilter {
        let defaults = UniverseFilter::default();
        UniverseFilter {
            markets: self.markets.clone().unwrap_or(defaults.markets),
            industries: self.industries.clone().unwrap_or(defaults.industries),
        }
    }
}

// ============================================================================
// States and stages
// ============================================================================

/// Job lifecycle state. Transitions only move forward:
/// pending → running → (completed | failed | cancelled).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// Whether the state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether moving to `next` respects the state graph.
    pub fn can_advance_to(&self, next: JobState) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending | Self::Running, Self::Cancelled) => true,
            (Self::Running, Self::Completed | Self::Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Coarse progress stage shown to pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Initializing,
    ResolvingUniverse,
    FetchingData,
    Analyzing,
    Ranking,
    Finalizing,
    Done,
}

impl Stage {
    /// Floor on the progress percent while in this stage, keeping the bar
    /// monotonic before the ticker count is known.
    pub fn floor(&self) -> u8 {
        match self {
            Self::Initializing => 0,
            Self::ResolvingUniverse => 5,
            Self::FetchingData => 10,
            Self::Analyzing => 15,
            Self::Ranking => 92,
            Self::Finalizing => 96,
            Self::Done => 100,
        }
    }
}

// ============================================================================
// Progress view
// ============================================================================

/// Flat progress record returned to pollers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressView {
    pub state: JobState,
    pub stage: Stage,
    /// 0–100, monotonic non-decreasing across polls
    pub percent: u8,
    pub total: usize,
    pub analyzed: usize,
    pub qualified: usize,
    pub skipped: usize,
    /// Best-effort "currently on" sample
    pub current_ticker: Option<String>,
    pub started_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
}

impl ProgressView {
    /// Initial view for a freshly accepted job.
    pub fn initial(started_at: DateTime<Utc>) -> Self {
        Self {
            state: JobState::Pending,
            stage: Stage::Initializing,
            percent: 0,
            total: 0,
            analyzed: 0,
            qualified: 0,
            skipped: 0,
            current_ticker: None,
            started_at,
            elapsed_seconds: 0.0,
        }
    }

    /// Derive the percent: max(stage_floor, processed / total × 100), so
    /// the bar stays monotonic while the ticker count is still unknown.
    pub fn derive_percent(stage: Stage, analyzed: usize, skipped: usize, total: usize) -> u8 {
        let floor = stage.floor();
        if total == 0 {
            return floor;
        }
        let ratio = ((analyzed + skipped) as f64 / total as f64 * 100.0).min(100.0) as u8;
        ratio.max(floor)
    }
}

// ============================================================================
// Final result
// ============================================================================

/// Sealed result document for a terminal job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResult {
    pub execution_id: String,
    pub strategy_id: String,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Universe size before truncation
    pub total_universe: usize,
    /// Tickers handed to the worker pool
    pub analysis_set_size: usize,
    pub analyzed: usize,
    pub qualified: usize,
    pub skipped: usize,
    /// Score-ordered prefix of the qualified list
    pub top_qualified: Vec<ScoredStock>,
    /// Every qualified stock
    pub all_qualified: Vec<ScoredStock>,
    /// Qualified + rejected counts per grade
    pub grade_distribution: HashMap<String, usize>,
    /// Analyzed counts per market
    pub market_distribution: HashMap<String, usize>,
    /// Which provider served the per-stock fundamentals
    pub data_sources: SourceBreakdown,
    pub avg_score: f64,
    pub max_score: f64,
    /// Average seconds spent per analyzed stock
    pub avg_seconds_per_stock: f64,
    /// Soft deadline expired before the analysis set drained
    pub truncated: bool,
    /// Job was cancelled; counters reflect cancel time
    pub cancelled: bool,
    /// Failure reason when state is failed
    pub failure_reason: Option<String>,
}

impl FinalResult {
    /// Grade histogram over a scored set.
    pub fn grade_histogram(stocks: &[ScoredStock]) -> HashMap<String, usize> {
        let mut histogram = HashMap::new();
        for grade in [Grade::S, Grade::A, Grade::B, Grade::C, Grade::D] {
            histogram.insert(grade.to_string(), 0);
        }
        for stock in stocks {
            *histogram.entry(stock.grade.to_string()).or_insert(0) += 1;
        }
        histogram
    }

    /// Market histogram over a scored set.
    pub fn market_histogram(stocks: &[ScoredStock]) -> HashMap<String, usize> {
        let mut histogram = HashMap::new();
        for stock in stocks {
            *histogram
                .entry(stock.market.suffix().to_string())
                .or_insert(0) += 1;
        }
        histogram
    }
}

/// Per-stock source tally for the result document.
pub fn source_tally(stocks: &[ScoredStock], primary_name: &str) -> SourceBreakdown {
    let mut breakdown = SourceBreakdown::default();
    for stock in stocks {
        if stock.data_source == primary_name {
            breakdown.primary += 1;
        } else {
            breakdown.secondary += 1;
        }
    }
    breakdown
}

// ============================================================================
// Job record
// ============================================================================

/// The stored job entity.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub strategy_id: String,
    pub state: JobState,
    pub progress: ProgressView,
    pub result: Option<FinalResult>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// New pending job.
    pub fn new(id: String, strategy_id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            strategy_id,
            state: JobState::Pending,
            progress: ProgressView::initial(now),
            result: None,
            created_at: now,
            completed_at: None,
        }
    }

    /// Advance the state, refusing regressions and exits from terminal
    /// states.
    pub fn advance(&mut self, next: JobState) -> bool {
        if !self.state.can_advance_to(next) {
            return false;
        }
        self.state = next;
        self.progress.state = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        true
    }
}

// ============================================================================
// Tests
// ============================================================================
