//! End-to-end tests for the strategy execution engine: fixture universes,
//! ranking determinism, cancellation, progress monotonicity, capacity and
//! retention behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};

use tide_analytics::data::{
    DataGateway, Fundamentals, GatewayConfig, HistoryBar, Market, ProviderError, QuoteProvider,
    QuoteSnapshot, TickerRef,
};
use tide_analytics::engine::{
    ExecutionRequest, FinalResult, JobEngine, JobState, ProgressStore, StartError,
};
use tide_analytics::strategy::{StrategyParameters, StrategyRegistry};
use tide_common::config::EngineConfig;

// ============================================================================
// Fixture Provider
// ============================================================================

/// One fixture ticker: reference entry plus fundamentals.
#[derive(Clone)]
struct Fixture {
    code: &'static str,
    name: &'static str,
    industry: &'static str,
    fundamentals: Fundamentals,
}

fn fixture(
    code: &'static str,
    name: &'static str,
    industry: &'static str,
    pe: f64,
    pb: f64,
    roe: f64,
    cap: f64,
) -> Fixture {
    Fixture {
        code,
        name,
        industry,
        fundamentals: Fundamentals {
            pe: Some(pe),
            pb: Some(pb),
            roe: Some(roe),
            market_cap: Some(cap),
            ..Default::default()
        },
    }
}

/// The S1 "blue-chip stable" 3-ticker universe.
fn blue_chip_universe() -> Vec<Fixture> {
    vec![
        fixture("600036", "招商银行", "银行", 8.0, 1.0, 15.0, 2000.0),
        fixture("600519", "贵州茅台", "白酒", 35.0, 10.0, 30.0, 2500.0),
        fixture("000001", "平安银行", "银行", 6.0, 0.7, 12.0, 1200.0),
    ]
}

/// A large synthetic universe for cancellation/progress tests.
fn wide_universe(count: usize) -> Vec<Fixture> {
    (0..count)
        .map(|i| {
            let code: &'static str = Box::leak(format!("{:06}", 600_000 + i).into_boxed_str());
            fixture(code, code, "银行", 8.0, 1.0, 15.0, 2000.0)
        })
        .collect()
}

/// Fixture-backed provider with optional per-call delay and failure
/// injection, counting every upstream call.
struct FixtureProvider {
    name: &'static str,
    fixtures: Vec<Fixture>,
    delay: Option<Duration>,
    /// Codes whose fundamentals calls fail with Unavailable
    broken_fundamentals: Vec<&'static str>,
    calls: AtomicU32,
    reference_calls: AtomicU32,
}

impl FixtureProvider {
    fn new(name: &'static str, fixtures: Vec<Fixture>) -> Self {
        Self {
            name,
            fixtures,
            delay: None,
            broken_fundamentals: Vec::new(),
            calls: AtomicU32::new(0),
            reference_calls: AtomicU32::new(0),
        }
    }

    fn sleepy(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn with_broken_fundamentals(mut self, codes: Vec<&'static str>) -> Self {
        self.broken_fundamentals = codes;
        self
    }

    fn total_calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }

    async fn tick(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl QuoteProvider for FixtureProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn load_reference_universe(&self) -> Result<Vec<TickerRef>, ProviderError> {
        self.reference_calls.fetch_add(1, Ordering::Relaxed);
        self.tick().await;
        Ok(self
            .fixtures
            .iter()
            .map(|f| TickerRef {
                code: f.code.to_string(),
                name: f.name.to_string(),
                market: Market::from_code(f.code).unwrap(),
                industry: Some(f.industry.to_string()),
                area: None,
                market_cap: f.fundamentals.market_cap,
                float_cap: None,
            })
            .collect())
    }

    async fn fetch_snapshot_batch(
        &self,
        codes: &[String],
    ) -> Result<HashMap<String, QuoteSnapshot>, ProviderError> {
        self.tick().await;
        let mut map = HashMap::new();
        for code in codes {
            map.insert(
                code.clone(),
                QuoteSnapshot {
                    code: code.clone(),
                    open: 10.0,
                    high: 10.1,
                    low: 9.9,
                    close: 10.0,
                    prev_close: 10.0,
                    volume: 100_000.0,
                    amount: 1_000_000.0,
                    turnover_rate: Some(1.0),
                    timestamp: Utc::now(),
                },
            );
        }
        Ok(map)
    }

    async fn fetch_history(
        &self,
        _code: &str,
        _from: NaiveDate,
        _to: NaiveDate,
    ) -> Result<Vec<HistoryBar>, ProviderError> {
        self.tick().await;
        // Identical flat history for every ticker keeps evaluation
        // symmetric: no technical or momentum divergence between fixtures
        let start = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();
        Ok((0..80)
            .map(|i| HistoryBar {
                date: start + chrono::Days::new(i),
                open: 10.0,
                high: 10.1,
                low: 9.9,
                close: 10.0,
                volume: 100_000.0,
                amount: 1_000_000.0,
            })
            .collect())
    }

    async fn fetch_fundamentals(&self, code: &str) -> Result<Fundamentals, ProviderError> {
        self.tick().await;
        if self.broken_fundamentals.contains(&code) {
            return Err(ProviderError::Unavailable("fixture outage".into()));
        }
        self.fixtures
            .iter()
            .find(|f| f.code == code)
            .map(|f| f.fundamentals.clone())
            .ok_or_else(|| ProviderError::NotFound(code.to_string()))
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    engine: Arc<JobEngine>,
    primary: Arc<FixtureProvider>,
    #[allow(dead_code)]
    secondary: Arc<FixtureProvider>,
}

fn harness(primary: FixtureProvider, secondary: FixtureProvider, config: EngineConfig) -> Harness {
    let primary = Arc::new(primary);
    let secondary = Arc::new(secondary);

    let gateway = Arc::new(DataGateway::new(
        primary.clone(),
        secondary.clone(),
        GatewayConfig {
            rate_limit_rps_primary: 100_000,
            rate_limit_rps_secondary: 100_000,
            fetch_timeout: Duration::from_secs(5),
            reference_timeout: Duration::from_secs(5),
            ..GatewayConfig::default()
        },
    ));

    let registry = Arc::new(StrategyRegistry::builtin());
    let store = Arc::new(ProgressStore::new(config.job_retention));
    let engine = Arc::new(JobEngine::new(gateway, registry, store, config));

    Harness {
        engine,
        primary,
        secondary,
    }
}

fn blue_chip_request() -> ExecutionRequest {
    ExecutionRequest {
        strategy_id: "blue_chip".to_string(),
        parameters: StrategyParameters::new(),
        markets: None,
        industries: None,
        max_stocks: None,
        min_score: None,
        worker_count: Some(2),
    }
}

async fn await_result(engine: &JobEngine, id: &str) -> FinalResult {
    for _ in 0..250 {
        if let Ok(result) = engine.result(id) {
            return result;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("execution {} did not finish in time", id);
}

// ============================================================================
// S1: blue-chip fixture
// ============================================================================

#[tokio::test]
async fn test_blue_chip_three_ticker_universe() {
    let h = harness(
        FixtureProvider::new("primary", blue_chip_universe()),
        FixtureProvider::new("secondary", blue_chip_universe()),
        EngineConfig::default(),
    );

    let id = h.engine.start(blue_chip_request()).unwrap();
    let result = await_result(&h.engine, id.as_str()).await;

    assert_eq!(result.state, JobState::Completed);
    assert_eq!(result.analyzed, 3);
    assert_eq!(result.qualified, 2);
    assert_eq!(result.skipped, 0);
    assert_eq!(result.analysis_set_size, 3);

    // Both qualifiers satisfy every bound: equal scores, cap breaks the tie
    let codes: Vec<&str> = result
        .top_qualified
        .iter()
        .map(|s| s.code.as_str())
        .collect();
    assert_eq!(codes, vec!["600036", "000001"]);
    assert_eq!(result.top_qualified[0].score, result.top_qualified[1].score);

    // 600519 was analyzed but rejected on the hard PE bound
    assert!(result
        .all_qualified
        .iter()
        .all(|s| s.code != "600519"));
    assert!(!result.cancelled);
    assert!(!result.truncated);
}

#[tokio::test]
async fn test_terminal_accounting_invariant() {
    let h = harness(
        FixtureProvider::new("primary", blue_chip_universe()),
        FixtureProvider::new("secondary", blue_chip_universe()),
        EngineConfig::default(),
    );

    let id = h.engine.start(blue_chip_request()).unwrap();
    let result = await_result(&h.engine, id.as_str()).await;

    assert_eq!(result.analyzed + result.skipped, result.analysis_set_size);
    assert!(result.qualified <= result.analyzed);
    for stock in &result.top_qualified {
        assert!((0.0..=100.0).contains(&stock.score));
        assert!(stock.qualified);
    }
}

// ============================================================================
// S5: ranking stability across worker counts
// ============================================================================

#[tokio::test]
async fn test_ranking_independent_of_parallelism() {
    let mut baseline: Option<String> = None;

    for worker_count in [1usize, 2, 4, 8] {
        for _ in 0..2 {
            let h = harness(
                FixtureProvider::new("primary", blue_chip_universe()),
                FixtureProvider::new("secondary", blue_chip_universe()),
                EngineConfig::default(),
            );

            let mut request = blue_chip_request();
            request.worker_count = Some(worker_count);
            let id = h.engine.start(request).unwrap();
            let result = await_result(&h.engine, id.as_str()).await;

            let rendered = serde_json::to_string(&result.top_qualified).unwrap();
            match &baseline {
                None => baseline = Some(rendered),
                Some(expected) => assert_eq!(
                    &rendered, expected,
                    "ranking diverged at worker_count={}",
                    worker_count
                ),
            }
        }
    }
}

// ============================================================================
// Boundary behaviors
// ============================================================================

#[tokio::test]
async fn test_empty_universe_completes_immediately() {
    let h = harness(
        FixtureProvider::new("primary", blue_chip_universe()),
        FixtureProvider::new("secondary", blue_chip_universe()),
        EngineConfig::default(),
    );

    let mut request = blue_chip_request();
    request.industries = Some(vec!["航空航天".to_string()]);
    let id = h.engine.start(request).unwrap();
    let result = await_result(&h.engine, id.as_str()).await;

    assert_eq!(result.state, JobState::Completed);
    assert_eq!(result.analyzed, 0);
    assert_eq!(result.qualified, 0);
    assert_eq!(result.analysis_set_size, 0);
}

#[tokio::test]
async fn test_max_stocks_zero_rejected() {
    let h = harness(
        FixtureProvider::new("primary", blue_chip_universe()),
        FixtureProvider::new("secondary", blue_chip_universe()),
        EngineConfig::default(),
    );

    let mut request = blue_chip_request();
    request.max_stocks = Some(0);
    match h.engine.start(request) {
        Err(StartError::InvalidParameters(_)) => {}
        other => panic!("expected InvalidParameters, got {:?}", other.err()),
    }
}

#[tokio::test]
async fn test_unknown_strategy_rejected() {
    let h = harness(
        FixtureProvider::new("primary", blue_chip_universe()),
        FixtureProvider::new("secondary", blue_chip_universe()),
        EngineConfig::default(),
    );

    let mut request = blue_chip_request();
    request.strategy_id = "moonshot".to_string();
    assert!(matches!(
        h.engine.start(request),
        Err(StartError::UnknownStrategy(_))
    ));
}

#[tokio::test]
async fn test_bad_filter_rejected() {
    let h = harness(
        FixtureProvider::new("primary", blue_chip_universe()),
        FixtureProvider::new("secondary", blue_chip_universe()),
        EngineConfig::default(),
    );

    let mut request = blue_chip_request();
    request.markets = Some(vec!["nasdaq".to_string()]);
    assert!(matches!(
        h.engine.start(request),
        Err(StartError::BadFilter(_))
    ));
}

#[tokio::test]
async fn test_parameter_out_of_schema_range_rejected() {
    let h = harness(
        FixtureProvider::new("primary", blue_chip_universe()),
        FixtureProvider::new("secondary", blue_chip_universe()),
        EngineConfig::default(),
    );

    let mut request = blue_chip_request();
    request.parameters.insert("pe_max".to_string(), 100_000.0);
    assert!(matches!(
        h.engine.start(request),
        Err(StartError::InvalidParameters(_))
    ));
}

#[tokio::test]
async fn test_max_stocks_truncates_in_code_order() {
    let h = harness(
        FixtureProvider::new("primary", blue_chip_universe()),
        FixtureProvider::new("secondary", blue_chip_universe()),
        EngineConfig::default(),
    );

    let mut request = blue_chip_request();
    request.max_stocks = Some(2);
    let id = h.engine.start(request).unwrap();
    let result = await_result(&h.engine, id.as_str()).await;

    // Ascending code order: 000001 and 600036 make the cut, 600519 does not
    assert_eq!(result.analysis_set_size, 2);
    assert_eq!(result.total_universe, 3);
    assert_eq!(result.analyzed, 2);
    let codes: Vec<&str> = result
        .all_qualified
        .iter()
        .map(|s| s.code.as_str())
        .collect();
    assert!(codes.contains(&"000001"));
    assert!(codes.contains(&"600036"));
}

// ============================================================================
// Skip accounting (both providers down for one ticker)
// ============================================================================

#[tokio::test]
async fn test_ticker_with_both_providers_down_is_skipped() {
    let h = harness(
        FixtureProvider::new("primary", blue_chip_universe())
            .with_broken_fundamentals(vec!["600519"]),
        FixtureProvider::new("secondary", blue_chip_universe())
            .with_broken_fundamentals(vec!["600519"]),
        EngineConfig::default(),
    );

    let id = h.engine.start(blue_chip_request()).unwrap();
    let result = await_result(&h.engine, id.as_str()).await;

    assert_eq!(result.state, JobState::Completed);
    assert_eq!(result.analyzed, 2);
    assert_eq!(result.skipped, 1);
    assert_eq!(result.qualified, 2);
}

// ============================================================================
// S2: failover visible in the result's source breakdown
// ============================================================================

#[tokio::test]
async fn test_failover_reflected_in_data_sources() {
    let h = harness(
        FixtureProvider::new("primary", blue_chip_universe())
            .with_broken_fundamentals(vec!["600036"]),
        FixtureProvider::new("secondary", blue_chip_universe()),
        EngineConfig::default(),
    );

    let id = h.engine.start(blue_chip_request()).unwrap();
    let result = await_result(&h.engine, id.as_str()).await;

    assert_eq!(result.analyzed, 3);
    // 600036 fundamentals came from the backup, the rest from the primary
    assert_eq!(result.data_sources.secondary, 1);
    assert_eq!(result.data_sources.primary, 2);

    let merchants = result
        .all_qualified
        .iter()
        .find(|s| s.code == "600036")
        .expect("600036 should still qualify via the backup");
    assert_eq!(merchants.data_source, "secondary");
}

// ============================================================================
// S3: reference roster coalesced across concurrent jobs
// ============================================================================

#[tokio::test]
async fn test_concurrent_jobs_share_one_reference_load() {
    let h = harness(
        FixtureProvider::new("primary", blue_chip_universe())
            .sleepy(Duration::from_millis(30)),
        FixtureProvider::new("secondary", blue_chip_universe()),
        EngineConfig::default(),
    );

    let id_a = h.engine.start(blue_chip_request()).unwrap();
    let id_b = h.engine.start(blue_chip_request()).unwrap();

    let result_a = await_result(&h.engine, id_a.as_str()).await;
    let result_b = await_result(&h.engine, id_b.as_str()).await;

    assert_eq!(h.primary.reference_calls.load(Ordering::Relaxed), 1);
    assert_eq!(result_a.total_universe, result_b.total_universe);
}

// ============================================================================
// S4 + S6: cancellation and progress monotonicity
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_mid_run() {
    let h = harness(
        FixtureProvider::new("primary", wide_universe(100))
            .sleepy(Duration::from_millis(100)),
        FixtureProvider::new("secondary", wide_universe(100)),
        EngineConfig::default(),
    );

    let mut request = blue_chip_request();
    request.worker_count = Some(2);
    let id = h.engine.start(request).unwrap();

    // Poll progress while the job runs; percent must never decrease
    let mut last_percent = 0u8;
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(view) = h.engine.progress(&id) {
            assert!(view.percent >= last_percent, "progress went backwards");
            last_percent = view.percent;
        }
    }

    h.engine.cancel(&id).unwrap();

    // Terminal within one polling interval
    tokio::time::sleep(Duration::from_millis(200)).await;
    let view = h.engine.progress(&id).unwrap();
    assert_eq!(view.state, JobState::Cancelled);
    assert!(view.percent >= last_percent);

    let result = await_result(&h.engine, id.as_str()).await;
    assert!(result.cancelled);
    assert_eq!(result.state, JobState::Cancelled);
    assert!(result.analyzed <= 20, "analyzed {} too high", result.analyzed);
    assert_eq!(
        result.analyzed + result.skipped,
        result.analysis_set_size
    );

    // In-flight calls drain out; after that no further upstream traffic
    tokio::time::sleep(Duration::from_millis(300)).await;
    let settled = h.primary.total_calls();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.primary.total_calls(), settled);
}

#[tokio::test]
async fn test_cancel_unknown_and_terminal() {
    let h = harness(
        FixtureProvider::new("primary", blue_chip_universe()),
        FixtureProvider::new("secondary", blue_chip_universe()),
        EngineConfig::default(),
    );

    assert!(h.engine.cancel("ghost").is_err());

    let id = h.engine.start(blue_chip_request()).unwrap();
    await_result(&h.engine, id.as_str()).await;
    assert!(h.engine.cancel(&id).is_err());
}

// ============================================================================
// Capacity and retention
// ============================================================================

#[tokio::test]
async fn test_capacity_ceiling() {
    let config = EngineConfig {
        max_concurrent_jobs: 1,
        ..EngineConfig::default()
    };
    let h = harness(
        FixtureProvider::new("primary", wide_universe(50))
            .sleepy(Duration::from_millis(50)),
        FixtureProvider::new("secondary", wide_universe(50)),
        config,
    );

    let id = h.engine.start(blue_chip_request()).unwrap();
    match h.engine.start(blue_chip_request()) {
        Err(StartError::CapacityExceeded { limit }) => assert_eq!(limit, 1),
        other => panic!("expected CapacityExceeded, got {:?}", other.err()),
    }

    h.engine.cancel(&id).unwrap();
}

#[tokio::test]
async fn test_retention_evicts_oldest_result() {
    let config = EngineConfig {
        job_retention: 1,
        ..EngineConfig::default()
    };
    let h = harness(
        FixtureProvider::new("primary", blue_chip_universe()),
        FixtureProvider::new("secondary", blue_chip_universe()),
        config,
    );

    let first = h.engine.start(blue_chip_request()).unwrap();
    await_result(&h.engine, first.as_str()).await;

    let second = h.engine.start(blue_chip_request()).unwrap();
    await_result(&h.engine, second.as_str()).await;

    // The older completed job fell out of the retention window
    assert!(h.engine.result(&first).is_err());
    assert!(h.engine.progress(&first).is_none());
    assert!(h.engine.result(&second).is_ok());
}

// ============================================================================
// Worker count clamping
// ============================================================================

#[tokio::test]
async fn test_oversized_worker_count_is_clamped_and_completes() {
    let h = harness(
        FixtureProvider::new("primary", blue_chip_universe()),
        FixtureProvider::new("secondary", blue_chip_universe()),
        EngineConfig::default(),
    );

    let mut request = blue_chip_request();
    request.worker_count = Some(99);
    let id = h.engine.start(request).unwrap();
    let result = await_result(&h.engine, id.as_str()).await;
    assert_eq!(result.state, JobState::Completed);
    assert_eq!(result.analyzed, 3);
}
