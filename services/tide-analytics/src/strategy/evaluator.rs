//! Strategy evaluation: score one ticker's merged profile against a
//! resolved strategy.
//!
//! Deterministic and free of I/O: the same profile and strategy always
//! produce the same `ScoredStock`. The industry-relative momentum bonus is
//! applied in a second pure pass at seal time, once the whole analysis set
//! is known.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::data::{Fundamentals, Market, QuoteSnapshot, TickerRef};
use crate::indicators::IndicatorSet;

use super::{BoundKind, ResolvedBound, ResolvedStrategy};

/// Bonus for a fresh MACD bullish crossover with price above MA20.
const TECHNICAL_BONUS: f64 = 10.0;

/// Bonus for beating the industry median 20-bar return.
const MOMENTUM_BONUS: f64 = 5.0;

// ============================================================================
// Inputs
// ============================================================================

/// One ticker's merged data, the unit of evaluation.
#[derive(Debug, Clone)]
pub struct StockProfile {
    pub ticker: TickerRef,
    pub snapshot: QuoteSnapshot,
    pub fundamentals: Fundamentals,
    pub indicators: IndicatorSet,
    /// Provider that served the fundamentals
    pub data_source: String,
}

impl StockProfile {
    /// Read a schema field off the profile.
    ///
    /// The accessor table is the only place field names are interpreted;
    /// strategies reference fields by these names.
    fn field(&self, name: &str) -> Option<f64> {
        match name {
            "pe" => self.fundamentals.pe,
            "pb" => self.fundamentals.pb,
            "roe" => self.fundamentals.roe,
            "revenue_growth" => self.fundamentals.revenue_growth,
            "profit_growth" => self.fundamentals.profit_growth,
            "debt_ratio" => self.fundamentals.debt_ratio,
            "current_ratio" => self.fundamentals.current_ratio,
            "dividend_yield" => self.fundamentals.dividend_yield,
            "payout_ratio" => self.fundamentals.payout_ratio,
            "gross_margin" => self.fundamentals.gross_margin,
            "rd_ratio" => self.fundamentals.rd_ratio,
            "market_cap" => self.fundamentals.market_cap.or(self.ticker.market_cap),
            "float_cap" => self.fundamentals.float_cap.or(self.ticker.float_cap),
            "turnover" => self.snapshot.turnover_rate,
            "close" => Some(self.snapshot.close),
            "percent_change" => Some(self.snapshot.percent_change()),
            "rsi" => self.indicators.rsi14,
            _ => None,
        }
    }

    fn market_cap(&self) -> Option<f64> {
        self.fundamentals.market_cap.or(self.ticker.market_cap)
    }
}

// ============================================================================
// Output
// ============================================================================

/// Letter grade derived from the numeric score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Grade {
    S,
    A,
    B,
    C,
    D,
}

impl Grade {
    /// Bucket a score: ≥90 S, 80–89 A, 70–79 B, 60–69 C, <60 D.
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            Self::S
        } else if score >= 80.0 {
            Self::A
        } else if score >= 70.0 {
            Self::B
        } else if score >= 60.0 {
            Self::C
        } else {
            Self::D
        }
    }
}

impl std::fmt::Display for Grade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::S => "S",
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
        };
        write!(f, "{}", s)
    }
}

/// Evaluation result for one ticker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredStock {
    pub code: String,
    pub name: String,
    pub market: Market,
    pub industry: Option<String>,
    pub score: f64,
    pub grade: Grade,
    pub qualified: bool,
    pub reason: String,
    pub close: f64,
    pub percent_change: f64,
    pub pe: Option<f64>,
    pub pb: Option<f64>,
    pub roe: Option<f64>,
    pub market_cap: Option<f64>,
    pub macd_hist: Option<f64>,
    pub rsi: Option<f64>,
    pub boll_position: Option<f64>,
    pub signals_count: u32,
    pub data_source: String,
    /// 20-bar return, the momentum-bonus input
    pub return_20d: Option<f64>,
    /// Whether any hard bound was violated (disqualifying)
    pub hard_bound_violated: bool,
}

// ============================================================================
// Evaluation
// ============================================================================

/// Score a profile against a resolved strategy.
pub fn evaluate(strategy: &ResolvedStrategy, profile: &StockProfile) -> ScoredStock {
    let mut satisfied_weight = 0.0;
    let mut total_weight = 0.0;
    let mut hard_violated = false;
    let mut first_failure: Option<String> = None;
    let mut satisfied: Vec<&ResolvedBound> = Vec::new();

    for bound in &strategy.bounds {
        total_weight += bound.weight;

        match profile.field(bound.field) {
            Some(value) if bound_satisfied(bound, value) => {
                satisfied_weight += bound.weight;
                satisfied.push(bound);
            }
            Some(value) => {
                if bound.hard {
                    hard_violated = true;
                }
                if first_failure.is_none() {
                    first_failure = Some(format!(
                        "{} {:.2} fails {} {}",
                        bound.field, value, bound.name, bound.value
                    ));
                }
            }
            None => {
                // Absent never satisfies a bound; a hard bound rejects
                if bound.hard {
                    hard_violated = true;
                }
                if first_failure.is_none() {
                    first_failure = Some(format!("{} unavailable for {}", bound.field, bound.name));
                }
            }
        }
    }

    let raw = if total_weight > 0.0 {
        satisfied_weight / total_weight * 100.0
    } else {
        0.0
    };

    // Technical-alignment bonus: fresh MACD bullish crossover above MA20
    let technical_bonus = if profile.indicators.macd_bullish_cross_3
        && profile.indicators.close_above_ma20
    {
        TECHNICAL_BONUS
    } else {
        0.0
    };

    let score = (raw + technical_bonus).clamp(0.0, 100.0);

    let reason = match first_failure {
        Some(failure) => failure,
        None => {
            let mut top: Vec<&ResolvedBound> = satisfied.clone();
            top.sort_by(|a, b| {
                b.weight
                    .partial_cmp(&a.weight)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let names: Vec<&str> = top.iter().take(3).map(|b| b.name).collect();
            if names.is_empty() {
                "no bounds declared".to_string()
            } else {
                format!("meets {}", names.join(", "))
            }
        }
    };

    ScoredStock {
        code: profile.ticker.code.clone(),
        name: profile.ticker.name.clone(),
        market: profile.ticker.market,
        industry: profile.ticker.industry.clone(),
        score,
        grade: Grade::from_score(score),
        qualified: !hard_violated && score >= strategy.min_score,
        reason,
        close: profile.snapshot.close,
        percent_change: profile.snapshot.percent_change(),
        pe: profile.fundamentals.pe,
        pb: profile.fundamentals.pb,
        roe: profile.fundamentals.roe,
        market_cap: profile.market_cap(),
        macd_hist: profile.indicators.macd_hist,
        rsi: profile.indicators.rsi14,
        boll_position: profile.indicators.boll_position,
        signals_count: profile.indicators.bullish_signal_count(),
        data_source: profile.data_source.clone(),
        return_20d: profile.indicators.return_20d,
        hard_bound_violated: hard_violated,
    }
}

fn bound_satisfied(bound: &ResolvedBound, value: f64) -> bool {
    match bound.kind {
        BoundKind::Min => value >= bound.value,
        BoundKind::Max => value <= bound.value,
    }
}

// ============================================================================
// Seal-time momentum pass
// ============================================================================

/// Apply the industry-relative momentum bonus across the analyzed set.
///
/// A stock whose 20-bar return strictly exceeds its industry's median earns
/// the bonus; scores are re-clipped, grades and qualified flags re-derived.
/// Pure function of the slice contents, independent of commit order.
pub fn apply_momentum_bonus(stocks: &mut [ScoredStock], min_score: f64) {
    let mut by_industry: HashMap<String, Vec<f64>> = HashMap::new();
    for stock in stocks.iter() {
        if let Some(r) = stock.return_20d {
            by_industry
                .entry(industry_key(stock))
                .or_default()
                .push(r);
        }
    }

    let medians: HashMap<String, f64> = by_industry
        .into_iter()
        .map(|(industry, mut returns)| {
            returns.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            (industry, median_of_sorted(&returns))
        })
        .collect();

    for stock in stocks.iter_mut() {
        let Some(r) = stock.return_20d else {
            continue;
        };
        let Some(median) = medians.get(&industry_key(stock)) else {
            continue;
        };
        if r > *median {
            stock.score = (stock.score + MOMENTUM_BONUS).clamp(0.0, 100.0);
            stock.grade = Grade::from_score(stock.score);
            stock.qualified = !stock.hard_bound_violated && stock.score >= min_score;
        }
    }
}

fn industry_key(stock: &ScoredStock) -> String {
    stock
        .industry
        .clone()
        .unwrap_or_else(|| "unclassified".to_string())
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{StrategyParameters, StrategyRegistry};
    use chrono::Utc;

    fn profile(pe: Option<f64>, pb: Option<f64>, roe: Option<f64>, cap: Option<f64>) -> StockProfile {
        StockProfile {
            ticker: TickerRef {
                code: "600036".into(),
                name: "招商银行".into(),
                market: Market::Sh,
                industry: Some("银行".into()),
                area: None,
                market_cap: None,
                float_cap: None,
            },
            snapshot: QuoteSnapshot {
                code: "600036".into(),
                open: 33.0,
                high: 34.0,
                low: 32.5,
                close: 33.6,
                prev_close: 32.0,
                volume: 1_000_000.0,
                amount: 33_000_000.0,
                turnover_rate: Some(1.2),
                timestamp: Utc::now(),
            },
            fundamentals: Fundamentals {
                pe,
                pb,
                roe,
                market_cap: cap,
                ..Default::default()
            },
            indicators: IndicatorSet::default(),
            data_source: "tushare".into(),
        }
    }

    fn blue_chip() -> ResolvedStrategy {
        StrategyRegistry::builtin()
            .get("blue_chip")
            .unwrap()
            .resolve(&StrategyParameters::new(), None)
            .unwrap()
    }

    #[test]
    fn test_all_bounds_satisfied_scores_100() {
        let strategy = blue_chip();
        let scored = evaluate(&strategy, &profile(Some(8.0), Some(1.0), Some(15.0), Some(2000.0)));
        assert_eq!(scored.score, 100.0);
        assert_eq!(scored.grade, Grade::S);
        assert!(scored.qualified);
        assert!(!scored.hard_bound_violated);
        assert!(scored.reason.starts_with("meets"));
    }

    #[test]
    fn test_hard_bound_violation_rejects() {
        let strategy = blue_chip();
        // 600519-like: pe=35 breaches pe_max=25
        let scored = evaluate(&strategy, &profile(Some(35.0), Some(10.0), Some(30.0), Some(2500.0)));
        assert!(scored.hard_bound_violated);
        assert!(!scored.qualified);
        assert!(scored.reason.contains("pe"));
        // roe and cap still satisfied: half the weight
        assert_eq!(scored.score, 50.0);
    }

    #[test]
    fn test_absent_field_on_hard_bound_rejects() {
        let strategy = blue_chip();
        let scored = evaluate(&strategy, &profile(None, Some(1.0), Some(15.0), Some(2000.0)));
        assert!(scored.hard_bound_violated);
        assert!(!scored.qualified);
        assert!(scored.reason.contains("unavailable"));
    }

    #[test]
    fn test_absent_field_on_soft_bound_only_loses_weight() {
        let registry = StrategyRegistry::builtin();
        // multi_factor has only soft bounds
        let strategy = registry
            .get("multi_factor")
            .unwrap()
            .resolve(&StrategyParameters::new(), None)
            .unwrap();

        let mut p = profile(Some(20.0), None, Some(15.0), None);
        p.fundamentals.revenue_growth = Some(10.0);
        p.fundamentals.gross_margin = None;
        p.fundamentals.debt_ratio = Some(40.0);

        let scored = evaluate(&strategy, &p);
        assert!(!scored.hard_bound_violated);
        // 4 of 5 equal-weight bounds met (gross_margin absent)
        assert_eq!(scored.score, 80.0);
    }

    #[test]
    fn test_technical_bonus_applied_and_clipped() {
        let strategy = blue_chip();
        let mut p = profile(Some(8.0), Some(1.0), Some(15.0), Some(2000.0));
        p.indicators.macd_bullish_cross_3 = true;
        p.indicators.close_above_ma20 = true;

        let scored = evaluate(&strategy, &p);
        // 100 + 10 clipped back to 100
        assert_eq!(scored.score, 100.0);

        // Half-satisfied case shows the bonus
        let mut p = profile(Some(35.0), Some(10.0), Some(15.0), Some(2000.0));
        p.indicators.macd_bullish_cross_3 = true;
        p.indicators.close_above_ma20 = true;
        let scored = evaluate(&strategy, &p);
        assert_eq!(scored.score, 60.0);
    }

    #[test]
    fn test_grade_buckets() {
        assert_eq!(Grade::from_score(95.0), Grade::S);
        assert_eq!(Grade::from_score(90.0), Grade::S);
        assert_eq!(Grade::from_score(89.9), Grade::A);
        assert_eq!(Grade::from_score(80.0), Grade::A);
        assert_eq!(Grade::from_score(79.9), Grade::B);
        assert_eq!(Grade::from_score(70.0), Grade::B);
        assert_eq!(Grade::from_score(69.9), Grade::C);
        assert_eq!(Grade::from_score(60.0), Grade::C);
        assert_eq!(Grade::from_score(59.9), Grade::D);
        assert_eq!(Grade::from_score(0.0), Grade::D);
    }

    #[test]
    fn test_determinism() {
        let strategy = blue_chip();
        let p = profile(Some(8.0), Some(1.0), Some(15.0), Some(2000.0));
        let a = evaluate(&strategy, &p);
        let b = evaluate(&strategy, &p);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    fn scored_with_return(code: &str, industry: &str, score: f64, ret: Option<f64>) -> ScoredStock {
        ScoredStock {
            code: code.into(),
            name: code.into(),
            market: Market::Sh,
            industry: Some(industry.into()),
            score,
            grade: Grade::from_score(score),
            qualified: score >= 60.0,
            reason: String::new(),
            close: 10.0,
            percent_change: 0.0,
            pe: None,
            pb: None,
            roe: None,
            market_cap: None,
            macd_hist: None,
            rsi: None,
            boll_position: None,
            signals_count: 0,
            data_source: "tushare".into(),
            return_20d: ret,
            hard_bound_violated: false,
        }
    }

    #[test]
    fn test_momentum_bonus_above_industry_median() {
        let mut stocks = vec![
            scored_with_return("600001", "银行", 70.0, Some(10.0)),
            scored_with_return("600002", "银行", 70.0, Some(2.0)),
            scored_with_return("600003", "银行", 70.0, Some(-5.0)),
        ];
        apply_momentum_bonus(&mut stocks, 60.0);

        // Median is 2.0: only the 10% return beats it strictly
        assert_eq!(stocks[0].score, 75.0);
        assert_eq!(stocks[1].score, 70.0);
        assert_eq!(stocks[2].score, 70.0);
    }

    #[test]
    fn test_momentum_bonus_single_stock_gets_nothing() {
        let mut stocks = vec![scored_with_return("600001", "银行", 70.0, Some(10.0))];
        apply_momentum_bonus(&mut stocks, 60.0);
        // Equal to its own median: strict comparison denies the bonus
        assert_eq!(stocks[0].score, 70.0);
    }

    #[test]
    fn test_momentum_bonus_requalifies() {
        let mut stocks = vec![
            scored_with_return("600001", "银行", 58.0, Some(10.0)),
            scored_with_return("600002", "银行", 58.0, Some(0.0)),
        ];
        stocks[0].qualified = false;
        stocks[1].qualified = false;

        apply_momentum_bonus(&mut stocks, 60.0);

        // Median of {10, 0} is 5: the winner crosses the threshold
        assert_eq!(stocks[0].score, 63.0);
        assert!(stocks[0].qualified);
        assert_eq!(stocks[1].score, 58.0);
        assert!(!stocks[1].qualified);
    }

    #[test]
    fn test_momentum_bonus_never_requalifies_hard_violation() {
        let mut stocks = vec![
            scored_with_return("600001", "银行", 58.0, Some(10.0)),
            scored_with_return("600002", "银行", 58.0, Some(0.0)),
        ];
        stocks[0].hard_bound_violated = true;
        stocks[0].qualified = false;

        apply_momentum_bonus(&mut stocks, 60.0);
        assert_eq!(stocks[0].score, 63.0);
        assert!(!stocks[0].qualified);
    }
}
