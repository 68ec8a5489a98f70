//! Strategy definitions and the process-local registry.
//!
//! A strategy is data, not code: an ordered schema of numeric bounds, each
//! reading one field of a ticker's merged profile. Adding a strategy means
//! adding a registry entry; the engine itself is parameter-driven.

pub mod evaluator;

pub use evaluator::{Grade, ScoredStock, StockProfile};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Parameter schema
// ============================================================================

/// How a bound compares the profile field against the parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundKind {
    /// Field must be ≥ value
    Min,
    /// Field must be ≤ value
    Max,
}

/// One named numeric bound in a strategy's schema.
#[derive(Debug, Clone, Serialize)]
pub struct ParamSpec {
    /// Parameter name as supplied by callers (e.g. "pe_max")
    pub name: &'static str,
    /// Profile field the bound reads (e.g. "pe")
    pub field: &'static str,
    /// Comparison direction
    pub kind: BoundKind,
    /// Lowest value a caller may bind
    pub floor: f64,
    /// Highest value a caller may bind
    pub ceil: f64,
    /// Value used when the caller does not override
    pub default: f64,
    /// Weight in the raw score
    pub weight: f64,
    /// Hard bounds reject the ticker on violation or missing data
    pub hard: bool,
}

impl ParamSpec {
    const fn new(
        name: &'static str,
        field: &'static str,
        kind: BoundKind,
        floor: f64,
        ceil: f64,
        default: f64,
    ) -> Self {
        Self {
            name,
            field,
            kind,
            floor,
            ceil,
            default,
            weight: 1.0,
            hard: false,
        }
    }

    const fn hard(mut self) -> Self {
        self.hard = true;
        self
    }

    const fn weighted(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

// ============================================================================
// Strategy definition
// ============================================================================

/// Risk classification shown in the registry listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// An immutable strategy entry.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyDefinition {
    /// Stable identifier used in requests
    pub id: &'static str,
    /// Display name
    pub name: &'static str,
    /// Category tag
    pub category: &'static str,
    /// Risk classification
    pub risk_level: RiskLevel,
    /// Ordered parameter schema
    pub schema: Vec<ParamSpec>,
    /// Default qualification threshold
    pub min_score_default: f64,
}

/// Concrete parameter overrides supplied at job start.
pub type StrategyParameters = HashMap<String, f64>;

/// A bound with its resolved value, ready for evaluation.
#[derive(Debug, Clone)]
pub struct ResolvedBound {
    pub name: &'static str,
    pub field: &'static str,
    pub kind: BoundKind,
    pub value: f64,
    pub weight: f64,
    pub hard: bool,
}

/// A strategy with every parameter bound to a concrete value.
#[derive(Debug, Clone)]
pub struct ResolvedStrategy {
    pub id: String,
    pub name: String,
    pub bounds: Vec<ResolvedBound>,
    pub min_score: f64,
}

impl StrategyDefinition {
    /// Bind caller overrides against the schema.
    ///
    /// Unknown parameter names and values outside the declared range are
    /// rejected; omitted parameters take their defaults.
    pub fn resolve(
        &self,
        overrides: &StrategyParameters,
        min_score: Option<f64>,
    ) -> Result<ResolvedStrategy, String> {
        for name in overrides.keys() {
            if !self.schema.iter().any(|spec| spec.name == name) {
                return Err(format!(
                    "strategy '{}' has no parameter '{}'",
                    self.id, name
                ));
            }
        }

        let mut bounds = Vec::with_capacity(self.schema.len());
        for spec in &self.schema {
            let value = overrides.get(spec.name).copied().unwrap_or(spec.default);
            if !value.is_finite() {
                return Err(format!("parameter '{}' must be finite", spec.name));
            }
            if value < spec.floor || value > spec.ceil {
                return Err(format!(
                    "parameter '{}' = {} outside declared range [{}, {}]",
                    spec.name, value, spec.floor, spec.ceil
                ));
            }
            bounds.push(ResolvedBound {
                name: spec.name,
                field: spec.field,
                kind: spec.kind,
                value,
                weight: spec.weight,
                hard: spec.hard,
            });
        }

        let min_score = min_score.unwrap_or(self.min_score_default);
        if !(0.0..=100.0).contains(&min_score) {
            return Err(format!("min_score {} outside [0, 100]", min_score));
        }

        Ok(ResolvedStrategy {
            id: self.id.to_string(),
            name: self.name.to_string(),
            bounds,
            min_score,
        })
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Process-local immutable strategy list, loaded at startup.
pub struct StrategyRegistry {
    strategies: Vec<StrategyDefinition>,
}

impl StrategyRegistry {
    /// The built-in strategy set.
    pub fn builtin() -> Self {
        use BoundKind::{Max, Min};

        let strategies = vec![
            StrategyDefinition {
                id: "blue_chip",
                name: "蓝筹白马",
                category: "value",
                risk_level: RiskLevel::Low,
                schema: vec![
                    ParamSpec::new("pe_max", "pe", Max, 1.0, 200.0, 25.0).hard(),
                    ParamSpec::new("pb_max", "pb", Max, 0.1, 50.0, 3.0).hard(),
                    ParamSpec::new("roe_min", "roe", Min, 0.0, 60.0, 10.0).hard(),
                    ParamSpec::new("market_cap_min", "market_cap", Min, 0.0, 50_000.0, 1000.0)
                        .hard(),
                ],
                min_score_default: 60.0,
            },
            StrategyDefinition {
                id: "dividend",
                name: "高股息",
                category: "dividend",
                risk_level: RiskLevel::Low,
                schema: vec![
                    ParamSpec::new("dividend_yield_min", "dividend_yield", Min, 0.0, 20.0, 3.0)
                        .hard()
                        .weighted(2.0),
                    ParamSpec::new("payout_ratio_min", "payout_ratio", Min, 0.0, 100.0, 30.0),
                    ParamSpec::new("pe_max", "pe", Max, 1.0, 200.0, 20.0),
                    ParamSpec::new("debt_ratio_max", "debt_ratio", Max, 0.0, 100.0, 60.0),
                ],
                min_score_default: 60.0,
            },
            StrategyDefinition {
                id: "quality_growth",
                name: "质量成长",
                category: "growth",
                risk_level: RiskLevel::Medium,
                schema: vec![
                    ParamSpec::new("revenue_growth_min", "revenue_growth", Min, -50.0, 300.0, 15.0)
                        .hard()
                        .weighted(2.0),
                    ParamSpec::new("profit_growth_min", "profit_growth", Min, -50.0, 300.0, 20.0)
                        .weighted(2.0),
                    ParamSpec::new("roe_min", "roe", Min, 0.0, 60.0, 12.0),
                    ParamSpec::new("rd_ratio_min", "rd_ratio", Min, 0.0, 50.0, 3.0),
                ],
                min_score_default: 65.0,
            },
            StrategyDefinition {
                id: "deep_value",
                name: "深度价值",
                category: "value",
                risk_level: RiskLevel::Medium,
                schema: vec![
                    ParamSpec::new("pe_max", "pe", Max, 1.0, 100.0, 15.0).hard().weighted(2.0),
                    ParamSpec::new("pb_max", "pb", Max, 0.1, 20.0, 1.5).hard().weighted(2.0),
                    ParamSpec::new("current_ratio_min", "current_ratio", Min, 0.0, 20.0, 1.2),
                    ParamSpec::new("debt_ratio_max", "debt_ratio", Max, 0.0, 100.0, 50.0),
                ],
                min_score_default: 60.0,
            },
            StrategyDefinition {
                id: "small_cap_momentum",
                name: "小盘动量",
                category: "momentum",
                risk_level: RiskLevel::High,
                schema: vec![
                    ParamSpec::new("market_cap_max", "market_cap", Max, 10.0, 5000.0, 300.0)
                        .hard(),
                    ParamSpec::new("turnover_min", "turnover", Min, 0.0, 50.0, 3.0),
                    ParamSpec::new("rsi_min", "rsi", Min, 0.0, 100.0, 50.0),
                    ParamSpec::new("rsi_max", "rsi", Max, 0.0, 100.0, 75.0),
                ],
                min_score_default: 70.0,
            },
            StrategyDefinition {
                id: "multi_factor",
                name: "多因子综合",
                category: "multi_factor",
                risk_level: RiskLevel::Medium,
                schema: vec![
                    ParamSpec::new("pe_max", "pe", Max, 1.0, 200.0, 40.0),
                    ParamSpec::new("roe_min", "roe", Min, 0.0, 60.0, 8.0),
                    ParamSpec::new("revenue_growth_min", "revenue_growth", Min, -50.0, 300.0, 5.0),
                    ParamSpec::new("gross_margin_min", "gross_margin", Min, 0.0, 100.0, 20.0),
                    ParamSpec::new("debt_ratio_max", "debt_ratio", Max, 0.0, 100.0, 65.0),
                ],
                min_score_default: 60.0,
            },
        ];

        Self { strategies }
    }

    /// Look up a strategy by id.
    pub fn get(&self, id: &str) -> Option<&StrategyDefinition> {
        self.strategies.iter().find(|s| s.id == id)
    }

    /// All registered strategies.
    pub fn list(&self) -> &[StrategyDefinition] {
        &self.strategies
    }
}

// ============================================================================
// Tests
// ============================================================================
