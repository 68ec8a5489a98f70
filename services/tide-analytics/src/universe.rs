//! Universe resolution: translate a market/industry filter into the
//! deduplicated, deterministically ordered ticker list a job analyzes.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::data::{Board, DataGateway, Market, ProviderError, TickerRef};

/// The wildcard token accepted on both filter axes.
pub const ALL: &str = "all";

// ============================================================================
// Filter
// ============================================================================

/// Universe filter over markets and industries.
///
/// Market tokens are exchange tags (`sh`/`sz`/`bj`) or board tags
/// (`main`/`star`/`gem`/`beijing`); `all` lifts the restriction on that axis.
/// Industries match exactly against the reference industry tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseFilter {
    #[serde(default = "default_all")]
    pub markets: Vec<String>,
    #[serde(default = "default_all")]
    pub industries: Vec<String>,
}

fn default_all() -> Vec<String> {
    vec![ALL.to_string()]
}

impl Default for UniverseFilter {
    fn default() -> Self {
        Self {
            markets: default_all(),
            industries: default_all(),
        }
    }
}

impl UniverseFilter {
    /// Validate the market tokens; industry tags are free-form.
    pub fn validate(&self) -> Result<(), String> {
        for token in &self.markets {
            let token = token.to_lowercase();
            match token.as_str() {
                ALL | "sh" | "sz" | "bj" | "main" | "star" | "gem" | "beijing" => {}
                other => return Err(format!("unknown market token '{}'", other)),
            }
        }
        if self.markets.is_empty() {
            return Err("markets filter must not be empty".to_string());
        }
        if self.industries.is_empty() {
            return Err("industries filter must not be empty".to_string());
        }
        Ok(())
    }

    fn matches_market(&self, ticker: &TickerRef) -> bool {
        self.markets.iter().any(|token| {
            let token = token.to_lowercase();
            if token == ALL {
                return true;
            }
            match token.as_str() {
                "sh" => ticker.market == Market::Sh,
                "sz" => ticker.market == Market::Sz,
                "bj" => ticker.market == Market::Bj,
                tag => Board::from_code(&ticker.code).map(|b| b.tag() == tag) == Some(true),
            }
        })
    }

    fn matches_industry(&self, ticker: &TickerRef) -> bool {
        self.industries.iter().any(|token| {
            token == ALL || Some(token.as_str()) == ticker.industry.as_deref()
        })
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Resolves a filter into the analysis universe.
pub struct UniverseResolver {
    gateway: Arc<DataGateway>,
}

impl UniverseResolver {
    pub fn new(gateway: Arc<DataGateway>) -> Self {
        Self { gateway }
    }

    /// Resolve a filter into a deduplicated ticker list in ascending code
    /// order. An empty result is a legal outcome, not an error.
    ///
    /// Names carrying suspension/delisting markers ("ST", "退") are dropped
    /// before any axis filter is applied.
    pub async fn resolve(&self, filter: &UniverseFilter) -> Result<Vec<TickerRef>, ProviderError> {
        let roster = self.gateway.reference_universe().await?;
        let total = roster.len();

        let mut seen = HashSet::new();
        let mut selected: Vec<TickerRef> = roster
            .into_iter()
            .filter(|t| !t.is_flagged())
            .filter(|t| filter.matches_market(t))
            .filter(|t| filter.matches_industry(t))
            .filter(|t| seen.insert(t.code.clone()))
            .collect();

        selected.sort_by(|a, b| a.code.cmp(&b.code));

        debug!(
            total,
            selected = selected.len(),
            markets = ?filter.markets,
            industries = ?filter.industries,
            "Universe resolved"
        );

        Ok(selected)
    }
}

// ============================================================================
// Tests
// ============================================================================
