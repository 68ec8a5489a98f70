//! Quote provider abstraction for multi-source market data.
//!
//! Defines the `QuoteProvider` capability that all upstream data sources
//! implement, enabling failover routing in the gateway. Implementations are
//! injected; the rest of the system never talks to an upstream directly.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::{Fundamentals, HistoryBar, QuoteSnapshot, TickerRef};

// ============================================================================
// Provider Error
// ============================================================================

/// Errors a quote provider operation can fail with.
#[derive(Debug, Clone)]
pub enum ProviderError {
    /// Provider refused, timed out or is otherwise unreachable
    Unavailable(String),
    /// Caller must back off; optional cooldown hint
    RateLimited { retry_after_secs: Option<u64> },
    /// Ticker unknown to this provider
    NotFound(String),
    /// Response could not be parsed or failed validation
    Malformed(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "Provider unavailable: {}", msg),
            Self::RateLimited { retry_after_secs } => {
                write!(f, "Rate limited")?;
                if let Some(secs) = retry_after_secs {
                    write!(f, ", retry after {} seconds", secs)?;
                }
                Ok(())
            }
            Self::NotFound(msg) => write!(f, "Not found: {}", msg),
            Self::Malformed(msg) => write!(f, "Malformed response: {}", msg),
        }
    }
}

impl std::error::Error for ProviderError {}

impl ProviderError {
    /// Check if this error should trigger a failover to the next provider.
    ///
    /// NotFound is authoritative: a ticker the upstream does not know will
    /// not appear on the backup either.
    pub fn should_failover(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::RateLimited { .. } | Self::Malformed(_)
        )
    }

    /// Severity rank used when both providers fail: the stronger error
    /// propagates (Unavailable > Malformed > RateLimited > NotFound).
    pub fn severity(&self) -> u8 {
        match self {
            Self::Unavailable(_) => 3,
            Self::Malformed(_) => 2,
            Self::RateLimited { .. } => 1,
            Self::NotFound(_) => 0,
        }
    }

    /// Pick the stronger of two errors.
    pub fn stronger(self, other: ProviderError) -> ProviderError {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl From<ProviderError> for tide_common::Error {
    fn from(error: ProviderError) -> Self {
        match error {
            ProviderError::Unavailable(msg) => Self::Unavailable(msg),
            ProviderError::RateLimited { retry_after_secs } => Self::RateLimited(match retry_after_secs {
                Some(secs) => format!("retry after {} seconds", secs),
                None => "upstream rate limit".to_string(),
            }),
            ProviderError::NotFound(msg) => Self::NotFound(msg),
            ProviderError::Malformed(msg) => Self::Upstream(msg),
        }
    }
}

// ============================================================================
// Quote Provider Trait
// ============================================================================

/// Capability contract for upstream market data sources.
///
/// Both production sources (TuShare, Eastmoney) implement this trait and are
/// injected into the gateway, which owns failover, rate limiting and
/// normalization policy. Providers stay dumb.
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    /// Provider name for logging and source attribution (e.g. "tushare")
    fn name(&self) -> &'static str;

    /// Fetch the full A-share reference roster.
    async fn load_reference_universe(&self) -> Result<Vec<TickerRef>, ProviderError>;

    /// Fetch latest-session snapshots for a batch of tickers.
    ///
    /// One round-trip where the upstream supports it. Tickers the upstream
    /// cannot serve are simply missing from the map.
    async fn fetch_snapshot_batch(
        &self,
        codes: &[String],
    ) -> Result<HashMap<String, QuoteSnapshot>, ProviderError>;

    /// Fetch daily OHLCV history, oldest bar first, no gaps on trading days.
    async fn fetch_history(
        &self,
        code: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<HistoryBar>, ProviderError>;

    /// Fetch fundamental metrics for a ticker.
    async fn fetch_fundamentals(&self, code: &str) -> Result<Fundamentals, ProviderError>;
}

// ============================================================================
// Provider Info (for monitoring)
// ============================================================================

/// Runtime information about a provider, exposed on the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// Provider name
    pub name: String,
    /// Role in the failover chain ("primary" / "secondary")
    pub role: String,
    /// Successful calls served
    pub success_count: u64,
    /// Failed calls
    pub error_count: u64,
    /// Last error message (if any)
    pub last_error: Option<String>,
    /// Timestamp of the last successful call
    pub last_success: Option<DateTime<Utc>>,
}

// ============================================================================
// Tests
// ============================================================================
