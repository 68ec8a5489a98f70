//! Market data module for A-shares.
//!
//! Provides the core data types plus fetching, caching and failover across
//! two upstream providers.
//!
//! # Data Sources
//! - **TuShare** (Primary): REST API, requires token, full fundamentals
//! - **Eastmoney** (Backup): public push2 endpoints, no token, partial
//!   fundamentals

mod cache;
mod eastmoney;
mod gateway;
mod provider;
mod rate_limiter;
mod tushare;

pub use cache::{CacheKey, CacheStats, QuoteCache};
pub use eastmoney::EastmoneyProvider;
pub use gateway::{DataGateway, GatewayConfig, SourceBreakdown, Sourced};
pub use provider::{ProviderError, ProviderInfo, QuoteProvider};
pub use rate_limiter::RateLimiter;
pub use tushare::TushareProvider;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Market classification
// ============================================================================

/// Exchange a ticker trades on, derived from its code prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Market {
    /// Shanghai Stock Exchange (600/601/603/605/688)
    Sh,
    /// Shenzhen Stock Exchange (000/001/002/003/300)
    Sz,
    /// Beijing Stock Exchange (8xx/4xx)
    Bj,
}

impl Market {
    /// Derive the market from a bare 6-digit code.
    ///
    /// Returns `None` for codes outside the A-share numbering plan.
    pub fn from_code(code: &str) -> Option<Self> {
        if code.len() != 6 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let p3 = &code[..3];
        match p3 {
            "600" | "601" | "603" | "605" | "688" => Some(Self::Sh),
            "000" | "001" | "002" | "003" | "300" => Some(Self::Sz),
            _ => match &code[..1] {
                "8" | "4" => Some(Self::Bj),
                _ => None,
            },
        }
    }

    /// The two-character market suffix (e.g. "SH").
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Sh => "SH",
            Self::Sz => "SZ",
            Self::Bj => "BJ",
        }
    }
}

impl std::fmt::Display for Market {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.suffix())
    }
}

/// Board a ticker belongs to, a finer split than the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Board {
    /// Shanghai/Shenzhen main boards
    Main,
    /// STAR market (科创板, 688)
    Star,
    /// ChiNext (创业板, 300)
    ChiNext,
    /// Beijing exchange (北交所)
    Beijing,
}

impl Board {
    /// Derive the board from a bare 6-digit code.
    pub fn from_code(code: &str) -> Option<Self> {
        let market = Market::from_code(code)?;
        Some(match market {
            Market::Sh if code.starts_with("688") => Self::Star,
            Market::Sz if code.starts_with("300") => Self::ChiNext,
            Market::Bj => Self::Beijing,
            _ => Self::Main,
        })
    }

    /// Stable tag used in filters and reports.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Star => "star",
            Self::ChiNext => "gem",
            Self::Beijing => "beijing",
        }
    }
}

// ============================================================================
// Reference data
// ============================================================================

/// Reference entry for one listed ticker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerRef {
    /// Bare 6-digit code (e.g. "600036")
    pub code: String,
    /// Display name (e.g. "招商银行")
    pub name: String,
    /// Exchange derived from the code
    pub market: Market,
    /// Industry classification
    #[serde(default)]
    pub industry: Option<String>,
    /// Listing region
    #[serde(default)]
    pub area: Option<String>,
    /// Total market capitalization in 100M CNY
    #[serde(default)]
    pub market_cap: Option<f64>,
    /// Free-float capitalization in 100M CNY
    #[serde(default)]
    pub float_cap: Option<f64>,
}

impl TickerRef {
    /// Full symbol with market suffix (e.g. "600036.SH").
    pub fn symbol(&self) -> String {
        format!("{}.{}", self.code, self.market.suffix())
    }

    /// Whether the name carries a suspension/delisting marker.
    pub fn is_flagged(&self) -> bool {
        self.name.contains("ST") || self.name.contains('退')
    }
}

// ============================================================================
// Quotes and history
// ============================================================================

/// Latest-session record for one ticker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    /// Bare 6-digit code
    pub code: String,
    /// Session open price
    pub open: f64,
    /// Session high
    pub high: f64,
    /// Session low
    pub low: f64,
    /// Latest close
    pub close: f64,
    /// Previous session close
    pub prev_close: f64,
    /// Traded volume (shares)
    pub volume: f64,
    /// Traded value (CNY)
    pub amount: f64,
    /// Turnover rate (%)
    #[serde(default)]
    pub turnover_rate: Option<f64>,
    /// Session timestamp
    pub timestamp: DateTime<Utc>,
}

impl QuoteSnapshot {
    /// Percent change versus the previous close.
    pub fn percent_change(&self) -> f64 {
        if self.prev_close > 0.0 {
            ((self.close - self.prev_close) / self.prev_close) * 100.0
        } else {
            0.0
        }
    }
}

/// A single dated OHLCV row. A ticker's history is ordered oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryBar {
    /// Trading date
    pub date: NaiveDate,
    /// Open price
    pub open: f64,
    /// High price
    pub high: f64,
    /// Low price
    pub low: f64,
    /// Close price
    pub close: f64,
    /// Volume (shares)
    pub volume: f64,
    /// Turnover (CNY)
    #[serde(default)]
    pub amount: f64,
}

impl HistoryBar {
    /// Check if this is a bullish bar
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    /// Full range (high - low)
    pub fn range(&self) -> f64 {
        self.high - self.low
    }
}

// ============================================================================
// Fundamentals
// ============================================================================

/// Fundamental metrics for one ticker.
///
/// Every field is optional: an upstream that cannot supply a metric leaves
/// it absent, it is never substituted with zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fundamentals {
    /// PE ratio (TTM)
    pub pe: Option<f64>,
    /// PB ratio
    pub pb: Option<f64>,
    /// Return on equity (%)
    pub roe: Option<f64>,
    /// Revenue growth YoY (%)
    pub revenue_growth: Option<f64>,
    /// Net profit growth YoY (%)
    pub profit_growth: Option<f64>,
    /// Debt to assets ratio (%)
    pub debt_ratio: Option<f64>,
    /// Current ratio
    pub current_ratio: Option<f64>,
    /// Dividend yield (%)
    pub dividend_yield: Option<f64>,
    /// Dividend payout ratio (%)
    pub payout_ratio: Option<f64>,
    /// Gross margin (%)
    pub gross_margin: Option<f64>,
    /// R&D expense ratio (%)
    pub rd_ratio: Option<f64>,
    /// Total market cap in 100M CNY
    pub market_cap: Option<f64>,
    /// Free-float cap in 100M CNY
    pub float_cap: Option<f64>,
}

impl Fundamentals {
    /// Merge another record into this one, keeping present values.
    pub fn merge(mut self, other: Fundamentals) -> Self {
        self.pe = self.pe.or(other.pe);
        self.pb = self.pb.or(other.pb);
        self.roe = self.roe.or(other.roe);
        self.revenue_growth = self.revenue_growth.or(other.revenue_growth);
        self.profit_growth = self.profit_growth.or(other.profit_growth);
        self.debt_ratio = self.debt_ratio.or(other.debt_ratio);
        self.current_ratio = self.current_ratio.or(other.current_ratio);
        self.dividend_yield = self.dividend_yield.or(other.dividend_yield);
        self.payout_ratio = self.payout_ratio.or(other.payout_ratio);
        self.gross_margin = self.gross_margin.or(other.gross_margin);
        self.rd_ratio = self.rd_ratio.or(other.rd_ratio);
        self.market_cap = self.market_cap.or(other.market_cap);
        self.float_cap = self.float_cap.or(other.float_cap);
        self
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_from_code() {
        assert_eq!(Market::from_code("600036"), Some(Market::Sh));
        assert_eq!(Market::from_code("601318"), Some(Market::Sh));
        assert_eq!(Market::from_code("603993"), Some(Market::Sh));
        assert_eq!(Market::from_code("605117"), Some(Market::Sh));
        assert_eq!(Market::from_code("688981"), Some(Market::Sh));
        assert_eq!(Market::from_code("000001"), Some(Market::Sz));
        assert_eq!(Market::from_code("001979"), Some(Market::Sz));
        assert_eq!(Market::from_code("002415"), Some(Market::Sz));
        assert_eq!(Market::from_code("003816"), Some(Market::Sz));
        assert_eq!(Market::from_code("300750"), Some(Market::Sz));
        assert_eq!(Market::from_code("830799"), Some(Market::Bj));
        assert_eq!(Market::from_code("430047"), Some(Market::Bj));
        // Out of plan
        assert_eq!(Market::from_code("700001"), None);
        assert_eq!(Market::from_code("60003"), None);
        assert_eq!(Market::from_code("60003a"), None);
    }

    #[test]
    fn test_board_from_code() {
        assert_eq!(Board::from_code("688981"), Some(Board::Star));
        assert_eq!(Board::from_code("300750"), Some(Board::ChiNext));
        assert_eq!(Board::from_code("830799"), Some(Board::Beijing));
        assert_eq!(Board::from_code("600036"), Some(Board::Main));
        assert_eq!(Board::from_code("000001"), Some(Board::Main));
    }

    #[test]
    fn test_ticker_ref_flags() {
        let normal = TickerRef {
            code: "600036".into(),
            name: "招商银行".into(),
            market: Market::Sh,
            industry: Some("银行".into()),
            area: None,
            market_cap: Some(9000.0),
            float_cap: None,
        };
        assert!(!normal.is_flagged());
        assert_eq!(normal.symbol(), "600036.SH");

        let st = TickerRef {
            name: "*ST康美".into(),
            ..normal.clone()
        };
        assert!(st.is_flagged());

        let delisting = TickerRef {
            name: "退市海润".into(),
            ..normal
        };
        assert!(delisting.is_flagged());
    }

    #[test]
    fn test_snapshot_percent_change() {
        let snap = QuoteSnapshot {
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
        };
        assert!((snap.percent_change() - 5.0).abs() < 1e-9);

        let zero_prev = QuoteSnapshot {
            prev_close: 0.0,
            ..snap
        };
        assert_eq!(zero_prev.percent_change(), 0.0);
    }

    #[test]
    fn test_fundamentals_merge_keeps_present() {
        let a = Fundamentals {
            pe: Some(10.0),
            roe: None,
            ..Default::default()
        };
        let b = Fundamentals {
            pe: Some(99.0),
            roe: Some(15.0),
            ..Default::default()
        };
        let merged = a.merge(b);
        assert_eq!(merged.pe, Some(10.0));
        assert_eq!(merged.roe, Some(15.0));
    }
}
