//! TuShare Pro API adapter for A-share market data.
//!
//! # API Documentation
//! https://tushare.pro/document/2
//!
//! # Request format
//! Single POST endpoint; the body names the API and the wanted fields, the
//! response is a column-name table: `{fields: [...], items: [[...], ...]}`.
//!
//! # APIs used
//! - `stock_basic`   reference roster
//! - `daily`         daily K-line history
//! - `daily_basic`   per-session valuation snapshot (pe/pb/mv/turnover)
//! - `fina_indicator` financial indicators (roe, growth, margins, ratios)

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use super::provider::{ProviderError, QuoteProvider};
use super::{Fundamentals, HistoryBar, Market, QuoteSnapshot, TickerRef};

const DEFAULT_ENDPOINT: &str = "http://api.tushare.pro";

/// TuShare Pro adapter (primary provider).
pub struct TushareProvider {
    token: String,
    client: reqwest::Client,
    base_url: String,
}

impl TushareProvider {
    /// Create a new adapter with the given API token.
    pub fn new(token: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            token: token.into(),
            client,
            base_url: DEFAULT_ENDPOINT.to_string(),
        }
    }

    /// Override the endpoint (for testing against a local stub).
    pub fn with_endpoint(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Call the TuShare API and return the parsed field table.
    async fn call_api(
        &self,
        api_name: &str,
        params: HashMap<&str, String>,
        fields: &[&str],
    ) -> Result<FieldTable, ProviderError> {
        let request = TushareRequest {
            api_name: api_name.to_string(),
            token: self.token.clone(),
            params: params
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            fields: fields.join(","),
        };

        let response = self
            .client
            .post(&self.base_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("tushare request failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited {
                retry_after_secs: None,
            });
        }
        if !status.is_success() {
            return Err(ProviderError::Unavailable(format!(
                "tushare returned HTTP {}",
                status
            )));
        }

        let body: TushareResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(format!("tushare response: {}", e)))?;

        match body.code {
            0 => {}
            // 40203: points/frequency limit reached
            40203 => {
                return Err(ProviderError::RateLimited {
                    retry_after_secs: Some(60),
                })
            }
            code => {
                return Err(ProviderError::Unavailable(format!(
                    "tushare error {}: {}",
                    code,
                    body.msg.unwrap_or_default()
                )))
            }
        }

        let data = body
            .data
            .ok_or_else(|| ProviderError::Malformed("tushare response missing data".into()))?;

        Ok(FieldTable::new(data.fields, data.items))
    }

    /// TuShare wants the exchange-suffixed symbol.
    fn ts_code(code: &str) -> Result<String, ProviderError> {
        let market = Market::from_code(code)
            .ok_or_else(|| ProviderError::NotFound(format!("unknown code {}", code)))?;
        Ok(format!("{}.{}", code, market.suffix()))
    }
}

#[async_trait]
impl QuoteProvider for TushareProvider {
    fn name(&self) -> &'static str {
        "tushare"
    }

    async fn load_reference_universe(&self) -> Result<Vec<TickerRef>, ProviderError> {
        let mut params = HashMap::new();
        params.insert("list_status", "L".to_string());

        let table = self
            .call_api(
                "stock_basic",
                params,
                &["ts_code", "symbol", "name", "area", "industry"],
            )
            .await?;

        let mut refs = Vec::with_capacity(table.len());
        for row in table.rows() {
            let Some(code) = row.str("symbol") else {
                continue;
            };
            let Some(market) = Market::from_code(&code) else {
                continue;
            };
            refs.push(TickerRef {
                code,
                name: row.str("name").unwrap_or_default(),
                market,
                industry: row.str("industry"),
                area: row.str("area"),
                market_cap: None,
                float_cap: None,
            });
        }

        if refs.is_empty() {
            return Err(ProviderError::Malformed("empty stock_basic roster".into()));
        }

        Ok(refs)
    }

    async fn fetch_snapshot_batch(
        &self,
        codes: &[String],
    ) -> Result<HashMap<String, QuoteSnapshot>, ProviderError> {
        // daily accepts a comma-separated ts_code list
        let ts_codes: Vec<String> = codes
            .iter()
            .filter_map(|c| Self::ts_code(c).ok())
            .collect();
        if ts_codes.is_empty() {
            return Ok(HashMap::new());
        }

        let mut params = HashMap::new();
        params.insert("ts_code", ts_codes.join(","));

        let table = self
            .call_api(
                "daily",
                params,
                &[
                    "ts_code",
                    "trade_date",
                    "open",
                    "high",
                    "low",
                    "close",
                    "pre_close",
                    "vol",
                    "amount",
                ],
            )
            .await?;

        // daily returns most-recent rows first; keep the newest per code
        let mut snapshots = HashMap::new();
        for row in table.rows() {
            let Some(ts_code) = row.str("ts_code") else {
                continue;
            };
            let code = ts_code.split('.').next().unwrap_or(&ts_code).to_string();
            if snapshots.contains_key(&code) {
                continue;
            }

            let timestamp = row
                .str("trade_date")
                .and_then(|d| NaiveDate::parse_from_str(&d, "%Y%m%d").ok())
                .and_then(|d| d.and_hms_opt(15, 0, 0))
                .map(|dt| Utc.from_utc_datetime(&dt))
                .unwrap_or_else(Utc::now);

            snapshots.insert(
                code.clone(),
                QuoteSnapshot {
                    code,
                    open: row.f64("open").unwrap_or(0.0),
                    high: row.f64("high").unwrap_or(0.0),
                    low: row.f64("low").unwrap_or(0.0),
                    close: row.f64("close").unwrap_or(0.0),
                    prev_close: row.f64("pre_close").unwrap_or(0.0),
                    // TuShare vol is in lots (100 shares), amount in 1000 CNY
                    volume: row.f64("vol").unwrap_or(0.0) * 100.0,
                    amount: row.f64("amount").unwrap_or(0.0) * 1000.0,
                    turnover_rate: None,
                    timestamp,
                },
            );
        }

        Ok(snapshots)
    }

    async fn fetch_history(
        &self,
        code: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<HistoryBar>, ProviderError> {
        let mut params = HashMap::new();
        params.insert("ts_code", Self::ts_code(code)?);
        params.insert("start_date", from.format("%Y%m%d").to_string());
        params.insert("end_date", to.format("%Y%m%d").to_string());

        let table = self
            .call_api(
                "daily",
                params,
                &[
                    "ts_code",
                    "trade_date",
                    "open",
                    "high",
                    "low",
                    "close",
                    "vol",
                    "amount",
                ],
            )
            .await?;

        let mut bars = Vec::with_capacity(table.len());
        for row in table.rows() {
            let Some(date) = row
                .str("trade_date")
                .and_then(|d| NaiveDate::parse_from_str(&d, "%Y%m%d").ok())
            else {
                return Err(ProviderError::Malformed(format!(
                    "bad trade_date for {}",
                    code
                )));
            };
            bars.push(HistoryBar {
                date,
                open: row.f64("open").unwrap_or(0.0),
                high: row.f64("high").unwrap_or(0.0),
                low: row.f64("low").unwrap_or(0.0),
                close: row.f64("close").unwrap_or(0.0),
                volume: row.f64("vol").unwrap_or(0.0) * 100.0,
                amount: row.f64("amount").unwrap_or(0.0) * 1000.0,
            });
        }

        if bars.is_empty() {
            return Err(ProviderError::NotFound(format!(
                "no history for {} in range",
                code
            )));
        }

        // TuShare returns newest first; callers expect oldest first
        bars.sort_by_key(|b| b.date);
        Ok(bars)
    }

    async fn fetch_fundamentals(&self, code: &str) -> Result<Fundamentals, ProviderError> {
        let ts_code = Self::ts_code(code)?;

        // Valuation side from daily_basic (latest row)
        let mut params = HashMap::new();
        params.insert("ts_code", ts_code.clone());
        let valuation = self
            .call_api(
                "daily_basic",
                params,
                &[
                    "ts_code",
                    "trade_date",
                    "pe_ttm",
                    "pb",
                    "dv_ratio",
                    "turnover_rate",
                    "total_mv",
                    "circ_mv",
                ],
            )
            .await?;

        let mut fundamentals = Fundamentals::default();
        if let Some(row) = valuation.rows().next() {
            fundamentals.pe = row.f64("pe_ttm").filter(|v| *v > 0.0);
            fundamentals.pb = row.f64("pb").filter(|v| *v > 0.0);
            fundamentals.dividend_yield = row.f64("dv_ratio");
            // total_mv / circ_mv come back in 万元; report in 亿元
            fundamentals.market_cap = row.f64("total_mv").map(|v| v / 10_000.0);
            fundamentals.float_cap = row.f64("circ_mv").map(|v| v / 10_000.0);
        } else {
            return Err(ProviderError::NotFound(format!(
                "no daily_basic row for {}",
                code
            )));
        }

        // Financial-indicator side from fina_indicator (latest report)
        let mut params = HashMap::new();
        params.insert("ts_code", ts_code);
        let indicators = self
            .call_api(
                "fina_indicator",
                params,
                &[
                    "ts_code",
                    "end_date",
                    "roe",
                    "or_yoy",
                    "netprofit_yoy",
                    "debt_to_assets",
                    "current_ratio",
                    "grossprofit_margin",
                    "rd_exp_to_or",
                    "dividend_ratio",
                ],
            )
            .await?;

        if let Some(row) = indicators.rows().next() {
            fundamentals.roe = row.f64("roe");
            fundamentals.revenue_growth = row.f64("or_yoy");
            fundamentals.profit_growth = row.f64("netprofit_yoy");
            fundamentals.debt_ratio = row.f64("debt_to_assets");
            fundamentals.current_ratio = row.f64("current_ratio");
            fundamentals.gross_margin = row.f64("grossprofit_margin");
            fundamentals.rd_ratio = row.f64("rd_exp_to_or");
            fundamentals.payout_ratio = row.f64("dividend_ratio");
        }

        Ok(fundamentals)
    }
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct TushareRequest {
    api_name: String,
    token: String,
    params: HashMap<String, String>,
    fields: String,
}

#[derive(Debug, Deserialize)]
struct TushareResponse {
    code: i64,
    msg: Option<String>,
    data: Option<TushareData>,
}

#[derive(Debug, Deserialize)]
struct TushareData {
    fields: Vec<String>,
    items: Vec<Vec<Value>>,
}

/// Column-name indexed view over TuShare's table responses.
struct FieldTable {
    index: HashMap<String, usize>,
    items: Vec<Vec<Value>>,
}

impl FieldTable {
    fn new(fields: Vec<String>, items: Vec<Vec<Value>>) -> Self {
        let index = fields
            .into_iter()
            .enumerate()
            .map(|(i, f)| (f, i))
            .collect();
        Self { index, items }
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        self.items.iter().map(move |values| Row {
            index: &self.index,
            values,
        })
    }
}

struct Row<'a> {
    index: &'a HashMap<String, usize>,
    values: &'a [Value],
}

impl Row<'_> {
    fn get(&self, field: &str) -> Option<&Value> {
        self.index.get(field).and_then(|i| self.values.get(*i))
    }

    fn str(&self, field: &str) -> Option<String> {
        self.get(field)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    fn f64(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn table(fields: &[&str], items: Vec<Vec<Value>>) -> FieldTable {
        FieldTable::new(fields.iter().map(|s| s.to_string()).collect(), items)
    }

    #[test]
    fn test_field_table_lookup() {
        let t = table(
            &["ts_code", "close", "vol"],
            vec![vec![
                Value::from("600036.SH"),
                Value::from(33.5),
                Value::from("12345"),
            ]],
        );

        let row = t.rows().next().unwrap();
        assert_eq!(row.str("ts_code").unwrap(), "600036.SH");
        assert_eq!(row.f64("close"), Some(33.5));
        // String-encoded numbers parse too
        assert_eq!(row.f64("vol"), Some(12345.0));
        assert_eq!(row.f64("missing"), None);
    }

    #[test]
    fn test_ts_code_mapping() {
        assert_eq!(TushareProvider::ts_code("600036").unwrap(), "600036.SH");
        assert_eq!(TushareProvider::ts_code("000001").unwrap(), "000001.SZ");
        assert_eq!(TushareProvider::ts_code("830799").unwrap(), "830799.BJ");
        assert!(TushareProvider::ts_code("999999").is_err());
    }

    #[test]
    fn test_response_envelope_parses() {
        let json = r#"{
            "code": 0,
            "msg": null,
            "data": {
                "fields": ["ts_code", "close"],
                "items": [["600036.SH", 33.5], ["000001.SZ", 10.2]]
            }
        }"#;
        let resp: TushareResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.code, 0);
        let data = resp.data.unwrap();
        assert_eq!(data.items.len(), 2);
    }
}
