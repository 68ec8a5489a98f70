//! Eastmoney push2 adapter for A-share market data.
//!
//! Public quote endpoints, no token required, which makes this the natural
//! backup source. Fundamentals coverage is thinner than TuShare's: valuation
//! and capitalization fields are available, financial-statement ratios are
//! not and stay absent.
//!
//! # Endpoints
//! - `api/qt/clist/get`      full roster with valuation fields
//! - `api/qt/ulist.np/get`   batched snapshots by secid list
//! - `api/qt/stock/get`      single-ticker detail (fundamentals subset)
//! - `api/qt/stock/kline/get` daily K-line history (push2his host)

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use super::provider::{ProviderError, QuoteProvider};
use super::{Fundamentals, HistoryBar, Market, QuoteSnapshot, TickerRef};

/// Eastmoney push2 adapter (secondary provider).
pub struct EastmoneyProvider {
    client: reqwest::Client,
    base_url: String,
    history_url: String,
}

impl EastmoneyProvider {
    /// Create a new adapter against the given push2 endpoint base.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        // Historical K-lines live on the push2his host
        let history_url = base_url.replace("push2.", "push2his.");

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url,
            history_url,
        }
    }

    /// Eastmoney security id: market prefix + code (1 = SH, 0 = SZ/BJ).
    fn secid(code: &str) -> Result<String, ProviderError> {
        let market = Market::from_code(code)
            .ok_or_else(|| ProviderError::NotFound(format!("unknown code {}", code)))?;
        let prefix = match market {
            Market::Sh => "1",
            Market::Sz | Market::Bj => "0",
        };
        Ok(format!("{}.{}", prefix, code))
    }

    async fn get_json(&self, url: &str) -> Result<Value, ProviderError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("eastmoney request failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited {
                retry_after_secs: None,
            });
        }
        if !status.is_success() {
            return Err(ProviderError::Unavailable(format!(
                "eastmoney returned HTTP {}",
                status
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(format!("eastmoney response: {}", e)))
    }

    fn snapshot_from_fields(code: String, row: &Value) -> QuoteSnapshot {
        QuoteSnapshot {
            code,
            open: field_f64(row, "f17").unwrap_or(0.0),
            high: field_f64(row, "f15").unwrap_or(0.0),
            low: field_f64(row, "f16").unwrap_or(0.0),
            close: field_f64(row, "f2").unwrap_or(0.0),
            prev_close: field_f64(row, "f18").unwrap_or(0.0),
            // f5 is in lots of 100 shares
            volume: field_f64(row, "f5").unwrap_or(0.0) * 100.0,
            amount: field_f64(row, "f6").unwrap_or(0.0),
            turnover_rate: field_f64(row, "f8"),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
impl QuoteProvider for EastmoneyProvider {
    fn name(&self) -> &'static str {
        "eastmoney"
    }

    async fn load_reference_universe(&self) -> Result<Vec<TickerRef>, ProviderError> {
        // fs filters select SH/SZ/BJ A-share boards
        let url = format!(
            "{}/api/qt/clist/get?pn=1&pz=10000&po=0&np=1&fltt=2&invt=2&fid=f12\
             &fs=m:0+t:6,m:0+t:80,m:1+t:2,m:1+t:23,m:0+t:81+s:2048\
             &fields=f12,f14,f20,f21,f100",
            self.base_url
        );

        let body = self.get_json(&url).await?;
        let diff = body
            .pointer("/data/diff")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ProviderError::Malformed("clist response missing data.diff".into()))?;

        let mut refs = Vec::with_capacity(diff.len());
        for row in diff {
            let Some(code) = row.get("f12").and_then(|v| v.as_str()).map(String::from) else {
                continue;
            };
            let Some(market) = Market::from_code(&code) else {
                continue;
            };
            refs.push(TickerRef {
                code,
                name: row
                    .get("f14")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                market,
                industry: row
                    .get("f100")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                area: None,
                // f20/f21 are in yuan; report in 100M CNY
                market_cap: field_f64(row, "f20").map(|v| v / 1e8),
                float_cap: field_f64(row, "f21").map(|v| v / 1e8),
            });
        }

        if refs.is_empty() {
            return Err(ProviderError::Malformed("empty clist roster".into()));
        }

        Ok(refs)
    }

    async fn fetch_snapshot_batch(
        &self,
        codes: &[String],
    ) -> Result<HashMap<String, QuoteSnapshot>, ProviderError> {
        let secids: Vec<String> = codes.iter().filter_map(|c| Self::secid(c).ok()).collect();
        if secids.is_empty() {
            return Ok(HashMap::new());
        }

        let url = format!(
            "{}/api/qt/ulist.np/get?fltt=2&invt=2&secids={}\
             &fields=f2,f5,f6,f8,f12,f15,f16,f17,f18",
            self.base_url,
            secids.join(",")
        );

        let body = self.get_json(&url).await?;
        let diff = body
            .pointer("/data/diff")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ProviderError::Malformed("ulist response missing data.diff".into()))?;

        let mut snapshots = HashMap::new();
        for row in diff {
            let Some(code) = row.get("f12").and_then(|v| v.as_str()).map(String::from) else {
                continue;
            };
            snapshots.insert(code.clone(), Self::snapshot_from_fields(code, row));
        }

        Ok(snapshots)
    }

    async fn fetch_history(
        &self,
        code: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<HistoryBar>, ProviderError> {
        let url = format!(
            "{}/api/qt/stock/kline/get?secid={}&klt=101&fqt=1&beg={}&end={}\
             &fields1=f1,f2,f3&fields2=f51,f52,f53,f54,f55,f56,f57",
            self.history_url,
            Self::secid(code)?,
            from.format("%Y%m%d"),
            to.format("%Y%m%d"),
        );

        let body = self.get_json(&url).await?;
        let klines = body
            .pointer("/data/klines")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ProviderError::NotFound(format!("no kline data for {}", code)))?;

        let mut bars = Vec::with_capacity(klines.len());
        for line in klines {
            let Some(parts) = line.as_str().map(|s| s.split(',').collect::<Vec<_>>()) else {
                return Err(ProviderError::Malformed(format!("bad kline row for {}", code)));
            };
            // date,open,close,high,low,volume,amount
            if parts.len() < 7 {
                return Err(ProviderError::Malformed(format!(
                    "short kline row for {}",
                    code
                )));
            }
            let date = NaiveDate::parse_from_str(parts[0], "%Y-%m-%d")
                .map_err(|_| ProviderError::Malformed(format!("bad kline date for {}", code)))?;
            bars.push(HistoryBar {
                date,
                open: parts[1].parse().unwrap_or(0.0),
                close: parts[2].parse().unwrap_or(0.0),
                high: parts[3].parse().unwrap_or(0.0),
                low: parts[4].parse().unwrap_or(0.0),
                volume: parts[5].parse::<f64>().unwrap_or(0.0) * 100.0,
                amount: parts[6].parse().unwrap_or(0.0),
            });
        }

        if bars.is_empty() {
            return Err(ProviderError::NotFound(format!(
                "no history for {} in range",
                code
            )));
        }

        Ok(bars)
    }

    async fn fetch_fundamentals(&self, code: &str) -> Result<Fundamentals, ProviderError> {
        let url = format!(
            "{}/api/qt/stock/get?fltt=2&invt=2&secid={}\
             &fields=f57,f58,f116,f117,f162,f167,f173",
            self.base_url,
            Self::secid(code)?
        );

        let body = self.get_json(&url).await?;
        let data = body
            .pointer("/data")
            .filter(|v| !v.is_null())
            .ok_or_else(|| ProviderError::NotFound(format!("no detail data for {}", code)))?;

        Ok(Fundamentals {
            pe: field_f64(data, "f162").filter(|v| *v > 0.0),
            pb: field_f64(data, "f167").filter(|v| *v > 0.0),
            roe: field_f64(data, "f173"),
            market_cap: field_f64(data, "f116").map(|v| v / 1e8),
            float_cap: field_f64(data, "f117").map(|v| v / 1e8),
            ..Default::default()
        })
    }
}

/// Read a numeric f-field; Eastmoney sends "-" for missing values.
fn field_f64(row: &Value, field: &str) -> Option<f64> {
    match row.get(field)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_secid_mapping() {
        assert_eq!(EastmoneyProvider::secid("600036").unwrap(), "1.600036");
        assert_eq!(EastmoneyProvider::secid("000001").unwrap(), "0.000001");
        assert_eq!(EastmoneyProvider::secid("830799").unwrap(), "0.830799");
        assert!(EastmoneyProvider::secid("999999").is_err());
    }

    #[test]
    fn test_field_f64_handles_dash() {
        let row = json!({"f2": 33.5, "f9": "-", "f8": "1.25"});
        assert_eq!(field_f64(&row, "f2"), Some(33.5));
        assert_eq!(field_f64(&row, "f9"), None);
        assert_eq!(field_f64(&row, "f8"), Some(1.25));
        assert_eq!(field_f64(&row, "f99"), None);
    }

    #[test]
    fn test_snapshot_from_fields() {
        let row = json!({
            "f2": 33.6, "f5": 100.0, "f6": 336000.0, "f8": 1.2,
            "f15": 34.0, "f16": 32.5, "f17": 33.0, "f18": 32.0
        });
        let snap = EastmoneyProvider::snapshot_from_fields("600036".into(), &row);
        assert_eq!(snap.close, 33.6);
        assert_eq!(snap.prev_close, 32.0);
        // lots converted to shares
        assert_eq!(snap.volume, 10_000.0);
        assert!((snap.percent_change() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_history_url_host_rewrite() {
        let provider = EastmoneyProvider::new("https://push2.eastmoney.com");
        assert_eq!(provider.history_url, "https://push2his.eastmoney.com");
    }
}
