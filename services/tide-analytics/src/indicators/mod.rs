//! Indicator kernel: pure, stateless series math over daily bars.
//!
//! Inputs are slices, outputs are derived sequences plus a latest-value
//! summary (`IndicatorSet`). Values that cannot be computed yet (not enough
//! bars) are absent, never zero. Nothing in this module performs I/O.

pub mod chips;

pub use chips::{ChipDistribution, ChipSummary};

use serde::{Deserialize, Serialize};

use crate::data::HistoryBar;

// ============================================================================
// Series functions
// ============================================================================

/// Simple moving average; absent until `window` values are available.
pub fn sma(values: &[f64], window: usize) -> Vec<Option<f64>> {
    if window == 0 {
        return vec![None; values.len()];
    }
    let mut out = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for (i, v) in values.iter().enumerate() {
        sum += v;
        if i >= window {
            sum -= values[i - window];
        }
        if i + 1 >= window {
            out.push(Some(sum / window as f64));
        } else {
            out.push(None);
        }
    }
    out
}

/// Exponential moving average seeded with the first value.
pub fn ema(values: &[f64], window: usize) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    let alpha = 2.0 / (window as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut prev = values[0];
    out.push(prev);
    for v in &values[1..] {
        prev = alpha * v + (1.0 - alpha) * prev;
        out.push(prev);
    }
    out
}

/// MACD(12,26,9) series.
#[derive(Debug, Clone, PartialEq)]
pub struct MacdSeries {
    /// DIF = EMA12 − EMA26
    pub dif: Vec<f64>,
    /// DEA = EMA9 of DIF
    pub dea: Vec<f64>,
    /// Histogram = 2 × (DIF − DEA)
    pub hist: Vec<f64>,
}

/// Standard MACD(12,26,9).
pub fn macd(closes: &[f64]) -> MacdSeries {
    let ema12 = ema(closes, 12);
    let ema26 = ema(closes, 26);
    let dif: Vec<f64> = ema12
        .iter()
        .zip(ema26.iter())
        .map(|(fast, slow)| fast - slow)
        .collect();
    let dea = ema(&dif, 9);
    let hist = dif
        .iter()
        .zip(dea.iter())
        .map(|(d, e)| 2.0 * (d - e))
        .collect();
    MacdSeries { dif, dea, hist }
}

/// Whether DIF crossed above DEA within the last `window` bars.
pub fn macd_bullish_cross_within(series: &MacdSeries, window: usize) -> bool {
    let n = series.dif.len();
    if n < 2 {
        return false;
    }
    let start = n.saturating_sub(window).max(1);
    (start..n).any(|i| {
        series.dif[i - 1] <= series.dea[i - 1] && series.dif[i] > series.dea[i]
    })
}

/// RSI with Wilder smoothing; first value emitted at index `period`.
pub fn rsi(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let n = closes.len();
    if period == 0 || n <= period {
        return vec![None; n];
    }

    let mut out = vec![None; n];
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;

    for i in 1..=period {
        let delta = closes[i] - closes[i - 1];
        if delta > 0.0 {
            avg_gain += delta;
        } else {
            avg_loss -= delta;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;
    out[period] = Some(rsi_value(avg_gain, avg_loss));

    for i in (period + 1)..n {
        let delta = closes[i] - closes[i - 1];
        let (gain, loss) = if delta > 0.0 {
            (delta, 0.0)
        } else {
            (0.0, -delta)
        };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        out[i] = Some(rsi_value(avg_gain, avg_loss));
    }

    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

/// Bollinger band series.
#[derive(Debug, Clone, PartialEq)]
pub struct BollingerSeries {
    pub upper: Vec<Option<f64>>,
    pub middle: Vec<Option<f64>>,
    pub lower: Vec<Option<f64>>,
}

/// Bollinger bands: middle = SMA(window), bands at ±`width` population
/// standard deviations.
pub fn bollinger(closes: &[f64], window: usize, width: f64) -> BollingerSeries {
    let middle = sma(closes, window);
    let mut upper = vec![None; closes.len()];
    let mut lower = vec![None; closes.len()];

    for i in 0..closes.len() {
        if let Some(mid) = middle[i] {
            let slice = &closes[i + 1 - window..=i];
            let variance =
                slice.iter().map(|v| (v - mid) * (v - mid)).sum::<f64>() / window as f64;
            let sd = variance.sqrt();
            upper[i] = Some(mid + width * sd);
            lower[i] = Some(mid - width * sd);
        }
    }

    BollingerSeries {
        upper,
        middle,
        lower,
    }
}

/// KDJ series.
#[derive(Debug, Clone, PartialEq)]
pub struct KdjSeries {
    pub k: Vec<Option<f64>>,
    pub d: Vec<Option<f64>>,
    pub j: Vec<Option<f64>>,
}

/// KDJ(9,3,3): classical recursion from %K over a 9-bar rolling range,
/// smoothed twice, K and D seeded at 50.
pub fn kdj(bars: &[HistoryBar], period: usize) -> KdjSeries {
    let n = bars.len();
    let mut k = vec![None; n];
    let mut d = vec![None; n];
    let mut j = vec![None; n];

    let mut prev_k = 50.0;
    let mut prev_d = 50.0;

    for i in 0..n {
        if i + 1 < period {
            continue;
        }
        let slice = &bars[i + 1 - period..=i];
        let highest = slice.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
        let lowest = slice.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
        let range = highest - lowest;
        let rsv = if range > 0.0 {
            (bars[i].close - lowest) / range * 100.0
        } else {
            50.0
        };

        prev_k = (2.0 * prev_k + rsv) / 3.0;
        prev_d = (2.0 * prev_d + prev_k) / 3.0;

        k[i] = Some(prev_k);
        d[i] = Some(prev_d);
        j[i] = Some(3.0 * prev_k - 2.0 * prev_d);
    }

    KdjSeries { k, d, j }
}

/// Percent return over the last `window` bars; absent with fewer bars.
pub fn return_over(closes: &[f64], window: usize) -> Option<f64> {
    let n = closes.len();
    if n <= window || window == 0 {
        return None;
    }
    let base = closes[n - 1 - window];
    if base <= 0.0 {
        return None;
    }
    Some((closes[n - 1] - base) / base * 100.0)
}

// ============================================================================
// Indicator Set (latest-value summary)
// ============================================================================

/// Latest-value indicator summary for one ticker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub ma5: Option<f64>,
    pub ma10: Option<f64>,
    pub ma20: Option<f64>,
    pub ma60: Option<f64>,
    pub macd_dif: Option<f64>,
    pub macd_dea: Option<f64>,
    pub macd_hist: Option<f64>,
    pub rsi14: Option<f64>,
    pub boll_upper: Option<f64>,
    pub boll_middle: Option<f64>,
    pub boll_lower: Option<f64>,
    /// Position of the close inside the bands: 0 = lower, 1 = upper
    pub boll_position: Option<f64>,
    pub kdj_k: Option<f64>,
    pub kdj_d: Option<f64>,
    pub kdj_j: Option<f64>,
    pub chips: Option<ChipSummary>,
    /// Percent return over the last 20 bars
    pub return_20d: Option<f64>,
    /// DIF crossed above DEA within the last 3 bars
    pub macd_bullish_cross_3: bool,
    /// Latest close sits above MA20
    pub close_above_ma20: bool,
}

impl IndicatorSet {
    /// Compute the summary from a daily bar sequence (oldest first).
    pub fn compute(bars: &[HistoryBar]) -> Self {
        if bars.is_empty() {
            return Self::default();
        }

        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let last_close = closes[closes.len() - 1];

        let ma5 = last(&sma(&closes, 5));
        let ma10 = last(&sma(&closes, 10));
        let ma20 = last(&sma(&closes, 20));
        let ma60 = last(&sma(&closes, 60));

        // MACD needs the slow EMA to have settled before it means anything
        let macd_series = macd(&closes);
        let (macd_dif, macd_dea, macd_hist, bullish_cross) = if closes.len() >= 26 {
            (
                macd_series.dif.last().copied(),
                macd_series.dea.last().copied(),
                macd_series.hist.last().copied(),
                macd_bullish_cross_within(&macd_series, 3),
            )
        } else {
            (None, None, None, false)
        };

        let rsi14 = last(&rsi(&closes, 14));

        let boll = bollinger(&closes, 20, 2.0);
        let boll_upper = last(&boll.upper);
        let boll_middle = last(&boll.middle);
        let boll_lower = last(&boll.lower);
        let boll_position = match (boll_upper, boll_lower) {
            (Some(up), Some(lo)) if up > lo => Some((last_close - lo) / (up - lo)),
            _ => None,
        };

        let kdj_series = kdj(bars, 9);
        let kdj_k = last(&kdj_series.k);
        let kdj_d = last(&kdj_series.d);
        let kdj_j = last(&kdj_series.j);

        let chips = ChipDistribution::compute(bars).map(|c| c.summary(last_close));

        let close_above_ma20 = ma20.map(|m| last_close > m).unwrap_or(false);

        Self {
            ma5,
            ma10,
            ma20,
            ma60,
            macd_dif,
            macd_dea,
            macd_hist,
            rsi14,
            boll_upper,
            boll_middle,
            boll_lower,
            boll_position,
            kdj_k,
            kdj_d,
            kdj_j,
            chips,
            return_20d: return_over(&closes, 20),
            macd_bullish_cross_3: bullish_cross,
            close_above_ma20,
        }
    }

    /// Count the bullish signals visible in the summary.
    pub fn bullish_signal_count(&self) -> u32 {
        let mut count = 0;
        if self.macd_bullish_cross_3 {
            count += 1;
        }
        if self.macd_hist.map(|h| h > 0.0).unwrap_or(false) {
            count += 1;
        }
        if self.close_above_ma20 {
            count += 1;
        }
        if self
            .rsi14
            .map(|r| (50.0..70.0).contains(&r))
            .unwrap_or(false)
        {
            count += 1;
        }
        if let (Some(k), Some(d)) = (self.kdj_k, self.kdj_d) {
            if k > d {
                count += 1;
            }
        }
        if self
            .chips
            .as_ref()
            .map(|c| c.profit_ratio > 0.5)
            .unwrap_or(false)
        {
            count += 1;
        }
        count
    }
}

fn last(series: &[Option<f64>]) -> Option<f64> {
    series.last().copied().flatten()
}

// ============================================================================
// Tests
// ============================================================================
