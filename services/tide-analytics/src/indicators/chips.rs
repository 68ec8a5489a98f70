//! Chip distribution: an empirical model of holder cost basis, estimated
//! from volume-at-price over history with exponential time decay.
//!
//! Each historical bar contributes its volume spread uniformly across its
//! [low, high] range, weighted by 0.95^age so recent turnover dominates. The
//! heaviest bucket is read as the dominant holder cost ("main peak").

use serde::{Deserialize, Serialize};

use crate::data::HistoryBar;

/// Number of price buckets.
const BUCKETS: usize = 100;

/// Per-bar decay factor applied per day of age.
const DECAY: f64 = 0.95;

/// How many buckets around the main peak count toward concentration.
const CONCENTRATION_WINDOW: usize = 20;

/// Full chip distribution over the price range of the input history.
#[derive(Debug, Clone, PartialEq)]
pub struct ChipDistribution {
    /// Lower edge of the price range
    pub price_lo: f64,
    /// Upper edge of the price range
    pub price_hi: f64,
    /// Accumulated mass per bucket, ascending price order
    pub masses: Vec<f64>,
    /// Total accumulated mass
    pub total_mass: f64,
    /// Index of the heaviest bucket
    pub main_peak_index: usize,
}

impl ChipDistribution {
    /// Build the distribution from a bar sequence (oldest first).
    ///
    /// Returns `None` when there is nothing to distribute (no bars or no
    /// traded volume).
    pub fn compute(bars: &[HistoryBar]) -> Option<Self> {
        if bars.is_empty() {
            return None;
        }

        let price_lo = bars.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
        let price_hi = bars.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
        if !price_lo.is_finite() || !price_hi.is_finite() || price_lo <= 0.0 {
            return None;
        }

        let mut masses = vec![0.0; BUCKETS];
        let width = (price_hi - price_lo) / BUCKETS as f64;
        let newest = bars.len() - 1;

        for (i, bar) in bars.iter().enumerate() {
            let age = (newest - i) as f64;
            let weight = bar.volume * DECAY.powf(age);
            if weight <= 0.0 {
                continue;
            }

            if width <= 0.0 || bar.high <= bar.low {
                // Degenerate range: the whole bar lands in one bucket
                let idx = bucket_index(bar.close.max(price_lo), price_lo, width);
                masses[idx] += weight;
                continue;
            }

            // Spread uniformly across the buckets the bar's range overlaps
            let bar_span = bar.high - bar.low;
            let first = bucket_index(bar.low, price_lo, width);
            let last = bucket_index(bar.high, price_lo, width);
            for idx in first..=last {
                let bucket_lo = price_lo + idx as f64 * width;
                let bucket_hi = bucket_lo + width;
                let overlap = (bar.high.min(bucket_hi) - bar.low.max(bucket_lo)).max(0.0);
                masses[idx] += weight * overlap / bar_span;
            }
        }

        let total_mass: f64 = masses.iter().sum();
        if total_mass <= 0.0 {
            return None;
        }

        let main_peak_index = peak_index(&masses);

        Some(Self {
            price_lo,
            price_hi,
            masses,
            total_mass,
            main_peak_index,
        })
    }

    /// Center price of a bucket.
    pub fn bucket_center(&self, index: usize) -> f64 {
        let width = (self.price_hi - self.price_lo) / BUCKETS as f64;
        self.price_lo + (index as f64 + 0.5) * width
    }

    /// Dominant holder cost: center of the heaviest bucket.
    pub fn main_peak_price(&self) -> f64 {
        self.bucket_center(self.main_peak_index)
    }

    /// Mass-weighted mean of bucket centers.
    pub fn average_cost(&self) -> f64 {
        let weighted: f64 = self
            .masses
            .iter()
            .enumerate()
            .map(|(i, m)| self.bucket_center(i) * m)
            .sum();
        weighted / self.total_mass
    }

    /// Fraction of mass inside the window of buckets centered on the peak.
    pub fn concentration(&self) -> f64 {
        let half = CONCENTRATION_WINDOW / 2;
        let start = self.main_peak_index.saturating_sub(half.saturating_sub(1));
        let end = (self.main_peak_index + half).min(BUCKETS - 1);
        let in_window: f64 = self.masses[start..=end].iter().sum();
        in_window / self.total_mass
    }

    /// Heaviest bucket strictly below `price`.
    pub fn support(&self, price: f64) -> Option<f64> {
        self.heaviest_where(|center| center < price)
    }

    /// Heaviest bucket strictly above `price`.
    pub fn resistance(&self, price: f64) -> Option<f64> {
        self.heaviest_where(|center| center > price)
    }

    /// Fraction of mass sitting below `price` (holders in profit).
    pub fn profit_ratio(&self, price: f64) -> f64 {
        let below: f64 = self
            .masses
            .iter()
            .enumerate()
            .filter(|(i, _)| self.bucket_center(*i) < price)
            .map(|(_, m)| m)
            .sum();
        below / self.total_mass
    }

    fn heaviest_where(&self, predicate: impl Fn(f64) -> bool) -> Option<f64> {
        let mut best: Option<(usize, f64)> = None;
        for (i, mass) in self.masses.iter().enumerate() {
            let center = self.bucket_center(i);
            if *mass > 0.0 && predicate(center) {
                match best {
                    // >= keeps the higher-price bucket on ties
                    Some((_, best_mass)) if *mass < best_mass => {}
                    _ => best = Some((i, *mass)),
                }
            }
        }
        best.map(|(i, _)| self.bucket_center(i))
    }

    /// Reduce to the latest-value summary carried on scored stocks.
    pub fn summary(&self, latest_close: f64) -> ChipSummary {
        ChipSummary {
            main_peak_price: self.main_peak_price(),
            average_cost: self.average_cost(),
            concentration: self.concentration(),
            support: self.support(latest_close),
            resistance: self.resistance(latest_close),
            profit_ratio: self.profit_ratio(latest_close),
        }
    }
}

/// Heaviest bucket; ties go to the higher-price bucket.
fn peak_index(masses: &[f64]) -> usize {
    let mut peak = 0;
    for (i, mass) in masses.iter().enumerate() {
        if *mass >= masses[peak] {
            peak = i;
        }
    }
    peak
}

fn bucket_index(price: f64, price_lo: f64, width: f64) -> usize {
    if width <= 0.0 {
        return 0;
    }
    (((price - price_lo) / width) as usize).min(BUCKETS - 1)
}

/// Latest-value chip summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChipSummary {
    /// Dominant holder cost price
    pub main_peak_price: f64,
    /// Mass-weighted average cost
    pub average_cost: f64,
    /// Fraction of mass near the main peak
    pub concentration: f64,
    /// Heaviest price level below the latest close
    pub support: Option<f64>,
    /// Heaviest price level above the latest close
    pub resistance: Option<f64>,
    /// Fraction of holders in profit at the latest close
    pub profit_ratio: f64,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn bar(day: u64, low: f64, high: f64, close: f64, volume: f64) -> HistoryBar {
        HistoryBar {
            date: NaiveDate::from_ymd_opt(2025, 1, 1)
                .unwrap()
                .checked_add_days(chrono::Days::new(day))
                .unwrap(),
            open: close,
            high,
            low,
            close,
            volume,
            amount: close * volume,
        }
    }

    #[test]
    fn test_empty_and_zero_volume() {
        assert!(ChipDistribution::compute(&[]).is_none());
        let bars = vec![bar(0, 10.0, 11.0, 10.5, 0.0)];
        assert!(ChipDistribution::compute(&bars).is_none());
    }

    #[test]
    fn test_mass_conserved() {
        let bars = vec![
            bar(0, 10.0, 12.0, 11.0, 1000.0),
            bar(1, 11.0, 13.0, 12.0, 2000.0),
            bar(2, 12.0, 14.0, 13.0, 1500.0),
        ];
        let dist = ChipDistribution::compute(&bars).unwrap();
        let expected = 1000.0 * DECAY.powf(2.0) + 2000.0 * DECAY + 1500.0;
        assert!((dist.total_mass - expected).abs() / expected < 1e-9);
    }

    #[test]
    fn test_recent_volume_dominates() {
        // 60 old bars at 10 versus 20 recent bars at 20, equal volume per
        // bar: after 0.95^age decay the recent zone carries more mass even
        // with a third of the bar count
        let mut bars: Vec<HistoryBar> = (0..60).map(|d| bar(d, 9.9, 10.1, 10.0, 1000.0)).collect();
        bars.extend((60..80).map(|d| bar(d, 19.9, 20.1, 20.0, 1000.0)));
        let dist = ChipDistribution::compute(&bars).unwrap();

        let peak = dist.main_peak_price();
        assert!(peak > 15.0, "peak {} should be near the recent price", peak);
    }

    #[test]
    fn test_tie_breaks_to_higher_price() {
        assert_eq!(peak_index(&[1.0, 2.0, 2.0, 0.5]), 2);
        assert_eq!(peak_index(&[3.0, 3.0, 3.0]), 2);
        assert_eq!(peak_index(&[5.0, 1.0]), 0);
    }

    #[test]
    fn test_profit_ratio_and_support_resistance() {
        let bars = vec![
            bar(0, 8.0, 9.0, 8.5, 1000.0),
            bar(1, 9.0, 10.0, 9.5, 1000.0),
            bar(2, 11.0, 12.0, 11.5, 1000.0),
        ];
        let dist = ChipDistribution::compute(&bars).unwrap();

        // At 10.5 everything from the first two bars is in profit
        let profit = dist.profit_ratio(10.5);
        assert!(profit > 0.3 && profit < 0.8);

        let support = dist.support(10.5).unwrap();
        assert!(support < 10.5);
        let resistance = dist.resistance(10.5).unwrap();
        assert!(resistance > 10.5);

        // Above the whole range there is no resistance left
        assert!(dist.resistance(100.0).is_none());
        assert!(dist.support(1.0).is_none());
    }

    #[test]
    fn test_concentration_bounds() {
        let bars: Vec<HistoryBar> = (0..40).map(|d| bar(d, 9.5, 10.5, 10.0, 1000.0)).collect();
        let dist = ChipDistribution::compute(&bars).unwrap();
        let c = dist.concentration();
        assert!(c > 0.0 && c <= 1.0);
    }

    #[test]
    fn test_determinism() {
        let bars: Vec<HistoryBar> = (0..60)
            .map(|d| bar(d, 10.0 + (d % 5) as f64, 11.0 + (d % 5) as f64, 10.5 + (d % 5) as f64, 1000.0))
            .collect();
        let a = ChipDistribution::compute(&bars).unwrap();
        let b = ChipDistribution::compute(&bars).unwrap();
        assert_eq!(a, b);
    }
}
