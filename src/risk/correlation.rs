//! Pairwise position-correlation monitoring.
//!
//! Runs on portfolio updates, off the pre-trade path: every pair of
//! positions that each exceed the exposure floor is checked against the
//! correlation ceiling, and a crossing is reported once until the pair
//! drops back under the ceiling.
//!
//! Correlation is a statistic, not money arithmetic, so the return
//! windows use f64.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

/// Samples required before a pair is considered at all.
const MIN_SAMPLES: usize = 20;

/// Return-window length per symbol.
const MAX_SAMPLES: usize = 288;

/// A pair that crossed the correlation ceiling on this scan.
#[derive(Debug, Clone)]
pub struct CorrelationBreach {
    pub symbol_a: String,
    pub symbol_b: String,
    pub correlation: f64,
}

/// Maintains per-symbol return windows and the alert latch per pair.
pub struct CorrelationTracker {
    returns: HashMap<String, VecDeque<f64>>,
    last_prices: HashMap<String, Decimal>,
    /// Pairs already reported, cleared when they drop under the ceiling
    alerted_pairs: HashSet<(String, String)>,
}

impl CorrelationTracker {
    pub fn new() -> Self {
        Self {
            returns: HashMap::new(),
            last_prices: HashMap::new(),
            alerted_pairs: HashSet::new(),
        }
    }

    /// Record the latest price for a symbol, extending its return window.
    pub fn record_price(&mut self, symbol: &str, price: Decimal) {
        if price <= Decimal::ZERO {
            return;
        }

        if let Some(previous) = self.last_prices.get(symbol) {
            if let (Some(prev), Some(curr)) = (previous.to_f64(), price.to_f64()) {
                if prev > 0.0 {
                    let window = self.returns.entry(symbol.to_string()).or_default();
                    window.push_back((curr - prev) / prev);
                    while window.len() > MAX_SAMPLES {
                        window.pop_front();
                    }
                }
            }
        }
        self.last_prices.insert(symbol.to_string(), price);
    }

    /// Inject a full return series (used by tests and warm starts).
    pub fn seed_returns(&mut self, symbol: &str, series: Vec<f64>) {
        let mut window: VecDeque<f64> = series.into();
        while window.len() > MAX_SAMPLES {
            window.pop_front();
        }
        self.returns.insert(symbol.to_string(), window);
    }

    /// Pearson correlation over the aligned tails of two return windows.
    pub fn pairwise(&self, a: &str, b: &str) -> Option<f64> {
        let wa = self.returns.get(a)?;
        let wb = self.returns.get(b)?;

        let n = wa.len().min(wb.len());
        if n < MIN_SAMPLES {
            return None;
        }

        let xa: Vec<f64> = wa.iter().rev().take(n).rev().copied().collect();
        let xb: Vec<f64> = wb.iter().rev().take(n).rev().copied().collect();

        let mean_a = xa.iter().sum::<f64>() / n as f64;
        let mean_b = xb.iter().sum::<f64>() / n as f64;

        let mut cov = 0.0;
        let mut var_a = 0.0;
        let mut var_b = 0.0;
        for i in 0..n {
            let da = xa[i] - mean_a;
            let db = xb[i] - mean_b;
            cov += da * db;
            var_a += da * da;
            var_b += db * db;
        }

        if var_a <= f64::EPSILON || var_b <= f64::EPSILON {
            return None;
        }
        Some(cov / (var_a.sqrt() * var_b.sqrt()))
    }

    /// Highest absolute correlation of `symbol` against `others`, clamped
    /// to [0, 1]. Used as the per-position correlation risk.
    pub fn max_correlation_for(&self, symbol: &str, others: &[String]) -> f64 {
        others
            .iter()
            .filter(|other| other.as_str() != symbol)
            .filter_map(|other| self.pairwise(symbol, other))
            .map(f64::abs)
            .fold(0.0, f64::max)
            .clamp(0.0, 1.0)
    }

    /// Scan every qualifying pair, returning breaches once per crossing.
    ///
    /// `exposures` carries each position's exposure as a fraction of
    /// portfolio value; only positions above `exposure_floor` qualify.
    pub fn scan(
        &mut self,
        exposures: &[(String, Decimal)],
        exposure_floor: Decimal,
        correlation_ceiling: f64,
    ) -> Vec<CorrelationBreach> {
        let qualifying: Vec<&String> = exposures
            .iter()
            .filter(|(_, exposure)| *exposure > exposure_floor)
            .map(|(symbol, _)| symbol)
            .collect();

        let mut breaches = Vec::new();
        let mut still_breached = HashSet::new();

        for i in 0..qualifying.len() {
            for j in (i + 1)..qualifying.len() {
                let key = Self::pair_key(qualifying[i], qualifying[j]);
                let Some(correlation) = self.pairwise(qualifying[i], qualifying[j]) else {
                    continue;
                };

                if correlation > correlation_ceiling {
                    still_breached.insert(key.clone());
                    if self.alerted_pairs.insert(key) {
                        breaches.push(CorrelationBreach {
                            symbol_a: qualifying[i].clone(),
                            symbol_b: qualifying[j].clone(),
                            correlation,
                        });
                    }
                } else {
                    debug!(
                        a = %qualifying[i],
                        b = %qualifying[j],
                        correlation,
                        "pair under correlation ceiling"
                    );
                }
            }
        }

        // Pairs that dropped under the ceiling re-arm their edge.
        self.alerted_pairs
            .retain(|pair| still_breached.contains(pair));

        breaches
    }

    fn pair_key(a: &str, b: &str) -> (String, String) {
        if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }
}

impl Default for CorrelationTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn correlated_series(n: usize, noise: f64) -> (Vec<f64>, Vec<f64>) {
        // Deterministic pseudo-noise keeps the test reproducible.
        let base: Vec<f64> = (0..n).map(|i| ((i * 37 % 97) as f64 - 48.0) / 480.0).collect();
        let other: Vec<f64> = base
            .iter()
            .enumerate()
            .map(|(i, r)| r + noise * (((i * 13 % 11) as f64 - 5.0) / 50.0))
            .collect();
        (base, other)
    }

    #[test]
    fn test_pairwise_detects_strong_correlation() {
        let mut tracker = CorrelationTracker::new();
        let (a, b) = correlated_series(50, 0.05);
        tracker.seed_returns("XBT/USD", a);
        tracker.seed_returns("ETH/USD", b);

        let correlation = tracker.pairwise("XBT/USD", "ETH/USD").unwrap();
        assert!(correlation > 0.85, "correlation was {correlation}");
    }

    #[test]
    fn test_too_few_samples_yields_none() {
        let mut tracker = CorrelationTracker::new();
        tracker.seed_returns("XBT/USD", vec![0.01; 5]);
        tracker.seed_returns("ETH/USD", vec![0.01; 5]);
        assert!(tracker.pairwise("XBT/USD", "ETH/USD").is_none());
    }

    #[test]
    fn test_scan_alerts_once_per_crossing() {
        let mut tracker = CorrelationTracker::new();
        let (a, b) = correlated_series(50, 0.01);
        tracker.seed_returns("XBT/USD", a);
        tracker.seed_returns("ETH/USD", b);

        let exposures = vec![
            ("XBT/USD".to_string(), dec!(0.04)),
            ("ETH/USD".to_string(), dec!(0.03)),
        ];

        let breaches = tracker.scan(&exposures, dec!(0.02), 0.80);
        assert_eq!(breaches.len(), 1);
        assert!(breaches[0].correlation > 0.80);

        // Unchanged portfolio: no duplicate alert.
        let breaches = tracker.scan(&exposures, dec!(0.02), 0.80);
        assert!(breaches.is_empty());
    }

    #[test]
    fn test_small_positions_are_ignored() {
        let mut tracker = CorrelationTracker::new();
        let (a, b) = correlated_series(50, 0.01);
        tracker.seed_returns("XBT/USD", a);
        tracker.seed_returns("ETH/USD", b);

        let exposures = vec![
            ("XBT/USD".to_string(), dec!(0.01)),
            ("ETH/USD".to_string(), dec!(0.03)),
        ];
        assert!(tracker.scan(&exposures, dec!(0.02), 0.80).is_empty());
    }

    #[test]
    fn test_record_price_builds_returns() {
        let mut tracker = CorrelationTracker::new();
        for i in 0..30 {
            let price = dec!(50000) + Decimal::from(i * 10);
            tracker.record_price("XBT/USD", price);
            tracker.record_price("ETH/USD", price / dec!(10));
        }

        let correlation = tracker.pairwise("XBT/USD", "ETH/USD").unwrap();
        assert!(correlation > 0.99);
    }
}
