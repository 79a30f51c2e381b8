//! Signal scoring for newly observed pools.
//!
//! A pure function of one pool's recent observation history: no clocks, no
//! storage, no network. Five component scores (volume trend, liquidity
//! trend, price momentum, trading activity, realized volatility) weight
//! into a composite in `[0, 100]`. Two thresholds act on the composite: an
//! alert level, and an auto-watchlist level that additionally requires the
//! age/volume/liquidity gates to hold.

use crate::settings::SignalSettings;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// One observation of a pool's metrics, oldest to newest in a history.
#[derive(Debug, Clone, Default)]
pub struct PoolObservation {
    pub price_usd: Option<Decimal>,
    pub volume_h24_usd: Option<Decimal>,
    pub reserve_usd: Option<Decimal>,
    pub buys_h24: Option<i64>,
    pub sells_h24: Option<i64>,
    pub pool_created_at: Option<DateTime<Utc>>,
}

/// Direction tag for volume and liquidity series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Spike,
    Increasing,
    Stable,
    Decreasing,
}

impl Trend {
    /// Tag recorded for the volume series.
    pub fn volume_label(&self) -> &'static str {
        match self {
            Trend::Spike => "spike",
            Trend::Increasing => "increasing",
            Trend::Stable => "stable",
            Trend::Decreasing => "decreasing",
        }
    }

    /// Tag recorded for the liquidity series; the spike level reads as
    /// strong growth there.
    pub fn liquidity_label(&self) -> &'static str {
        match self {
            Trend::Spike => "growth",
            Trend::Increasing => "increasing",
            Trend::Stable => "stable",
            Trend::Decreasing => "decreasing",
        }
    }

    fn score(&self) -> f64 {
        match self {
            Trend::Spike => 100.0,
            Trend::Increasing => 70.0,
            Trend::Stable => 40.0,
            Trend::Decreasing => 10.0,
        }
    }
}

/// Component and composite scores for one pool.
#[derive(Debug, Clone)]
pub struct SignalScore {
    pub composite: f64,
    pub volume_trend: Trend,
    pub liquidity_trend: Trend,
    pub momentum: f64,
    pub activity: f64,
    pub volatility: f64,
}

pub struct SignalAnalyzer {
    settings: SignalSettings,
}

impl SignalAnalyzer {
    pub fn new(settings: SignalSettings) -> Self {
        Self { settings }
    }

    /// Score a pool from its observation history (oldest first; the last
    /// element is the current observation). An empty history scores fully
    /// neutral.
    pub fn analyze(&self, history: &[PoolObservation]) -> SignalScore {
        let latest = history.last().cloned().unwrap_or_default();
        let prior = &history[..history.len().saturating_sub(1)];

        let volume_trend = self.trend(
            latest.volume_h24_usd,
            prior.iter().filter_map(|o| o.volume_h24_usd),
            self.settings.volume_spike_ratio,
        );
        let liquidity_trend = self.trend(
            latest.reserve_usd,
            prior.iter().filter_map(|o| o.reserve_usd),
            self.settings.liquidity_growth_ratio,
        );
        let momentum = self.momentum(history);
        let activity = activity_score(&latest);
        let volatility = self.volatility(history);

        let w = &self.settings.weights;
        let total_weight = w.volume + w.liquidity + w.momentum + w.activity + w.volatility;
        let composite = if total_weight > 0.0 {
            (volume_trend.score() * w.volume
                + liquidity_trend.score() * w.liquidity
                + momentum * w.momentum
                + activity * w.activity
                + volatility * w.volatility)
                / total_weight
        } else {
            0.0
        };

        SignalScore {
            composite: composite.clamp(0.0, 100.0),
            volume_trend,
            liquidity_trend,
            momentum,
            activity,
            volatility,
        }
    }

    pub fn is_alert(&self, score: &SignalScore) -> bool {
        score.composite >= self.settings.alert_threshold
    }

    /// Auto-watchlist decision: composite over the threshold plus every
    /// gate condition (young pool, enough volume, enough liquidity).
    pub fn recommends_watchlist(
        &self,
        score: &SignalScore,
        latest: &PoolObservation,
        now: DateTime<Utc>,
    ) -> bool {
        if score.composite < self.settings.auto_watchlist_threshold {
            return false;
        }
        let age_ok = latest
            .pool_created_at
            .map(|created| {
                now.signed_duration_since(created).num_hours()
                    <= self.settings.max_pool_age_hours as i64
            })
            .unwrap_or(false);
        let volume_ok = latest
            .volume_h24_usd
            .and_then(|v| v.to_f64())
            .map(|v| v >= self.settings.min_volume_24h_usd)
            .unwrap_or(false);
        let liquidity_ok = latest
            .reserve_usd
            .and_then(|v| v.to_f64())
            .map(|v| v >= self.settings.min_liquidity_usd)
            .unwrap_or(false);
        age_ok && volume_ok && liquidity_ok
    }

    fn trend(
        &self,
        latest: Option<Decimal>,
        baseline: impl Iterator<Item = Decimal>,
        spike_ratio: f64,
    ) -> Trend {
        let values: Vec<f64> = baseline.filter_map(|d| d.to_f64()).collect();
        let latest = match latest.and_then(|d| d.to_f64()) {
            Some(v) if v > 0.0 => v,
            _ => return Trend::Stable,
        };
        if values.is_empty() {
            return Trend::Stable;
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        if mean <= 0.0 {
            return Trend::Stable;
        }
        let ratio = latest / mean;
        if ratio >= spike_ratio {
            Trend::Spike
        } else if ratio >= 1.1 {
            Trend::Increasing
        } else if ratio <= 0.9 {
            Trend::Decreasing
        } else {
            Trend::Stable
        }
    }

    /// Signed magnitude from consecutive price changes over the lookback,
    /// centered at 50: a +10% average move per interval saturates to 100.
    fn momentum(&self, history: &[PoolObservation]) -> f64 {
        let changes = price_changes(history, self.settings.momentum_lookback);
        if changes.is_empty() {
            return 50.0;
        }
        let avg = changes.iter().sum::<f64>() / changes.len() as f64;
        (50.0 + avg * 5.0).clamp(0.0, 100.0)
    }

    /// Realized volatility: standard deviation of per-interval price
    /// changes, 10% saturating to 100.
    fn volatility(&self, history: &[PoolObservation]) -> f64 {
        let changes = price_changes(history, self.settings.momentum_lookback);
        if changes.len() < 2 {
            return 0.0;
        }
        let mean = changes.iter().sum::<f64>() / changes.len() as f64;
        let variance =
            changes.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / changes.len() as f64;
        (variance.sqrt() * 10.0).clamp(0.0, 100.0)
    }
}

/// Percent changes between consecutive priced observations within the
/// lookback window.
fn price_changes(history: &[PoolObservation], lookback: usize) -> Vec<f64> {
    let prices: Vec<f64> = history
        .iter()
        .filter_map(|o| o.price_usd.and_then(|p| p.to_f64()))
        .filter(|p| *p > 0.0)
        .collect();
    let window = prices.len().min(lookback + 1);
    let recent = &prices[prices.len() - window..];
    recent
        .windows(2)
        .map(|pair| (pair[1] - pair[0]) / pair[0] * 100.0)
        .collect()
}

/// Transactions per hour plus buy/sell imbalance: three trades per hour
/// saturates the rate share, an all-buy flow saturates the imbalance share.
fn activity_score(latest: &PoolObservation) -> f64 {
    let buys = latest.buys_h24.unwrap_or(0).max(0) as f64;
    let sells = latest.sells_h24.unwrap_or(0).max(0) as f64;
    let total = buys + sells;
    if total == 0.0 {
        return 0.0;
    }
    let per_hour = total / 24.0;
    let rate_score = (per_hour * 20.0).min(60.0);
    let imbalance = buys / total;
    let imbalance_score = (imbalance - 0.5).max(0.0) * 2.0 * 40.0;
    (rate_score + imbalance_score).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal::prelude::FromPrimitive;

    fn dec(v: f64) -> Option<Decimal> {
        Decimal::from_f64(v)
    }

    fn obs(price: f64, volume: f64, reserve: f64) -> PoolObservation {
        PoolObservation {
            price_usd: dec(price),
            volume_h24_usd: dec(volume),
            reserve_usd: dec(reserve),
            buys_h24: None,
            sells_h24: None,
            pool_created_at: None,
        }
    }

    fn analyzer() -> SignalAnalyzer {
        SignalAnalyzer::new(SignalSettings::default())
    }

    #[test]
    fn empty_history_is_neutral() {
        let score = analyzer().analyze(&[]);
        assert_eq!(score.volume_trend, Trend::Stable);
        assert_eq!(score.liquidity_trend, Trend::Stable);
        assert!(score.composite > 0.0 && score.composite < 60.0);
    }

    #[test]
    fn volume_spike_is_tagged() {
        let history = vec![obs(1.0, 1_000.0, 900.0), obs(1.0, 1_000.0, 900.0), obs(1.0, 2_500.0, 900.0)];
        let score = analyzer().analyze(&history);
        assert_eq!(score.volume_trend, Trend::Spike);
        assert_eq!(score.volume_trend.volume_label(), "spike");
    }

    #[test]
    fn liquidity_growth_uses_its_own_threshold() {
        // 1.58x growth: above the 1.5 liquidity threshold, below the 2.0
        // volume spike threshold.
        let history = vec![obs(1.0, 1_000.0, 950.0), obs(1.0, 1_000.0, 1_500.0)];
        let score = analyzer().analyze(&history);
        assert_eq!(score.liquidity_trend, Trend::Spike);
        assert_eq!(score.liquidity_trend.liquidity_label(), "growth");
        assert_eq!(score.volume_trend, Trend::Stable);
    }

    #[test]
    fn declining_series_tags_decreasing() {
        let history = vec![obs(1.0, 2_000.0, 2_000.0), obs(1.0, 1_000.0, 1_000.0)];
        let score = analyzer().analyze(&history);
        assert_eq!(score.volume_trend, Trend::Decreasing);
        assert_eq!(score.liquidity_trend, Trend::Decreasing);
    }

    #[test]
    fn momentum_rises_with_consecutive_gains() {
        let flat = analyzer().analyze(&[obs(1.0, 1.0, 1.0), obs(1.0, 1.0, 1.0)]);
        let rising = analyzer().analyze(&[
            obs(1.0, 1.0, 1.0),
            obs(1.05, 1.0, 1.0),
            obs(1.12, 1.0, 1.0),
            obs(1.2, 1.0, 1.0),
        ]);
        assert!(rising.momentum > flat.momentum);
        assert!(rising.momentum > 50.0);
    }

    #[test]
    fn hot_new_pool_crosses_auto_watchlist() {
        let now = Utc::now();
        let mut latest = obs(1.2, 2_500.0, 1_500.0);
        latest.buys_h24 = Some(42);
        latest.sells_h24 = Some(17);
        latest.pool_created_at = Some(now - Duration::hours(2));

        let history = vec![
            obs(1.0, 1_000.0, 900.0),
            obs(1.05, 1_100.0, 950.0),
            obs(1.12, 1_200.0, 1_000.0),
            latest.clone(),
        ];
        let analyzer = analyzer();
        let score = analyzer.analyze(&history);

        assert_eq!(score.volume_trend, Trend::Spike);
        assert_eq!(score.liquidity_trend, Trend::Spike);
        assert!(score.composite >= 75.0, "composite was {}", score.composite);
        assert!(analyzer.is_alert(&score));
        assert!(analyzer.recommends_watchlist(&score, &latest, now));
    }

    #[test]
    fn age_gate_blocks_old_pools() {
        let now = Utc::now();
        let mut latest = obs(1.2, 2_500.0, 1_500.0);
        latest.buys_h24 = Some(42);
        latest.sells_h24 = Some(17);
        latest.pool_created_at = Some(now - Duration::hours(48));

        let history = vec![
            obs(1.0, 1_000.0, 900.0),
            obs(1.05, 1_100.0, 950.0),
            obs(1.12, 1_200.0, 1_000.0),
            latest.clone(),
        ];
        let analyzer = analyzer();
        let score = analyzer.analyze(&history);
        assert!(score.composite >= 75.0);
        assert!(!analyzer.recommends_watchlist(&score, &latest, now));
    }

    #[test]
    fn volume_gate_blocks_thin_pools() {
        let now = Utc::now();
        let mut latest = obs(1.2, 500.0, 1_500.0);
        latest.pool_created_at = Some(now - Duration::hours(2));
        let analyzer = analyzer();
        let score = SignalScore {
            composite: 90.0,
            volume_trend: Trend::Spike,
            liquidity_trend: Trend::Spike,
            momentum: 90.0,
            activity: 90.0,
            volatility: 50.0,
        };
        assert!(!analyzer.recommends_watchlist(&score, &latest, now));
    }

    #[test]
    fn composite_stays_in_bounds() {
        let history = vec![
            obs(1.0, 100.0, 100.0),
            obs(10.0, 100_000.0, 100_000.0),
        ];
        let score = analyzer().analyze(&history);
        assert!((0.0..=100.0).contains(&score.composite));
    }
}
