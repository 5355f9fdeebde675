//! Target generation.
//!
//! A [`ScoringFunction`] scores (symbol, date) pairs; [`generate_targets`]
//! turns one date's scores into a top-k batch of proposed targets. The
//! batch still has to pass the supervisor before it is persisted.

use crate::pipeline::market_store::MarketStore;
use crate::pipeline::strategy::{RebalanceFrequency, Weighting};
use crate::pipeline::supervisor::Target;
use chrono::{Datelike, NaiveDate};
use std::cmp::Ordering;

/// `predict(symbol, date) -> score`. `None` means "no opinion" and drops
/// the symbol from that date's ranking.
pub trait ScoringFunction {
    fn name(&self) -> &str;
    fn predict(&self, symbol: &str, date: NaiveDate) -> anyhow::Result<Option<f64>>;
}

/// Ranks by a stored daily feature.
pub struct FactorRankScorer<'a> {
    store: &'a MarketStore,
    feature_name: String,
    feature_version: String,
    label: String,
}

impl<'a> FactorRankScorer<'a> {
    pub fn new(store: &'a MarketStore, feature_name: &str, feature_version: &str) -> Self {
        Self {
            store,
            feature_name: feature_name.to_string(),
            feature_version: feature_version.to_string(),
            label: format!("factor_rank:{}@{}", feature_name, feature_version),
        }
    }
}

impl ScoringFunction for FactorRankScorer<'_> {
    fn name(&self) -> &str {
        &self.label
    }

    fn predict(&self, symbol: &str, date: NaiveDate) -> anyhow::Result<Option<f64>> {
        Ok(self
            .store
            .load_feature(symbol, &self.feature_name, &self.feature_version, date)?)
    }
}

/// Identity fields stamped on every generated row.
#[derive(Debug, Clone, Copy)]
pub struct TargetBatch<'a> {
    pub strategy_id: &'a str,
    pub version: &'a str,
    pub as_of: NaiveDate,
}

/// Score `symbols` on `batch.as_of`, keep the `top_k` best, and weight them.
///
/// Ties break by symbol so the batch is deterministic.
pub fn generate_targets(
    scorer: &dyn ScoringFunction,
    batch: TargetBatch<'_>,
    symbols: &[String],
    top_k: usize,
    weighting: Weighting,
) -> anyhow::Result<Vec<Target>> {
    let mut scored: Vec<(&str, f64)> = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        if let Some(score) = scorer.predict(symbol, batch.as_of)? {
            if score.is_finite() {
                scored.push((symbol.as_str(), score));
            }
        }
    }
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });
    scored.truncate(top_k);

    let weights = weigh(&scored, weighting);
    Ok(scored
        .iter()
        .zip(weights)
        .map(|((symbol, score), weight)| {
            Target::proposed(batch.strategy_id, batch.version, batch.as_of, symbol, weight, *score)
        })
        .collect())
}

fn weigh(scored: &[(&str, f64)], weighting: Weighting) -> Vec<f64> {
    if scored.is_empty() {
        return Vec::new();
    }
    let equal = vec![1.0 / scored.len() as f64; scored.len()];
    match weighting {
        Weighting::Equal => equal,
        Weighting::ScoreWeighted => {
            let clipped: Vec<f64> = scored.iter().map(|(_, s)| s.max(0.0)).collect();
            let total: f64 = clipped.iter().sum();
            if total > 0.0 {
                clipped.iter().map(|s| s / total).collect()
            } else {
                equal
            }
        }
    }
}

/// Rebalance dates among `trading_dates` (sorted ascending): every date for
/// daily, the last trading date of each ISO week or calendar month
/// otherwise.
pub fn rebalance_dates(trading_dates: &[NaiveDate], frequency: RebalanceFrequency) -> Vec<NaiveDate> {
    let bucket = |d: &NaiveDate| -> (i32, u32) {
        match frequency {
            RebalanceFrequency::Daily => (d.year(), d.ordinal()),
            RebalanceFrequency::Weekly => {
                let w = d.iso_week();
                (w.year(), w.week())
            }
            RebalanceFrequency::Monthly => (d.year(), d.month()),
        }
    };

    let mut out = Vec::new();
    for (i, date) in trading_dates.iter().enumerate() {
        let last_in_bucket = trading_dates
            .get(i + 1)
            .map_or(true, |next| bucket(next) != bucket(date));
        if last_in_bucket {
            out.push(*date);
        }
    }
    out
}
