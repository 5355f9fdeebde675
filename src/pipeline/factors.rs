//! Daily factor computation over a single symbol's close series.
//!
//! Features look backwards only; labels look forward and must never feed
//! a same-day decision. Values that need more history than is available
//! are omitted rather than stored as NaN.

use crate::pipeline::market_store::PriceBar;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

pub const FEATURE_VERSION: &str = "v1";
pub const LABEL_VERSION: &str = "v1";

/// Return horizons (trading days) for `ret_<n>d` features.
pub const RETURN_HORIZONS: [usize; 3] = [1, 5, 20];
pub const VOL_WINDOW: usize = 20;
/// Forward horizons (trading days) for `forward_ret_<n>d` labels.
pub const LABEL_HORIZONS: [usize; 2] = [5, 20];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorValue {
    pub date: NaiveDate,
    pub name: String,
    pub value: f64,
}

impl FactorValue {
    fn new(date: NaiveDate, name: String, value: f64) -> Option<Self> {
        value.is_finite().then_some(Self { date, name, value })
    }
}

/// Names of every feature produced by [`compute_features`].
pub fn feature_names() -> Vec<String> {
    let mut names: Vec<String> = RETURN_HORIZONS.iter().map(|n| format!("ret_{}d", n)).collect();
    names.push(format!("vol_{}d", VOL_WINDOW));
    names
}

/// `ret_1d`, `ret_5d`, `ret_20d` (n-day percentage change) and `vol_20d`
/// (sample std of `ret_1d` over the trailing 20 observations).
pub fn compute_features(bars: &[PriceBar]) -> Vec<FactorValue> {
    let mut out = Vec::new();
    for n in RETURN_HORIZONS {
        let name = format!("ret_{}d", n);
        for i in n..bars.len() {
            let value = pct_change(bars[i - n].close, bars[i].close);
            out.extend(FactorValue::new(bars[i].date, name.clone(), value));
        }
    }

    // ret_1d[i] exists from i = 1, so a full window ends at i = VOL_WINDOW.
    let daily: Vec<f64> = (1..bars.len())
        .map(|i| pct_change(bars[i - 1].close, bars[i].close))
        .collect();
    let vol_name = format!("vol_{}d", VOL_WINDOW);
    for end in VOL_WINDOW..=daily.len() {
        let window = &daily[end - VOL_WINDOW..end];
        out.extend(FactorValue::new(bars[end].date, vol_name.clone(), window.std_dev()));
    }
    out
}

/// `forward_ret_<h>d = close[t + h] / close[t] - 1`.
pub fn compute_labels(bars: &[PriceBar]) -> Vec<FactorValue> {
    let mut out = Vec::new();
    for h in LABEL_HORIZONS {
        let name = format!("forward_ret_{}d", h);
        for i in 0..bars.len().saturating_sub(h) {
            let value = pct_change(bars[i].close, bars[i + h].close);
            out.extend(FactorValue::new(bars[i].date, name.clone(), value));
        }
    }
    out
}

fn pct_change(prev: f64, cur: f64) -> f64 {
    if prev == 0.0 {
        return f64::NAN;
    }
    cur / prev - 1.0
}
