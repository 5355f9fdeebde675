//! Daily Equity Curve
//!
//! Cumulative-product curve over the backtest's daily P&L series, with a
//! running peak for drawdown.
//!
//! ```text
//! equity[t]   = equity[t-1] * (1 + r[t])      equity[-1] = 1.0
//! peak[t]     = max(equity[0..=t])
//! drawdown[t] = equity[t] / peak[t] - 1        (<= 0)
//! ```
//!
//! The first point is its own peak, so a loss on day one is not a drawdown.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// =============================================================================
// EQUITY POINT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub daily_return: f64,
    /// Growth of 1.0 after this day.
    pub equity: f64,
    /// Highest equity seen so far, this day included.
    pub peak: f64,
    /// `equity / peak - 1`.
    pub drawdown: f64,
}

// =============================================================================
// EQUITY CURVE
// =============================================================================

/// Invariant: points are strictly increasing by `date`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EquityCurve {
    points: Vec<EquityPoint>,
}

impl EquityCurve {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
        }
    }

    /// Append one day. Out-of-order dates are ignored.
    pub fn record(&mut self, date: NaiveDate, daily_return: f64) -> bool {
        let (prev_equity, prev_peak) = match self.points.last() {
            Some(last) if date <= last.date => return false,
            Some(last) => (last.equity, Some(last.peak)),
            None => (1.0, None),
        };
        let equity = prev_equity * (1.0 + daily_return);
        let peak = prev_peak.map_or(equity, |p| p.max(equity));
        let drawdown = if peak > 0.0 { equity / peak - 1.0 } else { 0.0 };
        self.points.push(EquityPoint {
            date,
            daily_return,
            equity,
            peak,
            drawdown,
        });
        true
    }

    pub fn points(&self) -> &[EquityPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn final_equity(&self) -> f64 {
        self.points.last().map_or(1.0, |p| p.equity)
    }

    /// `final_equity - 1`.
    pub fn cumulative_return(&self) -> f64 {
        self.final_equity() - 1.0
    }

    /// Deepest drawdown (most negative), 0 for an empty curve.
    pub fn max_drawdown(&self) -> f64 {
        self.points
            .iter()
            .map(|p| p.drawdown)
            .fold(0.0, f64::min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    #[test]
    fn test_drawdown_from_running_peak() {
        let mut curve = EquityCurve::new();
        curve.record(d(1), 0.10);
        curve.record(d(2), -0.50);
        curve.record(d(3), 0.20);

        let pts = curve.points();
        assert!((pts[0].equity - 1.1).abs() < 1e-12);
        assert_eq!(pts[0].drawdown, 0.0);
        assert!((pts[1].drawdown + 0.5).abs() < 1e-12);
        assert!((pts[2].drawdown + 0.4).abs() < 1e-12);
        assert!((curve.max_drawdown() + 0.5).abs() < 1e-12);
        assert!((curve.cumulative_return() - (1.1 * 0.5 * 1.2 - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_first_day_loss_is_not_drawdown() {
        let mut curve = EquityCurve::new();
        curve.record(d(1), -0.20);
        assert_eq!(curve.max_drawdown(), 0.0);
    }

    #[test]
    fn test_rejects_out_of_order_dates() {
        let mut curve = EquityCurve::new();
        assert!(curve.record(d(2), 0.0));
        assert!(!curve.record(d(2), 0.1));
        assert!(!curve.record(d(1), 0.1));
        assert_eq!(curve.len(), 1);
    }
}
