//! Engine tests for the backtest module.
//!
//! These tests verify:
//! 1. Hold policy: weights carry forward and cost nothing on dates without targets
//! 2. Timing: a day's P&L uses the weights from the previous close
//! 3. Sharpe safety for short or flat series
//! 4. Pseudo-entries (CASH / COST) and attribution modes
//! 5. Store-backed runs, including the no-data paths

use crate::pipeline::backtest::{
    BacktestConfig, BacktestEngine, BacktestError, CostModel, DailyReturns, CASH_SYMBOL, COST_SYMBOL,
};
use crate::pipeline::market_store::{MarketStore, PriceBar};
use crate::pipeline::strategy::Attribution;
use crate::pipeline::supervisor::Target;
use chrono::NaiveDate;
use std::collections::BTreeMap;

fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
}

fn engine(from: u32, to: u32, bps: f64) -> BacktestEngine {
    BacktestEngine::new(BacktestConfig {
        strategy_id: "s1".to_string(),
        date_from: d(from),
        date_to: d(to),
        costs: CostModel::new(bps, 0.0),
        attribution: Attribution::Even,
    })
}

fn approved(day: u32, symbol: &str, weight: f64) -> Target {
    let mut t = Target::proposed("s1", "1", d(day), symbol, weight, 1.0);
    t.approved = true;
    t
}

fn returns(rows: &[(u32, &[(&str, f64)])]) -> DailyReturns {
    rows.iter()
        .map(|(day, rs)| {
            let map: BTreeMap<String, f64> = rs.iter().map(|(s, r)| (s.to_string(), *r)).collect();
            (d(*day), map)
        })
        .collect()
}

#[test]
fn test_hold_policy_carries_weights() {
    let targets = vec![approved(2, "X", 1.0)];
    let rets = returns(&[(2, &[("X", 0.01)]), (3, &[("X", 0.02)])]);
    let result = engine(2, 3, 10.0).simulate(&targets, &rets).unwrap().unwrap();

    let day1: Vec<_> = result.ledger.iter().filter(|e| e.date == d(2)).collect();
    let day2: Vec<_> = result.ledger.iter().filter(|e| e.date == d(3)).collect();
    assert_eq!(day2.len(), 1);
    assert_eq!(day2[0].symbol, "X");
    assert_eq!(day2[0].weight, day1[0].weight);
    assert_eq!(day2[0].cost, 0.0);
    assert!(!result.days[1].rebalanced);
    assert_eq!(result.days[1].rebalance_cost, 0.0);
}

#[test]
fn test_pnl_uses_previous_close_weights() {
    let targets = vec![approved(2, "X", 1.0)];
    let rets = returns(&[(2, &[("X", 0.50)]), (3, &[("X", 0.02)])]);
    let result = engine(2, 3, 0.0).simulate(&targets, &rets).unwrap().unwrap();

    // Weights set at day 2's close: day 2's own return is not earned.
    assert_eq!(result.days[0].pnl_from_assets, 0.0);
    assert!((result.days[1].pnl_from_assets - 0.02).abs() < 1e-12);
    assert_eq!(result.days[0].turnover, 1.0);
}

#[test]
fn test_single_day_sharpe_is_zero() {
    let targets = vec![approved(2, "X", 1.0)];
    let rets = returns(&[(2, &[("X", 0.05)])]);
    let summary = engine(2, 2, 25.0).simulate(&targets, &rets).unwrap().unwrap().summary;
    assert_eq!(summary.n_days, 1);
    assert_eq!(summary.sharpe, 0.0);
    assert_eq!(summary.std_daily_return, 0.0);
}

#[test]
fn test_flat_series_sharpe_is_zero() {
    let targets = vec![approved(2, "X", 1.0)];
    let rets = returns(&[(2, &[("X", 0.0)]), (3, &[("X", 0.0)]), (4, &[("X", 0.0)])]);
    let summary = engine(2, 4, 0.0).simulate(&targets, &rets).unwrap().unwrap().summary;
    assert_eq!(summary.sharpe, 0.0);
    assert_eq!(summary.max_drawdown, 0.0);
}

#[test]
fn test_alternating_weights_scenario() {
    let weights = [0.5, 0.8, 0.5, 0.8, 0.5];
    let targets: Vec<Target> = weights
        .iter()
        .enumerate()
        .map(|(i, w)| approved(2 + i as u32, "AAPL", *w))
        .collect();
    let rets = returns(&[
        (2, &[("AAPL", 0.01), ("GOOGL", 0.0)]),
        (3, &[("AAPL", -0.02), ("GOOGL", 0.01)]),
        (4, &[("AAPL", 0.03), ("GOOGL", 0.0)]),
        (5, &[("AAPL", 0.01), ("GOOGL", -0.01)]),
        (6, &[("AAPL", -0.01), ("GOOGL", 0.02)]),
    ]);
    let result = engine(2, 6, 10.0).simulate(&targets, &rets).unwrap().unwrap();

    assert_eq!(result.summary.n_days, 5);
    assert!((result.days[0].turnover - 0.5).abs() < 1e-12);
    for day in &result.days[1..] {
        assert!((day.turnover - 0.3).abs() < 1e-12);
        assert!((day.rebalance_cost - 0.3 * 0.001).abs() < 1e-12);
    }
    assert!((result.summary.turnover - 1.7).abs() < 1e-12);

    // Day 3: held 0.5 AAPL through a -2% day, then paid 0.3 * 10bps.
    let expected = 0.5 * -0.02 - 0.0003;
    assert!((result.days[1].total_pnl - expected).abs() < 1e-12);
}

#[test]
fn test_cost_and_cash_pseudo_entries() {
    let targets = vec![approved(2, "X", 1.0), approved(3, "X", 0.0)];
    let rets = returns(&[(2, &[("X", 0.0)]), (3, &[("X", 0.0)]), (4, &[("X", 0.0)])]);
    let result = engine(2, 4, 10.0).simulate(&targets, &rets).unwrap().unwrap();

    let day3: Vec<_> = result.ledger.iter().filter(|e| e.date == d(3)).collect();
    assert_eq!(day3.len(), 1);
    assert_eq!(day3[0].symbol, COST_SYMBOL);
    assert!((day3[0].contribution + 0.001).abs() < 1e-12);

    let day4: Vec<_> = result.ledger.iter().filter(|e| e.date == d(4)).collect();
    assert_eq!(day4[0].symbol, CASH_SYMBOL);
    assert_eq!(day4[0].contribution, 0.0);
}

#[test]
fn test_even_versus_weight_proportional_attribution() {
    let targets = vec![approved(2, "A", 0.9), approved(2, "B", 0.1)];
    let rets = returns(&[(2, &[("A", 0.0), ("B", 0.0)]), (3, &[("A", 0.10), ("B", 0.10)])]);

    let even = engine(2, 3, 0.0).simulate(&targets, &rets).unwrap().unwrap();
    let day: Vec<_> = even.ledger.iter().filter(|e| e.date == d(3)).collect();
    assert!((day[0].contribution - day[1].contribution).abs() < 1e-12);

    let proportional = BacktestEngine::new(BacktestConfig {
        attribution: Attribution::WeightProportional,
        ..engine(2, 3, 0.0).config().clone()
    })
    .simulate(&targets, &rets)
    .unwrap()
    .unwrap();
    let day: Vec<_> = proportional.ledger.iter().filter(|e| e.date == d(3)).collect();
    assert!((day[0].contribution - 0.09).abs() < 1e-12);
    assert!((day[1].contribution - 0.01).abs() < 1e-12);

    // Attribution never changes the totals.
    assert!((even.summary.cumulative_return - proportional.summary.cumulative_return).abs() < 1e-12);
}

#[test]
fn test_no_targets_and_no_prices() {
    let err = engine(2, 3, 0.0).simulate(&[], &DailyReturns::new()).unwrap_err();
    assert!(err.is_no_data());

    let targets = vec![approved(2, "X", 1.0)];
    assert!(engine(2, 3, 0.0).simulate(&targets, &DailyReturns::new()).unwrap().is_none());
}

#[test]
fn test_run_from_store() {
    let store = MarketStore::in_memory().unwrap();
    assert!(matches!(
        engine(2, 4, 0.0).run_from_store(&store),
        Err(BacktestError::NoTargets { .. })
    ));

    let bars: Vec<PriceBar> = [(1, 100.0), (2, 100.0), (3, 110.0), (4, 121.0)]
        .iter()
        .map(|&(day, close)| PriceBar { date: d(day), close })
        .collect();
    store.upsert_prices("X", &bars).unwrap();
    store.save_targets(&[approved(2, "X", 1.0)]).unwrap();

    let result = engine(2, 4, 0.0).run_from_store(&store).unwrap().unwrap();
    assert_eq!(result.summary.n_days, 3);
    assert!((result.summary.cumulative_return - 0.21).abs() < 1e-9);
    assert_eq!(result.summary.max_drawdown, 0.0);
    assert!(result.summary.sharpe > 0.0);
}
