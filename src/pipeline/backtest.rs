//! Backtest Engine
//!
//! Daily replay of approved targets under the Hold policy with a linear
//! transaction-cost model.
//!
//! # Timing
//!
//! ```text
//!        close T-1                 close T
//!   ──────────┼─────────────────────────┼──────────▶
//!      weights w(T-1) set     P&L(T) = Σ w(T-1)[s] · r[s,T]
//!                             then rebalance to targets(T), if any
//! ```
//!
//! - Targets dated T take effect at T's close; T's P&L uses the weights
//!   set at T-1's close.
//! - **Hold policy**: a date without targets keeps the previous weights and
//!   pays no cost.
//! - `cost(T) = turnover(T) · (fee_bps + slippage_bps) / 10_000`, where
//!   turnover is `Σ |w_new - w_prev|` over the union of symbols.
//!
//! The engine itself is pure; [`BacktestEngine::run_from_store`] is the
//! only entry point that reads the market store.

use crate::pipeline::equity_curve::EquityCurve;
use crate::pipeline::market_store::{MarketStore, MarketStoreError};
use crate::pipeline::strategy::Attribution;
use crate::pipeline::supervisor::Target;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Trading days per year used to annualize Sharpe and volatility.
pub const ANNUALIZATION_FACTOR: f64 = 252.0;

pub const CASH_SYMBOL: &str = "CASH";
pub const COST_SYMBOL: &str = "COST";

/// Daily close-to-close returns keyed by date, then symbol.
pub type DailyReturns = BTreeMap<NaiveDate, BTreeMap<String, f64>>;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug)]
pub enum BacktestError {
    /// No approved targets in the window.
    NoTargets {
        strategy_id: String,
        date_from: NaiveDate,
        date_to: NaiveDate,
    },
    Store(MarketStoreError),
}

impl BacktestError {
    /// Soft failures the caller reports as "no metrics" rather than failing.
    pub fn is_no_data(&self) -> bool {
        matches!(self, Self::NoTargets { .. })
    }
}

impl std::fmt::Display for BacktestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoTargets {
                strategy_id,
                date_from,
                date_to,
            } => write!(
                f,
                "No approved targets for strategy {} between {} and {}",
                strategy_id, date_from, date_to
            ),
            Self::Store(e) => write!(f, "Market store error: {}", e),
        }
    }
}

impl std::error::Error for BacktestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::NoTargets { .. } => None,
        }
    }
}

impl From<MarketStoreError> for BacktestError {
    fn from(e: MarketStoreError) -> Self {
        Self::Store(e)
    }
}

// =============================================================================
// CONFIG
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    pub fee_bps: f64,
    pub slippage_bps: f64,
}

impl CostModel {
    pub fn new(fee_bps: f64, slippage_bps: f64) -> Self {
        Self { fee_bps, slippage_bps }
    }

    /// Cost per unit of turnover.
    pub fn rate(&self) -> f64 {
        (self.fee_bps + self.slippage_bps) / 10_000.0
    }
}

#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub strategy_id: String,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub costs: CostModel,
    pub attribution: Attribution,
}

// =============================================================================
// OUTPUT
// =============================================================================

/// One row per (date, symbol or pseudo-symbol).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub date: NaiveDate,
    pub symbol: String,
    /// Post-rebalance weight.
    pub weight: f64,
    /// Share of the day's total P&L.
    pub contribution: f64,
    /// Share of the day's rebalance cost.
    pub cost: f64,
}

/// Per-day engine state, before attribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayRecord {
    pub date: NaiveDate,
    pub pnl_from_assets: f64,
    pub turnover: f64,
    pub rebalance_cost: f64,
    pub total_pnl: f64,
    pub rebalanced: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestSummary {
    pub strategy_id: String,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub cagr: f64,
    pub sharpe: f64,
    pub max_drawdown: f64,
    pub mean_daily_return: f64,
    pub std_daily_return: f64,
    pub n_days: usize,
    /// Sum of daily turnover.
    pub turnover: f64,
    pub annualized_volatility: f64,
    pub cumulative_return: f64,
}

impl BacktestSummary {
    /// Metric names, in a stable order, for stage metadata.
    pub fn metric_keys() -> Vec<&'static str> {
        vec![
            "cagr",
            "sharpe",
            "max_drawdown",
            "mean_daily_return",
            "std_daily_return",
            "n_days",
            "turnover",
            "annualized_volatility",
            "cumulative_return",
        ]
    }
}

#[derive(Debug, Clone)]
pub struct BacktestResult {
    pub summary: BacktestSummary,
    pub ledger: Vec<LedgerEntry>,
    pub days: Vec<DayRecord>,
    pub equity: EquityCurve,
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct BacktestEngine {
    config: BacktestConfig,
}

impl BacktestEngine {
    pub fn new(config: BacktestConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Load approved targets and returns from `store`, then simulate.
    pub fn run_from_store(&self, store: &MarketStore) -> Result<Option<BacktestResult>, BacktestError> {
        let cfg = &self.config;
        let targets = store.load_approved_targets(&cfg.strategy_id, cfg.date_from, cfg.date_to)?;
        if targets.is_empty() {
            return Err(self.no_targets());
        }
        let symbols: Vec<String> = targets
            .iter()
            .map(|t| t.symbol.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let returns = store.load_returns(&symbols, cfg.date_from, cfg.date_to)?;
        self.simulate(&targets, &returns)
    }

    /// `Err(NoTargets)` for an empty target set; `Ok(None)` when no return
    /// dates fall inside the window.
    pub fn simulate(&self, targets: &[Target], returns: &DailyReturns) -> Result<Option<BacktestResult>, BacktestError> {
        let cfg = &self.config;
        if targets.is_empty() {
            return Err(self.no_targets());
        }

        let dates: Vec<NaiveDate> = returns
            .range(cfg.date_from..=cfg.date_to)
            .map(|(d, _)| *d)
            .collect();
        if dates.is_empty() {
            info!(
                strategy_id = %cfg.strategy_id,
                "no price data in {}..{}; nothing to simulate",
                cfg.date_from, cfg.date_to
            );
            return Ok(None);
        }

        let mut by_date: BTreeMap<NaiveDate, BTreeMap<String, f64>> = BTreeMap::new();
        for t in targets.iter().filter(|t| t.approved) {
            by_date
                .entry(t.as_of)
                .or_default()
                .insert(t.symbol.clone(), t.weight);
        }

        let rate = cfg.costs.rate();
        let empty = BTreeMap::new();
        let mut weights: BTreeMap<String, f64> = BTreeMap::new();
        let mut ledger = Vec::new();
        let mut days = Vec::with_capacity(dates.len());

        for date in &dates {
            let day_returns = returns.get(date).unwrap_or(&empty);
            let pnl_from_assets: f64 = weights
                .iter()
                .map(|(s, w)| w * day_returns.get(s).copied().unwrap_or(0.0))
                .sum();

            let (turnover, rebalance_cost, rebalanced) = match by_date.get(date) {
                Some(new_weights) => {
                    let universe: BTreeSet<&String> = weights.keys().chain(new_weights.keys()).collect();
                    let turnover: f64 = universe
                        .into_iter()
                        .map(|s| {
                            let new = new_weights.get(s).copied().unwrap_or(0.0);
                            let old = weights.get(s).copied().unwrap_or(0.0);
                            (new - old).abs()
                        })
                        .sum();
                    weights = new_weights.clone();
                    (turnover, turnover * rate, true)
                }
                None => (0.0, 0.0, false),
            };

            let total_pnl = pnl_from_assets - rebalance_cost;
            ledger.extend(attribute_day(*date, &weights, total_pnl, rebalance_cost, cfg.attribution));
            days.push(DayRecord {
                date: *date,
                pnl_from_assets,
                turnover,
                rebalance_cost,
                total_pnl,
                rebalanced,
            });
        }

        let (summary, equity) = self.summarize(&dates, &ledger, &days);
        debug!(
            strategy_id = %cfg.strategy_id,
            n_days = summary.n_days,
            sharpe = summary.sharpe,
            "backtest simulated"
        );
        Ok(Some(BacktestResult {
            summary,
            ledger,
            days,
            equity,
        }))
    }

    fn summarize(&self, dates: &[NaiveDate], ledger: &[LedgerEntry], days: &[DayRecord]) -> (BacktestSummary, EquityCurve) {
        let mut daily: BTreeMap<NaiveDate, f64> = dates.iter().map(|d| (*d, 0.0)).collect();
        for entry in ledger {
            *daily.entry(entry.date).or_insert(0.0) += entry.contribution;
        }
        let series: Vec<f64> = daily.values().copied().collect();

        let mut equity = EquityCurve::with_capacity(series.len());
        for (date, r) in &daily {
            equity.record(*date, *r);
        }

        let n_days = series.len();
        let mean = if n_days == 0 { 0.0 } else { series.iter().mean() };
        // Sample std; NaN below two observations.
        let std = series.iter().std_dev();

        let sharpe = if n_days < 2 || std.is_nan() || std == 0.0 {
            0.0
        } else {
            mean / std * ANNUALIZATION_FACTOR.sqrt()
        };

        let cumulative_return = equity.cumulative_return();
        let span = match (dates.first(), dates.last()) {
            (Some(first), Some(last)) => (*last - *first).num_days() + 1,
            _ => 0,
        };
        let cagr = if span > 0 {
            let growth = 1.0 + cumulative_return;
            if growth > 0.0 {
                growth.powf(365.0 / span as f64) - 1.0
            } else {
                -1.0
            }
        } else {
            0.0
        };

        let std_daily_return = finite_or_zero(std);
        let summary = BacktestSummary {
            strategy_id: self.config.strategy_id.clone(),
            date_from: self.config.date_from,
            date_to: self.config.date_to,
            cagr,
            sharpe,
            max_drawdown: equity.max_drawdown(),
            mean_daily_return: finite_or_zero(mean),
            std_daily_return,
            n_days,
            turnover: days.iter().map(|d| d.turnover).sum(),
            annualized_volatility: std_daily_return * ANNUALIZATION_FACTOR.sqrt(),
            cumulative_return,
        };
        (summary, equity)
    }

    fn no_targets(&self) -> BacktestError {
        BacktestError::NoTargets {
            strategy_id: self.config.strategy_id.clone(),
            date_from: self.config.date_from,
            date_to: self.config.date_to,
        }
    }
}

/// Split one day's P&L and cost across symbols with positive weight.
fn attribute_day(
    date: NaiveDate,
    weights: &BTreeMap<String, f64>,
    total_pnl: f64,
    rebalance_cost: f64,
    attribution: Attribution,
) -> Vec<LedgerEntry> {
    let active: Vec<(&String, f64)> = weights
        .iter()
        .filter(|(_, w)| **w > 0.0)
        .map(|(s, w)| (s, *w))
        .collect();

    if active.is_empty() {
        let (symbol, contribution, cost) = if rebalance_cost > 0.0 {
            (COST_SYMBOL, -rebalance_cost, rebalance_cost)
        } else {
            (CASH_SYMBOL, 0.0, 0.0)
        };
        return vec![LedgerEntry {
            date,
            symbol: symbol.to_string(),
            weight: 0.0,
            contribution,
            cost,
        }];
    }

    let n = active.len() as f64;
    let gross: f64 = active.iter().map(|(_, w)| w).sum();
    active
        .into_iter()
        .map(|(symbol, weight)| {
            let share = match attribution {
                Attribution::Even => 1.0 / n,
                Attribution::WeightProportional => weight / gross,
            };
            LedgerEntry {
                date,
                symbol: symbol.clone(),
                weight,
                contribution: total_pnl * share,
                cost: rebalance_cost * share,
            }
        })
        .collect()
}

fn finite_or_zero(x: f64) -> f64 {
    if x.is_finite() {
        x
    } else {
        0.0
    }
}
