//! Stage adapters.
//!
//! One adapter per [`Stage`]. Each registers its own execution in the run
//! ledger through [`StageContext::tracked`], does its work against the
//! market store, and reports facts as stage metadata. Symbol loops are
//! sequential.
//!
//! External dependencies an adapter cannot own (a price feed, a fitted
//! model) come in through [`Collaborators`].

use crate::pipeline::artifact_store::try_persist;
use crate::pipeline::backtest::{BacktestConfig, BacktestEngine, BacktestSummary, CostModel};
use crate::pipeline::error::PipelineError;
use crate::pipeline::factors::{
    compute_features, compute_labels, feature_names, FEATURE_VERSION, LABEL_HORIZONS, LABEL_VERSION,
};
use crate::pipeline::market_store::PriceBar;
use crate::pipeline::recommender::{
    generate_targets, rebalance_dates, FactorRankScorer, ScoringFunction, TargetBatch,
};
use crate::pipeline::stage::{Stage, StageAdapter, StageContext, StageOutput};
use crate::pipeline::strategy::ScoreSource;
use crate::pipeline::supervisor::{PortfolioSupervisor, Target};
use anyhow::{anyhow, bail, Context};
use chrono::{Duration, NaiveDate};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Calendar days of history ingested before the window, enough for the
/// 20-day features and the backtest's return lookback.
pub const INGEST_HISTORY_DAYS: i64 = 45;

// =============================================================================
// COLLABORATORS
// =============================================================================

/// Daily price feed consumed by the ingest stage.
pub trait PriceSource {
    /// Bars for `symbol` with `from <= date <= to`, oldest first.
    fn fetch(&self, symbol: &str, from: NaiveDate, to: NaiveDate) -> anyhow::Result<Vec<PriceBar>>;
}

/// Reads `<dir>/<SYMBOL>.json`, a JSON array of `{"date", "close"}` objects.
pub struct JsonPriceSource {
    dir: PathBuf,
}

impl JsonPriceSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl PriceSource for JsonPriceSource {
    fn fetch(&self, symbol: &str, from: NaiveDate, to: NaiveDate) -> anyhow::Result<Vec<PriceBar>> {
        let path = self.dir.join(format!("{}.json", symbol));
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading price file {}", path.display()))?;
        let mut bars: Vec<PriceBar> =
            serde_json::from_str(&raw).with_context(|| format!("parsing price file {}", path.display()))?;
        bars.retain(|b| b.date >= from && b.date <= to);
        bars.sort_by_key(|b| b.date);
        bars.dedup_by_key(|b| b.date);
        Ok(bars)
    }
}

/// Pluggable dependencies shared by all adapters of one run.
pub struct Collaborators {
    pub price_source: Box<dyn PriceSource>,
    /// Scorer for `ml_gbdt` / `model_score` strategies.
    pub scorer: Option<Box<dyn ScoringFunction>>,
}

impl Collaborators {
    pub fn new(price_source: Box<dyn PriceSource>) -> Self {
        Self {
            price_source,
            scorer: None,
        }
    }

    /// JSON price files under `<data_dir>/prices`.
    pub fn from_data_dir(data_dir: &Path) -> Self {
        Self::new(Box::new(JsonPriceSource::new(data_dir.join("prices"))))
    }

    pub fn with_scorer(mut self, scorer: Box<dyn ScoringFunction>) -> Self {
        self.scorer = Some(scorer);
        self
    }
}

// =============================================================================
// ADAPTER TABLE
// =============================================================================

/// The closed stage -> adapter binding.
pub struct StageAdapters {
    ingest: Box<dyn StageAdapter>,
    features: Box<dyn StageAdapter>,
    labels: Box<dyn StageAdapter>,
    recommend: Box<dyn StageAdapter>,
    backtest: Box<dyn StageAdapter>,
}

impl Default for StageAdapters {
    fn default() -> Self {
        Self {
            ingest: Box::new(IngestAdapter),
            features: Box::new(FeaturesAdapter),
            labels: Box::new(LabelsAdapter),
            recommend: Box::new(RecommendAdapter),
            backtest: Box::new(BacktestAdapter),
        }
    }
}

impl StageAdapters {
    pub fn get(&self, stage: Stage) -> &dyn StageAdapter {
        match stage {
            Stage::Ingest => self.ingest.as_ref(),
            Stage::Features => self.features.as_ref(),
            Stage::Labels => self.labels.as_ref(),
            Stage::Recommend => self.recommend.as_ref(),
            Stage::Backtest => self.backtest.as_ref(),
        }
    }

    /// Replace one binding.
    pub fn with(mut self, stage: Stage, adapter: Box<dyn StageAdapter>) -> Self {
        match stage {
            Stage::Ingest => self.ingest = adapter,
            Stage::Features => self.features = adapter,
            Stage::Labels => self.labels = adapter,
            Stage::Recommend => self.recommend = adapter,
            Stage::Backtest => self.backtest = adapter,
        }
        self
    }
}

// =============================================================================
// INGEST
// =============================================================================

pub struct IngestAdapter;

impl StageAdapter for IngestAdapter {
    fn execute(&self, ctx: &StageContext<'_>) -> anyhow::Result<StageOutput> {
        let config = json!({ "symbols": ctx.symbols, "history_days": INGEST_HISTORY_DAYS });
        ctx.tracked(config, |exec_id| {
            if ctx.symbols.is_empty() {
                bail!("No symbols to ingest");
            }
            let fetch_from = ctx.date_from - Duration::days(INGEST_HISTORY_DAYS);
            let total = ctx.symbols.len();
            let mut n_rows = 0usize;
            let mut output = StageOutput::new();

            for (i, symbol) in ctx.symbols.iter().enumerate() {
                let bars = ctx
                    .collaborators
                    .price_source
                    .fetch(symbol, fetch_from, ctx.date_to)
                    .with_context(|| format!("fetching {}", symbol))?;
                ctx.market.register_symbol(symbol)?;
                let written = ctx.market.upsert_prices(symbol, &bars)?;
                if written == 0 {
                    output = output.warn(format!("No price rows for {}", symbol));
                }
                n_rows += written;
                ctx.detail(format_args!("ingested {} rows for {}", written, symbol));
                ctx.progress(exec_id, "symbol_done", i + 1, total, json!({ "symbol": symbol, "rows": written }));
            }

            info!(stage = "ingest", n_symbols = total, n_rows, "ingest complete");
            Ok(output
                .meta("n_symbols", json!(total))
                .meta("symbols", json!(ctx.symbols))
                .meta("n_rows", json!(n_rows)))
        })
    }
}

// =============================================================================
// FEATURES & LABELS
// =============================================================================

pub struct FeaturesAdapter;

impl StageAdapter for FeaturesAdapter {
    fn execute(&self, ctx: &StageContext<'_>) -> anyhow::Result<StageOutput> {
        let config = json!({ "symbols": ctx.symbols, "feature_version": FEATURE_VERSION });
        ctx.tracked(config, |exec_id| {
            let (n_rows, output) = per_symbol(ctx, exec_id, |symbol, bars| {
                let values = compute_features(bars);
                Ok(ctx.market.upsert_features(symbol, FEATURE_VERSION, &values)?)
            })?;
            Ok(output
                .meta("n_symbols", json!(ctx.symbols.len()))
                .meta("symbols", json!(ctx.symbols))
                .meta("n_rows", json!(n_rows))
                .meta("feature_version", json!(FEATURE_VERSION))
                .meta("features", json!(feature_names())))
        })
    }
}

pub struct LabelsAdapter;

impl StageAdapter for LabelsAdapter {
    fn execute(&self, ctx: &StageContext<'_>) -> anyhow::Result<StageOutput> {
        let config = json!({ "symbols": ctx.symbols, "label_version": LABEL_VERSION });
        ctx.tracked(config, |exec_id| {
            let (n_rows, output) = per_symbol(ctx, exec_id, |symbol, bars| {
                let values = compute_labels(bars);
                Ok(ctx.market.upsert_labels(symbol, LABEL_VERSION, &values)?)
            })?;
            Ok(output
                .meta("n_symbols", json!(ctx.symbols.len()))
                .meta("symbols", json!(ctx.symbols))
                .meta("n_rows", json!(n_rows))
                .meta("label_version", json!(LABEL_VERSION))
                .meta("horizons", json!(LABEL_HORIZONS)))
        })
    }
}

/// Load each symbol's closes and hand them to `compute`; symbols without
/// prices become warnings.
fn per_symbol<F>(ctx: &StageContext<'_>, exec_id: &str, mut compute: F) -> anyhow::Result<(usize, StageOutput)>
where
    F: FnMut(&str, &[PriceBar]) -> anyhow::Result<usize>,
{
    let total = ctx.symbols.len();
    let mut n_rows = 0;
    let mut output = StageOutput::new();
    for (i, symbol) in ctx.symbols.iter().enumerate() {
        let bars = ctx.market.load_closes(symbol)?;
        if bars.is_empty() {
            output = output.warn(format!("No stored prices for {}", symbol));
        } else {
            let written = compute(symbol.as_str(), bars.as_slice()).with_context(|| format!("{} for {}", ctx.stage, symbol))?;
            ctx.detail(format_args!("{} rows for {}", written, symbol));
            n_rows += written;
        }
        ctx.progress(exec_id, "symbol_done", i + 1, total, json!({ "symbol": symbol }));
    }
    Ok((n_rows, output))
}

// =============================================================================
// RECOMMEND
// =============================================================================

pub struct RecommendAdapter;

impl StageAdapter for RecommendAdapter {
    fn execute(&self, ctx: &StageContext<'_>) -> anyhow::Result<StageOutput> {
        let rec = ctx.strategy.recommendation();
        let descriptor = recommender_descriptor(ctx, &rec.source, &rec.kind);
        let config = json!({
            "strategy_id": ctx.strategy.strategy_id,
            "symbols": ctx.symbols,
            "recommender": descriptor.clone(),
        });

        ctx.tracked(config, |exec_id| {
            let factor;
            let scorer: &dyn ScoringFunction = match &rec.source {
                ScoreSource::Feature { name, version } => {
                    if name.is_empty() || version.is_empty() {
                        bail!("factor_rank requires signal.inputs.feature_name/feature_version");
                    }
                    factor = FactorRankScorer::new(ctx.market, name, version);
                    &factor
                }
                ScoreSource::Plugged { label } => ctx
                    .collaborators
                    .scorer
                    .as_deref()
                    .ok_or_else(|| anyhow!("No scoring function configured for {}", label))?,
            };

            let as_of_dates = match rec.source {
                ScoreSource::Feature { .. } => vec![ctx.date_to],
                ScoreSource::Plugged { .. } => {
                    let trading = ctx.market.trading_dates(ctx.symbols, ctx.date_from, ctx.date_to)?;
                    rebalance_dates(&trading, ctx.strategy.rebalance)
                }
            };

            let supervisor = PortfolioSupervisor::new(ctx.strategy.supervisor.clone());
            let mut output = StageOutput::new();
            let mut written: Vec<Target> = Vec::new();
            let mut dates_written: Vec<NaiveDate> = Vec::new();
            let total = as_of_dates.len();

            for (i, as_of) in as_of_dates.iter().enumerate() {
                let batch = TargetBatch {
                    strategy_id: &ctx.strategy.strategy_id,
                    version: &ctx.strategy.version,
                    as_of: *as_of,
                };
                let proposed = generate_targets(scorer, batch, ctx.symbols, rec.top_k, rec.weighting)
                    .with_context(|| format!("scoring {} with {}", as_of, scorer.name()))?;
                if proposed.is_empty() {
                    output = output.warn(format!("No scores for {}", as_of));
                    continue;
                }
                let audited = supervisor.audit(proposed);
                ctx.market.save_targets(&audited)?;
                let approved = audited.iter().filter(|t| t.approved).count();
                ctx.detail(format_args!("{}: {} targets, {} approved", as_of, audited.len(), approved));
                ctx.progress(
                    exec_id,
                    "targets_write",
                    i + 1,
                    total,
                    json!({ "asof": as_of.to_string(), "rows": audited.len(), "approved": approved }),
                );
                dates_written.push(*as_of);
                written.extend(audited);
            }

            if written.is_empty() {
                warn!(strategy_id = %ctx.strategy.strategy_id, "recommend produced no targets");
                output = output.warn("No targets generated");
            } else {
                let targets_path = try_persist("targets.json", || {
                    ctx.artifacts
                        .write_stage_file(ctx.run_id, Stage::Recommend, "targets.json", &written)
                });
                if let Some(path) = targets_path {
                    output = output.meta("targets_path", json!(path));
                }
            }

            let n_approved = written.iter().filter(|t| t.approved).count();
            Ok(output
                .meta("n_dates", json!(dates_written.len()))
                .meta("n_rows", json!(written.len()))
                .meta("n_approved", json!(n_approved))
                .meta("date_min", json!(dates_written.first().map(|d| d.to_string())))
                .meta("date_max", json!(dates_written.last().map(|d| d.to_string())))
                .meta("top_k", json!(rec.top_k))
                .meta("recommender", descriptor.clone()))
        })
    }
}

fn recommender_descriptor(ctx: &StageContext<'_>, source: &ScoreSource, kind: &str) -> Value {
    let model = ctx.strategy.recommender.as_ref().and_then(|r| r.model.as_ref());
    let feature_version = match source {
        ScoreSource::Feature { version, .. } => Some(version.clone()),
        ScoreSource::Plugged { .. } => None,
    };
    json!({
        "type": kind,
        "algo": model.map(|m| format!("{:?}", m.algo).to_lowercase()),
        "target": model.map(|m| m.target.as_str()),
        "featureset": model.map(|m| m.featureset.clone()),
        "feature_version": feature_version,
    })
}

// =============================================================================
// BACKTEST
// =============================================================================

pub struct BacktestAdapter;

impl StageAdapter for BacktestAdapter {
    fn execute(&self, ctx: &StageContext<'_>) -> anyhow::Result<StageOutput> {
        let settings = &ctx.strategy.backtest;
        let config = json!({
            "strategy_id": ctx.strategy.strategy_id,
            "fee_bps": settings.fee_bps,
            "slippage_bps": settings.slippage_bps,
            "attribution": settings.attribution,
        });

        ctx.tracked(config, |exec_id| {
            let engine = BacktestEngine::new(BacktestConfig {
                strategy_id: ctx.strategy.strategy_id.clone(),
                date_from: ctx.date_from,
                date_to: ctx.date_to,
                costs: CostModel::new(settings.fee_bps, settings.slippage_bps),
                attribution: settings.attribution,
            });

            let output = StageOutput::new()
                .meta("date_from", json!(ctx.date_from.to_string()))
                .meta("date_to", json!(ctx.date_to.to_string()));

            let found = engine
                .run_from_store(ctx.market)
                .map_err(PipelineError::from)
                .and_then(|result| {
                    result.ok_or_else(|| {
                        PipelineError::NoData(format!(
                            "No price data for {}..{}; backtest skipped",
                            ctx.date_from, ctx.date_to
                        ))
                    })
                });
            let result = match found {
                Ok(result) => result,
                Err(PipelineError::NoData(reason)) => return Ok(no_metrics(output, reason)),
                Err(e) => return Err(e.into()),
            };

            ctx.market
                .save_backtest(exec_id, &ctx.strategy.strategy_id, &result.summary, &result.ledger)?;
            try_persist("backtest summary.json", || {
                ctx.artifacts
                    .write_stage_file(ctx.run_id, Stage::Backtest, "summary.json", &result.summary)
            });
            try_persist("backtest ledger.json", || {
                ctx.artifacts
                    .write_stage_file(ctx.run_id, Stage::Backtest, "ledger.json", &result.ledger)
            });

            let s = &result.summary;
            info!(
                strategy_id = %s.strategy_id,
                n_days = s.n_days,
                sharpe = s.sharpe,
                cagr = s.cagr,
                max_drawdown = s.max_drawdown,
                "backtest complete"
            );
            Ok(output
                .meta("has_metrics", json!(true))
                .meta("metrics_keys", json!(BacktestSummary::metric_keys()))
                .meta("metrics", serde_json::to_value(s)?)
                .meta("backtest_run_id", json!(exec_id)))
        })
    }
}

fn no_metrics(output: StageOutput, reason: String) -> StageOutput {
    warn!("{}", reason);
    output
        .meta("has_metrics", json!(false))
        .meta("metrics_keys", json!([]))
        .meta("backtest_run_id", Value::Null)
        .warn(reason)
}
