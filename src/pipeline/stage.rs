//! Pipeline stages and the adapter contract.
//!
//! The stage set is closed: five variants executed in a fixed canonical
//! order. Each variant is bound to one [`StageAdapter`] inside
//! [`StageAdapters`](crate::pipeline::adapters::StageAdapters); nothing is
//! dispatched by name at run time.

use crate::config::Verbosity;
use crate::pipeline::adapters::Collaborators;
use crate::pipeline::artifact_store::{try_persist, ArtifactStore};
use crate::pipeline::error::PipelineError;
use crate::pipeline::market_store::MarketStore;
use crate::pipeline::progress::ProgressEvent;
use crate::pipeline::run_ledger::RunLedger;
use crate::pipeline::strategy::StrategyDefinition;
use anyhow::Context;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use tracing::{debug, info, warn};
use uuid::Uuid;

// =============================================================================
// STAGE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Ingest,
    Features,
    Labels,
    Recommend,
    Backtest,
}

impl Stage {
    /// Canonical execution order.
    pub const ALL: [Stage; 5] = [
        Stage::Ingest,
        Stage::Features,
        Stage::Labels,
        Stage::Recommend,
        Stage::Backtest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::Features => "features",
            Stage::Labels => "labels",
            Stage::Recommend => "recommend",
            Stage::Backtest => "backtest",
        }
    }

    /// Token used in run slugs.
    pub fn short_token(&self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::Features => "feat",
            Stage::Labels => "lbl",
            Stage::Recommend => "rec",
            Stage::Backtest => "bt",
        }
    }

    pub fn parse(raw: &str) -> Option<Stage> {
        let raw = raw.trim();
        Stage::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(raw))
    }

    /// Parse a comma-separated stage list. Unknown names are a validation error.
    pub fn parse_list(raw: &str) -> Result<Vec<Stage>, PipelineError> {
        let mut stages = Vec::new();
        let mut unknown = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match Stage::parse(part) {
                Some(stage) => {
                    if !stages.contains(&stage) {
                        stages.push(stage);
                    }
                }
                None => unknown.push(format!("Unknown stage: {}", part)),
            }
        }
        if !unknown.is_empty() {
            return Err(PipelineError::Validation(unknown));
        }
        Ok(stages)
    }

    /// Requested subset in canonical order; empty means every stage.
    pub fn resolve(requested: &[Stage]) -> Vec<Stage> {
        if requested.is_empty() {
            return Stage::ALL.to_vec();
        }
        Stage::ALL
            .into_iter()
            .filter(|s| requested.contains(s))
            .collect()
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::parse(s).ok_or_else(|| PipelineError::validation(format!("Unknown stage: {}", s)))
    }
}

// =============================================================================
// ADAPTER CONTRACT
// =============================================================================

/// What a stage adapter hands back on success.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    /// Opaque handle correlating with the run ledger.
    pub execution_id: Option<String>,
    /// Stage-specific facts recorded in `result.json` and `run.json`.
    pub metadata: Map<String, Value>,
    /// Soft problems that did not fail the stage.
    pub warnings: Vec<String>,
}

impl StageOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn warn(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// One callable per stage.
pub trait StageAdapter {
    fn execute(&self, ctx: &StageContext<'_>) -> anyhow::Result<StageOutput>;
}

/// Everything a stage adapter may touch while it runs.
pub struct StageContext<'a> {
    pub stage: Stage,
    pub run_id: Uuid,
    pub strategy: &'a StrategyDefinition,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub symbols: &'a [String],
    /// Absolute path of `stages/<name>/`.
    pub stage_dir: PathBuf,
    pub artifacts: &'a ArtifactStore,
    pub ledger: &'a RunLedger,
    pub market: &'a MarketStore,
    pub collaborators: &'a Collaborators,
    pub verbosity: Verbosity,
}

impl<'a> StageContext<'a> {
    /// Register this stage's execution in the ledger, run `body`, and record
    /// the outcome. The ledger id becomes the stage execution id.
    pub fn tracked<F>(&self, config: Value, body: F) -> anyhow::Result<StageOutput>
    where
        F: FnOnce(&str) -> anyhow::Result<StageOutput>,
    {
        let mut config = match config {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("config".to_string(), other);
                map
            }
        };
        config.insert("parent_run_id".to_string(), json!(self.run_id.to_string()));
        config.insert("date_from".to_string(), json!(self.date_from.to_string()));
        config.insert("date_to".to_string(), json!(self.date_to.to_string()));

        let exec_id = self
            .ledger
            .run_start(self.stage.as_str(), &Value::Object(config), None)
            .with_context(|| format!("registering {} execution", self.stage))?;

        match body(&exec_id) {
            Ok(mut output) => {
                if let Err(e) = self.ledger.run_success(&exec_id) {
                    warn!(stage = %self.stage, exec_id = %exec_id, "ledger success write failed: {}", e);
                }
                output.execution_id = Some(exec_id);
                Ok(output)
            }
            Err(err) => {
                if let Err(e) = self.ledger.run_fail(&exec_id, &format!("{:#}", err)) {
                    warn!(stage = %self.stage, exec_id = %exec_id, "ledger fail write failed: {}", e);
                }
                Err(err)
            }
        }
    }

    /// Append a progress event to the run log. Best-effort.
    pub fn progress(&self, exec_id: &str, event: &str, current: usize, total: usize, extra: Value) {
        let mut evt = ProgressEvent::new(self.run_id, self.stage, event, current, total)
            .with_exec_id(exec_id);
        if let Value::Object(map) = extra {
            evt.extra = map;
        }
        try_persist("progress event", || self.artifacts.append_progress(self.run_id, &evt));
    }

    /// Per-item chatter: `info` when verbose, `debug` otherwise.
    pub fn detail(&self, message: std::fmt::Arguments<'_>) {
        match self.verbosity {
            Verbosity::Verbose => info!(stage = %self.stage, "{}", message),
            Verbosity::Normal => debug!(stage = %self.stage, "{}", message),
            Verbosity::Quiet => {}
        }
    }
}
