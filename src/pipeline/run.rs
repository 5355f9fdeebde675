//! Run request, run record, and stage results.
//!
//! # Design Principles
//!
//! 1. **UUID identity**: `run_id` is assigned once and never changes. The
//!    slug is a derived, human-friendly alias and is not an identity.
//! 2. **Single transition**: a run moves `running -> success | fail`
//!    exactly once and is never resurrected.
//! 3. **No nested runs**: stage results carry an opaque execution id for
//!    ledger correlation, never another run's identity.

use crate::pipeline::error::PipelineError;
use crate::pipeline::stage::{Stage, StageOutput};
use crate::pipeline::strategy::normalize_symbols;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const RUN_KIND_PIPELINE: &str = "pipeline";

/// Exit code recorded for a run that crashed.
pub const EXIT_CODE_CRASH: i32 = 3;

// =============================================================================
// REQUEST
// =============================================================================

/// Immutable input to a pipeline execution.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub strategy_path: PathBuf,
    /// Inclusive.
    pub date_from: NaiveDate,
    /// Inclusive.
    pub date_to: NaiveDate,
    /// Explicit symbols; empty means "resolve from the strategy universe".
    pub symbols: Vec<String>,
    /// Requested subset; empty means every stage.
    pub stages: Vec<Stage>,
    pub dry_run: bool,
    pub fail_fast: bool,
    /// A UUID is used as the run id; anything else is a slug hint.
    pub run_identifier: Option<String>,
    pub plan_run_id: Option<Uuid>,
    pub invoked_command: Option<String>,
}

/// How the caller's run identifier is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestedIdentity {
    Fresh,
    RunId(Uuid),
    SlugHint(String),
}

impl RunRequest {
    pub fn new(
        strategy_path: impl Into<PathBuf>,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<Self, PipelineError> {
        if date_from > date_to {
            return Err(PipelineError::validation(format!(
                "Invalid date range: {} is after {}",
                date_from, date_to
            )));
        }
        Ok(Self {
            strategy_path: strategy_path.into(),
            date_from,
            date_to,
            symbols: Vec::new(),
            stages: Vec::new(),
            dry_run: false,
            fail_fast: true,
            run_identifier: None,
            plan_run_id: None,
            invoked_command: None,
        })
    }

    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let raw: Vec<S> = symbols.into_iter().collect();
        self.symbols = normalize_symbols(raw.iter().map(|s| s.as_ref()));
        self
    }

    pub fn with_stages(mut self, stages: &[Stage]) -> Self {
        self.stages = if stages.is_empty() {
            Vec::new()
        } else {
            Stage::resolve(stages)
        };
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn run_identifier(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.run_identifier = if id.trim().is_empty() { None } else { Some(id) };
        self
    }

    pub fn plan_run_id(mut self, plan_run_id: Option<Uuid>) -> Self {
        self.plan_run_id = plan_run_id;
        self
    }

    pub fn invoked_command(mut self, command: impl Into<String>) -> Self {
        self.invoked_command = Some(command.into());
        self
    }

    pub fn requested_identity(&self) -> RequestedIdentity {
        match self.run_identifier.as_deref().map(str::trim) {
            None | Some("") => RequestedIdentity::Fresh,
            Some(raw) => match Uuid::parse_str(raw) {
                Ok(id) => RequestedIdentity::RunId(id),
                Err(_) => RequestedIdentity::SlugHint(raw.to_string()),
            },
        }
    }

    /// Run id to use and the slug hint, if any.
    pub fn resolve_identity(&self) -> (Uuid, Option<String>) {
        match self.requested_identity() {
            RequestedIdentity::Fresh => (Uuid::new_v4(), None),
            RequestedIdentity::RunId(id) => (id, None),
            RequestedIdentity::SlugHint(hint) => (Uuid::new_v4(), Some(hint)),
        }
    }

    pub fn resolved_stages(&self) -> Vec<Stage> {
        Stage::resolve(&self.stages)
    }
}

// =============================================================================
// STATUS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Fail,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Success => write!(f, "success"),
            RunStatus::Fail => write!(f, "fail"),
        }
    }
}

/// Persisted stage outcomes. "running" only exists in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Success,
    Fail,
}

// =============================================================================
// STAGE RESULT
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_name: Stage,
    pub status: StageStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_sec: f64,
    pub stage_exec_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    /// Relative to the run directory.
    pub result_path: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl StageResult {
    pub fn result_path_for(stage: Stage) -> String {
        format!("stages/{}/result.json", stage.as_str())
    }

    pub fn succeeded(
        stage: Stage,
        started_at: DateTime<Utc>,
        duration_sec: f64,
        output: StageOutput,
    ) -> Self {
        Self {
            stage_name: stage,
            status: StageStatus::Success,
            started_at,
            ended_at: Utc::now(),
            duration_sec,
            stage_exec_id: output.execution_id,
            error_text: None,
            result_path: Self::result_path_for(stage),
            meta: output.metadata,
            warnings: output.warnings,
        }
    }

    pub fn failed(
        stage: Stage,
        started_at: DateTime<Utc>,
        duration_sec: f64,
        error_text: String,
    ) -> Self {
        Self {
            stage_name: stage,
            status: StageStatus::Fail,
            started_at,
            ended_at: Utc::now(),
            duration_sec,
            stage_exec_id: None,
            error_text: Some(error_text),
            result_path: Self::result_path_for(stage),
            meta: Map::new(),
            warnings: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StageStatus::Success
    }
}

/// Contents of `stages/<name>/result.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResultFile {
    pub ok: bool,
    pub stage_name: Stage,
    pub status: StageStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub elapsed_sec: f64,
    pub stage_exec_id: Option<String>,
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl From<&StageResult> for StageResultFile {
    fn from(r: &StageResult) -> Self {
        Self {
            ok: r.is_success(),
            stage_name: r.stage_name,
            status: r.status,
            started_at: r.started_at,
            ended_at: r.ended_at,
            elapsed_sec: r.duration_sec,
            stage_exec_id: r.stage_exec_id.clone(),
            meta: r.meta.clone(),
            errors: r.error_text.iter().cloned().collect(),
            warnings: r.warnings.clone(),
            generated_at: Utc::now(),
        }
    }
}

// =============================================================================
// RUN
// =============================================================================

/// Everything known about the strategy when a run starts.
#[derive(Debug, Clone, Default)]
pub struct StrategyIdentity {
    pub strategy_id: String,
    pub strategy_version: String,
    pub strategy_path: String,
    pub strategy_sha256: Option<String>,
}

/// One pipeline execution. Mutated only by the orchestrator while running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub run_slug: String,
    pub display_name: String,
    pub kind: String,
    pub invoked_command: Option<String>,
    pub artifacts_dir: PathBuf,
    pub plan_run_id: Option<Uuid>,
    pub plan_artifacts_dir: Option<PathBuf>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub strategy_id: String,
    pub strategy_version: String,
    pub strategy_path: String,
    #[serde(default)]
    pub strategy_sha256: Option<String>,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub symbols_resolved: Vec<String>,
    pub stages_resolved: Vec<Stage>,
    pub fail_fast: bool,
    pub dry_run: bool,
    #[serde(default)]
    pub error_text: Option<String>,
    #[serde(default)]
    pub stage_results: Vec<StageResult>,
}

impl Run {
    /// A fresh run in the `running` state.
    pub fn start(
        run_id: Uuid,
        request: &RunRequest,
        strategy: StrategyIdentity,
        symbols: Vec<String>,
        artifacts_dir: &Path,
    ) -> Self {
        Self {
            run_id,
            run_slug: String::new(),
            display_name: String::new(),
            kind: RUN_KIND_PIPELINE.to_string(),
            invoked_command: request.invoked_command.clone(),
            artifacts_dir: artifacts_dir.to_path_buf(),
            plan_run_id: request.plan_run_id,
            plan_artifacts_dir: None,
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
            strategy_id: strategy.strategy_id,
            strategy_version: strategy.strategy_version,
            strategy_path: strategy.strategy_path,
            strategy_sha256: strategy.strategy_sha256,
            date_from: request.date_from,
            date_to: request.date_to,
            symbols_resolved: symbols,
            stages_resolved: request.resolved_stages(),
            fail_fast: request.fail_fast,
            dry_run: false,
            error_text: None,
            stage_results: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != RunStatus::Running
    }

    pub fn record_stage(&mut self, result: StageResult) {
        self.stage_results.push(result);
    }

    pub fn failed_stages(&self) -> Vec<&StageResult> {
        self.stage_results.iter().filter(|r| !r.is_success()).collect()
    }

    /// `Failed stages: a, b | Error: <first error>` when anything failed.
    pub fn failure_summary(&self) -> Option<String> {
        let failed = self.failed_stages();
        let first = failed.first()?;
        let names: Vec<&str> = failed.iter().map(|r| r.stage_name.as_str()).collect();
        Some(format!(
            "Failed stages: {} | Error: {}",
            names.join(", "),
            first.error_text.as_deref().unwrap_or("unknown error")
        ))
    }

    /// Settle the final status from the recorded stage results.
    /// Returns false if the run had already finished.
    pub fn finish(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        let failure = self.failure_summary();
        self.status = if failure.is_some() {
            RunStatus::Fail
        } else {
            RunStatus::Success
        };
        self.exit_code = Some(if failure.is_some() { 1 } else { 0 });
        self.error_text = failure;
        self.ended_at = Some(Utc::now());
        true
    }

    /// Mark the run failed after a crash escaped the stage loop.
    pub fn crash(&mut self, message: &str) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = RunStatus::Fail;
        self.exit_code = Some(EXIT_CODE_CRASH);
        self.error_text = Some(message.to_string());
        self.ended_at = Some(Utc::now());
        true
    }
}

/// `run.json` as read back from disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    #[serde(flatten)]
    pub run: Run,
    pub generated_at: DateTime<Utc>,
}
