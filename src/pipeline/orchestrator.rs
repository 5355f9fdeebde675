//! Pipeline Orchestrator
//!
//! Plans and executes multi-stage runs.
//!
//! # Execution Flow
//!
//! ```text
//! RunRequest
//!    │
//!    ├─ dry_run ──▶ build_plan ──▶ PLAN_JSON line + plan.json      (no adapters, no ledger)
//!    │
//!    └─ execute
//!         1. validate strategy + symbols             ──▶ Err(Validation), exit 2
//!         2. identity, name, slug claim, alias
//!         3. config.json, run.json(running), ledger(pipeline)
//!         4. for stage in canonical order:            (inside catch_unwind)
//!              stage dir ─▶ adapter ─▶ result.json ─▶ run.json
//!              stop on failure when fail_fast
//!         5. final run.json, ledger success | fail
//! ```
//!
//! Artifact writes never change a run's outcome; they go through
//! [`try_persist`]. Ledger writes made here are best-effort as well.

use crate::config::{Settings, Verbosity};
use crate::pipeline::adapters::{Collaborators, StageAdapters};
use crate::pipeline::artifact_store::{try_persist, AliasEntry, ArtifactStore};
use crate::pipeline::error::PipelineError;
use crate::pipeline::market_store::MarketStore;
use crate::pipeline::naming::{make_run_name, name_from_hint};
use crate::pipeline::plan::{build_plan, Plan};
use crate::pipeline::run::{Run, RunRequest, StageResult, StrategyIdentity, RUN_KIND_PIPELINE};
use crate::pipeline::run_ledger::RunLedger;
use crate::pipeline::stage::StageContext;
use crate::pipeline::strategy::{fingerprint_file, StrategyDefinition};
use anyhow::Context;
use chrono::Utc;
use serde_json::{json, Value};
use std::any::Any;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;
use tracing::{error, info, warn};

pub struct PipelineOrchestrator {
    artifacts: ArtifactStore,
    ledger: RunLedger,
    market: MarketStore,
    adapters: StageAdapters,
    collaborators: Collaborators,
    verbosity: Verbosity,
}

impl PipelineOrchestrator {
    pub fn new(
        artifacts: ArtifactStore,
        ledger: RunLedger,
        market: MarketStore,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            artifacts,
            ledger,
            market,
            adapters: StageAdapters::default(),
            collaborators,
            verbosity: Verbosity::Normal,
        }
    }

    /// Open the stores named by `settings`.
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let artifacts = ArtifactStore::new(&settings.artifacts_dir, &settings.runs_dir);
        let ledger = RunLedger::open(&settings.meta_db_path)
            .with_context(|| format!("opening run ledger {}", settings.meta_db_path.display()))?;
        let market = MarketStore::open(&settings.market_db_path)
            .with_context(|| format!("opening market store {}", settings.market_db_path.display()))?;
        let collaborators = Collaborators::from_data_dir(&settings.data_dir);
        Ok(Self::new(artifacts, ledger, market, collaborators).with_verbosity(settings.verbosity))
    }

    pub fn with_adapters(mut self, adapters: StageAdapters) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }

    pub fn market(&self) -> &MarketStore {
        &self.market
    }

    // =========================================================================
    // PLANNING
    // =========================================================================

    pub fn build_plan(&self, request: &RunRequest) -> Plan {
        build_plan(request, &self.market, self.artifacts.runs_dir())
    }

    /// Compute the plan, print its sentinel line to `out`, and persist it.
    pub fn dry_run<W: Write>(&self, request: &RunRequest, out: &mut W) -> Plan {
        let plan = self.build_plan(request);
        match plan.sentinel_line() {
            Ok(line) => {
                if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
                    warn!("failed to print plan: {}", e);
                }
            }
            Err(e) => warn!("failed to serialize plan: {}", e),
        }
        try_persist("plan.json", || self.artifacts.write_plan(&plan));

        info!(
            run_id = %plan.run_id,
            slug = %plan.run_slug,
            ok = plan.validation.ok,
            errors = plan.validation.errors.len(),
            warnings = plan.validation.warnings.len(),
            "dry-run plan built"
        );
        plan
    }

    /// Dispatch on `request.dry_run` and map the outcome to an exit code.
    pub fn run<W: Write>(&self, request: &RunRequest, out: &mut W) -> i32 {
        if request.dry_run {
            return self.dry_run(request, out).exit_code();
        }
        match self.execute(request) {
            Ok(run) => run.exit_code.unwrap_or(1),
            Err(e) => {
                error!("{}", e);
                e.exit_code()
            }
        }
    }

    // =========================================================================
    // EXECUTION
    // =========================================================================

    /// Execute the requested stages. Validation problems return before any
    /// stage runs; stage failures are recorded in the returned run; a panic
    /// escaping the stage loop becomes `PipelineError::Crash` after the run
    /// has been marked failed.
    pub fn execute(&self, request: &RunRequest) -> Result<Run, PipelineError> {
        if request.dry_run {
            return Err(PipelineError::validation(
                "Dry-run requests are planned, not executed",
            ));
        }

        let strategy = StrategyDefinition::load(&request.strategy_path)?;
        let symbols = if request.symbols.is_empty() {
            strategy.universe_symbols()?
        } else {
            request.symbols.clone()
        };

        let (run_id, slug_hint) = request.resolve_identity();
        let name = slug_hint
            .as_deref()
            .and_then(|hint| {
                name_from_hint(
                    hint,
                    &strategy.strategy_id,
                    request.date_from,
                    request.date_to,
                    &request.resolved_stages(),
                    &symbols,
                )
            })
            .unwrap_or_else(|| {
                make_run_name(
                    &strategy.strategy_id,
                    request.date_from,
                    request.date_to,
                    &request.stages,
                    &symbols,
                )
            });

        let run_dir = try_persist("run directory", || self.artifacts.create_run_dir(run_id))
            .unwrap_or_else(|| self.artifacts.run_dir(run_id));
        let slug = self.artifacts.claim_slug(&name.slug, run_id);

        let identity = StrategyIdentity {
            strategy_id: strategy.strategy_id.clone(),
            strategy_version: strategy.version.clone(),
            strategy_path: request.strategy_path.display().to_string(),
            strategy_sha256: fingerprint_file(&request.strategy_path),
        };
        let mut run = Run::start(run_id, request, identity, symbols, &run_dir);
        run.run_slug = slug;
        run.display_name = name.display_name;
        run.plan_artifacts_dir = request
            .plan_run_id
            .map(|plan_id| self.artifacts.run_dir(plan_id));

        if let Some(plan_id) = request.plan_run_id {
            match self.artifacts.read_plan(plan_id) {
                Ok(Some(_)) => info!(run_id = %run_id, plan_run_id = %plan_id, "executing planned run"),
                Ok(None) => warn!(plan_run_id = %plan_id, "linked plan not found"),
                Err(e) => warn!(plan_run_id = %plan_id, "linked plan unreadable: {}", e),
            }
        }

        let config = self.config_snapshot(&run, request);
        try_persist("alias entry", || self.artifacts.write_alias(&AliasEntry::for_run(&run)));
        try_persist("config.json", || self.artifacts.write_config_snapshot(run_id, &config));
        try_persist("run.json", || self.artifacts.write_run_summary(&run));
        let ledger_id = match self
            .ledger
            .run_start(RUN_KIND_PIPELINE, &config, Some(&run_id.to_string()))
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(run_id = %run_id, "run ledger unavailable: {}", e);
                None
            }
        };

        info!(
            run_id = %run_id,
            slug = %run.run_slug,
            stages = ?run.stages_resolved,
            symbols = run.symbols_resolved.len(),
            "pipeline run started"
        );
        self.log_line(&run, "INFO", &format!("run started: {}", run.display_name));

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_stages(&mut run, &strategy)));

        let crash = match outcome {
            Ok(()) => {
                run.finish();
                None
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(run_id = %run_id, "pipeline crashed: {}", message);
                run.crash(&message);
                Some(message)
            }
        };

        try_persist("run.json", || self.artifacts.write_run_summary(&run));
        if let Some(id) = ledger_id {
            let result = match &run.error_text {
                Some(text) => self.ledger.run_fail(&id, text),
                None => self.ledger.run_success(&id),
            };
            if let Err(e) = result {
                warn!(run_id = %run_id, "run ledger finish failed: {}", e);
            }
        }

        let status_line = format!(
            "run finished: status={} exit_code={}",
            run.status,
            run.exit_code.unwrap_or(1)
        );
        self.log_line(&run, "INFO", &status_line);
        info!(run_id = %run_id, status = %run.status, "pipeline run finished");

        match crash {
            Some(message) => Err(PipelineError::Crash(message)),
            None => Ok(run),
        }
    }

    fn run_stages(&self, run: &mut Run, strategy: &StrategyDefinition) {
        let stages = run.stages_resolved.clone();
        let symbols = run.symbols_resolved.clone();

        for stage in stages {
            let started_at = Utc::now();
            let timer = Instant::now();
            let stage_dir = try_persist("stage directory", || self.artifacts.create_stage_dir(run.run_id, stage))
                .unwrap_or_else(|| self.artifacts.stage_dir(run.run_id, stage));
            self.log_line(run, "INFO", &format!("stage {} started", stage));

            let ctx = StageContext {
                stage,
                run_id: run.run_id,
                strategy,
                date_from: run.date_from,
                date_to: run.date_to,
                symbols: &symbols,
                stage_dir,
                artifacts: &self.artifacts,
                ledger: &self.ledger,
                market: &self.market,
                collaborators: &self.collaborators,
                verbosity: self.verbosity,
            };

            let result = match self.adapters.get(stage).execute(&ctx) {
                Ok(output) => {
                    for warning in &output.warnings {
                        warn!(stage = %stage, "{}", warning);
                    }
                    StageResult::succeeded(stage, started_at, timer.elapsed().as_secs_f64(), output)
                }
                Err(e) => {
                    let failure = PipelineError::adapter(stage, e);
                    error!(stage = %stage, "{}", failure);
                    StageResult::failed(
                        stage,
                        started_at,
                        timer.elapsed().as_secs_f64(),
                        failure.stage_error_text(),
                    )
                }
            };

            let failed = !result.is_success();
            self.log_line(
                run,
                if failed { "ERROR" } else { "INFO" },
                &format!(
                    "stage {} {} in {:.2}s",
                    stage,
                    if failed { "failed" } else { "succeeded" },
                    result.duration_sec
                ),
            );
            try_persist("result.json", || self.artifacts.write_stage_result(run.run_id, &result));
            run.record_stage(result);
            try_persist("run.json", || self.artifacts.write_run_summary(run));

            if failed && run.fail_fast {
                info!(run_id = %run.run_id, stage = %stage, "fail-fast: skipping remaining stages");
                break;
            }
        }
    }

    fn config_snapshot(&self, run: &Run, request: &RunRequest) -> Value {
        json!({
            "run_id": run.run_id,
            "run_slug": run.run_slug,
            "created_at": run.started_at,
            "request": {
                "strategy_path": request.strategy_path.display().to_string(),
                "date_from": request.date_from,
                "date_to": request.date_to,
                "symbols": request.symbols,
                "stages": request.stages,
                "dry_run": request.dry_run,
                "fail_fast": request.fail_fast,
                "run_identifier": request.run_identifier,
                "plan_run_id": request.plan_run_id,
                "invoked_command": request.invoked_command,
            },
            "resolved": {
                "symbols": run.symbols_resolved,
                "stages": run.stages_resolved,
            },
            "strategy": {
                "strategy_id": run.strategy_id,
                "strategy_version": run.strategy_version,
                "strategy_sha256": run.strategy_sha256,
            },
        })
    }

    fn log_line(&self, run: &Run, level: &str, message: &str) {
        try_persist("pipeline.log", || self.artifacts.append_log(run.run_id, level, message));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
