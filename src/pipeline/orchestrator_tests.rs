//! Orchestrator tests with scripted stage adapters.
//!
//! These tests verify:
//! 1. Stages run in canonical order regardless of request order
//! 2. Fail-fast stops after the first failure; the alternative runs everything
//! 3. A panicking adapter becomes a crash with exit code 3 and a failed run
//! 4. Dry-run invokes no adapter and writes no ledger rows
//! 5. Validation problems surface before any stage runs
//! 6. Slug collisions get the run id suffix
//! 7. Every stage execution is a ledger child of the pipeline run
//! 8. Failed run.json and result.json writes leave the run outcome untouched

use crate::config::Verbosity;
use crate::pipeline::adapters::{Collaborators, JsonPriceSource, StageAdapters};
use crate::pipeline::artifact_store::ArtifactStore;
use crate::pipeline::error::PipelineError;
use crate::pipeline::market_store::MarketStore;
use crate::pipeline::naming::short_run_id;
use crate::pipeline::orchestrator::PipelineOrchestrator;
use crate::pipeline::run::{RunRequest, RunStatus, StageStatus};
use crate::pipeline::run_ledger::RunLedger;
use crate::pipeline::stage::{Stage, StageAdapter, StageContext, StageOutput};
use chrono::NaiveDate;
use serde_json::json;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::TempDir;

const STRATEGY: &str = r#"
strategy_id: momo
version: 2
universe: {type: symbols, symbols: [AAPL, GOOGL]}
rebalance: daily
portfolio: {top_k: 1}
supervisor: {}
signal: {type: factor_rank, inputs: {feature_name: ret_1d, feature_version: v1}}
"#;

#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    Fail,
    Panic,
}

type CallLog = Rc<RefCell<Vec<Stage>>>;

struct ScriptedAdapter {
    behavior: Behavior,
    calls: CallLog,
}

impl StageAdapter for ScriptedAdapter {
    fn execute(&self, ctx: &StageContext<'_>) -> anyhow::Result<StageOutput> {
        self.calls.borrow_mut().push(ctx.stage);
        let behavior = self.behavior;
        ctx.tracked(json!({"symbols": ctx.symbols}), |_exec_id| match behavior {
            Behavior::Succeed => Ok(StageOutput::new().meta("n_symbols", json!(ctx.symbols.len()))),
            Behavior::Fail => anyhow::bail!("{} exploded", ctx.stage),
            Behavior::Panic => panic!("adapter bug in {}", ctx.stage),
        })
    }
}

struct Harness {
    _dir: TempDir,
    root: PathBuf,
    calls: CallLog,
    orchestrator: PipelineOrchestrator,
}

fn harness(overrides: &[(Stage, Behavior)]) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let calls: CallLog = Rc::new(RefCell::new(Vec::new()));

    let mut adapters = StageAdapters::default();
    for stage in Stage::ALL {
        let behavior = overrides
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, b)| *b)
            .unwrap_or(Behavior::Succeed);
        adapters = adapters.with(
            stage,
            Box::new(ScriptedAdapter {
                behavior,
                calls: calls.clone(),
            }),
        );
    }

    let orchestrator = PipelineOrchestrator::new(
        ArtifactStore::at(root.join("artifacts")),
        RunLedger::in_memory().unwrap(),
        MarketStore::in_memory().unwrap(),
        Collaborators::new(Box::new(JsonPriceSource::new(root.join("prices")))),
    )
    .with_adapters(adapters)
    .with_verbosity(Verbosity::Quiet);

    Harness {
        _dir: dir,
        root,
        calls,
        orchestrator,
    }
}

fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn write_strategy(root: &Path, body: &str) -> PathBuf {
    let path = root.join("strategy.yaml");
    std::fs::write(&path, body).unwrap();
    path
}

fn request(h: &Harness) -> RunRequest {
    let path = write_strategy(&h.root, STRATEGY);
    RunRequest::new(path, d("2024-01-02"), d("2024-01-05")).unwrap()
}

#[test]
fn test_stages_run_in_canonical_order() {
    let h = harness(&[]);
    let req = request(&h).with_stages(&[Stage::Backtest, Stage::Ingest, Stage::Recommend]);
    let run = h.orchestrator.execute(&req).unwrap();

    assert_eq!(
        *h.calls.borrow(),
        vec![Stage::Ingest, Stage::Recommend, Stage::Backtest]
    );
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.exit_code, Some(0));
    assert!(run.error_text.is_none());
    assert_eq!(run.stage_results.len(), 3);
    assert_eq!(run.run_slug, "momo__2024-01-02_2024-01-05__ingest-rec-bt__aapl-googl");

    let summary = h
        .orchestrator
        .artifacts()
        .read_run_summary(run.run_id)
        .unwrap()
        .unwrap();
    assert_eq!(summary.run.status, RunStatus::Success);
    assert_eq!(summary.run.stage_results.len(), 3);

    let files = h.orchestrator.artifacts().list_stage_results(run.run_id).unwrap();
    assert_eq!(files.len(), 3);
    assert!(files.iter().all(|f| f.ok));
}

#[test]
fn test_fail_fast_stops_after_first_failure() {
    let h = harness(&[(Stage::Features, Behavior::Fail)]);
    let run = h.orchestrator.execute(&request(&h)).unwrap();

    assert_eq!(*h.calls.borrow(), vec![Stage::Ingest, Stage::Features]);
    assert_eq!(run.status, RunStatus::Fail);
    assert_eq!(run.exit_code, Some(1));
    assert_eq!(run.stage_results.len(), 2);
    assert_eq!(run.stage_results[1].status, StageStatus::Fail);

    let text = run.error_text.unwrap();
    assert!(text.starts_with("Failed stages: features | Error: "));
    assert!(text.contains("features exploded"));
}

#[test]
fn test_without_fail_fast_every_stage_runs() {
    let h = harness(&[(Stage::Features, Behavior::Fail), (Stage::Recommend, Behavior::Fail)]);
    let req = request(&h).fail_fast(false);
    let run = h.orchestrator.execute(&req).unwrap();

    assert_eq!(*h.calls.borrow(), Stage::ALL.to_vec());
    assert_eq!(run.status, RunStatus::Fail);
    assert_eq!(run.exit_code, Some(1));
    let text = run.error_text.unwrap();
    assert!(text.starts_with("Failed stages: features, recommend | Error: features exploded"));
    assert_eq!(run.stage_results[4].status, StageStatus::Success);
}

#[test]
fn test_panic_becomes_crash() {
    let h = harness(&[(Stage::Labels, Behavior::Panic)]);
    let req = request(&h).run_identifier(uuid::Uuid::new_v4().to_string());
    let run_id = req.resolve_identity().0;

    let err = h.orchestrator.execute(&req).unwrap_err();
    assert!(matches!(err, PipelineError::Crash(ref msg) if msg.contains("adapter bug in labels")));
    assert_eq!(err.exit_code(), 3);
    assert_eq!(*h.calls.borrow(), vec![Stage::Ingest, Stage::Features, Stage::Labels]);

    let summary = h
        .orchestrator
        .artifacts()
        .read_run_summary(run_id)
        .unwrap()
        .unwrap();
    assert_eq!(summary.run.status, RunStatus::Fail);
    assert_eq!(summary.run.exit_code, Some(3));
    assert_eq!(summary.run.stage_results.len(), 2);

    let record = h
        .orchestrator
        .ledger()
        .get(&run_id.to_string())
        .unwrap()
        .unwrap();
    assert_eq!(record.status, RunStatus::Fail);
    assert!(record.error_text.unwrap().contains("adapter bug"));
}

#[test]
fn test_run_maps_crash_to_exit_code() {
    let h = harness(&[(Stage::Ingest, Behavior::Panic)]);
    let mut out = Vec::new();
    assert_eq!(h.orchestrator.run(&request(&h), &mut out), 3);
    assert!(out.is_empty());
}

#[test]
fn test_dry_run_touches_nothing() {
    let h = harness(&[]);
    let req = request(&h).dry_run(true);
    let mut out = Vec::new();

    let code = h.orchestrator.run(&req, &mut out);
    assert_eq!(code, 0);
    assert!(h.calls.borrow().is_empty());

    let printed = String::from_utf8(out).unwrap();
    let line = printed.lines().next().unwrap();
    let plan = crate::pipeline::Plan::parse_sentinel_line(line).unwrap();
    assert!(plan.dry_run);
    assert_eq!(plan.symbols_resolved, vec!["AAPL", "GOOGL"]);

    let stored = h.orchestrator.artifacts().read_plan(plan.run_id).unwrap();
    assert!(stored.is_some());
    assert!(h.orchestrator.ledger().get(&plan.run_id.to_string()).unwrap().is_none());
    assert!(h.orchestrator.artifacts().read_run_summary(plan.run_id).unwrap().is_none());
}

#[test]
fn test_execute_refuses_dry_run_request() {
    let h = harness(&[]);
    let err = h.orchestrator.execute(&request(&h).dry_run(true)).unwrap_err();
    assert_eq!(err.exit_code(), 2);
    assert!(h.calls.borrow().is_empty());
}

#[test]
fn test_invalid_strategy_is_validation_error() {
    let h = harness(&[]);
    let path = write_strategy(&h.root, "strategy_id: half\nversion: 1\n");
    let req = RunRequest::new(path, d("2024-01-02"), d("2024-01-05")).unwrap();

    let err = h.orchestrator.execute(&req).unwrap_err();
    match &err {
        PipelineError::Validation(errors) => {
            assert!(errors.iter().any(|e| e.starts_with("Missing required fields")));
        }
        other => panic!("expected validation error, got {:?}", other),
    }
    assert_eq!(h.orchestrator.run(&req, &mut Vec::new()), 2);
    assert!(h.calls.borrow().is_empty());
    assert!(h.orchestrator.artifacts().list_runs().unwrap().is_empty());
}

#[test]
fn test_slug_collision_gets_suffix() {
    let h = harness(&[]);
    let req = request(&h).with_stages(&[Stage::Ingest]);
    let first = h.orchestrator.execute(&req).unwrap();
    let second = h.orchestrator.execute(&req).unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.run_slug, "momo__2024-01-02_2024-01-05__ingest__aapl-googl");
    assert_ne!(second.run_slug, first.run_slug);
    assert!(second.run_slug.starts_with(&first.run_slug));
    assert!(second.run_slug.ends_with(&short_run_id(&second.run_id)));

    let artifacts = h.orchestrator.artifacts();
    assert_eq!(artifacts.resolve_slug(&first.run_slug).unwrap(), first.run_id);
    assert_eq!(artifacts.resolve_slug(&second.run_slug).unwrap(), second.run_id);
}

#[test]
fn test_stage_executions_are_ledger_children() {
    let h = harness(&[(Stage::Backtest, Behavior::Fail)]);
    let run = h.orchestrator.execute(&request(&h)).unwrap();
    let ledger = h.orchestrator.ledger();

    let parent = ledger.get(&run.run_id.to_string()).unwrap().unwrap();
    assert_eq!(parent.kind, "pipeline");
    assert_eq!(parent.status, RunStatus::Fail);

    let children = ledger.children(&run.run_id.to_string()).unwrap();
    assert_eq!(children.len(), 5);
    let failed: Vec<&str> = children
        .iter()
        .filter(|c| c.status == RunStatus::Fail)
        .map(|c| c.kind.as_str())
        .collect();
    assert_eq!(failed, vec!["backtest"]);

    let exec_ids: Vec<&str> = run
        .stage_results
        .iter()
        .filter_map(|r| r.stage_exec_id.as_deref())
        .collect();
    assert_eq!(exec_ids.len(), 4);
    for exec_id in exec_ids {
        assert!(children.iter().any(|c| c.run_id == exec_id));
    }
}

#[test]
fn test_uuid_identifier_is_used_verbatim() {
    let h = harness(&[]);
    let id = uuid::Uuid::new_v4();
    let req = request(&h)
        .with_stages(&[Stage::Ingest])
        .run_identifier(id.to_string());
    let run = h.orchestrator.execute(&req).unwrap();
    assert_eq!(run.run_id, id);
    assert!(h.orchestrator.artifacts().run_dir(id).join("run.json").exists());
}

#[test]
fn test_artifact_write_failures_do_not_change_outcome() {
    let h = harness(&[]);
    let id = uuid::Uuid::new_v4();
    let artifacts = h.orchestrator.artifacts();
    // Directories squatting on the file names make both atomic renames fail.
    std::fs::create_dir_all(artifacts.run_dir(id).join("run.json").join("blocker")).unwrap();
    std::fs::create_dir_all(artifacts.stage_dir(id, Stage::Ingest).join("result.json").join("blocker")).unwrap();

    let req = request(&h)
        .with_stages(&[Stage::Ingest])
        .run_identifier(id.to_string());
    let run = h.orchestrator.execute(&req).unwrap();

    assert_eq!(run.run_id, id);
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.exit_code, Some(0));
    assert!(run.error_text.is_none());
    assert_eq!(run.stage_results.len(), 1);
    assert_eq!(run.stage_results[0].status, StageStatus::Success);
    assert!(artifacts.run_dir(id).join("run.json").is_dir());

    let row = h.orchestrator.ledger().get(&id.to_string()).unwrap().unwrap();
    assert_eq!(row.status, RunStatus::Success);
}
