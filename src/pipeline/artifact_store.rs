//! Run Artifact Store
//!
//! File-system tree that is the source of truth for run and stage status.
//! Secondary indexes (the run ledger) may disagree after a crash; this tree
//! wins.
//!
//! # Layout
//!
//! ```text
//! <artifacts>/
//! ├── index/runs/<slug>.json          alias: slug -> run id
//! └── runs/<run_id>/
//!     ├── run.json                    mutable summary (last writer wins)
//!     ├── config.json                 request snapshot
//!     ├── plan.json                   dry-run plans only
//!     ├── pipeline.log                human log + PROGRESS_JSON lines
//!     ├── pipeline.pid / .exit_code   process supervision
//!     └── stages/<stage>/result.json  written once per stage
//! ```
//!
//! Every write made during a run goes through [`try_persist`]: artifact I/O
//! must never change a run's logical outcome.

use crate::pipeline::plan::Plan;
use crate::pipeline::progress::ProgressEvent;
use crate::pipeline::run::{Run, RunSummary, StageResult, StageResultFile};
use crate::pipeline::stage::Stage;
use crate::pipeline::supervision::{ProcessFiles, LOG_FILE};
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

const RUN_SUMMARY_FILE: &str = "run.json";
const CONFIG_FILE: &str = "config.json";
const PLAN_FILE: &str = "plan.json";
const RESULT_FILE: &str = "result.json";

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug)]
pub enum ArtifactStoreError {
    Io { path: PathBuf, source: std::io::Error },
    Serialization(serde_json::Error),
    NotFound(String),
}

impl ArtifactStoreError {
    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl std::fmt::Display for ArtifactStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "I/O error at {}: {}", path.display(), source),
            Self::Serialization(e) => write!(f, "Serialization error: {}", e),
            Self::NotFound(what) => write!(f, "Artifact not found: {}", what),
        }
    }
}

impl std::error::Error for ArtifactStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Serialization(e) => Some(e),
            Self::NotFound(_) => None,
        }
    }
}

impl From<serde_json::Error> for ArtifactStoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

/// Run a best-effort artifact write: failures are logged and dropped.
pub fn try_persist<T, F>(what: &str, action: F) -> Option<T>
where
    F: FnOnce() -> Result<T, ArtifactStoreError>,
{
    match action() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(artifact = what, "best-effort artifact write failed: {}", e);
            None
        }
    }
}

// =============================================================================
// ALIAS INDEX
// =============================================================================

/// One alias-index file: slug -> canonical run id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasEntry {
    pub run_id: Uuid,
    pub run_slug: String,
    pub display_name: String,
    pub artifacts_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub strategy_id: String,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub stages_resolved: Vec<Stage>,
}

impl AliasEntry {
    pub fn for_run(run: &Run) -> Self {
        Self {
            run_id: run.run_id,
            run_slug: run.run_slug.clone(),
            display_name: run.display_name.clone(),
            artifacts_dir: run.artifacts_dir.clone(),
            created_at: run.started_at,
            strategy_id: run.strategy_id.clone(),
            date_from: run.date_from,
            date_to: run.date_to,
            stages_resolved: run.stages_resolved.clone(),
        }
    }
}

// =============================================================================
// STORE
// =============================================================================

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    runs_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(artifacts_dir: impl Into<PathBuf>, runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: artifacts_dir.into(),
            runs_dir: runs_dir.into(),
        }
    }

    /// Store whose runs live under `<artifacts_dir>/runs`.
    pub fn at(artifacts_dir: impl Into<PathBuf>) -> Self {
        let root = artifacts_dir.into();
        let runs_dir = root.join("runs");
        Self { root, runs_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.runs_dir.join(run_id.to_string())
    }

    pub fn stage_dir(&self, run_id: Uuid, stage: Stage) -> PathBuf {
        self.run_dir(run_id).join("stages").join(stage.as_str())
    }

    fn index_dir(&self) -> PathBuf {
        self.root.join("index").join("runs")
    }

    pub fn process_files(&self, run_id: Uuid) -> ProcessFiles {
        ProcessFiles::in_dir(&self.run_dir(run_id))
    }

    pub fn log_path(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join(LOG_FILE)
    }

    /// Create `runs/<run_id>/stages/`.
    pub fn create_run_dir(&self, run_id: Uuid) -> Result<PathBuf, ArtifactStoreError> {
        let dir = self.run_dir(run_id);
        let stages = dir.join("stages");
        fs::create_dir_all(&stages).map_err(ArtifactStoreError::io(&stages))?;
        Ok(dir)
    }

    pub fn create_stage_dir(&self, run_id: Uuid, stage: Stage) -> Result<PathBuf, ArtifactStoreError> {
        let dir = self.stage_dir(run_id, stage);
        fs::create_dir_all(&dir).map_err(ArtifactStoreError::io(&dir))?;
        Ok(dir)
    }

    // -------------------------------------------------------------------------
    // run summary / config
    // -------------------------------------------------------------------------

    pub fn write_run_summary(&self, run: &Run) -> Result<PathBuf, ArtifactStoreError> {
        #[derive(Serialize)]
        struct SummaryFile<'a> {
            #[serde(flatten)]
            run: &'a Run,
            generated_at: DateTime<Utc>,
        }
        let path = self.run_dir(run.run_id).join(RUN_SUMMARY_FILE);
        write_json_atomic(
            &path,
            &SummaryFile {
                run,
                generated_at: Utc::now(),
            },
        )?;
        Ok(path)
    }

    pub fn read_run_summary(&self, run_id: Uuid) -> Result<Option<RunSummary>, ArtifactStoreError> {
        read_json(&self.run_dir(run_id).join(RUN_SUMMARY_FILE))
    }

    pub fn write_config_snapshot(&self, run_id: Uuid, config: &Value) -> Result<PathBuf, ArtifactStoreError> {
        let path = self.run_dir(run_id).join(CONFIG_FILE);
        write_json_atomic(&path, config)?;
        Ok(path)
    }

    /// Runs that carry a `run.json`, newest first. Unreadable summaries are skipped.
    pub fn list_runs(&self) -> Result<Vec<RunSummary>, ArtifactStoreError> {
        let entries = match fs::read_dir(&self.runs_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ArtifactStoreError::io(&self.runs_dir)(e)),
        };

        let mut runs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path().join(RUN_SUMMARY_FILE);
            match read_json::<RunSummary>(&path) {
                Ok(Some(summary)) => runs.push(summary),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), "skipping unreadable run summary: {}", e),
            }
        }
        runs.sort_by(|a, b| b.run.started_at.cmp(&a.run.started_at));
        Ok(runs)
    }

    // -------------------------------------------------------------------------
    // stage results
    // -------------------------------------------------------------------------

    pub fn write_stage_result(&self, run_id: Uuid, result: &StageResult) -> Result<PathBuf, ArtifactStoreError> {
        let path = self.stage_dir(run_id, result.stage_name).join(RESULT_FILE);
        write_json_atomic(&path, &StageResultFile::from(result))?;
        Ok(path)
    }

    pub fn read_stage_result(
        &self,
        run_id: Uuid,
        stage: Stage,
    ) -> Result<Option<StageResultFile>, ArtifactStoreError> {
        read_json(&self.stage_dir(run_id, stage).join(RESULT_FILE))
    }

    /// Stage results present on disk, in canonical stage order.
    pub fn list_stage_results(&self, run_id: Uuid) -> Result<Vec<StageResultFile>, ArtifactStoreError> {
        let mut out = Vec::new();
        for stage in Stage::ALL {
            if let Some(result) = self.read_stage_result(run_id, stage)? {
                out.push(result);
            }
        }
        Ok(out)
    }

    /// Write an extra JSON file into a stage directory; returns its run-relative path.
    pub fn write_stage_file<T: Serialize>(
        &self,
        run_id: Uuid,
        stage: Stage,
        name: &str,
        value: &T,
    ) -> Result<String, ArtifactStoreError> {
        let path = self.stage_dir(run_id, stage).join(name);
        write_json_atomic(&path, value)?;
        Ok(format!("stages/{}/{}", stage.as_str(), name))
    }

    // -------------------------------------------------------------------------
    // plans
    // -------------------------------------------------------------------------

    pub fn write_plan(&self, plan: &Plan) -> Result<PathBuf, ArtifactStoreError> {
        let path = self.run_dir(plan.run_id).join(PLAN_FILE);
        write_json_atomic(&path, plan)?;
        Ok(path)
    }

    pub fn read_plan(&self, plan_run_id: Uuid) -> Result<Option<Plan>, ArtifactStoreError> {
        read_json(&self.run_dir(plan_run_id).join(PLAN_FILE))
    }

    // -------------------------------------------------------------------------
    // alias index
    // -------------------------------------------------------------------------

    fn alias_path(&self, slug: &str) -> PathBuf {
        self.index_dir().join(format!("{}.json", slug))
    }

    pub fn read_alias(&self, slug: &str) -> Result<Option<AliasEntry>, ArtifactStoreError> {
        read_json(&self.alias_path(slug))
    }

    /// Final slug for `run_id`: `slug` itself unless another run already owns
    /// it. An unreadable alias counts as owned so it is never overwritten.
    pub fn claim_slug(&self, slug: &str, run_id: Uuid) -> String {
        match self.read_alias(slug) {
            Ok(Some(existing)) if existing.run_id == run_id => slug.to_string(),
            Ok(None) => slug.to_string(),
            Ok(Some(_)) => crate::pipeline::naming::with_collision_suffix(slug, &run_id),
            Err(e) => {
                warn!(slug, "alias unreadable, claiming suffixed slug: {}", e);
                crate::pipeline::naming::with_collision_suffix(slug, &run_id)
            }
        }
    }

    pub fn write_alias(&self, entry: &AliasEntry) -> Result<PathBuf, ArtifactStoreError> {
        let path = self.alias_path(&entry.run_slug);
        write_json_atomic(&path, entry)?;
        Ok(path)
    }

    /// Alias entries, newest first.
    pub fn list_aliases(&self) -> Result<Vec<AliasEntry>, ArtifactStoreError> {
        let dir = self.index_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ArtifactStoreError::io(&dir)(e)),
        };
        let mut aliases = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<AliasEntry>(&path) {
                Ok(Some(alias)) => aliases.push(alias),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), "skipping unreadable alias: {}", e),
            }
        }
        aliases.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(aliases)
    }

    pub fn resolve_slug(&self, slug: &str) -> Result<Uuid, ArtifactStoreError> {
        self.read_alias(slug)?
            .map(|alias| alias.run_id)
            .ok_or_else(|| ArtifactStoreError::NotFound(format!("run slug {}", slug)))
    }

    // -------------------------------------------------------------------------
    // log
    // -------------------------------------------------------------------------

    pub fn append_log(&self, run_id: Uuid, level: &str, message: &str) -> Result<(), ArtifactStoreError> {
        let line = format!("{} {:<5} {}", Utc::now().to_rfc3339(), level, message);
        append_line(&self.log_path(run_id), &line)
    }

    pub fn append_progress(&self, run_id: Uuid, event: &ProgressEvent) -> Result<(), ArtifactStoreError> {
        append_line(&self.log_path(run_id), &event.to_log_line()?)
    }

    /// Last `n` lines of the run log.
    pub fn tail_log(&self, run_id: Uuid, n: usize) -> Result<Vec<String>, ArtifactStoreError> {
        let path = self.log_path(run_id);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ArtifactStoreError::io(&path)(e)),
        };
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(n);
        Ok(lines[start..].iter().map(|l| l.to_string()).collect())
    }
}

// =============================================================================
// FILE HELPERS
// =============================================================================

/// Write via a temp file and rename so readers never see a torn file.
fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), ArtifactStoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(ArtifactStoreError::io(parent))?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &bytes).map_err(ArtifactStoreError::io(&tmp))?;
    fs::rename(&tmp, path).map_err(ArtifactStoreError::io(path))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ArtifactStoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ArtifactStoreError::io(path)(e)),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

fn append_line(path: &Path, line: &str) -> Result<(), ArtifactStoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(ArtifactStoreError::io(parent))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(ArtifactStoreError::io(path))?;
    writeln!(file, "{}", line).map_err(ArtifactStoreError::io(path))
}
