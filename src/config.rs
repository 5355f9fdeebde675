//! Environment-driven settings.
//!
//! Settings are read once per process from the environment after `.env`
//! files have been loaded. Relative paths resolve against the working
//! directory, so the same `.env` works for the CLI and the worker.

use dotenv::dotenv;
use std::env;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// How much per-symbol detail stage adapters report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
}

impl Verbosity {
    fn from_env_value(raw: Option<&str>) -> Self {
        match raw.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "1" || v == "true" || v == "yes" => Verbosity::Verbose,
            Some(v) if v == "quiet" || v == "-1" => Verbosity::Quiet,
            _ => Verbosity::Normal,
        }
    }

    pub fn is_verbose(&self) -> bool {
        matches!(self, Verbosity::Verbose)
    }
}

/// Resolved process settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root for raw inputs (price bar files live under `prices/`).
    pub data_dir: PathBuf,
    /// Tabular store (prices, features, labels, targets, backtest results).
    pub market_db_path: PathBuf,
    /// Run ledger.
    pub meta_db_path: PathBuf,
    /// Artifact root; holds `runs/` and `index/`.
    pub artifacts_dir: PathBuf,
    /// Per-run directories.
    pub runs_dir: PathBuf,
    pub log_level: String,
    pub verbosity: Verbosity,
    /// Plan this process is acting on, if any.
    pub plan_run_id: Option<Uuid>,
}

impl Settings {
    /// Load `.env` candidates and read settings from the environment.
    pub fn from_env() -> Self {
        load_env();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Settings rooted under a single directory. Used by tests and tooling.
    pub fn rooted_at(root: &Path) -> Self {
        let data_dir = root.join("data");
        let artifacts_dir = root.join("artifacts");
        Self {
            market_db_path: data_dir.join("quant.db"),
            meta_db_path: data_dir.join("meta.db"),
            runs_dir: artifacts_dir.join("runs"),
            data_dir,
            artifacts_dir,
            log_level: "info".to_string(),
            verbosity: Verbosity::Normal,
            plan_run_id: None,
        }
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let data_dir = resolve_data_path(lookup("QUANT_DATA_DIR"), Path::new("./data"));
        let artifacts_dir =
            resolve_data_path(lookup("QUANT_ARTIFACTS_DIR"), Path::new("./artifacts"));
        let market_db_path =
            resolve_data_path(lookup("QUANT_MARKET_DB"), &data_dir.join("quant.db"));
        let meta_db_path = resolve_data_path(lookup("QUANT_META_DB"), &data_dir.join("meta.db"));
        let runs_dir = resolve_data_path(lookup("QUANT_RUNS_DIR"), &artifacts_dir.join("runs"));

        let log_level = lookup("QUANT_LOG_LEVEL")
            .filter(|v| !v.trim().is_empty())
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_else(|| "info".to_string());
        let verbosity = Verbosity::from_env_value(lookup("QUANT_VERBOSE").as_deref());
        let plan_run_id = lookup("QUANT_PLAN_RUN_ID").and_then(|v| Uuid::parse_str(v.trim()).ok());

        Self {
            data_dir,
            market_db_path,
            meta_db_path,
            artifacts_dir,
            runs_dir,
            log_level,
            verbosity,
            plan_run_id,
        }
    }

    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub fn default_log_directive(&self) -> String {
        format!(
            "quantlab_pipeline={lvl},quantlab={lvl},pipeline_worker={lvl}",
            lvl = self.log_level
        )
    }
}

/// Resolve a configured path; blank values fall back to `default`.
pub fn resolve_data_path(env_value: Option<String>, default: &Path) -> PathBuf {
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return absolutize(default);
    };
    absolutize(Path::new(raw.trim()))
}

fn absolutize(p: &Path) -> PathBuf {
    if p.is_absolute() {
        return p.to_path_buf();
    }
    match env::current_dir() {
        Ok(cwd) => cwd.join(p),
        Err(_) => p.to_path_buf(),
    }
}

/// Load `.env` from the working directory tree, then from the crate root.
pub fn load_env() {
    let _ = dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidates = [manifest_dir.join(".env")];
    for p in candidates {
        if p.exists() {
            let _ = dotenv::from_path(&p);
        }
    }
}
