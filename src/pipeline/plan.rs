//! Dry-run plans.
//!
//! A plan is a side-effect-free projection of what a run would do. It is
//! computed best-effort: a strategy that fails to parse or validate becomes
//! a validation error inside the plan rather than an early return, so the
//! caller always gets a complete picture.

use crate::pipeline::naming::{make_run_name, name_from_hint};
use crate::pipeline::run::RunRequest;
use crate::pipeline::stage::Stage;
use crate::pipeline::strategy::{load_document, StrategyDefinition};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Prefix of the single stdout line carrying a serialized plan.
pub const PLAN_SENTINEL: &str = "PLAN_JSON: ";

/// Read-only lookups backing the advisory plan checks.
pub trait UniverseCatalog {
    /// Whether `symbol` is in the symbol registry.
    fn is_registered(&self, symbol: &str) -> anyhow::Result<bool>;
    /// Number of stored price rows for `symbol`.
    fn price_rows(&self, symbol: &str) -> anyhow::Result<u64>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validation {
    pub ok: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Validation {
    pub fn new() -> Self {
        Self {
            ok: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.ok = false;
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

impl Default for Validation {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolsSource {
    Override,
    Strategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub run_id: Uuid,
    pub run_slug: String,
    pub display_name: String,
    pub invoked_command: Option<String>,
    pub strategy_path: String,
    pub strategy_id: String,
    pub strategy_version: Option<String>,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub stages_requested: Vec<Stage>,
    pub stages_resolved: Vec<Stage>,
    pub symbols_override: Vec<String>,
    pub symbols_resolved: Vec<String>,
    pub symbols_source: SymbolsSource,
    pub dry_run: bool,
    pub fail_fast: bool,
    pub validation: Validation,
    pub artifacts_dir: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    /// `PLAN_JSON: {...}` with sorted keys on one line.
    pub fn sentinel_line(&self) -> Result<String, serde_json::Error> {
        // Value maps are ordered by key.
        let value = serde_json::to_value(self)?;
        Ok(format!("{}{}", PLAN_SENTINEL, serde_json::to_string(&value)?))
    }

    pub fn parse_sentinel_line(line: &str) -> Option<Self> {
        let payload = line.trim().strip_prefix(PLAN_SENTINEL)?;
        serde_json::from_str(payload).ok()
    }

    pub fn exit_code(&self) -> i32 {
        if self.validation.ok {
            0
        } else {
            1
        }
    }
}

/// Build a plan for `request`. Never fails; problems land in `validation`.
pub fn build_plan(request: &RunRequest, catalog: &dyn UniverseCatalog, runs_dir: &Path) -> Plan {
    let mut validation = Validation::new();

    let (run_id, slug_hint) = request.resolve_identity();
    let stages_resolved = request.resolved_stages();

    let document = match load_document(&request.strategy_path) {
        Ok(doc) => Some(doc),
        Err(e) => {
            validation.error(e.to_string());
            None
        }
    };
    let strategy = document
        .as_ref()
        .and_then(|doc| match StrategyDefinition::from_document(doc) {
            Ok(strategy) => Some(strategy),
            Err(e) => {
                validation.error(e.to_string());
                None
            }
        });

    let strategy_id = strategy
        .as_ref()
        .map(|s| s.strategy_id.clone())
        .or_else(|| raw_text(document.as_ref(), "strategy_id"))
        .unwrap_or_else(|| "unknown".to_string());
    let strategy_version = strategy
        .as_ref()
        .map(|s| s.version.clone())
        .or_else(|| raw_text(document.as_ref(), "version"));

    let (symbols_resolved, symbols_source) = if !request.symbols.is_empty() {
        (request.symbols.clone(), SymbolsSource::Override)
    } else {
        let symbols = match strategy.as_ref().map(|s| s.universe_symbols()) {
            Some(Ok(symbols)) => symbols,
            Some(Err(e)) => {
                validation.error(e.to_string());
                Vec::new()
            }
            None => Vec::new(),
        };
        (symbols, SymbolsSource::Strategy)
    };

    check_registry(catalog, &symbols_resolved, &mut validation);
    check_price_coverage(catalog, &symbols_resolved, &mut validation);

    let name = slug_hint
        .as_deref()
        .and_then(|hint| {
            name_from_hint(
                hint,
                &strategy_id,
                request.date_from,
                request.date_to,
                &stages_resolved,
                &symbols_resolved,
            )
        })
        .unwrap_or_else(|| {
            make_run_name(
                &strategy_id,
                request.date_from,
                request.date_to,
                &request.stages,
                &symbols_resolved,
            )
        });

    Plan {
        run_id,
        run_slug: name.slug,
        display_name: name.display_name,
        invoked_command: request.invoked_command.clone(),
        strategy_path: request.strategy_path.display().to_string(),
        strategy_id,
        strategy_version,
        date_from: request.date_from,
        date_to: request.date_to,
        stages_requested: request.stages.clone(),
        stages_resolved,
        symbols_override: request.symbols.clone(),
        symbols_resolved,
        symbols_source,
        dry_run: true,
        fail_fast: request.fail_fast,
        validation,
        artifacts_dir: runs_dir.join(run_id.to_string()),
        created_at: Utc::now(),
    }
}

fn check_registry(catalog: &dyn UniverseCatalog, symbols: &[String], validation: &mut Validation) {
    for sym in symbols {
        match catalog.is_registered(sym) {
            Ok(true) => {}
            Ok(false) => validation.warn(format!("{} not registered", sym)),
            Err(e) => {
                validation.warn(format!("Symbol registry check skipped: {:#}", e));
                return;
            }
        }
    }
}

fn check_price_coverage(catalog: &dyn UniverseCatalog, symbols: &[String], validation: &mut Validation) {
    for sym in symbols {
        match catalog.price_rows(sym) {
            Ok(0) => validation.warn(format!("OHLCV coverage missing: {}", sym)),
            Ok(_) => {}
            Err(e) => {
                validation.warn(format!("OHLCV coverage check skipped: {:#}", e));
                return;
            }
        }
    }
}

fn raw_text(doc: Option<&Value>, key: &str) -> Option<String> {
    match doc?.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
