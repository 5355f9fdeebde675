//! Run Ledger
//!
//! SQLite registry of run and stage executions. One row per execution,
//! moving `running -> success | fail`. The artifact tree remains the source
//! of truth; this table is a queryable secondary index.
//!
//! # Schema Design
//!
//! ```sql
//! CREATE TABLE runs (
//!     run_id TEXT PRIMARY KEY,
//!     kind TEXT NOT NULL,            -- "pipeline" or a stage name
//!     status TEXT NOT NULL,          -- running | success | fail
//!     started_at TEXT NOT NULL,
//!     ended_at TEXT,
//!     config_json TEXT NOT NULL,
//!     error_text TEXT,
//!     parent_run_id TEXT             -- pipeline run for stage executions
//! );
//! ```

use crate::pipeline::run::RunStatus;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Schema version for migrations.
/// Version history:
/// - v1: runs table
const SCHEMA_VERSION: u32 = 1;

#[derive(Debug)]
pub enum LedgerError {
    Io(std::io::Error),
    Sqlite(rusqlite::Error),
    Serialization(serde_json::Error),
    NotFound(String),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
            Self::Serialization(e) => write!(f, "Serialization error: {}", e),
            Self::NotFound(id) => write!(f, "Ledger entry not found: {}", id),
        }
    }
}

impl std::error::Error for LedgerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Sqlite(e) => Some(e),
            Self::Serialization(e) => Some(e),
            Self::NotFound(_) => None,
        }
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub run_id: String,
    pub kind: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub config: Value,
    pub error_text: Option<String>,
    pub parent_run_id: Option<String>,
}

pub struct RunLedger {
    conn: Arc<Mutex<Connection>>,
}

impl RunLedger {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let ledger = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        ledger.initialize_schema()?;
        Ok(ledger)
    }

    /// In-memory ledger (for testing).
    pub fn in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        let ledger = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        ledger.initialize_schema()?;
        Ok(ledger)
    }

    fn initialize_schema(&self) -> Result<(), LedgerError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
        "#,
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .optional()?;

        match current {
            None => {
                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS runs (
                        run_id TEXT PRIMARY KEY,
                        kind TEXT NOT NULL,
                        status TEXT NOT NULL,
                        started_at TEXT NOT NULL,
                        ended_at TEXT,
                        config_json TEXT NOT NULL,
                        error_text TEXT,
                        parent_run_id TEXT
                    );
                    CREATE INDEX IF NOT EXISTS idx_runs_parent ON runs(parent_run_id);
                    CREATE INDEX IF NOT EXISTS idx_runs_kind ON runs(kind, started_at DESC);
                "#,
                )?;
                conn.execute("INSERT INTO schema_version (version) VALUES (?)", [SCHEMA_VERSION])?;
                info!("Created run ledger schema v{}", SCHEMA_VERSION);
            }
            Some(v) if v == SCHEMA_VERSION => {
                debug!("Run ledger schema at v{}", SCHEMA_VERSION);
            }
            Some(v) => {
                warn!(
                    "Run ledger schema version mismatch: expected {}, got {}",
                    SCHEMA_VERSION, v
                );
            }
        }
        Ok(())
    }

    /// Insert a `running` row. A fresh UUID is used unless `run_id` is given.
    pub fn run_start(&self, kind: &str, config: &Value, run_id: Option<&str>) -> Result<String, LedgerError> {
        let run_id = run_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let parent = config
            .get("parent_run_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let config_json = serde_json::to_string(config)?;

        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT INTO runs (run_id, kind, status, started_at, config_json, parent_run_id)
               VALUES (?, ?, ?, ?, ?, ?)"#,
            params![
                run_id,
                kind,
                RunStatus::Running.to_string(),
                Utc::now().to_rfc3339(),
                config_json,
                parent,
            ],
        )?;
        debug!(run_id = %run_id, kind, "ledger run_start");
        Ok(run_id)
    }

    pub fn run_success(&self, run_id: &str) -> Result<(), LedgerError> {
        self.finish(run_id, RunStatus::Success, None)
    }

    pub fn run_fail(&self, run_id: &str, error_text: &str) -> Result<(), LedgerError> {
        self.finish(run_id, RunStatus::Fail, Some(error_text))
    }

    fn finish(&self, run_id: &str, status: RunStatus, error_text: Option<&str>) -> Result<(), LedgerError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE runs SET status = ?, ended_at = ?, error_text = ? WHERE run_id = ? AND status = 'running'",
            params![status.to_string(), Utc::now().to_rfc3339(), error_text, run_id],
        )?;
        if updated == 0 {
            let exists: Option<String> = conn
                .query_row("SELECT status FROM runs WHERE run_id = ?", [run_id], |row| row.get(0))
                .optional()?;
            return match exists {
                None => Err(LedgerError::NotFound(run_id.to_string())),
                Some(current) => {
                    warn!(run_id, current = %current, "ledger entry already finished; ignoring {}", status);
                    Ok(())
                }
            };
        }
        Ok(())
    }

    pub fn get(&self, run_id: &str) -> Result<Option<LedgerRecord>, LedgerError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                r#"SELECT run_id, kind, status, started_at, ended_at, config_json, error_text, parent_run_id
                   FROM runs WHERE run_id = ?"#,
                [run_id],
                raw_row,
            )
            .optional()?;
        row.map(into_record).transpose()
    }

    /// Stage executions registered under a pipeline run, oldest first.
    pub fn children(&self, parent_run_id: &str) -> Result<Vec<LedgerRecord>, LedgerError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"SELECT run_id, kind, status, started_at, ended_at, config_json, error_text, parent_run_id
               FROM runs WHERE parent_run_id = ? ORDER BY started_at ASC, rowid ASC"#,
        )?;
        let rows = stmt
            .query_map([parent_run_id], raw_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(into_record).collect()
    }
}

type RawRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
);

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn into_record(raw: RawRow) -> Result<LedgerRecord, LedgerError> {
    let (run_id, kind, status, started_at, ended_at, config_json, error_text, parent_run_id) = raw;
    let status: RunStatus = serde_json::from_value(Value::String(status))?;
    Ok(LedgerRecord {
        run_id,
        kind,
        status,
        started_at: parse_ts(&started_at),
        ended_at: ended_at.as_deref().map(parse_ts),
        config: serde_json::from_str(&config_json)?,
        error_text,
        parent_run_id,
    })
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_start_and_succeed() {
        let ledger = RunLedger::in_memory().unwrap();
        let id = ledger.run_start("pipeline", &json!({"strategy": "momo"}), None).unwrap();
        let rec = ledger.get(&id).unwrap().unwrap();
        assert_eq!(rec.status, RunStatus::Running);
        assert!(rec.ended_at.is_none());

        ledger.run_success(&id).unwrap();
        let rec = ledger.get(&id).unwrap().unwrap();
        assert_eq!(rec.status, RunStatus::Success);
        assert!(rec.ended_at.is_some());
        assert_eq!(rec.config["strategy"], "momo");
    }

    #[test]
    fn test_terminal_rows_are_not_resurrected() {
        let ledger = RunLedger::in_memory().unwrap();
        let id = ledger.run_start("ingest", &json!({}), Some("fixed-id")).unwrap();
        assert_eq!(id, "fixed-id");
        ledger.run_fail(&id, "boom").unwrap();
        ledger.run_success(&id).unwrap();

        let rec = ledger.get(&id).unwrap().unwrap();
        assert_eq!(rec.status, RunStatus::Fail);
        assert_eq!(rec.error_text.as_deref(), Some("boom"));
    }

    #[test]
    fn test_children_by_parent() {
        let ledger = RunLedger::in_memory().unwrap();
        let parent = ledger.run_start("pipeline", &json!({}), None).unwrap();
        ledger
            .run_start("ingest", &json!({"parent_run_id": parent}), None)
            .unwrap();
        ledger
            .run_start("features", &json!({"parent_run_id": parent}), None)
            .unwrap();
        ledger.run_start("ingest", &json!({}), None).unwrap();

        let kids = ledger.children(&parent).unwrap();
        let kinds: Vec<&str> = kids.iter().map(|r| r.kind.as_str()).collect();
        assert_eq!(kinds, vec!["ingest", "features"]);
    }

    #[test]
    fn test_unknown_run_is_not_found() {
        let ledger = RunLedger::in_memory().unwrap();
        assert!(matches!(ledger.run_success("nope"), Err(LedgerError::NotFound(_))));
        assert!(ledger.get("nope").unwrap().is_none());
    }

    #[test]
    fn test_file_backed_ledger_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta").join("meta.db");
        let id = {
            let ledger = RunLedger::open(&path).unwrap();
            ledger.run_start("pipeline", &json!({}), None).unwrap()
        };
        let reopened = RunLedger::open(&path).unwrap();
        assert!(reopened.get(&id).unwrap().is_some());
    }

    #[test]
    fn test_open_reports_unusable_parent() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("meta");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let result = RunLedger::open(blocker.join("meta.db"));
        assert!(matches!(result, Err(LedgerError::Io(_))));
    }
}
