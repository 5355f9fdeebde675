//! Market Store
//!
//! SQLite tabular store shared by the stage adapters: daily closes, derived
//! features and labels, audited targets, and backtest results.
//!
//! # Schema Design
//!
//! ```text
//! symbols           (symbol PK, registered_at)
//! ohlcv             (symbol, ts, close)                 PK(symbol, ts)
//! features_daily    (symbol, ts, name, version, value)  PK(symbol, ts, name, version)
//! labels_daily      (symbol, ts, name, version, value)  PK(symbol, ts, name, version)
//! targets           (strategy_id, asof, symbol, ...)    PK(strategy_id, asof, symbol)
//! backtest_summary  (run_id PK, strategy_id, ..., summary_json)
//! backtest_ledger   (run_id, date, symbol, weight, contribution, cost)
//! ```
//!
//! Dates are stored as ISO `YYYY-MM-DD` text so lexical order is date order.

use crate::pipeline::backtest::{BacktestSummary, DailyReturns, LedgerEntry};
use crate::pipeline::factors::FactorValue;
use crate::pipeline::plan::UniverseCatalog;
use crate::pipeline::supervisor::Target;
use chrono::{Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Schema version for migrations.
/// Version history:
/// - v1: prices, features, labels, targets, backtest results
const SCHEMA_VERSION: u32 = 1;

/// Calendar days loaded before the window so day one has a prior close.
pub const RETURNS_LOOKBACK_DAYS: i64 = 5;

const DATE_FMT: &str = "%Y-%m-%d";

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug)]
pub enum MarketStoreError {
    Io(std::io::Error),
    Sqlite(rusqlite::Error),
    Serialization(serde_json::Error),
    BadDate(String),
}

impl std::fmt::Display for MarketStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
            Self::Serialization(e) => write!(f, "Serialization error: {}", e),
            Self::BadDate(raw) => write!(f, "Invalid stored date: {}", raw),
        }
    }
}

impl std::error::Error for MarketStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Sqlite(e) => Some(e),
            Self::Serialization(e) => Some(e),
            Self::BadDate(_) => None,
        }
    }
}

impl From<std::io::Error> for MarketStoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<rusqlite::Error> for MarketStoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<serde_json::Error> for MarketStoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

pub type Result<T> = std::result::Result<T, MarketStoreError>;

/// One daily close.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub close: f64,
}

// =============================================================================
// STORE
// =============================================================================

pub struct MarketStore {
    conn: Arc<Mutex<Connection>>,
}

impl MarketStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// In-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
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
                    CREATE TABLE IF NOT EXISTS symbols (
                        symbol TEXT PRIMARY KEY,
                        registered_at TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS ohlcv (
                        symbol TEXT NOT NULL,
                        ts TEXT NOT NULL,
                        close REAL NOT NULL,
                        PRIMARY KEY (symbol, ts)
                    );

                    CREATE TABLE IF NOT EXISTS features_daily (
                        symbol TEXT NOT NULL,
                        ts TEXT NOT NULL,
                        name TEXT NOT NULL,
                        version TEXT NOT NULL,
                        value REAL NOT NULL,
                        PRIMARY KEY (symbol, ts, name, version)
                    );

                    CREATE TABLE IF NOT EXISTS labels_daily (
                        symbol TEXT NOT NULL,
                        ts TEXT NOT NULL,
                        name TEXT NOT NULL,
                        version TEXT NOT NULL,
                        value REAL NOT NULL,
                        PRIMARY KEY (symbol, ts, name, version)
                    );

                    CREATE TABLE IF NOT EXISTS targets (
                        strategy_id TEXT NOT NULL,
                        version TEXT NOT NULL,
                        asof TEXT NOT NULL,
                        symbol TEXT NOT NULL,
                        weight REAL NOT NULL,
                        score REAL NOT NULL,
                        approved INTEGER NOT NULL,
                        risk_flags TEXT NOT NULL,
                        PRIMARY KEY (strategy_id, asof, symbol)
                    );

                    CREATE TABLE IF NOT EXISTS backtest_summary (
                        run_id TEXT PRIMARY KEY,
                        strategy_id TEXT NOT NULL,
                        date_from TEXT NOT NULL,
                        date_to TEXT NOT NULL,
                        created_at TEXT NOT NULL,
                        summary_json TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS backtest_ledger (
                        run_id TEXT NOT NULL,
                        date TEXT NOT NULL,
                        symbol TEXT NOT NULL,
                        weight REAL NOT NULL,
                        contribution REAL NOT NULL,
                        cost REAL NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_ohlcv_ts ON ohlcv(ts);
                    CREATE INDEX IF NOT EXISTS idx_targets_window ON targets(strategy_id, asof);
                    CREATE INDEX IF NOT EXISTS idx_bt_ledger_run ON backtest_ledger(run_id, date);
                "#,
                )?;
                conn.execute("INSERT INTO schema_version (version) VALUES (?)", [SCHEMA_VERSION])?;
                info!("Created market store schema v{}", SCHEMA_VERSION);
            }
            Some(v) if v == SCHEMA_VERSION => {
                debug!("Market store schema at v{}", SCHEMA_VERSION);
            }
            Some(v) => {
                warn!(
                    "Market store schema version mismatch: expected {}, got {}",
                    SCHEMA_VERSION, v
                );
            }
        }
        Ok(())
    }

    // =========================================================================
    // SYMBOLS & PRICES
    // =========================================================================

    pub fn register_symbol(&self, symbol: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO symbols (symbol, registered_at) VALUES (?, ?)",
            params![symbol, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Upsert daily closes; returns the number of rows written.
    pub fn upsert_prices(&self, symbol: &str, bars: &[PriceBar]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO ohlcv (symbol, ts, close) VALUES (?, ?, ?)",
            )?;
            for bar in bars {
                stmt.execute(params![symbol, fmt_date(bar.date), bar.close])?;
            }
        }
        tx.commit()?;
        Ok(bars.len())
    }

    /// Every stored close for `symbol`, oldest first.
    pub fn load_closes(&self, symbol: &str) -> Result<Vec<PriceBar>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT ts, close FROM ohlcv WHERE symbol = ? ORDER BY ts ASC")?;
        let rows = stmt
            .query_map([symbol], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(ts, close)| Ok(PriceBar { date: parse_date(&ts)?, close }))
            .collect()
    }

    /// Distinct dates with a close for any of `symbols` inside `[from, to]`.
    pub fn trading_dates(&self, symbols: &[String], from: NaiveDate, to: NaiveDate) -> Result<Vec<NaiveDate>> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT DISTINCT ts FROM ohlcv WHERE ts >= ? AND ts <= ? AND symbol IN ({}) ORDER BY ts ASC",
            placeholders(symbols.len())
        );
        let mut args = vec![fmt_date(from), fmt_date(to)];
        args.extend(symbols.iter().cloned());
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.iter().map(|ts| parse_date(ts)).collect()
    }

    /// Close-to-close returns over `[from - lookback, to + 1 day)`, forward
    /// filled per symbol. A symbol's first observation, and any date before
    /// it, has return 0.
    pub fn load_returns(&self, symbols: &[String], from: NaiveDate, to: NaiveDate) -> Result<DailyReturns> {
        let mut returns = DailyReturns::new();
        if symbols.is_empty() {
            return Ok(returns);
        }
        let start = from - Duration::days(RETURNS_LOOKBACK_DAYS);
        let end = to + Duration::days(1);

        let rows = {
            let conn = self.conn.lock();
            let sql = format!(
                "SELECT symbol, ts, close FROM ohlcv WHERE ts >= ? AND ts < ? AND symbol IN ({}) ORDER BY ts ASC",
                placeholders(symbols.len())
            );
            let mut args = vec![fmt_date(start), fmt_date(end)];
            args.extend(symbols.iter().cloned());
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(args.iter()), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, f64>(2)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let mut closes: BTreeMap<NaiveDate, BTreeMap<String, f64>> = BTreeMap::new();
        let mut present: BTreeSet<String> = BTreeSet::new();
        for (symbol, ts, close) in rows {
            closes.entry(parse_date(&ts)?).or_default().insert(symbol.clone(), close);
            present.insert(symbol);
        }

        let mut last_close: BTreeMap<&str, f64> = BTreeMap::new();
        for (date, day) in &closes {
            let row = returns.entry(*date).or_default();
            for symbol in &present {
                let ret = match (day.get(symbol), last_close.get(symbol.as_str())) {
                    (Some(&close), Some(&prev)) if prev != 0.0 => close / prev - 1.0,
                    _ => 0.0,
                };
                if let Some(&close) = day.get(symbol) {
                    last_close.insert(symbol.as_str(), close);
                }
                row.insert(symbol.clone(), ret);
            }
        }
        Ok(returns)
    }

    // =========================================================================
    // FEATURES & LABELS
    // =========================================================================

    pub fn upsert_features(&self, symbol: &str, version: &str, values: &[FactorValue]) -> Result<usize> {
        self.upsert_factor_table("features_daily", symbol, version, values)
    }

    pub fn upsert_labels(&self, symbol: &str, version: &str, values: &[FactorValue]) -> Result<usize> {
        self.upsert_factor_table("labels_daily", symbol, version, values)
    }

    fn upsert_factor_table(&self, table: &str, symbol: &str, version: &str, values: &[FactorValue]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let sql = format!(
                "INSERT OR REPLACE INTO {} (symbol, ts, name, version, value) VALUES (?, ?, ?, ?, ?)",
                table
            );
            let mut stmt = tx.prepare(&sql)?;
            for v in values {
                stmt.execute(params![symbol, fmt_date(v.date), v.name, version, v.value])?;
            }
        }
        tx.commit()?;
        Ok(values.len())
    }

    pub fn load_feature(&self, symbol: &str, name: &str, version: &str, date: NaiveDate) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM features_daily WHERE symbol = ? AND ts = ? AND name = ? AND version = ?",
                params![symbol, fmt_date(date), name, version],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn load_label(&self, symbol: &str, name: &str, version: &str, date: NaiveDate) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM labels_daily WHERE symbol = ? AND ts = ? AND name = ? AND version = ?",
                params![symbol, fmt_date(date), name, version],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    // =========================================================================
    // TARGETS
    // =========================================================================

    /// Replace the stored batch for every (strategy, as-of) present in
    /// `targets`, atomically.
    pub fn save_targets(&self, targets: &[Target]) -> Result<usize> {
        let keys: BTreeSet<(String, NaiveDate)> = targets
            .iter()
            .map(|t| (t.strategy_id.clone(), t.as_of))
            .collect();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for (strategy_id, as_of) in &keys {
            tx.execute(
                "DELETE FROM targets WHERE strategy_id = ? AND asof = ?",
                params![strategy_id, fmt_date(*as_of)],
            )?;
        }
        {
            let mut stmt = tx.prepare(
                r#"INSERT INTO targets (strategy_id, version, asof, symbol, weight, score, approved, risk_flags)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
            )?;
            for t in targets {
                stmt.execute(params![
                    t.strategy_id,
                    t.version,
                    fmt_date(t.as_of),
                    t.symbol,
                    t.weight,
                    t.score,
                    t.approved,
                    serde_json::to_string(&t.risk_flags)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(targets.len())
    }

    /// Stored batch for one (strategy, as-of), approved or not.
    pub fn load_targets(&self, strategy_id: &str, as_of: NaiveDate) -> Result<Vec<Target>> {
        self.query_targets(
            r#"SELECT strategy_id, version, asof, symbol, weight, score, approved, risk_flags
               FROM targets WHERE strategy_id = ? AND asof = ? ORDER BY symbol ASC"#,
            &[strategy_id.to_string(), fmt_date(as_of)],
        )
    }

    /// Approved targets for `strategy_id` with as-of inside `[from, to]`.
    pub fn load_approved_targets(&self, strategy_id: &str, from: NaiveDate, to: NaiveDate) -> Result<Vec<Target>> {
        self.query_targets(
            r#"SELECT strategy_id, version, asof, symbol, weight, score, approved, risk_flags
               FROM targets
               WHERE strategy_id = ? AND asof >= ? AND asof <= ? AND approved = 1
               ORDER BY asof ASC, symbol ASC"#,
            &[strategy_id.to_string(), fmt_date(from), fmt_date(to)],
        )
    }

    fn query_targets(&self, sql: &str, args: &[String]) -> Result<Vec<Target>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, bool>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(strategy_id, version, asof, symbol, weight, score, approved, flags)| {
                Ok(Target {
                    strategy_id,
                    version,
                    as_of: parse_date(&asof)?,
                    symbol,
                    weight,
                    score,
                    approved,
                    risk_flags: serde_json::from_str(&flags)?,
                })
            })
            .collect()
    }

    // =========================================================================
    // BACKTEST RESULTS
    // =========================================================================

    pub fn save_backtest(
        &self,
        run_id: &str,
        strategy_id: &str,
        summary: &BacktestSummary,
        ledger: &[LedgerEntry],
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            r#"INSERT OR REPLACE INTO backtest_summary
               (run_id, strategy_id, date_from, date_to, created_at, summary_json)
               VALUES (?, ?, ?, ?, ?, ?)"#,
            params![
                run_id,
                strategy_id,
                fmt_date(summary.date_from),
                fmt_date(summary.date_to),
                Utc::now().to_rfc3339(),
                serde_json::to_string(summary)?,
            ],
        )?;
        tx.execute("DELETE FROM backtest_ledger WHERE run_id = ?", [run_id])?;
        {
            let mut stmt = tx.prepare(
                r#"INSERT INTO backtest_ledger (run_id, date, symbol, weight, contribution, cost)
                   VALUES (?, ?, ?, ?, ?, ?)"#,
            )?;
            for e in ledger {
                stmt.execute(params![
                    run_id,
                    fmt_date(e.date),
                    e.symbol,
                    e.weight,
                    e.contribution,
                    e.cost
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_backtest_summary(&self, run_id: &str) -> Result<Option<BacktestSummary>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT summary_json FROM backtest_summary WHERE run_id = ?",
                [run_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).map_err(MarketStoreError::from))
            .transpose()
    }

    pub fn backtest_ledger_rows(&self, run_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM backtest_ledger WHERE run_id = ?",
            [run_id],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as u64)
    }
}

impl UniverseCatalog for MarketStore {
    fn is_registered(&self, symbol: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock();
        let found: Option<String> = conn
            .query_row("SELECT symbol FROM symbols WHERE symbol = ?", [symbol], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    fn price_rows(&self, symbol: &str) -> anyhow::Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM ohlcv WHERE symbol = ?", [symbol], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }
}

fn fmt_date(date: NaiveDate) -> String {
    date.format(DATE_FMT).to_string()
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FMT).map_err(|_| MarketStoreError::BadDate(raw.to_string()))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn bars(closes: &[(u32, f64)]) -> Vec<PriceBar> {
        closes
            .iter()
            .map(|&(day, close)| PriceBar { date: d(day), close })
            .collect()
    }

    #[test]
    fn test_open_reports_unusable_parent() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("market");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let result = MarketStore::open(blocker.join("market.db"));
        assert!(matches!(result, Err(MarketStoreError::Io(_))));
    }

    #[test]
    fn test_catalog_lookups() {
        let store = MarketStore::in_memory().unwrap();
        assert!(!store.is_registered("AAPL").unwrap());
        store.register_symbol("AAPL").unwrap();
        store.register_symbol("AAPL").unwrap();
        assert!(store.is_registered("AAPL").unwrap());

        store.upsert_prices("AAPL", &bars(&[(2, 100.0), (3, 101.0)])).unwrap();
        store.upsert_prices("AAPL", &bars(&[(3, 102.0)])).unwrap();
        assert_eq!(store.price_rows("AAPL").unwrap(), 2);
        assert_eq!(store.load_closes("AAPL").unwrap()[1].close, 102.0);
    }

    #[test]
    fn test_returns_forward_fill() {
        let store = MarketStore::in_memory().unwrap();
        store
            .upsert_prices("AAA", &bars(&[(2, 100.0), (3, 110.0), (5, 121.0)]))
            .unwrap();
        store.upsert_prices("BBB", &bars(&[(3, 50.0), (4, 55.0)])).unwrap();

        let symbols = vec!["AAA".to_string(), "BBB".to_string()];
        let returns = store.load_returns(&symbols, d(3), d(5)).unwrap();
        let dates: Vec<NaiveDate> = returns.keys().copied().collect();
        assert_eq!(dates, vec![d(2), d(3), d(4), d(5)]);

        assert_eq!(returns[&d(2)]["AAA"], 0.0);
        assert_eq!(returns[&d(2)]["BBB"], 0.0);
        assert!((returns[&d(3)]["AAA"] - 0.10).abs() < 1e-12);
        assert_eq!(returns[&d(3)]["BBB"], 0.0);
        // AAA has no close on day 4: carried forward.
        assert_eq!(returns[&d(4)]["AAA"], 0.0);
        assert!((returns[&d(4)]["BBB"] - 0.10).abs() < 1e-12);
        assert!((returns[&d(5)]["AAA"] - 0.10).abs() < 1e-12);
        assert_eq!(returns[&d(5)]["BBB"], 0.0);
    }

    #[test]
    fn test_save_targets_replaces_batch() {
        let store = MarketStore::in_memory().unwrap();
        let mut a = Target::proposed("s1", "1", d(5), "AAPL", 0.5, 0.9);
        a.approved = true;
        let mut b = Target::proposed("s1", "1", d(5), "MSFT", 0.5, 0.1);
        b.risk_flags.push("R5:ScoreTooLow(0.10<0.20)".to_string());
        store.save_targets(&[a.clone(), b]).unwrap();
        assert_eq!(store.load_targets("s1", d(5)).unwrap().len(), 2);

        store.save_targets(&[a.clone()]).unwrap();
        let stored = store.load_targets("s1", d(5)).unwrap();
        assert_eq!(stored, vec![a]);
    }

    #[test]
    fn test_load_approved_targets_window() {
        let store = MarketStore::in_memory().unwrap();
        let mut rows = Vec::new();
        for day in [2, 3, 9] {
            let mut t = Target::proposed("s1", "1", d(day), "AAPL", 1.0, 1.0);
            t.approved = true;
            rows.push(t);
        }
        rows.push(Target::proposed("s1", "1", d(3), "MSFT", 0.5, 0.5));
        store.save_targets(&rows).unwrap();

        let approved = store.load_approved_targets("s1", d(2), d(5)).unwrap();
        assert_eq!(approved.len(), 2);
        assert!(approved.iter().all(|t| t.approved && t.symbol == "AAPL"));
        assert!(store.load_approved_targets("other", d(1), d(31)).unwrap().is_empty());
    }

    #[test]
    fn test_features_by_key() {
        let store = MarketStore::in_memory().unwrap();
        let values = vec![FactorValue {
            date: d(4),
            name: "ret_5d".to_string(),
            value: 0.03,
        }];
        store.upsert_features("AAPL", "v1", &values).unwrap();
        assert_eq!(store.load_feature("AAPL", "ret_5d", "v1", d(4)).unwrap(), Some(0.03));
        assert_eq!(store.load_feature("AAPL", "ret_5d", "v2", d(4)).unwrap(), None);
        assert_eq!(store.load_label("AAPL", "ret_5d", "v1", d(4)).unwrap(), None);
    }
}
