//! Progress events.
//!
//! Long-running stages append single-line, sentinel-prefixed JSON objects to
//! the run log. Observers scan the log for the sentinel and keep the latest
//! event per stage; nothing else in the log needs to be parsed.
//!
//! ```text
//! PROGRESS_JSON: {"run_id":"..","stage":"ingest","event":"symbol_done","current":3,"total":10,"symbol":"AAPL"}
//! ```

use crate::pipeline::stage::Stage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const PROGRESS_SENTINEL: &str = "PROGRESS_JSON: ";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub run_id: String,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_exec_id: Option<String>,
    pub event: String,
    pub current: u64,
    pub total: u64,
    /// Free-form fields (`symbol`, `asof`, `rows`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProgressEvent {
    pub fn new(run_id: Uuid, stage: Stage, event: &str, current: usize, total: usize) -> Self {
        Self {
            run_id: run_id.to_string(),
            stage: stage.as_str().to_string(),
            stage_exec_id: None,
            event: event.to_string(),
            current: current as u64,
            total: total as u64,
            extra: Map::new(),
        }
    }

    pub fn with_exec_id(mut self, exec_id: &str) -> Self {
        self.stage_exec_id = Some(exec_id.to_string());
        self
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    /// Completed fraction in [0, 1]; `None` when the total is unknown.
    pub fn fraction(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some((self.current as f64 / self.total as f64).clamp(0.0, 1.0))
    }

    pub fn to_log_line(&self) -> Result<String, serde_json::Error> {
        Ok(format!("{}{}", PROGRESS_SENTINEL, serde_json::to_string(self)?))
    }

    /// Parse one log line; lines without the sentinel or with bad JSON yield `None`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let idx = line.find(PROGRESS_SENTINEL)?;
        let payload = line[idx + PROGRESS_SENTINEL.len()..].trim();
        serde_json::from_str(payload).ok()
    }
}

/// Every progress event in `log_text`, in order.
pub fn parse_events(log_text: &str) -> Vec<ProgressEvent> {
    log_text.lines().filter_map(ProgressEvent::parse_line).collect()
}

/// Latest event per stage name.
pub fn latest_by_stage(events: &[ProgressEvent]) -> BTreeMap<String, ProgressEvent> {
    let mut latest = BTreeMap::new();
    for event in events {
        latest.insert(event.stage.clone(), event.clone());
    }
    latest
}
