//! Pipeline error taxonomy.
//!
//! Artifact I/O has no variant here: every artifact write during a run goes
//! through `try_persist` and never changes the outcome.

use crate::pipeline::backtest::BacktestError;
use crate::pipeline::stage::Stage;
use crate::pipeline::strategy::StrategyError;

/// Errors surfaced by the orchestrator.
#[derive(Debug)]
pub enum PipelineError {
    /// Malformed strategy input, invalid date range, or unknown stage name.
    /// Always raised before any stage executes.
    Validation(Vec<String>),
    /// A stage's underlying operation failed.
    Adapter { stage: Stage, message: String },
    /// Empty target set or price series reached the backtest engine.
    NoData(String),
    /// A panic escaped the stage loop.
    Crash(String),
}

impl PipelineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(vec![message.into()])
    }

    /// Classify an adapter failure. A `PipelineError` raised inside the
    /// adapter keeps its own class.
    pub fn adapter(stage: Stage, err: anyhow::Error) -> Self {
        match err.downcast::<PipelineError>() {
            Ok(inner) => inner,
            Err(err) => Self::Adapter {
                stage,
                message: format!("{:#}", err),
            },
        }
    }

    /// Text recorded as a failed stage's `error_text`.
    pub fn stage_error_text(&self) -> String {
        match self {
            Self::Adapter { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Process exit code for this error class.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) => 2,
            Self::Crash(_) => 3,
            Self::Adapter { .. } | Self::NoData(_) => 1,
        }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(errors) => write!(f, "Validation failed: {}", errors.join("; ")),
            Self::Adapter { stage, message } => write!(f, "Stage {} failed: {}", stage, message),
            Self::NoData(what) => write!(f, "No data: {}", what),
            Self::Crash(msg) => write!(f, "Pipeline crashed: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<StrategyError> for PipelineError {
    fn from(e: StrategyError) -> Self {
        match e {
            StrategyError::Invalid(errors) => Self::Validation(errors),
            other => Self::Validation(vec![other.to_string()]),
        }
    }
}

impl From<BacktestError> for PipelineError {
    fn from(e: BacktestError) -> Self {
        if e.is_no_data() {
            return Self::NoData(e.to_string());
        }
        Self::Adapter {
            stage: Stage::Backtest,
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::market_store::MarketStoreError;
    use chrono::NaiveDate;

    fn no_targets() -> BacktestError {
        BacktestError::NoTargets {
            strategy_id: "momo".to_string(),
            date_from: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            date_to: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
        }
    }

    #[test]
    fn test_missing_targets_are_no_data() {
        let err = PipelineError::from(no_targets());
        assert!(matches!(err, PipelineError::NoData(ref msg) if msg.contains("momo")));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_store_failure_is_backtest_adapter_error() {
        let store = MarketStoreError::BadDate("2024-13-01".to_string());
        let err = PipelineError::from(BacktestError::Store(store));
        match &err {
            PipelineError::Adapter { stage, message } => {
                assert_eq!(*stage, Stage::Backtest);
                assert!(message.contains("2024-13-01"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_adapter_wraps_plain_errors() {
        let err = PipelineError::adapter(
            Stage::Features,
            anyhow::anyhow!("disk full").context("writing features"),
        );
        assert!(matches!(err, PipelineError::Adapter { stage: Stage::Features, .. }));
        assert_eq!(err.stage_error_text(), "writing features: disk full");
        assert_eq!(err.to_string(), "Stage features failed: writing features: disk full");
    }

    #[test]
    fn test_adapter_keeps_inner_pipeline_error() {
        let err = PipelineError::adapter(Stage::Backtest, PipelineError::from(no_targets()).into());
        assert!(matches!(err, PipelineError::NoData(_)));
        assert!(err.stage_error_text().starts_with("No data: "));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(PipelineError::validation("bad").exit_code(), 2);
        assert_eq!(PipelineError::Crash("boom".into()).exit_code(), 3);
    }
}
