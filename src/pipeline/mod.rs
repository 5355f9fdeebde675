//! Research Pipeline
//!
//! Batch orchestration of the quant research stages over a strategy and a
//! date window, with an auditable artifact trail.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     PipelineOrchestrator                        │
//! │  (plan | execute, naming, fail-fast, crash capture)             │
//! └─────────────────────────────────────────────────────────────────┘
//!        │                       │                       │
//!        ▼                       ▼                       ▼
//! ┌─────────────┐        ┌─────────────┐        ┌─────────────┐
//! │ArtifactStore│        │  RunLedger  │        │StageAdapters│
//! │ (run tree)  │        │  (SQLite)   │        │ (5 stages)  │
//! └─────────────┘        └─────────────┘        └──────┬──────┘
//!                                                      │
//!                  ┌───────────────────────────────────┼───────────┐
//!                  ▼                                   ▼           ▼
//!          ┌──────────────┐                   ┌──────────────┐ ┌──────────┐
//!          │ Recommender  │──▶ Portfolio  ──▶ │ MarketStore  │◀│ Backtest │
//!          │ (top-k)      │    Supervisor     │ (SQLite)     │ │ Engine   │
//!          └──────────────┘                   └──────────────┘ └──────────┘
//! ```
//!
//! # Guarantees
//!
//! - **Fixed order**: stages run `ingest, features, labels, recommend,
//!   backtest`, filtered to the requested subset, one at a time.
//! - **UUID identity**: slugs are aliases; collisions are suffixed with the
//!   run id's first 8 hex characters.
//! - **Artifacts first**: the run tree is the source of truth; artifact I/O
//!   never alters a run's status.

pub mod adapters;
pub mod artifact_store;
pub mod backtest;
pub mod equity_curve;
pub mod error;
pub mod factors;
pub mod market_store;
pub mod naming;
pub mod orchestrator;
pub mod plan;
pub mod progress;
pub mod recommender;
pub mod run;
pub mod run_ledger;
pub mod stage;
pub mod strategy;
pub mod supervision;
pub mod supervisor;

#[cfg(test)]
mod backtest_tests;
#[cfg(test)]
mod orchestrator_tests;

pub use adapters::{Collaborators, JsonPriceSource, PriceSource, StageAdapters};
pub use artifact_store::{try_persist, AliasEntry, ArtifactStore, ArtifactStoreError};
pub use backtest::{BacktestConfig, BacktestEngine, BacktestError, BacktestSummary, CostModel, LedgerEntry};
pub use error::PipelineError;
pub use market_store::{MarketStore, PriceBar};
pub use orchestrator::PipelineOrchestrator;
pub use plan::{Plan, Validation, PLAN_SENTINEL};
pub use progress::{ProgressEvent, PROGRESS_SENTINEL};
pub use recommender::ScoringFunction;
pub use run::{Run, RunRequest, RunStatus, StageResult, StageStatus};
pub use run_ledger::RunLedger;
pub use stage::{Stage, StageAdapter, StageContext, StageOutput};
pub use strategy::StrategyDefinition;
pub use supervision::{ProcessFiles, ProcessState};
pub use supervisor::{PortfolioSupervisor, SupervisorRules, Target};
