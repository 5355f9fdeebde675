//! QuantLab pipeline CLI
//!
//! # Usage
//!
//! ```bash
//! quantlab run --strategy strategies/momo.yaml --from 2024-01-02 --to 2024-03-29
//! quantlab run --strategy strategies/momo.yaml --from 2024-01-02 --to 2024-03-29 \
//!   --symbols AAPL,MSFT --stages recommend,backtest --dry-run
//! quantlab resolve momo__2024-01-02_2024-03-29__all__aapl-msft
//! quantlab runs --limit 20
//! ```
//!
//! # Exit Codes
//!
//! - 0: Success (dry-run: plan validated)
//! - 1: One or more stages failed (dry-run: plan has errors)
//! - 2: Validation error before any stage ran
//! - 3: Crash, or the stores could not be opened

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use quantlab_pipeline::config::{Settings, Verbosity};
use quantlab_pipeline::pipeline::strategy::parse_symbol_override;
use quantlab_pipeline::pipeline::{ArtifactStore, PipelineError, PipelineOrchestrator, RunRequest, Stage};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_VALIDATION: u8 = 2;
const EXIT_RUNTIME: u8 = 3;

/// Research pipeline runner
#[derive(Parser, Debug)]
#[command(name = "quantlab")]
#[command(about = "Plan and run research pipelines: ingest, features, labels, recommend, backtest")]
struct Cli {
    /// Report per-symbol progress at info level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress per-symbol progress entirely
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Plan or execute a pipeline run
    Run {
        /// Strategy definition (YAML, JSON, or TOML)
        #[arg(long)]
        strategy: PathBuf,

        /// First date, inclusive (YYYY-MM-DD)
        #[arg(long)]
        from: NaiveDate,

        /// Last date, inclusive (YYYY-MM-DD)
        #[arg(long)]
        to: NaiveDate,

        /// Comma-separated symbols replacing the strategy universe
        #[arg(long)]
        symbols: Option<String>,

        /// Comma-separated stage subset (default: all)
        #[arg(long)]
        stages: Option<String>,

        /// Print and persist the plan without executing anything
        #[arg(long)]
        dry_run: bool,

        /// Keep running later stages after a failure
        #[arg(long)]
        no_fail_fast: bool,

        /// Run UUID, or a slug hint
        #[arg(long)]
        run_id: Option<String>,

        /// Plan this run executes
        #[arg(long, env = "QUANT_PLAN_RUN_ID")]
        plan_run_id: Option<uuid::Uuid>,
    },

    /// Print the run id behind a slug
    Resolve {
        slug: String,
    },

    /// List runs, newest first
    Runs {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut settings = Settings::from_env();
    if cli.verbose {
        settings.verbosity = Verbosity::Verbose;
    } else if cli.quiet {
        settings.verbosity = Verbosity::Quiet;
    }
    init_tracing(&settings);

    match cli.command {
        Commands::Run {
            strategy,
            from,
            to,
            symbols,
            stages,
            dry_run,
            no_fail_fast,
            run_id,
            plan_run_id,
        } => {
            let request = match build_request(
                strategy,
                from,
                to,
                symbols.as_deref(),
                stages.as_deref(),
                dry_run,
                !no_fail_fast,
                run_id,
                plan_run_id.or(settings.plan_run_id),
            ) {
                Ok(request) => request,
                Err(e) => {
                    error!("{}", e);
                    eprintln!("{}", e);
                    return ExitCode::from(EXIT_VALIDATION);
                }
            };

            let orchestrator = match PipelineOrchestrator::from_settings(&settings) {
                Ok(o) => o,
                Err(e) => {
                    error!("{:#}", e);
                    return ExitCode::from(EXIT_RUNTIME);
                }
            };
            let code = orchestrator.run(&request, &mut std::io::stdout().lock());
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
        Commands::Resolve { slug } => {
            let store = ArtifactStore::new(&settings.artifacts_dir, &settings.runs_dir);
            match store.resolve_slug(&slug) {
                Ok(run_id) => {
                    println!("{}", run_id);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{}", e);
                    ExitCode::from(1)
                }
            }
        }
        Commands::Runs { limit } => {
            let store = ArtifactStore::new(&settings.artifacts_dir, &settings.runs_dir);
            match store.list_runs() {
                Ok(runs) => {
                    for summary in runs.iter().take(limit) {
                        let run = &summary.run;
                        println!(
                            "{}  {:<7}  {}  {}",
                            run.run_id, run.status, run.started_at.format("%Y-%m-%d %H:%M:%S"), run.run_slug
                        );
                    }
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{}", e);
                    ExitCode::from(EXIT_RUNTIME)
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_request(
    strategy: PathBuf,
    from: NaiveDate,
    to: NaiveDate,
    symbols: Option<&str>,
    stages: Option<&str>,
    dry_run: bool,
    fail_fast: bool,
    run_id: Option<String>,
    plan_run_id: Option<uuid::Uuid>,
) -> Result<RunRequest, PipelineError> {
    let stages = match stages {
        Some(raw) => Stage::parse_list(raw)?,
        None => Vec::new(),
    };
    let mut request = RunRequest::new(strategy, from, to)?
        .with_symbols(symbols.map(parse_symbol_override).unwrap_or_default())
        .with_stages(&stages)
        .dry_run(dry_run)
        .fail_fast(fail_fast)
        .plan_run_id(plan_run_id)
        .invoked_command(std::env::args().collect::<Vec<_>>().join(" "));
    if let Some(id) = run_id {
        request = request.run_identifier(id);
    }
    Ok(request)
}

/// Logs go to stderr; stdout is reserved for the plan sentinel line.
fn init_tracing(settings: &Settings) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| settings.default_log_directive().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
