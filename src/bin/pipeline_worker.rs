//! Pipeline Worker
//!
//! Runs a command as a supervised child and maintains the three supervision
//! files observers poll: an append-only log, a pid file, and an exit-code
//! file written exactly once.
//!
//! Usage:
//!   pipeline_worker --run-dir ./artifacts/runs/<run_id> -- quantlab run --strategy s.yaml --from 2024-01-02 --to 2024-03-29
//!   pipeline_worker --run-dir ./tmp --log-file ./tmp/custom.log --cwd ./research -- ./run.sh
//!
//! The pid file carries the child's pid. If the child cannot be spawned the
//! exit-code file still gets written, with code 127. After a successful
//! spawn the exit-code file always carries the child's own exit code.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use quantlab_pipeline::config::Settings;
use quantlab_pipeline::pipeline::ProcessFiles;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, ExitCode, ExitStatus, Stdio};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_SPAWN_FAILED: i32 = 127;

/// Supervised launcher for detached pipeline runs
#[derive(Parser, Debug)]
#[command(name = "pipeline_worker")]
#[command(about = "Run a command with pid, exit-code, and log files for external supervision")]
struct Args {
    /// Directory holding the supervision files
    #[arg(long)]
    run_dir: PathBuf,

    /// Log file (default: <run-dir>/pipeline.log)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Pid file (default: <run-dir>/pipeline.pid)
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Exit-code file (default: <run-dir>/pipeline.exit_code)
    #[arg(long)]
    exit_code_file: Option<PathBuf>,

    /// Working directory for the child
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Command and arguments
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

impl Args {
    fn process_files(&self) -> ProcessFiles {
        let mut files = ProcessFiles::in_dir(&self.run_dir);
        if let Some(p) = &self.log_file {
            files.log = p.clone();
        }
        if let Some(p) = &self.pid_file {
            files.pid = p.clone();
        }
        if let Some(p) = &self.exit_code_file {
            files.exit_code = p.clone();
        }
        files
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let settings = Settings::from_env();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| settings.default_log_directive().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let files = args.process_files();
    let code = match supervise(&args, &files) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            append_line(&files, &format!("[worker] {:#}", e));
            EXIT_SPAWN_FAILED
        }
    };

    if let Err(e) = files.write_exit_code(code) {
        warn!("exit code not recorded at {}: {}", files.exit_code.display(), e);
    }
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn supervise(args: &Args, files: &ProcessFiles) -> Result<i32> {
    let Some((program, rest)) = args.command.split_first() else {
        bail!("no command given");
    };

    let mut log = open_log(files)?;
    writeln!(log, "=== {} pipeline_worker ===", Utc::now().to_rfc3339())?;
    writeln!(log, "cmd: {}", args.command.join(" "))?;
    if let Some(cwd) = &args.cwd {
        writeln!(log, "cwd: {}", cwd.display())?;
    }
    log.flush()?;

    let stdout = log.try_clone().context("duplicating log handle")?;
    let stderr = log.try_clone().context("duplicating log handle")?;

    let mut command = Command::new(program);
    command
        .args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    if let Some(cwd) = &args.cwd {
        command.current_dir(cwd);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("spawning {}", program))?;
    // Once spawned, the child is always waited on; supervision file writes
    // are best-effort from here so the recorded exit code is the child's.
    let pid = child.id();
    if let Err(e) = files.write_pid(pid) {
        warn!(pid, "pid file not written at {}: {}", files.pid.display(), e);
        let _ = writeln!(log, "[worker] pid file not written: {}", e);
    }
    info!(pid, "child started: {}", args.command.join(" "));

    let status = child.wait().context("waiting for child")?;
    let code = exit_code_of(status);
    if let Err(e) = writeln!(log, "=== {} exited with {} ===", Utc::now().to_rfc3339(), code) {
        warn!(pid, "log trailer not written: {}", e);
    }
    info!(pid, code, "child exited");
    Ok(code)
}

fn open_log(files: &ProcessFiles) -> Result<File> {
    if let Some(parent) = files.log.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&files.log)
        .with_context(|| format!("opening log {}", files.log.display()))
}

fn append_line(files: &ProcessFiles, line: &str) {
    if let Ok(mut log) = open_log(files) {
        let _ = writeln!(log, "{}", line);
    }
}

#[cfg(unix)]
fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

#[cfg(not(unix))]
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}
