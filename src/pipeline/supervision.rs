//! Process supervision files.
//!
//! A detached pipeline process is tracked through three files next to its
//! run artifacts: an append-only log, a pid file written once at start, and
//! an exit-code file written exactly once at termination. Observers never
//! talk to the process; they only read these files.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const LOG_FILE: &str = "pipeline.log";
pub const PID_FILE: &str = "pipeline.pid";
pub const EXIT_CODE_FILE: &str = "pipeline.exit_code";

/// Supervision file locations for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessFiles {
    pub log: PathBuf,
    pub pid: PathBuf,
    pub exit_code: PathBuf,
}

impl ProcessFiles {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            log: dir.join(LOG_FILE),
            pid: dir.join(PID_FILE),
            exit_code: dir.join(EXIT_CODE_FILE),
        }
    }

    pub fn write_pid(&self, pid: u32) -> io::Result<()> {
        ensure_parent(&self.pid)?;
        fs::write(&self.pid, format!("{}\n", pid))
    }

    /// Fails with `AlreadyExists` if an exit code was already recorded.
    pub fn write_exit_code(&self, code: i32) -> io::Result<()> {
        ensure_parent(&self.exit_code)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.exit_code)?;
        writeln!(file, "{}", code)
    }

    pub fn read_pid(&self) -> Option<u32> {
        read_trimmed(&self.pid)?.parse().ok()
    }

    pub fn read_exit_code(&self) -> Option<i32> {
        read_trimmed(&self.exit_code)?.parse().ok()
    }

    /// Reconstruct the process state from the files alone.
    pub fn state(&self) -> ProcessState {
        if let Some(code) = self.read_exit_code() {
            return ProcessState::Exited(code);
        }
        match self.read_pid() {
            None => ProcessState::NotStarted,
            Some(pid) if is_process_alive(pid) => ProcessState::Running(pid),
            Some(pid) => ProcessState::Vanished(pid),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// No pid file yet.
    NotStarted,
    Running(u32),
    Exited(i32),
    /// Pid recorded, process gone, no exit code: killed or crashed hard.
    Vanished(u32),
}

impl ProcessState {
    pub fn is_finished(&self) -> bool {
        matches!(self, ProcessState::Exited(_) | ProcessState::Vanished(_))
    }
}

#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 performs permission and existence checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    false
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let files = ProcessFiles::in_dir(dir.path());
        assert_eq!(files.state(), ProcessState::NotStarted);

        files.write_pid(std::process::id()).unwrap();
        assert_eq!(files.state(), ProcessState::Running(std::process::id()));

        files.write_exit_code(0).unwrap();
        assert_eq!(files.state(), ProcessState::Exited(0));
        assert!(files.state().is_finished());
    }

    #[test]
    fn test_exit_code_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let files = ProcessFiles::in_dir(&dir.path().join("nested"));
        files.write_exit_code(1).unwrap();
        let err = files.write_exit_code(0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(files.read_exit_code(), Some(1));
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_pid_is_vanished() {
        let dir = tempfile::tempdir().unwrap();
        let files = ProcessFiles::in_dir(dir.path());
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        files.write_pid(pid).unwrap();
        assert_eq!(files.state(), ProcessState::Vanished(pid));
    }
}
