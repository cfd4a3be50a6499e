//! Execution capability: launch a command, wait for it, report exit status and
//! wall-clock time.
//!
//! The record layer only sees the [`Executor`] trait, so tests and callers can
//! substitute their own launcher. [`SubprocessExecutor`] is the real one; it
//! optionally appends one JSON line per launch to an event log.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Execution {
    pub exit_code: i32,
    pub elapsed_secs: f64,
}

/// Why a command could not be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchFailure {
    PermissionDenied,
    NotFound,
    NotExecutable,
    Other,
}

impl LaunchFailure {
    pub fn classify(err: &io::Error) -> Self {
        match (err.kind(), err.raw_os_error()) {
            // ENOEXEC: exec format error.
            (_, Some(8)) => LaunchFailure::NotExecutable,
            (ErrorKind::PermissionDenied, _) => LaunchFailure::PermissionDenied,
            (ErrorKind::NotFound, _) => LaunchFailure::NotFound,
            _ => LaunchFailure::Other,
        }
    }
}

#[derive(Debug, Error)]
#[error("Couldn't execute {command}: {source}")]
pub struct LaunchError {
    pub command: String,
    pub failure: LaunchFailure,
    #[source]
    pub source: io::Error,
}

pub trait Executor {
    fn execute(
        &self,
        cmd: &[String],
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<Execution, LaunchError>;
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ExecutionEvent {
    ts: String,
    command: Vec<String>,
    cwd: String,
    status: String,
    exit_code: Option<i32>,
    elapsed_secs: f64,
}

/// Runs commands as child processes that inherit stdio.
#[derive(Debug, Clone, Default)]
pub struct SubprocessExecutor {
    event_log: Option<PathBuf>,
}

impl SubprocessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a JSON line per launch to `path`.
    pub fn with_event_log(path: PathBuf) -> Self {
        Self {
            event_log: Some(path),
        }
    }

    fn log_event(&self, event: &ExecutionEvent) -> io::Result<()> {
        let Some(path) = &self.event_log else {
            return Ok(());
        };
        let mut f = OpenOptions::new().create(true).append(true).open(path)?;
        let line = serde_json::to_string(event).map_err(io::Error::other)?;
        writeln!(f, "{}", line)
    }
}

impl Executor for SubprocessExecutor {
    fn execute(
        &self,
        cmd: &[String],
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<Execution, LaunchError> {
        let command_text = cmd.join(" ");
        let Some((program, args)) = cmd.split_first() else {
            return Err(LaunchError {
                command: command_text,
                failure: LaunchFailure::NotFound,
                source: io::Error::new(ErrorKind::NotFound, "empty command"),
            });
        };
        info!("Executing {} in {}", command_text, cwd.display());
        // Relative paths such as `./a.out` name files in the working directory.
        let program_path = Path::new(program);
        let program = if program_path.is_relative() && program_path.components().count() > 1 {
            cwd.join(program_path)
        } else {
            program_path.to_path_buf()
        };
        let started = Instant::now();
        let status = Command::new(&program)
            .args(args)
            .current_dir(cwd)
            .envs(env)
            .status()
            .map_err(|source| LaunchError {
                command: command_text.clone(),
                failure: LaunchFailure::classify(&source),
                source,
            })?;
        let elapsed_secs = started.elapsed().as_secs_f64();
        let exit_code = exit_code_of(&status);
        debug!("{} exited with {} after {:.3}s", command_text, exit_code, elapsed_secs);

        let event = ExecutionEvent {
            ts: crate::core::time::now_rfc3339(),
            command: cmd.to_vec(),
            cwd: cwd.to_string_lossy().to_string(),
            status: if status.success() { "success" } else { "error" }.to_string(),
            exit_code: status.code(),
            elapsed_secs,
        };
        if let Err(err) = self.log_event(&event) {
            warn!("Cannot record execution event: {}", err);
        }

        Ok(Execution {
            exit_code,
            elapsed_secs,
        })
    }
}

/// Resolve `name` the way a shell would: paths with a separator are checked
/// directly, bare names are searched for on `PATH`.
pub fn which(name: &str) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    let candidate = Path::new(name);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|full| is_executable(full))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(unix)]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| -sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
