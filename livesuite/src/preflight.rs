//! Preflight: build and unit-test the subject before any live traffic.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use livesuite_common::ErrorCategory;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

use crate::options::CommandSpec;

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("failed to open preflight log {path}: {source}")]
    Log { path: PathBuf, source: io::Error },

    #[error("preflight failed at `{step}`: {source}")]
    Spawn { step: String, source: io::Error },

    #[error("preflight failed at `{step}`: {status}")]
    Failed { step: String, status: ExitStatus },
}

impl PreflightError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Infrastructure
    }
}

fn open_log(path: &Path) -> Result<File, PreflightError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| PreflightError::Log {
            path: path.to_path_buf(),
            source,
        })
}

fn clone_log(log: &File, path: &Path) -> Result<File, PreflightError> {
    log.try_clone().map_err(|source| PreflightError::Log {
        path: path.to_path_buf(),
        source,
    })
}

/// Run `steps` in order, appending each command line and its combined
/// output to `log_path`. Stops at the first step that cannot start or
/// exits non-zero.
pub async fn run_preflight(steps: &[CommandSpec], log_path: &Path) -> Result<(), PreflightError> {
    let mut log = open_log(log_path)?;

    for step in steps {
        let line = step.to_string();
        info!(step = %line, "Running preflight step");
        writeln!(log, "\n$ {line}").map_err(|source| PreflightError::Log {
            path: log_path.to_path_buf(),
            source,
        })?;

        let stdout = clone_log(&log, log_path)?;
        let stderr = clone_log(&log, log_path)?;

        let status = Command::new(&step.program)
            .args(&step.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|source| PreflightError::Spawn {
                step: line.clone(),
                source,
            })?;

        if !status.success() {
            warn!(step = %line, %status, "Preflight step failed");
            return Err(PreflightError::Failed { step: line, status });
        }
    }

    Ok(())
}
