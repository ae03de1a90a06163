//! Run-level reports and retention.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::SecondsFormat;
use livesuite_common::{CaseResult, RunSummary};
use thiserror::Error;
use tracing::info;

use crate::artifacts::{self, ArtifactError};

pub const SUMMARY_JSON: &str = "summary.json";
pub const SUMMARY_MD: &str = "summary.md";
pub const SERVER_LOG: &str = "server.log";
pub const PREFLIGHT_LOG: &str = "preflight.log";

#[derive(Debug, Error)]
pub enum PruneError {
    #[error("failed to list {path}: {source}")]
    List { path: PathBuf, source: io::Error },

    #[error("{}", .0.join("; "))]
    Remove(Vec<String>),
}

/// Write `summary.json` and `summary.md` into `run_dir`.
pub fn write_summary(run_dir: &Path, summary: &RunSummary) -> Result<(), ArtifactError> {
    artifacts::write_json(&run_dir.join(SUMMARY_JSON), summary)?;

    let md_path = run_dir.join(SUMMARY_MD);
    fs::write(&md_path, render_markdown(run_dir, summary)).map_err(|source| ArtifactError::Io {
        path: md_path.clone(),
        source,
    })?;
    info!(path = %md_path.display(), passed = summary.stats.passed, failed = summary.stats.failed, "Summary written");
    Ok(())
}

fn failure_reason(case: &CaseResult) -> String {
    if let Some(error) = &case.error {
        return error.clone();
    }
    let failed: Vec<&str> = case
        .assertions
        .iter()
        .filter(|a| !a.passed)
        .map(|a| a.name.as_str())
        .collect();
    format!("failed assertions: {}", failed.join(", "))
}

fn status_list(codes: &[u16]) -> String {
    let parts: Vec<String> = codes.iter().map(u16::to_string).collect();
    format!("[{}]", parts.join(" "))
}

/// Human-facing report. Failed cases come first with a log grep hint.
pub fn render_markdown(run_dir: &Path, s: &RunSummary) -> String {
    let server_log = run_dir.join(SERVER_LOG);
    let mut b = String::new();

    b.push_str("# DS2API Live Testsuite Summary\n\n");
    b.push_str("**Sensitive Notice:** this run stores full raw request/response logs. Do not share artifacts publicly.\n\n");
    let _ = writeln!(b, "- Run ID: `{}`", s.run_id);
    let _ = writeln!(b, "- Started: `{}`", s.started_at.to_rfc3339_opts(SecondsFormat::Nanos, true));
    let _ = writeln!(b, "- Ended: `{}`", s.ended_at.to_rfc3339_opts(SecondsFormat::Nanos, true));
    let _ = writeln!(b, "- Duration: `{} ms`", s.duration_ms);
    let _ = writeln!(b, "- Base URL: `{}`", s.environment.base_url);
    let _ = writeln!(b, "- Passed/Failed: `{}/{}`\n", s.stats.passed, s.stats.failed);

    if !s.warnings.is_empty() {
        b.push_str("## Warnings\n\n");
        for warning in &s.warnings {
            let _ = writeln!(b, "- {warning}");
        }
        b.push('\n');
    }

    b.push_str("## Failed Cases\n\n");
    let mut any_failed = false;
    for case in s.failed_cases() {
        any_failed = true;
        let _ = writeln!(b, "- `{}`: {}", case.case_id, failure_reason(case));
        if let Some(first) = case.trace_ids.first() {
            let _ = writeln!(b, "  - trace_ids: `{}`", case.trace_ids.join(", "));
            let _ = writeln!(b, "  - grep: `rg \"{}\" {}`", first, server_log.display());
        }
        let _ = writeln!(b, "  - artifact: `{}`", case.artifact_path);
    }
    if !any_failed {
        b.push_str("- none\n");
    }

    b.push_str("\n## Case Table\n\n");
    b.push_str("| case_id | status | duration_ms | statuses | artifact |\n");
    b.push_str("|---|---:|---:|---|---|\n");
    for case in &s.cases {
        let status = if case.passed { "PASS" } else { "FAIL" };
        let _ = writeln!(
            b,
            "| {} | {} | {} | {} | `{}` |",
            case.case_id,
            status,
            case.duration_ms,
            status_list(&case.status_codes),
            case.artifact_path
        );
    }
    b
}

/// Keep the `keep` lexicographically greatest run directories under
/// `output_dir` and remove the rest. `keep <= 0` disables pruning.
/// Returns the names removed.
pub fn prune_old_runs(output_dir: &Path, keep: i64) -> Result<Vec<String>, PruneError> {
    if keep <= 0 {
        return Ok(Vec::new());
    }
    let keep = usize::try_from(keep).unwrap_or(usize::MAX);

    let entries = fs::read_dir(output_dir).map_err(|source| PruneError::List {
        path: output_dir.to_path_buf(),
        source,
    })?;
    let mut runs: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    runs.sort();

    if runs.len() <= keep {
        return Ok(Vec::new());
    }

    let excess = runs.len() - keep;
    let mut removed = Vec::new();
    let mut errors = Vec::new();
    for name in runs.into_iter().take(excess) {
        match fs::remove_dir_all(output_dir.join(&name)) {
            Ok(()) => {
                info!(run = %name, "pruned old test run");
                removed.push(name);
            }
            Err(e) => errors.push(format!("remove {name}: {e}")),
        }
    }

    if errors.is_empty() {
        Ok(removed)
    } else {
        Err(PruneError::Remove(errors))
    }
}
