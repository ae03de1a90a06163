//! Per-case artifact files.
//!
//! Layout under `<run>/cases/<case>/`:
//! `request.json`, `response.headers`, `response.body`, `stream.raw`,
//! `assertions.json` and `meta.json`. JSON is pretty-printed; request
//! and response records are ordered by (seq, attempt).

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use livesuite_common::{CaseResult, CaseStatus, sanitize_id};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::engine::CaseRecord;

pub const CASES_DIR: &str = "cases";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to write {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("failed to encode {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Serialize)]
struct ResponseHeadersEntry<'a> {
    seq: u32,
    attempt: u32,
    trace_id: &'a str,
    status_code: u16,
    headers: &'a BTreeMap<String, Vec<String>>,
}

#[derive(Serialize)]
struct ResponseBodyEntry<'a> {
    seq: u32,
    attempt: u32,
    trace_id: &'a str,
    status_code: u16,
    body_text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    network_error: Option<&'a str>,
    duration_ms: u64,
    truncated: bool,
}

#[derive(Serialize)]
struct CaseMeta<'a> {
    case_id: &'a str,
    trace_id: String,
    attempt: usize,
    duration_ms: u64,
    status: CaseStatus,
    status_codes: &'a [u16],
    assertions: usize,
    artifact_path: &'a str,
}

/// Directory holding one case's artifacts.
pub fn case_dir(run_dir: &Path, case_id: &str) -> PathBuf {
    run_dir.join(CASES_DIR).join(sanitize_id(case_id))
}

/// Write `value` as two-space pretty JSON.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), ArtifactError> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|source| ArtifactError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    bytes.push(b'\n');
    write_bytes(path, &bytes)
}

fn write_bytes(path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    fs::write(path, bytes).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Persist everything `record` holds, plus the verdict in `result`.
pub fn write_case_artifacts(
    dir: &Path,
    record: &CaseRecord,
    result: &CaseResult,
) -> Result<(), ArtifactError> {
    fs::create_dir_all(dir).map_err(|source| ArtifactError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    write_json(&dir.join("request.json"), &record.requests)?;

    let headers: Vec<ResponseHeadersEntry<'_>> = record
        .responses
        .iter()
        .map(|r| ResponseHeadersEntry {
            seq: r.seq,
            attempt: r.attempt,
            trace_id: &r.trace_id,
            status_code: r.status_code,
            headers: &r.headers,
        })
        .collect();
    write_json(&dir.join("response.headers"), &headers)?;

    let bodies: Vec<ResponseBodyEntry<'_>> = record
        .responses
        .iter()
        .map(|r| ResponseBodyEntry {
            seq: r.seq,
            attempt: r.attempt,
            trace_id: &r.trace_id,
            status_code: r.status_code,
            body_text: &r.body_text,
            network_error: r.network_error.as_deref(),
            duration_ms: r.duration_ms,
            truncated: r.truncated,
        })
        .collect();
    write_json(&dir.join("response.body"), &bodies)?;

    write_bytes(&dir.join("stream.raw"), &record.stream_raw)?;
    write_json(&dir.join("assertions.json"), &result.assertions)?;

    let meta = CaseMeta {
        case_id: &result.case_id,
        trace_id: result.trace_ids.join(","),
        attempt: record.responses.len(),
        duration_ms: result.duration_ms,
        status: result.status(),
        status_codes: &result.status_codes,
        assertions: result.assertions.len(),
        artifact_path: &result.artifact_path,
    };
    write_json(&dir.join("meta.json"), &meta)?;

    debug!(case_id = %result.case_id, dir = %dir.display(), "Wrote case artifacts");
    Ok(())
}
