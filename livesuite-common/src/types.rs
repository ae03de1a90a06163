//! Persisted data model for one harness run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named boolean check with a free-form diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assertion {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl Assertion {
    pub fn new(name: impl Into<String>, passed: bool, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed,
            detail: detail.into(),
        }
    }
}

/// One outgoing attempt as it was sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLog {
    pub seq: u32,
    pub attempt: u32,
    pub trace_id: String,
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    pub timestamp: String,
}

/// The outcome of one attempt. `status_code == 0` means no status was
/// obtained and `network_error` says why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseLog {
    pub seq: u32,
    pub attempt: u32,
    pub trace_id: String,
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub body_text: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_error: Option<String>,
    #[serde(default)]
    pub truncated: bool,
    pub received_at: String,
}

/// Verdict of a finished case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Passed,
    Failed,
}

impl CaseStatus {
    pub fn from_passed(passed: bool) -> Self {
        if passed { Self::Passed } else { Self::Failed }
    }
}

impl std::fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Result of one case as reported in the run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: String,
    pub passed: bool,
    pub duration_ms: u64,
    /// Sorted, distinct.
    pub trace_ids: Vec<String>,
    /// Sorted, distinct, never zero.
    pub status_codes: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub artifact_path: String,
    pub assertions: Vec<Assertion>,
}

impl CaseResult {
    pub fn status(&self) -> CaseStatus {
        CaseStatus::from_passed(self.passed)
    }
}

/// Aggregate pass/fail counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

impl RunStats {
    pub fn from_cases(cases: &[CaseResult]) -> Self {
        let passed = cases.iter().filter(|c| c.passed).count();
        Self {
            total: cases.len(),
            passed,
            failed: cases.len() - passed,
        }
    }
}

/// Where and how the run executed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEnvironment {
    pub os: String,
    pub arch: String,
    pub base_url: String,
    pub config_source: String,
    pub config_isolated: String,
    pub server_log: String,
    pub preflight_log: String,
    pub retries: u32,
    pub timeout_seconds: u64,
}

/// The aggregate document written to `summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub stats: RunStats,
    pub environment: RunEnvironment,
    pub cases: Vec<CaseResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl RunSummary {
    pub fn failed_cases(&self) -> impl Iterator<Item = &CaseResult> {
        self.cases.iter().filter(|c| !c.passed)
    }
}
