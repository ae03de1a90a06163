//! Failure taxonomy shared by every harness layer.

use serde::Serialize;

/// How far a failure is allowed to propagate.
///
/// Only [`ErrorCategory::Infrastructure`] may end a run early. Everything
/// else is contained within the case that observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Preflight, process start, readiness, config isolation, integrity.
    Infrastructure,
    /// Connection failure or timeout before a status was obtained.
    Network,
    /// Malformed stream frame, missing sentinel, unexpected status.
    Protocol,
    /// A recorded check that evaluated to false.
    Assertion,
}

impl ErrorCategory {
    /// Whether a failure in this category terminates the run.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Infrastructure)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Network => write!(f, "network"),
            Self::Protocol => write!(f, "protocol"),
            Self::Assertion => write!(f, "assertion"),
        }
    }
}
