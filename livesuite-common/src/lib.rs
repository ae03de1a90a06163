//! Shared building blocks for the livesuite gateway harness.
//!
//! Everything here is free of process and network ownership: the
//! event-stream decoder, the retry policy, trace identifiers, the
//! persisted data model, environment parsing, and logging setup.

pub mod config;
pub mod errors;
pub mod logging;
pub mod retry;
pub mod sse;
pub mod trace;
pub mod types;

pub use errors::ErrorCategory;
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use retry::{RetryPolicy, RetryableError, run_with_retry};
pub use sse::{StreamParse, count_malformed_data_lines, event_types, parse_event_stream};
pub use trace::{TRACE_QUERY_PARAM, generate_run_id, sanitize_id, trace_id};
pub use types::{
    Assertion, CaseResult, CaseStatus, RequestLog, ResponseLog, RunEnvironment, RunStats,
    RunSummary,
};
