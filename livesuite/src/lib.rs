//! Live end-to-end harness for an OpenAI/Anthropic-compatible gateway.
//!
//! A run isolates the gateway's config, starts (or attaches to) the
//! gateway, drives a fixed catalogue of HTTP and streaming cases against
//! it, and leaves per-case artifacts plus a run summary on disk.

pub mod artifacts;
pub mod engine;
pub mod isolation;
pub mod options;
pub mod preflight;
pub mod runner;
pub mod scenarios;
pub mod summary;
pub mod supervisor;
pub mod transport;

pub use engine::{CaseContext, CaseError, Engine, EngineConfig, EngineError, RequestSpec};
pub use options::{BurstPolicy, CommandSpec, RunOptions, SubjectMode};
pub use runner::{RunError, Runner};
pub use scenarios::CaseKind;
pub use transport::{HttpTransport, Transport, TransportError};
