//! Request execution engine and per-case context.
//!
//! An [`Engine`] is shared by the whole run: it owns the transport, the
//! base URL, the retry policy and the trace header name. Each case gets a
//! fresh [`CaseContext`] from [`Engine::case`]; the context owns the
//! sequence counter, request/response logs, raw stream buffer and
//! assertions for that case only. Contexts are cheap to clone so a case
//! can fan requests out across tasks; every clone shares one mutex.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use livesuite_common::sse::{self, StreamParse};
use livesuite_common::{
    Assertion, ErrorCategory, RequestLog, ResponseLog, RetryPolicy, RetryableError,
    TRACE_QUERY_PARAM, run_with_retry, trace_id,
};
use reqwest::Url;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::transport::{ABORT_READ_LIMIT, BodyRead, OutboundRequest, Transport, TransportError};

/// Header carrying the trace ID on every request.
pub const TRACE_HEADER: &str = "X-Ds2-Test-Trace";

/// `body_text` recorded for an exchange that hung up after one chunk.
pub const ABORTED_BODY_MARKER: &str = "aborted_after_first_chunk";

// ── Errors ──────────────────────────────────────────────────────────────

/// Failure of one engine call after retries were applied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// No status line was obtained.
    #[error("{0}")]
    Network(TransportError),

    /// A server error survived every allowed attempt.
    #[error("status={0}")]
    Status(u16),

    #[error("invalid request url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to serialize request body: {0}")]
    Serialize(String),
}

impl EngineError {
    /// Status to bucket this failure under; zero for network failures.
    pub fn status(&self) -> u16 {
        match self {
            Self::Status(status) => *status,
            _ => 0,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Network(_) => ErrorCategory::Network,
            Self::Status(_) => ErrorCategory::Protocol,
            Self::InvalidUrl { .. } | Self::Serialize(_) => ErrorCategory::Infrastructure,
        }
    }
}

impl RetryableError for EngineError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Status(_))
    }
}

/// Error returned by a scenario body.
#[derive(Debug, Clone, Error)]
pub enum CaseError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The subject answered, but not in a shape the case can continue from.
    #[error("{0}")]
    Protocol(String),

    /// A precondition the case needs is missing.
    #[error("{0}")]
    Setup(String),
}

impl CaseError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn setup(message: impl Into<String>) -> Self {
        Self::Setup(message.into())
    }

    /// Name of the synthetic failing assertion recorded for this error.
    pub fn assertion_name(&self) -> &'static str {
        match self {
            Self::Engine(EngineError::Network(_)) => "case_error_network",
            Self::Engine(EngineError::Status(_)) => "case_error_status_5xx",
            Self::Protocol(_) => "case_error_protocol",
            _ => "case_error",
        }
    }

    /// Category for logging. The runner contains every case error in
    /// its case regardless of category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Engine(err) => err.category(),
            Self::Protocol(_) => ErrorCategory::Protocol,
            Self::Setup(_) => ErrorCategory::Assertion,
        }
    }
}

// ── Request specs ───────────────────────────────────────────────────────

/// One logical request a case wants to make.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    pub method: String,
    /// Path relative to the base URL, optionally with a query string.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Keep the raw body in the case's stream buffer.
    pub stream: bool,
    /// Retry network errors and server errors per the engine policy.
    pub retryable: bool,
}

impl RequestSpec {
    pub fn new(method: &str, path: impl Into<String>) -> Self {
        Self {
            method: method.to_string(),
            path: path.into(),
            headers: Vec::new(),
            body: None,
            stream: false,
            retryable: true,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new("POST", path).json(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new("DELETE", path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// `Authorization: Bearer <token>`.
    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {token}"))
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Make exactly one attempt regardless of the outcome.
    pub fn no_retry(mut self) -> Self {
        self.retryable = false;
        self
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }
}

/// What a case gets back from a successful engine call.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseResult {
    pub status: u16,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: Vec<u8>,
    pub trace_id: String,
    /// Effective URL, including the trace query parameter.
    pub url: String,
}

impl ResponseResult {
    /// Body parsed as JSON, `Null` when it is not.
    pub fn json(&self) -> Value {
        sse::json_body(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn event_stream(&self) -> StreamParse {
        sse::parse_event_stream(&self.body)
    }
}

// ── Engine ──────────────────────────────────────────────────────────────

/// Run-wide request settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub base_url: String,
    pub run_id: String,
    /// Per-attempt timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub trace_header: String,
}

impl EngineConfig {
    pub fn new(base_url: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            run_id: run_id.into(),
            timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            trace_header: TRACE_HEADER.to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Shared request engine. One per run.
pub struct Engine {
    transport: Arc<dyn Transport>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(transport: Arc<dyn Transport>, config: EngineConfig) -> Arc<Self> {
        Arc::new(Self { transport, config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    pub fn run_id(&self) -> &str {
        &self.config.run_id
    }

    /// Fresh context for one case.
    pub fn case(self: &Arc<Self>, case_id: impl Into<String>) -> CaseContext {
        CaseContext {
            inner: Arc::new(CaseInner {
                engine: Arc::clone(self),
                case_id: case_id.into(),
                started: Instant::now(),
                state: Mutex::new(CaseState::default()),
            }),
        }
    }

    fn resolve_url(&self, path: &str, trace: &str) -> Result<String, EngineError> {
        let raw = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        inject_trace(&raw, trace)
    }

    /// Untraced GET outside any case. Anything but 200 is an error.
    pub async fn ping(&self, path: &str) -> Result<(), EngineError> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let response = self
            .transport
            .send(OutboundRequest::get(url, self.config.timeout))
            .await
            .map_err(EngineError::Network)?;
        if response.status != 200 {
            return Err(EngineError::Status(response.status));
        }
        Ok(())
    }
}

/// Set `__trace_id=<trace>` on `raw`, replacing any existing value and
/// keeping other query parameters in order.
pub fn inject_trace(raw: &str, trace: &str) -> Result<String, EngineError> {
    let mut url = Url::parse(raw).map_err(|e| EngineError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != TRACE_QUERY_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair(TRACE_QUERY_PARAM, trace);
    Ok(url.into())
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

// ── Case context ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct CaseState {
    seq: u32,
    requests: Vec<RequestLog>,
    responses: Vec<ResponseLog>,
    stream_raw: Vec<u8>,
    assertions: Vec<Assertion>,
}

struct CaseInner {
    engine: Arc<Engine>,
    case_id: String,
    started: Instant,
    state: Mutex<CaseState>,
}

/// Outcome of one request in a fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOutOutcome {
    pub index: usize,
    /// Zero when no status was obtained.
    pub status: u16,
    pub error: Option<String>,
}

/// Everything a case accumulated, ready for the artifact writer.
#[derive(Debug, Clone, Default)]
pub struct CaseRecord {
    pub case_id: String,
    pub duration_ms: u64,
    /// Ordered by (seq, attempt).
    pub requests: Vec<RequestLog>,
    /// Ordered by (seq, attempt).
    pub responses: Vec<ResponseLog>,
    pub stream_raw: Vec<u8>,
    pub assertions: Vec<Assertion>,
    /// One per sequence number, in sequence order.
    pub trace_ids: Vec<String>,
}

impl CaseRecord {
    /// Distinct non-zero statuses observed, sorted.
    pub fn status_codes(&self) -> Vec<u16> {
        let mut codes: Vec<u16> = self
            .responses
            .iter()
            .map(|r| r.status_code)
            .filter(|s| *s > 0)
            .collect();
        codes.sort_unstable();
        codes.dedup();
        codes
    }

    pub fn all_assertions_passed(&self) -> bool {
        self.assertions.iter().all(|a| a.passed)
    }
}

/// Handle on one case's mutable state. Clones share the same state.
#[derive(Clone)]
pub struct CaseContext {
    inner: Arc<CaseInner>,
}

impl std::fmt::Debug for CaseContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaseContext")
            .field("case_id", &self.inner.case_id)
            .finish_non_exhaustive()
    }
}

/// How a single attempt treats the response body and status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptMode {
    /// Server errors become [`EngineError::Status`].
    Checked,
    /// Any status is returned as-is.
    Unchecked,
    /// Read one chunk, hang up, record the exchange as truncated.
    AbortAfterFirstChunk,
}

impl CaseContext {
    pub fn case_id(&self) -> &str {
        &self.inner.case_id
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.inner.engine
    }

    fn state(&self) -> MutexGuard<'_, CaseState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Send `spec`, retrying per the engine policy when it is retryable.
    ///
    /// Any status below 500 is returned. A server error or network error
    /// that survives every attempt is returned as the error.
    pub async fn execute(&self, spec: &RequestSpec) -> Result<ResponseResult, EngineError> {
        let engine = self.engine();
        let policy = if spec.retryable {
            engine.config.retry.clone()
        } else {
            engine.config.retry.single_attempt()
        };
        let label = format!("{} {} {}", self.case_id(), spec.method, spec.path);
        run_with_retry(&label, &policy, |attempt| {
            self.attempt(spec, attempt, AttemptMode::Checked)
        })
        .await
    }

    /// Send `spec` exactly once and return whatever status comes back.
    pub async fn execute_once(&self, spec: &RequestSpec) -> Result<ResponseResult, EngineError> {
        self.attempt(spec, 1, AttemptMode::Unchecked).await
    }

    /// Open a stream, read the first chunk and hang up without draining.
    pub async fn abort_after_first_chunk(
        &self,
        spec: &RequestSpec,
    ) -> Result<ResponseResult, EngineError> {
        self.attempt(spec, 1, AttemptMode::AbortAfterFirstChunk).await
    }

    async fn attempt(
        &self,
        spec: &RequestSpec,
        attempt: u32,
        mode: AttemptMode,
    ) -> Result<ResponseResult, EngineError> {
        let engine = self.engine();
        let (seq, trace) = {
            let mut state = self.state();
            state.seq += 1;
            let seq = state.seq;
            let trace = trace_id(&engine.config.run_id, self.case_id(), seq);
            (seq, trace)
        };

        let url = engine.resolve_url(&spec.path, &trace)?;
        let body = spec
            .body
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| EngineError::Serialize(e.to_string()))?;

        let mut headers = spec.headers.clone();
        if body.is_some() && !spec.has_header("content-type") {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }
        headers.push((engine.config.trace_header.clone(), trace.clone()));

        self.state().requests.push(RequestLog {
            seq,
            attempt,
            trace_id: trace.clone(),
            method: spec.method.clone(),
            url: url.clone(),
            headers: headers.iter().cloned().collect(),
            body: spec.body.clone(),
            timestamp: now_rfc3339(),
        });
        debug!(case_id = %self.case_id(), trace_id = %trace, attempt, method = %spec.method, url = %url, "Sending request");

        let read = match mode {
            AttemptMode::AbortAfterFirstChunk => BodyRead::FirstChunk {
                limit: ABORT_READ_LIMIT,
            },
            _ => BodyRead::Full,
        };
        let request = OutboundRequest {
            method: spec.method.clone(),
            url: url.clone(),
            headers,
            body,
            timeout: engine.config.timeout,
            read,
        };

        let started = Instant::now();
        let outcome = engine.transport.send(request).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                warn!(case_id = %self.case_id(), trace_id = %trace, attempt, error = %err, "Request failed before a status was received");
                self.state().responses.push(ResponseLog {
                    seq,
                    attempt,
                    trace_id: trace,
                    status_code: 0,
                    headers: BTreeMap::new(),
                    body_text: String::new(),
                    duration_ms,
                    network_error: Some(err.to_string()),
                    truncated: false,
                    received_at: now_rfc3339(),
                });
                return Err(EngineError::Network(err));
            }
        };

        let aborted = mode == AttemptMode::AbortAfterFirstChunk;
        let body_text = if aborted {
            ABORTED_BODY_MARKER.to_string()
        } else {
            String::from_utf8_lossy(&response.body).into_owned()
        };
        debug!(case_id = %self.case_id(), trace_id = %trace, attempt, status = response.status, duration_ms, "Response received");

        {
            let mut state = self.state();
            if spec.stream && !aborted {
                state
                    .stream_raw
                    .extend_from_slice(format!("### trace={trace} url={url}\n").as_bytes());
                state.stream_raw.extend_from_slice(&response.body);
                state.stream_raw.extend_from_slice(b"\n\n");
            }
            state.responses.push(ResponseLog {
                seq,
                attempt,
                trace_id: trace.clone(),
                status_code: response.status,
                headers: response.headers.clone(),
                body_text,
                duration_ms,
                network_error: None,
                truncated: aborted,
                received_at: now_rfc3339(),
            });
        }

        if mode == AttemptMode::Checked && response.status >= 500 {
            return Err(EngineError::Status(response.status));
        }

        Ok(ResponseResult {
            status: response.status,
            headers: response.headers,
            body: response.body,
            trace_id: trace,
            url,
        })
    }

    /// Record a named check.
    pub fn assert(&self, name: impl Into<String>, passed: bool, detail: impl Into<String>) {
        self.state()
            .assertions
            .push(Assertion::new(name, passed, detail));
    }

    /// Record `<name>` as `status == expected`.
    pub fn assert_status(&self, name: &str, response: &ResponseResult, expected: u16) {
        self.assert(
            name,
            response.status == expected,
            format!("status={}", response.status),
        );
    }

    /// Run `n` copies of `make` concurrently on this context and wait for
    /// all of them. Outcomes come back ordered by index.
    pub async fn fan_out_with<F, Fut>(&self, n: usize, make: F) -> Vec<FanOutOutcome>
    where
        F: Fn(CaseContext, usize) -> Fut,
        Fut: Future<Output = Result<ResponseResult, EngineError>> + Send + 'static,
    {
        let mut outcomes: Vec<FanOutOutcome> = (0..n)
            .map(|index| FanOutOutcome {
                index,
                status: 0,
                error: Some("request task did not complete".to_string()),
            })
            .collect();

        let mut tasks = JoinSet::new();
        for index in 0..n {
            let fut = make(self.clone(), index);
            tasks.spawn(async move { (index, fut.await) });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(response))) => {
                    outcomes[index] = FanOutOutcome {
                        index,
                        status: response.status,
                        error: None,
                    };
                }
                Ok((index, Err(err))) => {
                    outcomes[index] = FanOutOutcome {
                        index,
                        status: err.status(),
                        error: Some(err.to_string()),
                    };
                }
                Err(err) => {
                    warn!(case_id = %self.case_id(), error = %err, "Fan-out task failed");
                }
            }
        }
        outcomes
    }

    /// Execute every spec concurrently.
    pub async fn fan_out(&self, specs: Vec<RequestSpec>) -> Vec<FanOutOutcome> {
        let specs = Arc::new(specs);
        let n = specs.len();
        self.fan_out_with(n, move |ctx, index| {
            let specs = Arc::clone(&specs);
            async move { ctx.execute(&specs[index]).await }
        })
        .await
    }

    /// Snapshot of everything recorded so far.
    pub fn finish(&self) -> CaseRecord {
        let duration_ms = self.inner.started.elapsed().as_millis() as u64;
        let state = self.state();

        let mut requests = state.requests.clone();
        requests.sort_by_key(|r| (r.seq, r.attempt));
        let mut responses = state.responses.clone();
        responses.sort_by_key(|r| (r.seq, r.attempt));
        let mut trace_ids: Vec<(u32, String)> = state
            .requests
            .iter()
            .map(|r| (r.seq, r.trace_id.clone()))
            .collect();
        trace_ids.sort_by_key(|(seq, _)| *seq);
        trace_ids.dedup_by_key(|(seq, _)| *seq);

        CaseRecord {
            case_id: self.case_id().to_string(),
            duration_ms,
            requests,
            responses,
            stream_raw: state.stream_raw.clone(),
            assertions: state.assertions.clone(),
            trace_ids: trace_ids.into_iter().map(|(_, trace)| trace).collect(),
        }
    }
}
