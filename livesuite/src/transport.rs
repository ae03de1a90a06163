//! HTTP transport seam.
//!
//! The engine talks to the subject through [`Transport`] so retry,
//! logging and fan-out can be exercised without a network. Production
//! runs use [`HttpTransport`]; tests script a [`ScriptedTransport`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

/// Bytes read before an abort-after-first-chunk request hangs up.
pub const ABORT_READ_LIMIT: usize = 512;

/// How much of the response body to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyRead {
    /// Drain the body completely.
    Full,
    /// Read one chunk, keep at most `limit` bytes, then drop the
    /// connection without draining.
    FirstChunk { limit: usize },
}

/// A fully resolved request, ready to put on the wire.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Duration,
    pub read: BodyRead,
}

impl OutboundRequest {
    /// Plain GET with no headers, used for health probes.
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout,
            read: BodyRead::Full,
        }
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// What came back, before any logging or interpretation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    /// Lower-cased header names; repeated headers keep every value.
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn json(status: u16, value: &Value) -> Self {
        Self::new(status, value.to_string()).with_header("content-type", "application/json")
    }

    pub fn event_stream(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self::new(status, body).with_header("content-type", "text/event-stream")
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
        self
    }
}

/// Failure to obtain a status line.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Other(String),
}

/// Sends one request. Implementations must be safe to share across tasks.
pub trait Transport: Send + Sync {
    fn send(&self, request: OutboundRequest) -> BoxFuture<'_, Result<TransportResponse, TransportError>>;
}

// ── reqwest transport ───────────────────────────────────────────────────

/// Production transport over a pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Other(error_chain(&e)))?;
        Ok(Self { client })
    }

    async fn execute(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        let timeout = request.timeout;

        let mut builder = self.client.request(method, &request.url).timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let mut response = builder.send().await.map_err(|e| classify(&e, timeout))?;
        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());

        let body = match request.read {
            BodyRead::Full => response
                .bytes()
                .await
                .map_err(|e| classify(&e, timeout))?
                .to_vec(),
            BodyRead::FirstChunk { limit } => match response.chunk().await {
                Ok(Some(chunk)) => chunk[..chunk.len().min(limit)].to_vec(),
                Ok(None) => Vec::new(),
                Err(e) => return Err(classify(&e, timeout)),
            },
        };

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: OutboundRequest) -> BoxFuture<'_, Result<TransportResponse, TransportError>> {
        Box::pin(self.execute(request))
    }
}

fn collect_headers(headers: &reqwest::header::HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        out.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    out
}

fn classify(err: &reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else if err.is_connect() {
        TransportError::Connect(error_chain(err))
    } else if err.is_builder() {
        TransportError::InvalidRequest(error_chain(err))
    } else {
        TransportError::Other(error_chain(err))
    }
}

/// `outer: inner: root` rendering of an error and its sources.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = inner.source();
    }
    out
}

// ── scripted transport ──────────────────────────────────────────────────

type Responder = dyn Fn(&OutboundRequest) -> Result<TransportResponse, TransportError> + Send + Sync;

/// In-memory transport for tests.
///
/// Scripted outcomes are consumed FIFO. Once the script is empty the
/// optional responder answers; without one the call fails.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<VecDeque<Result<TransportResponse, TransportError>>>>,
    responder: Option<Arc<Responder>>,
    calls: Arc<Mutex<Vec<OutboundRequest>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer unscripted calls with `responder`.
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&OutboundRequest) -> Result<TransportResponse, TransportError> + Send + Sync + 'static,
    {
        Self {
            responder: Some(Arc::new(responder)),
            ..Self::default()
        }
    }

    /// Append a scripted outcome.
    pub fn push(&self, outcome: Result<TransportResponse, TransportError>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(outcome);
    }

    pub fn push_status(&self, status: u16) {
        self.push(Ok(TransportResponse::new(status, Vec::new())));
    }

    /// Snapshot of every request received.
    pub fn calls(&self) -> Vec<OutboundRequest> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn answer(&self, request: &OutboundRequest) -> Result<TransportResponse, TransportError> {
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match (scripted, &self.responder) {
            (Some(outcome), _) => outcome,
            (None, Some(responder)) => responder(request),
            (None, None) => Err(TransportError::Other(
                "scripted transport has no response left".to_string(),
            )),
        }
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: OutboundRequest) -> BoxFuture<'_, Result<TransportResponse, TransportError>> {
        let outcome = self.answer(&request).map(|mut response| {
            if let BodyRead::FirstChunk { limit } = request.read {
                response.body.truncate(limit);
            }
            response
        });
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        Box::pin(async move { outcome })
    }
}
