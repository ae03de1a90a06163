//! Shared fixtures for the livesuite integration tests: test logging and
//! an in-process fake gateway served over loopback HTTP.

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once, PoisonError};

use axum::body::{Body, Bytes};
use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("livesuite=debug,livesuite_common=debug"));

        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_line_number(true),
            )
            .with(filter)
            .init();
    });
}

#[macro_export]
macro_rules! test_log {
    ($($arg:tt)*) => {
        tracing::info!(target: "test", $($arg)*);
    };
}

/// API key the fake gateway accepts.
pub const API_KEY: &str = "sk-fake";
/// Admin token handed out by the fake login.
pub const ADMIN_TOKEN: &str = "jwt-fake";

/// One request as the fake gateway saw it.
#[derive(Debug, Clone)]
pub struct Seen {
    pub path: String,
    pub query: Option<String>,
    pub trace_header: Option<String>,
    pub authorization: Option<String>,
}

#[derive(Debug, Default)]
pub struct FakeState {
    seen: Mutex<Vec<Seen>>,
    /// Number of 503s `/flaky` returns before answering 200.
    flaky_failures: usize,
    flaky_calls: AtomicUsize,
}

impl FakeState {
    fn record(&self, path: &str, query: Option<String>, headers: &HeaderMap) {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Seen {
                path: path.to_string(),
                query,
                trace_header: text("x-ds2-test-trace"),
                authorization: text("authorization"),
            });
    }

    fn authorized(headers: &HeaderMap, expected: &str) -> bool {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == format!("Bearer {expected}"))
    }
}

/// A running fake gateway. The server task ends with the test runtime.
pub struct FakeGateway {
    pub addr: SocketAddr,
    pub state: Arc<FakeState>,
}

impl FakeGateway {
    pub async fn start() -> Self {
        Self::start_with_flaky(0).await
    }

    /// Start with `/flaky` failing `failures` times before succeeding.
    pub async fn start_with_flaky(failures: usize) -> Self {
        let state = Arc::new(FakeState {
            flaky_failures: failures,
            ..FakeState::default()
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.state
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn seen_path(&self, path: &str) -> Vec<Seen> {
        self.seen().into_iter().filter(|s| s.path == path).collect()
    }

    pub fn flaky_calls(&self) -> usize {
        self.state.flaky_calls.load(Ordering::SeqCst)
    }
}

type Shared = State<Arc<FakeState>>;

fn router(state: Arc<FakeState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/admin/login", post(admin_login))
        .route("/admin/verify", get(admin_verify))
        .route("/v1/models", get(models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/flaky", get(flaky))
        .route("/slow-stream", post(slow_stream))
        .with_state(state)
}

async fn healthz(State(state): Shared, RawQuery(query): RawQuery, headers: HeaderMap) -> Json<Value> {
    state.record("/healthz", query, &headers);
    Json(json!({"status": "ok"}))
}

async fn readyz(State(state): Shared, RawQuery(query): RawQuery, headers: HeaderMap) -> Json<Value> {
    state.record("/readyz", query, &headers);
    Json(json!({"status": "ready"}))
}

async fn admin_login(
    State(state): Shared,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.record("/admin/login", query, &headers);
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    if body["admin_key"] == "admin" {
        Json(json!({"token": ADMIN_TOKEN})).into_response()
    } else {
        (StatusCode::UNAUTHORIZED, Json(json!({"detail": "invalid admin key"}))).into_response()
    }
}

async fn admin_verify(State(state): Shared, RawQuery(query): RawQuery, headers: HeaderMap) -> Response {
    state.record("/admin/verify", query, &headers);
    if FakeState::authorized(&headers, ADMIN_TOKEN) {
        Json(json!({"valid": true})).into_response()
    } else {
        (StatusCode::UNAUTHORIZED, Json(json!({"valid": false}))).into_response()
    }
}

async fn models(State(state): Shared, RawQuery(query): RawQuery, headers: HeaderMap) -> Json<Value> {
    state.record("/v1/models", query, &headers);
    Json(json!({
        "object": "list",
        "data": [
            {"id": "deepseek-chat", "object": "model"},
            {"id": "deepseek-reasoner", "object": "model"},
        ],
    }))
}

fn openai_error(status: StatusCode, kind: &str, message: &str) -> Response {
    (
        status,
        Json(json!({"error": {"type": kind, "message": message}})),
    )
        .into_response()
}

async fn chat_completions(
    State(state): Shared,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.record("/v1/chat/completions", query, &headers);
    if !FakeState::authorized(&headers, API_KEY) {
        return openai_error(StatusCode::UNAUTHORIZED, "authentication_error", "invalid api key");
    }
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    if !body["messages"].is_array() {
        return openai_error(StatusCode::BAD_REQUEST, "invalid_request_error", "messages is required");
    }

    if body["stream"].as_bool().unwrap_or(false) {
        let frames = [
            json!({"object": "chat.completion.chunk", "choices": [{"index": 0, "delta": {"role": "assistant"}}]}),
            json!({"object": "chat.completion.chunk", "choices": [{"index": 0, "delta": {"content": "你好"}}]}),
            json!({"object": "chat.completion.chunk", "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}),
        ];
        let mut sse = String::new();
        for frame in frames {
            sse.push_str(&format!("data: {frame}\n\n"));
        }
        sse.push_str("data: [DONE]\n\n");
        return ([(header::CONTENT_TYPE, "text/event-stream")], sse).into_response();
    }

    Json(json!({
        "id": "chatcmpl-fake",
        "object": "chat.completion",
        "model": body["model"],
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "你好"}, "finish_reason": "stop"}],
    }))
    .into_response()
}

async fn flaky(State(state): Shared, RawQuery(query): RawQuery, headers: HeaderMap) -> Response {
    state.record("/flaky", query, &headers);
    let call = state.flaky_calls.fetch_add(1, Ordering::SeqCst);
    if call < state.flaky_failures {
        (StatusCode::SERVICE_UNAVAILABLE, "warming up").into_response()
    } else {
        Json(json!({"status": "ok", "call": call + 1})).into_response()
    }
}

/// Sends one frame, then holds the connection open without another byte.
async fn slow_stream(State(state): Shared, RawQuery(query): RawQuery, headers: HeaderMap) -> Response {
    state.record("/slow-stream", query, &headers);
    let first = futures::stream::once(async {
        Ok::<_, Infallible>(Bytes::from_static(b"data: {\"choices\":[]}\n\n"))
    });
    let body = Body::from_stream(first.chain(futures::stream::pending()));
    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}

/// Gateway config accepted by the isolation step.
pub fn gateway_config() -> String {
    json!({"keys": [API_KEY], "accounts": []}).to_string()
}
