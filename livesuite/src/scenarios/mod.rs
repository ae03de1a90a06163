//! The live case catalogue.
//!
//! Every case is a function over the shared [`Suite`] and its own
//! [`CaseContext`]. Cases record assertions and return an error only
//! when they cannot continue; the runner turns that error into a failing
//! assertion.

mod admin;
mod anthropic;
mod edge;
mod openai;

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use livesuite_common::sanitize_id;
use livesuite_common::sse::StatusDistribution;
use serde_json::{Map, Value, json};

use crate::engine::{CaseContext, CaseError, RequestSpec, ResponseResult};
use crate::isolation::IsolatedConfig;
use crate::options::BurstPolicy;

/// Header selecting the account a chat request must use.
pub const TARGET_ACCOUNT_HEADER: &str = "X-Ds2-Target-Account";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// How long the abort-release case waits for in-use slots to drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Pause after a failed queue status read.
    pub error_backoff: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(25),
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_millis(500),
        }
    }
}

/// Run-wide inputs shared by every case.
#[derive(Debug)]
pub struct Suite {
    pub run_id: String,
    /// First key of the subject config; used for API calls.
    pub api_key: String,
    pub admin_key: String,
    /// Admin bearer token from the auth bootstrap. Empty if it failed.
    pub admin_jwt: String,
    pub isolated: IsolatedConfig,
    pub burst: BurstPolicy,
    pub recovery: RecoveryPolicy,
    warnings: Mutex<Vec<String>>,
}

impl Suite {
    pub fn new(
        run_id: impl Into<String>,
        admin_key: impl Into<String>,
        admin_jwt: impl Into<String>,
        isolated: IsolatedConfig,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            api_key: isolated.api_key(),
            admin_key: admin_key.into(),
            admin_jwt: admin_jwt.into(),
            isolated,
            burst: BurstPolicy::default(),
            recovery: RecoveryPolicy::default(),
            warnings: Mutex::new(Vec::new()),
        }
    }

    pub fn with_burst(mut self, burst: BurstPolicy) -> Self {
        self.burst = burst;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryPolicy) -> Self {
        self.recovery = recovery;
        self
    }

    /// Record a non-fatal anomaly for the run summary.
    pub fn warn(&self, message: impl Into<String>) {
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.into());
    }

    /// Drain warnings recorded since the last call.
    pub fn take_warnings(&self) -> Vec<String> {
        std::mem::take(&mut *self.warnings.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn account_id(&self) -> Option<String> {
        self.isolated.account_id()
    }

    /// Run-scoped suffix for throwaway keys and tokens.
    fn run_tag(&self) -> String {
        sanitize_id(&self.run_id)
    }

    fn api(&self, spec: RequestSpec) -> RequestSpec {
        spec.bearer(&self.api_key)
    }

    fn admin(&self, spec: RequestSpec) -> RequestSpec {
        spec.bearer(&self.admin_jwt)
    }

    fn anthropic(&self, spec: RequestSpec) -> RequestSpec {
        self.api(spec).header("anthropic-version", ANTHROPIC_VERSION)
    }
}

// ── Catalogue ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaseKind {
    HealthzOk,
    ReadyzOk,
    ModelsOpenai,
    ModelOpenaiById,
    ModelsClaude,
    AdminLoginVerify,
    AdminQueueStatus,
    ChatNonstreamBasic,
    ChatStreamBasic,
    ResponsesNonstreamBasic,
    ResponsesStreamBasic,
    EmbeddingsContract,
    ReasonerStream,
    ToolcallNonstream,
    ToolcallStream,
    AnthropicMessagesNonstream,
    AnthropicMessagesStream,
    AnthropicCountTokens,
    AdminAccountTestSingle,
    ConcurrencyBurst,
    ConcurrencyThresholdLimit,
    StreamAbortRelease,
    ToolcallStreamMixed,
    SseJsonIntegrity,
    ErrorContractInvalidModel,
    ErrorContractMissingMessages,
    AdminUnauthorizedContract,
    ConfigWriteIsolated,
    TokenRefreshManagedAccount,
    ErrorContractInvalidKey,
}

impl CaseKind {
    /// Every case, in execution order.
    pub const ALL: [CaseKind; 30] = [
        Self::HealthzOk,
        Self::ReadyzOk,
        Self::ModelsOpenai,
        Self::ModelOpenaiById,
        Self::ModelsClaude,
        Self::AdminLoginVerify,
        Self::AdminQueueStatus,
        Self::ChatNonstreamBasic,
        Self::ChatStreamBasic,
        Self::ResponsesNonstreamBasic,
        Self::ResponsesStreamBasic,
        Self::EmbeddingsContract,
        Self::ReasonerStream,
        Self::ToolcallNonstream,
        Self::ToolcallStream,
        Self::AnthropicMessagesNonstream,
        Self::AnthropicMessagesStream,
        Self::AnthropicCountTokens,
        Self::AdminAccountTestSingle,
        Self::ConcurrencyBurst,
        Self::ConcurrencyThresholdLimit,
        Self::StreamAbortRelease,
        Self::ToolcallStreamMixed,
        Self::SseJsonIntegrity,
        Self::ErrorContractInvalidModel,
        Self::ErrorContractMissingMessages,
        Self::AdminUnauthorizedContract,
        Self::ConfigWriteIsolated,
        Self::TokenRefreshManagedAccount,
        Self::ErrorContractInvalidKey,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Self::HealthzOk => "healthz_ok",
            Self::ReadyzOk => "readyz_ok",
            Self::ModelsOpenai => "models_openai",
            Self::ModelOpenaiById => "model_openai_by_id",
            Self::ModelsClaude => "models_claude",
            Self::AdminLoginVerify => "admin_login_verify",
            Self::AdminQueueStatus => "admin_queue_status",
            Self::ChatNonstreamBasic => "chat_nonstream_basic",
            Self::ChatStreamBasic => "chat_stream_basic",
            Self::ResponsesNonstreamBasic => "responses_nonstream_basic",
            Self::ResponsesStreamBasic => "responses_stream_basic",
            Self::EmbeddingsContract => "embeddings_contract",
            Self::ReasonerStream => "reasoner_stream",
            Self::ToolcallNonstream => "toolcall_nonstream",
            Self::ToolcallStream => "toolcall_stream",
            Self::AnthropicMessagesNonstream => "anthropic_messages_nonstream",
            Self::AnthropicMessagesStream => "anthropic_messages_stream",
            Self::AnthropicCountTokens => "anthropic_count_tokens",
            Self::AdminAccountTestSingle => "admin_account_test_single",
            Self::ConcurrencyBurst => "concurrency_burst",
            Self::ConcurrencyThresholdLimit => "concurrency_threshold_limit",
            Self::StreamAbortRelease => "stream_abort_release",
            Self::ToolcallStreamMixed => "toolcall_stream_mixed",
            Self::SseJsonIntegrity => "sse_json_integrity",
            Self::ErrorContractInvalidModel => "error_contract_invalid_model",
            Self::ErrorContractMissingMessages => "error_contract_missing_messages",
            Self::AdminUnauthorizedContract => "admin_unauthorized_contract",
            Self::ConfigWriteIsolated => "config_write_isolated",
            Self::TokenRefreshManagedAccount => "token_refresh_managed_account",
            Self::ErrorContractInvalidKey => "error_contract_invalid_key",
        }
    }

    pub async fn run(self, suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
        match self {
            Self::HealthzOk => openai::healthz(suite, ctx).await,
            Self::ReadyzOk => openai::readyz(suite, ctx).await,
            Self::ModelsOpenai => openai::models(suite, ctx).await,
            Self::ModelOpenaiById => openai::model_by_id(suite, ctx).await,
            Self::ModelsClaude => anthropic::models(suite, ctx).await,
            Self::AdminLoginVerify => admin::login_verify(suite, ctx).await,
            Self::AdminQueueStatus => admin::queue_status(suite, ctx).await,
            Self::ChatNonstreamBasic => openai::chat_nonstream(suite, ctx).await,
            Self::ChatStreamBasic => openai::chat_stream(suite, ctx).await,
            Self::ResponsesNonstreamBasic => openai::responses_nonstream(suite, ctx).await,
            Self::ResponsesStreamBasic => openai::responses_stream(suite, ctx).await,
            Self::EmbeddingsContract => openai::embeddings(suite, ctx).await,
            Self::ReasonerStream => openai::reasoner_stream(suite, ctx).await,
            Self::ToolcallNonstream => openai::toolcall_nonstream(suite, ctx).await,
            Self::ToolcallStream => openai::toolcall_stream(suite, ctx).await,
            Self::AnthropicMessagesNonstream => anthropic::messages_nonstream(suite, ctx).await,
            Self::AnthropicMessagesStream => anthropic::messages_stream(suite, ctx).await,
            Self::AnthropicCountTokens => anthropic::count_tokens(suite, ctx).await,
            Self::AdminAccountTestSingle => admin::account_test(suite, ctx).await,
            Self::ConcurrencyBurst => edge::concurrency_burst(suite, ctx).await,
            Self::ConcurrencyThresholdLimit => edge::threshold_limit(suite, ctx).await,
            Self::StreamAbortRelease => edge::stream_abort_release(suite, ctx).await,
            Self::ToolcallStreamMixed => openai::toolcall_stream_mixed(suite, ctx).await,
            Self::SseJsonIntegrity => edge::sse_json_integrity(suite, ctx).await,
            Self::ErrorContractInvalidModel => edge::invalid_model(suite, ctx).await,
            Self::ErrorContractMissingMessages => edge::missing_messages(suite, ctx).await,
            Self::AdminUnauthorizedContract => admin::unauthorized(suite, ctx).await,
            Self::ConfigWriteIsolated => admin::config_write_isolated(suite, ctx).await,
            Self::TokenRefreshManagedAccount => admin::token_refresh(suite, ctx).await,
            Self::ErrorContractInvalidKey => edge::invalid_key(suite, ctx).await,
        }
    }
}

impl std::fmt::Display for CaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

// ── Shared helpers ──────────────────────────────────────────────────────

const CHAT_PATH: &str = "/v1/chat/completions";
const QUEUE_STATUS_PATH: &str = "/admin/queue/status";

/// Single-turn chat body.
fn chat_body(model: &str, content: &str, stream: bool) -> Value {
    json!({
        "model": model,
        "messages": [{"role": "user", "content": content}],
        "stream": stream,
    })
}

fn status_detail(resp: &ResponseResult) -> String {
    format!("status={}", resp.status)
}

fn body_detail(resp: &ResponseResult) -> String {
    format!("body={}", resp.text())
}

fn array_len(value: &Value) -> usize {
    value.as_array().map_or(0, Vec::len)
}

fn distribution_detail(dist: &StatusDistribution) -> String {
    format!("distribution={dist:?}")
}

/// GET the admin queue status. A body that is not a JSON object is a
/// protocol error.
async fn fetch_queue_status(
    suite: &Suite,
    ctx: &CaseContext,
) -> Result<Map<String, Value>, CaseError> {
    let resp = ctx
        .execute(&suite.admin(RequestSpec::get(QUEUE_STATUS_PATH)))
        .await?;
    serde_json::from_slice::<Map<String, Value>>(&resp.body)
        .map_err(|e| CaseError::protocol(format!("queue status is not a JSON object: {e}")))
}


#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_catalogue_ids_are_unique_and_ordered() {
        let ids: Vec<&str> = CaseKind::ALL.iter().map(|k| k.id()).collect();
        assert_eq!(ids.len(), 30);
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 30);
        assert_eq!(ids[0], "healthz_ok");
        assert_eq!(ids[21], "stream_abort_release");
        assert_eq!(ids[29], "error_contract_invalid_key");
    }

    #[test]
    fn test_suite_warnings_drain() {
        let suite = testing::suite(Default::default());
        suite.warn("one");
        suite.warn("two");
        assert_eq!(suite.take_warnings(), vec!["one", "two"]);
        assert!(suite.take_warnings().is_empty());
    }

    #[test]
    fn test_chat_body_shape() {
        let body = chat_body("deepseek-chat", "hi", true);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["stream"], true);
    }
}
