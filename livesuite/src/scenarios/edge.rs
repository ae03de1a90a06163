//! Concurrency, cancellation and error-contract cases.

use livesuite_common::count_malformed_data_lines;
use livesuite_common::sse::{
    StatusDistribution, first_server_error, status_distribution, value_int, value_text,
};
use serde_json::{Value, json};
use tokio::time::{Instant, sleep};
use tracing::debug;

use super::{
    CHAT_PATH, Suite, body_detail, chat_body, distribution_detail, fetch_queue_status,
};
use crate::engine::{CaseContext, CaseError, FanOutOutcome, RequestSpec};
use crate::options::BurstPolicy;

const ABORT_ROUNDS: usize = 3;

fn streaming_chat(suite: &Suite, content: String) -> RequestSpec {
    suite
        .api(RequestSpec::post(CHAT_PATH, chat_body("deepseek-chat", &content, true)))
        .streaming()
}

/// Status counts; network failures land in the `0` bucket.
fn distribution(outcomes: &[FanOutOutcome]) -> StatusDistribution {
    status_distribution(outcomes.iter().map(|o| o.status))
}

/// A burst sized from the configured accounts must see at least one
/// success, no server errors and a live server afterwards.
pub(super) async fn concurrency_burst(suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let n = (suite.isolated.snapshot.accounts.len() * 2 + 2).max(2);
    let specs = (0..n)
        .map(|i| streaming_chat(suite, format!("并发请求 #{i}，请回复ok")))
        .collect();
    let outcomes = ctx.fan_out(specs).await;

    let dist = distribution(&outcomes);
    debug!(case_id = %ctx.case_id(), n, ?dist, "Burst finished");
    let success = dist.get(&200).copied().unwrap_or(0);
    ctx.assert("success_gt_zero", success > 0, distribution_detail(&dist));
    ctx.assert("no_5xx", first_server_error(&dist).is_none(), distribution_detail(&dist));

    match ctx.engine().ping("/healthz").await {
        Ok(()) => ctx.assert("server_alive", true, ""),
        Err(e) => ctx.assert("server_alive", false, e.to_string()),
    }
    Ok(())
}

/// Overshoot the advertised capacity and expect both admissions and 429s.
pub(super) async fn threshold_limit(suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let status = fetch_queue_status(suite, ctx).await?;
    let total = value_int(status.get("total").unwrap_or(&Value::Null));
    let max_inflight = value_int(status.get("max_inflight_per_account").unwrap_or(&Value::Null));
    let max_queue = value_int(status.get("max_queue_size").unwrap_or(&Value::Null));

    let Some(capacity) = BurstPolicy::capacity(total, max_inflight, max_queue) else {
        ctx.assert(
            "queue_capacity_known",
            false,
            format!("queue_status={}", Value::Object(status)),
        );
        return Ok(());
    };

    let n = suite.burst.burst_size(capacity);
    let specs = (0..n)
        .map(|i| streaming_chat(suite, format!("并发边界测试 #{i}，请输出不少于300字。")))
        .collect();
    let outcomes = ctx.fan_out(specs).await;

    let dist = distribution(&outcomes);
    ctx.assert("has_200", dist.contains_key(&200), distribution_detail(&dist));
    ctx.assert(
        "has_429_when_over_capacity",
        dist.contains_key(&429),
        format!("distribution={dist:?} capacity={capacity} n={n}"),
    );
    ctx.assert("no_5xx", first_server_error(&dist).is_none(), distribution_detail(&dist));
    Ok(())
}

/// Hang up on streams after the first chunk and wait for the subject to
/// release their slots.
pub(super) async fn stream_abort_release(suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let before = fetch_queue_status(suite, ctx).await?;
    let base_in_use = value_int(before.get("in_use").unwrap_or(&Value::Null));

    for i in 0..ABORT_ROUNDS {
        let spec = streaming_chat(suite, format!("中断释放测试 #{i}，请流式回复"));
        if let Err(e) = ctx.abort_after_first_chunk(&spec).await {
            ctx.assert("abort_request_no_error", false, e.to_string());
        }
    }

    let policy = suite.recovery;
    let deadline = Instant::now() + policy.timeout;
    let mut recovered = false;
    let mut last_in_use = -1;
    while Instant::now() < deadline {
        let status = match fetch_queue_status(suite, ctx).await {
            Ok(status) => status,
            Err(e) => {
                debug!(case_id = %ctx.case_id(), error = %e, "Queue status read failed while waiting for release");
                sleep(policy.error_backoff).await;
                continue;
            }
        };
        last_in_use = value_int(status.get("in_use").unwrap_or(&Value::Null));
        if last_in_use <= base_in_use {
            recovered = true;
            break;
        }
        sleep(policy.poll_interval).await;
    }
    ctx.assert(
        "in_use_recovered_after_abort",
        recovered,
        format!("base={base_in_use} last={last_in_use}"),
    );
    Ok(())
}

/// Every `data:` line of both dialects' streams must be valid JSON.
pub(super) async fn sse_json_integrity(suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let openai = suite
        .api(RequestSpec::post(CHAT_PATH, chat_body("deepseek-chat", "输出一句话", true)))
        .streaming()
        .no_retry();
    let resp = ctx.execute(&openai).await?;
    ctx.assert_status("openai_status_200", &resp, 200);
    let malformed = count_malformed_data_lines(&resp.body);
    ctx.assert("openai_sse_json_valid", malformed == 0, format!("malformed={malformed}"));

    let anthropic = suite
        .anthropic(RequestSpec::post(
            "/anthropic/v1/messages",
            json!({
                "model": "claude-sonnet-4-5",
                "messages": [{"role": "user", "content": "stream json integrity"}],
                "stream": true,
            }),
        ))
        .streaming()
        .no_retry();
    let resp = ctx.execute(&anthropic).await?;
    ctx.assert_status("anthropic_status_200", &resp, 200);
    let malformed = count_malformed_data_lines(&resp.body);
    ctx.assert("anthropic_sse_json_valid", malformed == 0, format!("malformed={malformed}"));
    Ok(())
}

/// The expected answer is a 503, so the status is taken as-is.
pub(super) async fn invalid_model(suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let spec = suite
        .api(RequestSpec::post(CHAT_PATH, chat_body("deepseek-not-exists", "hi", false)))
        .no_retry();
    let resp = ctx.execute_once(&spec).await?;
    ctx.assert_status("status_503", &resp, 503);
    ctx.assert(
        "error_type_service_unavailable",
        value_text(&resp.json()["error"]["type"]) == "service_unavailable_error",
        body_detail(&resp),
    );
    Ok(())
}

pub(super) async fn missing_messages(suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let spec = suite.api(RequestSpec::post(
        CHAT_PATH,
        json!({"model": "deepseek-chat", "stream": false}),
    ));
    let resp = ctx.execute(&spec).await?;
    ctx.assert_status("status_400", &resp, 400);
    ctx.assert(
        "error_type_invalid_request",
        value_text(&resp.json()["error"]["type"]) == "invalid_request_error",
        body_detail(&resp),
    );
    Ok(())
}

pub(super) async fn invalid_key(suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let bogus = format!("invalid-testsuite-key-{}", suite.run_tag());
    let spec = RequestSpec::post(CHAT_PATH, chat_body("deepseek-chat", "hi", false)).bearer(&bogus);
    let resp = ctx.execute(&spec).await?;
    ctx.assert_status("status_401", &resp, 401);

    let body = resp.json();
    let error = body["error"].as_object();
    ctx.assert(
        "error_object_present",
        error.is_some_and(|e| !e.is_empty()),
        body_detail(&resp),
    );
    ctx.assert(
        "error_message_present",
        !value_text(&body["error"]["message"]).is_empty(),
        body_detail(&resp),
    );
    Ok(())
}
