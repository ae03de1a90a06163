//! Anthropic-dialect cases.

use livesuite_common::event_types;
use livesuite_common::sse::{model_ids, value_int, value_text};
use serde_json::{Value, json};

use super::{Suite, body_detail};
use crate::engine::{CaseContext, CaseError, RequestSpec};

const MESSAGES_PATH: &str = "/anthropic/v1/messages";
const MODEL: &str = "claude-sonnet-4-5";

fn messages_request(suite: &Suite, path: &str, body: Value) -> RequestSpec {
    suite
        .anthropic(RequestSpec::post(path, body))
        .header("content-type", "application/json")
}

pub(super) async fn models(_suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let resp = ctx.execute(&RequestSpec::get("/anthropic/v1/models")).await?;
    ctx.assert_status("status_200", &resp, 200);
    let ids = model_ids(&resp.body);
    ctx.assert("non_empty", !ids.is_empty(), format!("models={ids:?}"));
    Ok(())
}

pub(super) async fn messages_nonstream(suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let body = json!({
        "model": MODEL,
        "messages": [{"role": "user", "content": "hello"}],
        "stream": false,
    });
    let resp = ctx.execute(&messages_request(suite, MESSAGES_PATH, body)).await?;
    ctx.assert_status("status_200", &resp, 200);
    ctx.assert(
        "type_message",
        value_text(&resp.json()["type"]) == "message",
        body_detail(&resp),
    );
    Ok(())
}

pub(super) async fn messages_stream(suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let body = json!({
        "model": MODEL,
        "messages": [{"role": "user", "content": "stream hello"}],
        "stream": true,
    });
    let spec = messages_request(suite, MESSAGES_PATH, body).streaming();
    let resp = ctx.execute(&spec).await?;
    ctx.assert_status("status_200", &resp, 200);

    let events = event_types(&resp.body);
    let has = |name: &str| events.iter().any(|e| e == name);
    ctx.assert("has_message_start", has("message_start"), format!("events={events:?}"));
    ctx.assert("has_message_stop", has("message_stop"), format!("events={events:?}"));
    Ok(())
}

pub(super) async fn count_tokens(suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let body = json!({
        "model": MODEL,
        "messages": [{"role": "user", "content": "count me"}],
    });
    let path = format!("{MESSAGES_PATH}/count_tokens");
    let resp = ctx.execute(&messages_request(suite, &path, body)).await?;
    ctx.assert_status("status_200", &resp, 200);
    ctx.assert(
        "input_tokens_gt_zero",
        value_int(&resp.json()["input_tokens"]) > 0,
        body_detail(&resp),
    );
    Ok(())
}
