//! OpenAI-dialect cases: health, models, chat, responses, embeddings and
//! tool calls.

use livesuite_common::sse::{choice_deltas, model_ids, value_text};
use serde_json::{Value, json};

use super::{CHAT_PATH, Suite, array_len, body_detail, chat_body, status_detail};
use crate::engine::{CaseContext, CaseError, RequestSpec};

pub(super) async fn healthz(_suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    probe(ctx, "/healthz", "status_ok", "ok").await
}

pub(super) async fn readyz(_suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    probe(ctx, "/readyz", "status_ready", "ready").await
}

async fn probe(ctx: &CaseContext, path: &str, name: &str, expected: &str) -> Result<(), CaseError> {
    let resp = ctx.execute(&RequestSpec::get(path)).await?;
    ctx.assert_status("status_200", &resp, 200);
    ctx.assert(
        name,
        value_text(&resp.json()["status"]) == expected,
        body_detail(&resp),
    );
    Ok(())
}

pub(super) async fn models(_suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let resp = ctx.execute(&RequestSpec::get("/v1/models")).await?;
    ctx.assert_status("status_200", &resp, 200);
    let ids = model_ids(&resp.body);
    let joined = ids.join(",");
    ctx.assert(
        "has_deepseek_chat",
        ids.iter().any(|id| id == "deepseek-chat"),
        joined.clone(),
    );
    ctx.assert(
        "has_deepseek_reasoner",
        ids.iter().any(|id| id == "deepseek-reasoner"),
        joined,
    );
    Ok(())
}

pub(super) async fn model_by_id(_suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let resp = ctx.execute(&RequestSpec::get("/v1/models/gpt-4o")).await?;
    ctx.assert_status("status_200", &resp, 200);
    let m = resp.json();
    ctx.assert("object_model", value_text(&m["object"]) == "model", body_detail(&resp));
    ctx.assert(
        "id_deepseek_chat",
        value_text(&m["id"]) == "deepseek-chat",
        body_detail(&resp),
    );
    Ok(())
}

pub(super) async fn chat_nonstream(suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let spec = suite.api(RequestSpec::post(
        CHAT_PATH,
        chat_body("deepseek-chat", "请简单回复一句话", false),
    ));
    let resp = ctx.execute(&spec).await?;
    ctx.assert_status("status_200", &resp, 200);
    let m = resp.json();
    ctx.assert(
        "object_chat_completion",
        value_text(&m["object"]) == "chat.completion",
        body_detail(&resp),
    );
    ctx.assert("choices_non_empty", array_len(&m["choices"]) > 0, body_detail(&resp));
    Ok(())
}

pub(super) async fn chat_stream(suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let spec = suite
        .api(RequestSpec::post(
            CHAT_PATH,
            chat_body("deepseek-chat", "请流式回复一句话", true),
        ))
        .streaming();
    let resp = ctx.execute(&spec).await?;
    ctx.assert_status("status_200", &resp, 200);
    let stream = resp.event_stream();
    ctx.assert(
        "frames_non_empty",
        !stream.frames.is_empty(),
        format!("len={}", stream.frames.len()),
    );
    ctx.assert("done_terminated", stream.terminated, "expected [DONE]");
    Ok(())
}

pub(super) async fn responses_nonstream(suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let spec = suite.api(RequestSpec::post(
        "/v1/responses",
        json!({"model": "gpt-4o", "input": "请简要回答 hello"}),
    ));
    let resp = ctx.execute(&spec).await?;
    ctx.assert_status("status_200", &resp, 200);
    let m = resp.json();
    ctx.assert("object_response", value_text(&m["object"]) == "response", body_detail(&resp));

    let response_id = value_text(&m["id"]);
    ctx.assert("response_id_present", !response_id.is_empty(), body_detail(&resp));
    if !response_id.is_empty() {
        let get = ctx
            .execute(&suite.api(RequestSpec::get(format!("/v1/responses/{response_id}"))))
            .await?;
        ctx.assert_status("get_status_200", &get, 200);
    }
    Ok(())
}

pub(super) async fn responses_stream(suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let spec = suite
        .api(RequestSpec::post(
            "/v1/responses",
            json!({"model": "gpt-4o", "input": "请流式回答 hello", "stream": true}),
        ))
        .streaming();
    let resp = ctx.execute(&spec).await?;
    ctx.assert_status("status_200", &resp, 200);

    let stream = resp.event_stream();
    ctx.assert(
        "frames_non_empty",
        !stream.frames.is_empty(),
        format!("len={}", stream.frames.len()),
    );
    let has_type = |wanted: &str| {
        stream
            .frames
            .iter()
            .any(|f| value_text(&f["type"]) == wanted)
    };
    ctx.assert("has_response_created", has_type("response.created"), body_detail(&resp));
    ctx.assert("has_response_completed", has_type("response.completed"), body_detail(&resp));
    ctx.assert("done_terminated", stream.terminated, "expected [DONE]");
    Ok(())
}

/// 501 is part of the contract here, so the status is not checked by the
/// engine.
pub(super) async fn embeddings(suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let spec = suite.api(RequestSpec::post(
        "/v1/embeddings",
        json!({"model": "gpt-4o", "input": ["hello", "world"]}),
    ));
    let resp = ctx.execute_once(&spec).await?;
    ctx.assert(
        "status_200_or_501",
        resp.status == 200 || resp.status == 501,
        status_detail(&resp),
    );

    let m = resp.json();
    if resp.status == 200 {
        ctx.assert("object_list", value_text(&m["object"]) == "list", body_detail(&resp));
        ctx.assert("data_non_empty", array_len(&m["data"]) > 0, body_detail(&resp));
        return Ok(());
    }
    let error = &m["error"];
    ctx.assert("error_has_code", error.get("code").is_some(), body_detail(&resp));
    ctx.assert("error_has_param", error.get("param").is_some(), body_detail(&resp));
    Ok(())
}

pub(super) async fn reasoner_stream(suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let spec = suite
        .api(RequestSpec::post(
            CHAT_PATH,
            chat_body("deepseek-reasoner", "先思考后回答：1+1", true),
        ))
        .streaming();
    let resp = ctx.execute(&spec).await?;
    ctx.assert_status("status_200", &resp, 200);

    let stream = resp.event_stream();
    let has_reasoning = choice_deltas(&stream.frames).any(|delta| {
        delta
            .get("reasoning_content")
            .is_some_and(|v| !value_text(v).is_empty())
    });
    ctx.assert("has_reasoning_content", has_reasoning, "reasoning_content not found");
    ctx.assert("done_terminated", stream.terminated, "expected [DONE]");
    Ok(())
}

/// Chat body that instructs the model to call a `search` tool.
fn toolcall_body(content: &str, stream: bool) -> Value {
    json!({
        "model": "deepseek-chat",
        "messages": [{"role": "user", "content": content}],
        "tools": [{
            "type": "function",
            "function": {
                "name": "search",
                "description": "search documents",
                "parameters": {
                    "type": "object",
                    "properties": {"q": {"type": "string"}},
                    "required": ["q"],
                },
            },
        }],
        "stream": stream,
    })
}

const TOOLCALL_PROMPT: &str = "你必须调用工具 search 查询 golang，并仅返回工具调用。";
const TOOLCALL_MIXED_PROMPT: &str =
    "请先输出一句普通文本，再调用工具 search 查询 golang，最后再输出一句普通文本。";

pub(super) async fn toolcall_nonstream(suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let spec = suite.api(RequestSpec::post(CHAT_PATH, toolcall_body(TOOLCALL_PROMPT, false)));
    let resp = ctx.execute(&spec).await?;
    ctx.assert_status("status_200", &resp, 200);

    let m = resp.json();
    let Some(first) = m["choices"].as_array().and_then(|c| c.first()) else {
        ctx.assert("choices_non_empty", false, body_detail(&resp));
        return Ok(());
    };
    ctx.assert(
        "finish_reason_tool_calls",
        value_text(&first["finish_reason"]) == "tool_calls",
        body_detail(&resp),
    );
    ctx.assert(
        "tool_calls_present",
        array_len(&first["message"]["tool_calls"]) > 0,
        body_detail(&resp),
    );
    Ok(())
}

/// What a tool-call stream contained.
#[derive(Debug, Default, PartialEq, Eq)]
struct ToolStreamScan {
    has_tool_delta: bool,
    has_text: bool,
    /// Tool-call JSON surfaced as plain content.
    raw_leak: bool,
    terminated: bool,
}

fn scan_tool_stream(body: &[u8]) -> ToolStreamScan {
    let stream = livesuite_common::parse_event_stream(body);
    let mut scan = ToolStreamScan {
        terminated: stream.terminated,
        ..ToolStreamScan::default()
    };
    for delta in choice_deltas(&stream.frames) {
        if delta.contains_key("tool_calls") {
            scan.has_tool_delta = true;
        }
        let content = delta.get("content").map(value_text).unwrap_or_default();
        if !content.is_empty() {
            scan.has_text = true;
        }
        if content.to_lowercase().contains("\"tool_calls\"") {
            scan.raw_leak = true;
        }
    }
    scan
}

pub(super) async fn toolcall_stream(suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let spec = suite
        .api(RequestSpec::post(CHAT_PATH, toolcall_body(TOOLCALL_PROMPT, true)))
        .streaming();
    let resp = ctx.execute(&spec).await?;
    ctx.assert_status("status_200", &resp, 200);

    let scan = scan_tool_stream(&resp.body);
    ctx.assert("tool_calls_delta_present", scan.has_tool_delta, "tool_calls delta missing");
    ctx.assert("no_raw_tool_json_leak", !scan.raw_leak, "raw tool_calls JSON leaked in content");
    ctx.assert("done_terminated", scan.terminated, "expected [DONE]");
    Ok(())
}

pub(super) async fn toolcall_stream_mixed(suite: &Suite, ctx: &CaseContext) -> Result<(), CaseError> {
    let spec = suite
        .api(RequestSpec::post(CHAT_PATH, toolcall_body(TOOLCALL_MIXED_PROMPT, true)))
        .streaming()
        .no_retry();
    let resp = ctx.execute(&spec).await?;
    ctx.assert_status("status_200", &resp, 200);

    let scan = scan_tool_stream(&resp.body);
    ctx.assert("tool_calls_delta_present", scan.has_tool_delta, "tool_calls delta missing");
    ctx.assert("no_raw_tool_json_leak", !scan.raw_leak, "raw tool_calls leaked");
    ctx.assert("done_terminated", scan.terminated, "expected [DONE]");
    if !(scan.has_tool_delta && scan.has_text) {
        suite.warn(
            "toolcall mixed stream did not produce both text and tool_calls in this run (model-side behavior dependent)",
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenarios::testing::{context, passed, snapshot_with_account, suite};
    use crate::transport::{ScriptedTransport, TransportResponse};

    #[tokio::test]
    async fn test_healthz_checks_status_field() {
        let transport = ScriptedTransport::new();
        transport.push(Ok(TransportResponse::json(200, &json!({"status": "ok"}))));
        let ctx = context(&transport, "healthz_ok");

        healthz(&suite(Default::default()), &ctx).await.unwrap();
        assert_eq!(passed(&ctx, "status_200"), Some(true));
        assert_eq!(passed(&ctx, "status_ok"), Some(true));
    }

    #[tokio::test]
    async fn test_models_requires_both_deepseek_ids() {
        let transport = ScriptedTransport::new();
        transport.push(Ok(TransportResponse::json(
            200,
            &json!({"data": [{"id": "deepseek-chat"}, {"id": "gpt-4o"}]}),
        )));
        let ctx = context(&transport, "models_openai");

        models(&suite(Default::default()), &ctx).await.unwrap();
        assert_eq!(passed(&ctx, "has_deepseek_chat"), Some(true));
        assert_eq!(passed(&ctx, "has_deepseek_reasoner"), Some(false));
    }

    #[tokio::test]
    async fn test_chat_uses_first_api_key() {
        let transport = ScriptedTransport::new();
        transport.push(Ok(TransportResponse::json(
            200,
            &json!({"object": "chat.completion", "choices": [{}]}),
        )));
        let ctx = context(&transport, "chat_nonstream_basic");

        chat_nonstream(&suite(snapshot_with_account("p")), &ctx).await.unwrap();
        assert_eq!(transport.calls()[0].header("authorization"), Some("Bearer sk-live"));
        assert!(ctx.finish().all_assertions_passed());
    }

    #[tokio::test]
    async fn test_responses_nonstream_follows_up_by_id() {
        let transport = ScriptedTransport::new();
        transport.push(Ok(TransportResponse::json(
            200,
            &json!({"object": "response", "id": "resp_1"}),
        )));
        transport.push_status(200);
        let ctx = context(&transport, "responses_nonstream_basic");

        responses_nonstream(&suite(Default::default()), &ctx).await.unwrap();
        assert!(transport.calls()[1].url.contains("/v1/responses/resp_1?"));
        assert_eq!(passed(&ctx, "get_status_200"), Some(true));
    }

    #[tokio::test]
    async fn test_embeddings_accepts_not_implemented_contract() {
        let transport = ScriptedTransport::new();
        transport.push(Ok(TransportResponse::json(
            501,
            &json!({"error": {"code": "not_implemented", "param": null}}),
        )));
        let ctx = context(&transport, "embeddings_contract");

        embeddings(&suite(Default::default()), &ctx).await.unwrap();
        let record = ctx.finish();
        assert!(record.all_assertions_passed());
        assert_eq!(record.assertions.len(), 3);
    }

    #[test]
    fn test_scan_tool_stream_detects_leak_and_text() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Sure\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"{\\\"TOOL_CALLS\\\":[]}\"}}]}\n\n",
            "data: [DONE]\n"
        );
        let scan = scan_tool_stream(body.as_bytes());
        assert_eq!(
            scan,
            ToolStreamScan {
                has_tool_delta: true,
                has_text: true,
                raw_leak: true,
                terminated: true,
            }
        );
    }

    #[tokio::test]
    async fn test_mixed_stream_without_text_warns() {
        let transport = ScriptedTransport::new();
        transport.push(Ok(TransportResponse::event_stream(
            200,
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{}]}}]}\n\ndata: [DONE]\n",
        )));
        let ctx = context(&transport, "toolcall_stream_mixed");
        let suite = suite(Default::default());

        toolcall_stream_mixed(&suite, &ctx).await.unwrap();
        assert!(ctx.finish().all_assertions_passed());
        assert_eq!(suite.take_warnings().len(), 1);
    }

    #[tokio::test]
    async fn test_toolcall_nonstream_without_choices_stops_early() {
        let transport = ScriptedTransport::new();
        transport.push(Ok(TransportResponse::json(200, &json!({"choices": []}))));
        let ctx = context(&transport, "toolcall_nonstream");

        toolcall_nonstream(&suite(Default::default()), &ctx).await.unwrap();
        assert_eq!(passed(&ctx, "choices_non_empty"), Some(false));
        assert_eq!(passed(&ctx, "finish_reason_tool_calls"), None);
    }
}
