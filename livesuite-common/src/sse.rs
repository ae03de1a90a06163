//! Event-stream decoding for streamed gateway responses.
//!
//! Both API dialects the subject speaks use line-oriented `data:` frames.
//! The OpenAI dialect ends with a literal `[DONE]` payload; the Anthropic
//! dialect sends typed JSON events (`message_start` ... `message_stop`).
//!
//! Unparseable data lines are skipped by [`parse_event_stream`] and
//! reported separately by [`count_malformed_data_lines`].

use std::collections::{BTreeMap, HashSet};

use memchr::memchr_iter;
use serde_json::Value;

/// Payload that marks graceful stream termination.
pub const DONE_SENTINEL: &[u8] = b"[DONE]";

const DATA_PREFIX: &[u8] = b"data:";

/// Decoded frames of one event-stream body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamParse {
    /// JSON payloads in wire order.
    pub frames: Vec<Value>,
    /// Whether the `[DONE]` sentinel was seen.
    pub terminated: bool,
}

/// Iterate over the trimmed payload of every `data:` line.
///
/// Blank payloads are skipped. Lines are split on `\n`; a trailing `\r`
/// is removed by trimming.
fn data_payloads(body: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut start = 0;
    let mut ends = memchr_iter(b'\n', body).chain(std::iter::once(body.len()));
    std::iter::from_fn(move || {
        loop {
            let end = ends.next()?;
            if end < start {
                continue;
            }
            let line = body[start..end].trim_ascii();
            start = end + 1;
            if let Some(rest) = line.strip_prefix(DATA_PREFIX) {
                let payload = rest.trim_ascii();
                if !payload.is_empty() {
                    return Some(payload);
                }
            }
        }
    })
}

/// Parse an event-stream body into JSON frames and a termination flag.
pub fn parse_event_stream(body: &[u8]) -> StreamParse {
    let mut parsed = StreamParse::default();
    for payload in data_payloads(body) {
        if payload == DONE_SENTINEL {
            parsed.terminated = true;
            continue;
        }
        if let Ok(value) = serde_json::from_slice::<Value>(payload) {
            parsed.frames.push(value);
        }
    }
    parsed
}

/// Distinct `type` values of JSON-object frames, in first-seen order.
pub fn event_types(body: &[u8]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for payload in data_payloads(body) {
        let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(payload) else {
            continue;
        };
        let kind = value_text(map.get("type").unwrap_or(&Value::Null));
        if kind.is_empty() || !seen.insert(kind.clone()) {
            continue;
        }
        out.push(kind);
    }
    out
}

/// Number of `data:` lines whose payload is neither blank, the sentinel,
/// nor valid JSON.
pub fn count_malformed_data_lines(body: &[u8]) -> usize {
    data_payloads(body)
        .filter(|payload| *payload != DONE_SENTINEL)
        .filter(|payload| serde_json::from_slice::<Value>(payload).is_err())
        .count()
}

/// Parse a response body as JSON, yielding `Null` when it is not JSON.
pub fn json_body(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap_or(Value::Null)
}

/// `data[].id` values of a model-listing body.
pub fn model_ids(body: &[u8]) -> Vec<String> {
    json_body(body)
        .get("data")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| value_text(item.get("id").unwrap_or(&Value::Null)))
                .filter(|id| !id.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Lenient text view of a JSON value: trimmed strings, rendered scalars,
/// empty for null.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string().trim().to_string(),
    }
}

/// Lenient integer view of a JSON value: numbers truncate, anything else
/// is zero.
pub fn value_int(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        _ => 0,
    }
}

/// Iterate over `choices[].delta` objects of OpenAI-style stream frames.
pub fn choice_deltas(frames: &[Value]) -> impl Iterator<Item = &serde_json::Map<String, Value>> {
    frames
        .iter()
        .filter_map(|frame| frame.get("choices").and_then(Value::as_array))
        .flatten()
        .filter_map(|choice| choice.get("delta").and_then(Value::as_object))
}

/// Count of outcomes per status code. Zero is the network-failure bucket.
pub type StatusDistribution = BTreeMap<u16, usize>;

/// Build a distribution from raw status codes.
pub fn status_distribution<I>(statuses: I) -> StatusDistribution
where
    I: IntoIterator<Item = u16>,
{
    let mut dist = StatusDistribution::new();
    for status in statuses {
        *dist.entry(status).or_default() += 1;
    }
    dist
}

/// First server-error status in a distribution, if any.
pub fn first_server_error(dist: &StatusDistribution) -> Option<u16> {
    dist.keys().copied().find(|status| *status >= 500)
}
