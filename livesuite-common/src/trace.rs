//! Run and trace identifiers.
//!
//! A run ID is a fixed-width UTC timestamp, so run directories sort
//! lexicographically in creation order. Trace IDs embed the run ID, the
//! case ID and a per-case sequence number so the subject's own logs can
//! be grepped for one exchange.

use chrono::{DateTime, Utc};

/// Query parameter carrying the trace ID on every outbound request.
pub const TRACE_QUERY_PARAM: &str = "__trace_id";

const RUN_ID_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Run ID for the given instant, e.g. `20260118T093015Z`.
pub fn run_id_at(at: DateTime<Utc>) -> String {
    at.format(RUN_ID_FORMAT).to_string()
}

/// Run ID for the current instant.
pub fn generate_run_id() -> String {
    run_id_at(Utc::now())
}

/// Replace characters that are awkward in file names and log greps.
pub fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .map(|ch| match ch {
            ':' | '/' | ' ' => '_',
            other => other,
        })
        .collect()
}

/// `ts_<run>_<case>_<seq>` with a zero-padded, at least three digit sequence.
pub fn trace_id(run_id: &str, case_id: &str, seq: u32) -> String {
    format!("ts_{}_{}_{:03}", run_id, sanitize_id(case_id), seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_run_id_fixed_width() {
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(run_id_at(at), "20260102T030405Z");
    }

    #[test]
    fn test_run_ids_sort_chronologically() {
        let earlier = run_id_at(Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 59).unwrap());
        let later = run_id_at(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        assert!(earlier < later);
    }

    #[test]
    fn test_sanitize_id() {
        assert_eq!(sanitize_id("a:b/c d"), "a_b_c_d");
        assert_eq!(sanitize_id("plain_id-1"), "plain_id-1");
    }

    #[test]
    fn test_trace_id_format() {
        assert_eq!(
            trace_id("20260102T030405Z", "chat stream", 7),
            "ts_20260102T030405Z_chat_stream_007"
        );
        assert_eq!(trace_id("r", "c", 1234), "ts_r_c_1234");
    }
}
