//! Trace id propagation.
//!
//! Every inbound request carries a trace id: taken from `X-Trace-Id` when
//! the caller supplies one, generated otherwise. The id flows into audit
//! entries, error envelopes, and the runner environment.

use axum::http::HeaderMap;
use uuid::Uuid;

/// Header carrying a caller-supplied trace id.
pub const TRACE_HEADER: &str = "x-trace-id";

/// Extracts or generates the request trace id.
#[must_use]
pub fn trace_id_from(headers: &HeaderMap) -> String {
    headers
        .get(TRACE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map_or_else(|| Uuid::new_v4().to_string(), ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_supplied_id_is_kept() {
        let mut headers = HeaderMap::new();
        headers.insert(TRACE_HEADER, "trace-abc".parse().unwrap());
        assert_eq!(trace_id_from(&headers), "trace-abc");
    }

    #[test]
    fn missing_or_oversized_ids_are_replaced() {
        assert!(!trace_id_from(&HeaderMap::new()).is_empty());

        let mut headers = HeaderMap::new();
        headers.insert(TRACE_HEADER, "x".repeat(300).parse().unwrap());
        assert_ne!(trace_id_from(&headers), "x".repeat(300));
    }
}
