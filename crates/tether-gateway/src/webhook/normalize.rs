//! Event normalization.
//!
//! Maps raw source payloads to the normalized trigger event names carried
//! on `spec.trigger.event`. Payloads are parsed through strict per-source
//! lookups — never reflected on generically — and the raw payload is
//! retained verbatim on the trigger regardless of what normalization
//! understands. Unknown events normalize to `<source>_event`.

use serde_json::Value;

/// Normalizes a source payload to an event type.
#[must_use]
pub fn normalize_event(source: &str, headers_event: Option<&str>, payload: &Value) -> String {
    match source {
        "github" => normalize_github(headers_event, payload),
        "slack" => normalize_slack(payload),
        "jira" => normalize_jira(payload),
        _ => fallback(source),
    }
}

fn fallback(source: &str) -> String {
    format!("{source}_event")
}

/// GitHub: the event class arrives in `X-GitHub-Event`, the verb in the
/// payload's `action` field.
fn normalize_github(headers_event: Option<&str>, payload: &Value) -> String {
    let action = payload.get("action").and_then(Value::as_str);
    match (headers_event, action) {
        (Some("pull_request"), Some(action)) => format!("pull_request_{action}"),
        (Some("issues"), Some(action)) => format!("issue_{action}"),
        (Some("issue_comment"), Some(action)) => format!("issue_comment_{action}"),
        (Some("push"), _) => "push".to_string(),
        (Some(event), Some(action)) => format!("{event}_{action}"),
        (Some(event), None) => event.to_string(),
        // Header missing: fall back to the action alone or the generic name.
        (None, Some(action)) if payload.get("pull_request").is_some() => {
            format!("pull_request_{action}")
        }
        (None, Some(action)) if payload.get("issue").is_some() => format!("issue_{action}"),
        _ => fallback("github"),
    }
}

/// Slack event API: `{"type":"event_callback","event":{"type":"message"}}`.
fn normalize_slack(payload: &Value) -> String {
    match payload.get("type").and_then(Value::as_str) {
        Some("event_callback") => payload
            .get("event")
            .and_then(|e| e.get("type"))
            .and_then(Value::as_str)
            .map_or_else(|| fallback("slack"), ToString::to_string),
        Some("url_verification") => "url_verification".to_string(),
        Some(other) => other.to_string(),
        None => fallback("slack"),
    }
}

/// Jira: `webhookEvent` strings like `jira:issue_created`.
fn normalize_jira(payload: &Value) -> String {
    payload
        .get("webhookEvent")
        .and_then(Value::as_str)
        .map_or_else(
            || fallback("jira"),
            |event| event.strip_prefix("jira:").unwrap_or(event).to_string(),
        )
}
