use serde::Deserialize;

pub(crate) const PROTOCOL_VERSION: u64 = 1;

// Process exit codes shared by every adapter. Callers key retry policy off
// these: 2 means fix the request, 3 means the backend failed and a retry may
// succeed, EXIT_CRASH means the adapter itself blew up.
pub(crate) const EXIT_OK: i32 = 0;
pub(crate) const EXIT_VALIDATION: i32 = 2;
pub(crate) const EXIT_BACKEND: i32 = 3;
pub(crate) const EXIT_CRASH: i32 = 70;

/// One inbound request, read in full from stdin. `meta` is informational
/// (timestamp, calling tool name) and never consulted for dispatch.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RequestEnvelope {
    #[serde(default = "default_version")]
    pub(crate) version: u64,
    #[serde(default)]
    pub(crate) domain: Option<String>,
    pub(crate) action: String,
    #[serde(default)]
    pub(crate) payload: serde_json::Value,
    #[serde(default)]
    pub(crate) idempotency_key: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    pub(crate) meta: serde_json::Value,
}

fn default_version() -> u64 {
    PROTOCOL_VERSION
}

#[derive(Debug)]
pub(crate) enum EnvelopeError {
    /// Unparsable JSON or a non-object top level.
    Malformed(String),
    /// Parsed fine but no usable `action` string.
    MissingAction,
    /// A version this adapter does not speak.
    BadVersion(u64),
}

impl EnvelopeError {
    pub(crate) fn message(&self) -> String {
        match self {
            EnvelopeError::Malformed(detail) => format!("malformed envelope: {detail}"),
            EnvelopeError::MissingAction => {
                "envelope is missing a non-empty 'action' string".to_string()
            }
            EnvelopeError::BadVersion(found) => {
                format!("unsupported envelope version {found} (expected {PROTOCOL_VERSION})")
            }
        }
    }
}

pub(crate) fn parse_envelope(raw: &str) -> Result<RequestEnvelope, EnvelopeError> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| EnvelopeError::Malformed(format!("invalid json: {e}")))?;
    if !value.is_object() {
        return Err(EnvelopeError::Malformed(
            "top level must be a json object".to_string(),
        ));
    }
    let action_ok = value
        .get("action")
        .and_then(|v| v.as_str())
        .is_some_and(|s| !s.trim().is_empty());
    if !action_ok {
        return Err(EnvelopeError::MissingAction);
    }
    let envelope: RequestEnvelope = serde_json::from_value(value)
        .map_err(|e| EnvelopeError::Malformed(format!("envelope fields: {e}")))?;
    if envelope.version != PROTOCOL_VERSION {
        return Err(EnvelopeError::BadVersion(envelope.version));
    }
    Ok(envelope)
}

/// Pure construction of a response envelope. `extra`'s object keys are merged
/// over the base `{ok, domain, action}`; a non-object `extra` is ignored.
pub(crate) fn build_response(
    domain: &str,
    action: &str,
    ok: bool,
    extra: serde_json::Value,
) -> serde_json::Value {
    let mut body = serde_json::json!({
        "ok": ok,
        "domain": domain,
        "action": action,
    });
    if let (Some(map), Some(extra_map)) = (body.as_object_mut(), extra.as_object()) {
        for (key, value) in extra_map {
            map.insert(key.clone(), value.clone());
        }
    }
    body
}

/// Router-boundary error taxonomy. Backend-specific failures never escape a
/// router raw; they are folded into one of these before reaching the
/// entrypoint.
#[derive(Debug)]
pub(crate) enum ActionError {
    /// Missing/invalid payload field, unknown action, bad enum value.
    Validation(String),
    /// Idempotency key reuse with a different content hash. Surfaced apart
    /// from plain validation so callers can tell "conflicting reuse" from
    /// "missing field".
    Conflict {
        message: String,
        prior: serde_json::Value,
    },
    /// The backend ran and failed: nonzero exit, failed HTTP status,
    /// transport error, or timeout.
    Backend {
        message: String,
        detail: serde_json::Value,
    },
}

impl ActionError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        ActionError::Validation(message.into())
    }

    pub(crate) fn backend(message: impl Into<String>, detail: serde_json::Value) -> Self {
        ActionError::Backend {
            message: message.into(),
            detail,
        }
    }

    pub(crate) fn exit_code(&self) -> i32 {
        match self {
            ActionError::Validation(_) | ActionError::Conflict { .. } => EXIT_VALIDATION,
            ActionError::Backend { .. } => EXIT_BACKEND,
        }
    }

    pub(crate) fn into_extra(self) -> serde_json::Value {
        match self {
            ActionError::Validation(message) => serde_json::json!({ "error": message }),
            ActionError::Conflict { message, prior } => serde_json::json!({
                "error": message,
                "conflict": true,
                "prior": prior,
            }),
            ActionError::Backend { message, detail } => {
                let mut extra = serde_json::json!({ "error": message });
                if let (Some(map), Some(detail_map)) = (extra.as_object_mut(), detail.as_object())
                {
                    for (key, value) in detail_map {
                        map.insert(key.clone(), value.clone());
                    }
                }
                extra
            }
        }
    }
}

/// The finished verdict for one request: the response body to print and the
/// process exit code to return.
#[derive(Debug)]
pub(crate) struct Dispatch {
    pub(crate) exit_code: i32,
    pub(crate) body: serde_json::Value,
}

pub(crate) fn finish_dispatch(
    domain: &str,
    action: &str,
    result: Result<serde_json::Value, ActionError>,
) -> Dispatch {
    match result {
        Ok(extra) => Dispatch {
            exit_code: EXIT_OK,
            body: build_response(domain, action, true, extra),
        },
        Err(err) => {
            let exit_code = err.exit_code();
            Dispatch {
                exit_code,
                body: build_response(domain, action, false, err.into_extra()),
            }
        }
    }
}

/// Standard rejection for an action name outside a router's enumerated set.
/// The response lists the supported actions so the caller can self-correct.
pub(crate) fn unknown_action(action: &str, supported: &[&str]) -> ActionError {
    ActionError::Validation(format!(
        "unknown action '{action}' (supported: {})",
        supported.join(", ")
    ))
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_envelope() {
        let raw = r#"{
            "version": 1,
            "domain": "mail",
            "action": "list_messages",
            "payload": {"folder": "INBOX"},
            "idempotencyKey": "k-123",
            "meta": {"tool": "summarizer"}
        }"#;
        let env = parse_envelope(raw).unwrap();
        assert_eq!(env.version, 1);
        assert_eq!(env.domain.as_deref(), Some("mail"));
        assert_eq!(env.action, "list_messages");
        assert_eq!(env.payload["folder"], "INBOX");
        assert_eq!(env.idempotency_key.as_deref(), Some("k-123"));
    }

    #[test]
    fn parse_defaults_version_and_payload() {
        let env = parse_envelope(r#"{"action": "health"}"#).unwrap();
        assert_eq!(env.version, PROTOCOL_VERSION);
        assert!(env.payload.is_null());
        assert!(env.idempotency_key.is_none());
    }

    #[test]
    fn malformed_json_is_distinct_from_missing_action() {
        assert!(matches!(
            parse_envelope("{nope"),
            Err(EnvelopeError::Malformed(_))
        ));
        assert!(matches!(
            parse_envelope(r#"[1, 2]"#),
            Err(EnvelopeError::Malformed(_))
        ));
        assert!(matches!(
            parse_envelope(r#"{"payload": {}}"#),
            Err(EnvelopeError::MissingAction)
        ));
        assert!(matches!(
            parse_envelope(r#"{"action": "  "}"#),
            Err(EnvelopeError::MissingAction)
        ));
    }

    #[test]
    fn bad_version_rejected() {
        assert!(matches!(
            parse_envelope(r#"{"action": "health", "version": 2}"#),
            Err(EnvelopeError::BadVersion(2))
        ));
    }

    #[test]
    fn build_response_merges_extra() {
        let body = build_response(
            "notes",
            "create_note",
            true,
            serde_json::json!({"noteId": "n1", "durationMs": 12}),
        );
        assert_eq!(body["ok"], true);
        assert_eq!(body["domain"], "notes");
        assert_eq!(body["action"], "create_note");
        assert_eq!(body["noteId"], "n1");
    }

    #[test]
    fn response_round_trips_as_json() {
        let body = build_response("mail", "health", true, serde_json::json!({"data": []}));
        let text = serde_json::to_string(&body).unwrap();
        let back: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back["ok"], true);
        assert_eq!(back["domain"], "mail");
        assert_eq!(back["action"], "health");
    }

    #[test]
    fn conflict_maps_to_validation_exit_with_marker() {
        let err = ActionError::Conflict {
            message: "idempotency key reused with different content".to_string(),
            prior: serde_json::json!({"contentHash": "abc"}),
        };
        assert_eq!(err.exit_code(), EXIT_VALIDATION);
        let extra = err.into_extra();
        assert_eq!(extra["conflict"], true);
        assert_eq!(extra["prior"]["contentHash"], "abc");
    }

    #[test]
    fn backend_error_maps_to_backend_exit() {
        let err = ActionError::backend("himalaya exited 1", serde_json::json!({"exitCode": 1}));
        assert_eq!(err.exit_code(), EXIT_BACKEND);
        let extra = err.into_extra();
        assert_eq!(extra["error"], "himalaya exited 1");
        assert_eq!(extra["exitCode"], 1);
    }

    #[test]
    fn unknown_action_lists_supported_set() {
        let err = unknown_action("explode", &["health", "list_messages"]);
        let extra = err.into_extra();
        let message = extra["error"].as_str().unwrap();
        assert!(message.contains("explode"));
        assert!(message.contains("health, list_messages"));
    }
}
