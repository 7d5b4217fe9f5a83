use std::path::Path;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::config::Settings;
use crate::envelope::{ActionError, Dispatch, finish_dispatch, unknown_action};
use crate::exec::{HttpOutcome, http_call};
use crate::rate_limit::RateLimiter;
use crate::state::tail_excerpt;

pub(crate) const NOTES_ACTIONS: &[&str] = &[
    "health",
    "create_doc",
    "update_doc",
    "set_doc",
    "create_note",
    "edit_note",
    "set_note",
    "upload_prepare",
    "upload_url",
];

/// Actions the backend has no safe counterpart for. Rejected loudly instead
/// of degrading to a partial implementation.
const REJECTED_ACTIONS: &[(&str, &str)] = &[
    ("append_doc", "the backend has no append operation; read-modify-write via edit_note instead"),
    ("read_doc", "the backend exposes no document read endpoint"),
    ("search", "the backend exposes no search endpoint"),
    ("list_spaces", "the backend has no spaces listing"),
];

const RATE_KEY_NOTE: &str = "note.write";
const RATE_KEY_UPLOAD: &str = "upload.write";

const BODY_EXCERPT_CHARS: usize = 4_000;

/// Stable external names normalize to the backend's native ones before
/// dispatch; the normalized name is echoed in the response for traceability.
pub(crate) fn normalize_action(action: &str) -> Option<&'static str> {
    match action {
        "create_doc" | "create_note" => Some("create_note"),
        "update_doc" | "edit_note" => Some("edit_note"),
        "set_doc" | "set_note" => Some("set_note"),
        "upload_prepare" => Some("upload_prepare"),
        "upload_url" => Some("upload_url"),
        "health" => Some("health"),
        _ => None,
    }
}

// ── Payloads ─────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct NoteWritePayload {
    title: Option<String>,
    author: Option<String>,
    /// Target for edit_note.
    note_id: Option<String>,
    /// Target for set_note (create-or-replace at a stable slug).
    slug: Option<String>,
    /// Body sources, exactly one of which must be supplied.
    body: Option<serde_json::Value>,
    document: Option<serde_json::Value>,
    paragraphs: Option<Vec<serde_json::Value>>,
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct UploadPreparePayload {
    filename: Option<String>,
    content_type: Option<String>,
    byte_size: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct UploadUrlPayload {
    url: Option<String>,
}

fn parse_payload<T: DeserializeOwned>(payload: &serde_json::Value) -> Result<T, ActionError> {
    let value = if payload.is_null() {
        serde_json::json!({})
    } else {
        payload.clone()
    };
    serde_json::from_value(value).map_err(|e| ActionError::validation(format!("payload: {e}")))
}

// ── Document body construction ───────────────────────────────────────────

/// Build the structured document content from whichever source the payload
/// carries. Sources in priority order: a fully-formed `body`, a named
/// `document`, a `paragraphs` array (strings or ready-made nodes), or flat
/// `text` split on newlines into one paragraph per line. Supplying more than
/// one is ambiguous and rejected; supplying none fails before any network
/// call is made.
fn build_document_content(payload: &NoteWritePayload) -> Result<serde_json::Value, ActionError> {
    let mut provided: Vec<&str> = Vec::new();
    if payload.body.is_some() {
        provided.push("body");
    }
    if payload.document.is_some() {
        provided.push("document");
    }
    if payload.paragraphs.is_some() {
        provided.push("paragraphs");
    }
    if payload.text.is_some() {
        provided.push("text");
    }
    if provided.is_empty() {
        return Err(ActionError::validation(
            "one of 'body', 'document', 'paragraphs', or 'text' is required",
        ));
    }
    if provided.len() > 1 {
        return Err(ActionError::validation(format!(
            "ambiguous document body: got {}, supply exactly one",
            provided.join(" and ")
        )));
    }

    if let Some(body) = &payload.body {
        if !body.is_object() && !body.is_array() {
            return Err(ActionError::validation(
                "'body' must be a structured document object or node array",
            ));
        }
        return Ok(body.clone());
    }
    if let Some(document) = &payload.document {
        if !document.is_object() && !document.is_array() {
            return Err(ActionError::validation(
                "'document' must be a structured document object or node array",
            ));
        }
        return Ok(document.clone());
    }
    if let Some(paragraphs) = &payload.paragraphs {
        if paragraphs.is_empty() {
            return Err(ActionError::validation("'paragraphs' must not be empty"));
        }
        let nodes: Vec<serde_json::Value> = paragraphs
            .iter()
            .map(|item| match item {
                serde_json::Value::String(text) => paragraph_node(text),
                node => node.clone(),
            })
            .collect();
        return Ok(serde_json::Value::Array(nodes));
    }

    let text = payload.text.as_deref().unwrap_or_default();
    if text.trim().is_empty() {
        return Err(ActionError::validation("'text' must not be empty"));
    }
    let nodes: Vec<serde_json::Value> = text.lines().map(paragraph_node).collect();
    Ok(serde_json::Value::Array(nodes))
}

fn paragraph_node(text: &str) -> serde_json::Value {
    serde_json::json!({ "type": "paragraph", "text": text })
}

// ── Response normalization ───────────────────────────────────────────────

/// Ordered lookup paths for the note identifier. Backend responses have
/// drifted between flat and nested shapes; keeping the probe list in one
/// place makes the next drift a one-line fix.
const NOTE_ID_PATHS: &[&[&str]] = &[
    &["noteId"],
    &["id"],
    &["data", "noteId"],
    &["data", "id"],
    &["result", "noteId"],
    &["result", "id"],
    &["note", "noteId"],
    &["note", "id"],
];

pub(crate) fn extract_note_id(response: &serde_json::Value) -> Option<String> {
    for path in NOTE_ID_PATHS {
        let mut cursor = response;
        let mut found = true;
        for segment in *path {
            match cursor.get(segment) {
                Some(next) => cursor = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if !found {
            continue;
        }
        match cursor {
            serde_json::Value::String(id) if !id.is_empty() => return Some(id.clone()),
            serde_json::Value::Number(id) => return Some(id.to_string()),
            _ => {}
        }
    }
    None
}

// ── HTTP execution ───────────────────────────────────────────────────────

fn api_key(settings: &Settings) -> Result<String, ActionError> {
    settings.notes_api_key().ok_or_else(|| {
        ActionError::backend(
            "notes api key not configured (set DESKRELAY_NOTES_API_KEY or notes.apiKey)",
            serde_json::json!({ "configured": false }),
        )
    })
}

fn classify_http(outcome: &HttpOutcome) -> Result<serde_json::Value, ActionError> {
    if let Some(transport) = &outcome.transport_error {
        return Err(ActionError::backend(
            format!("notes transport failure: {transport}"),
            serde_json::json!({
                "transport": true,
                "durationMs": outcome.duration_ms,
            }),
        ));
    }
    if !outcome.success() {
        return Err(ActionError::backend(
            format!(
                "notes api returned status {}",
                outcome.status.unwrap_or_default()
            ),
            serde_json::json!({
                "httpStatus": outcome.status,
                "body": tail_excerpt(&outcome.body, BODY_EXCERPT_CHARS),
                "durationMs": outcome.duration_ms,
            }),
        ));
    }
    Ok(serde_json::from_str(&outcome.body)
        .unwrap_or_else(|_| serde_json::json!({ "raw": outcome.body })))
}

/// Every non-health write goes through here: rate limit first, then one
/// bounded-duration request.
fn api_post(
    settings: &Settings,
    state_dir: &Path,
    rate_key: &str,
    min_interval_ms: u64,
    method: &str,
    path: &str,
    body: serde_json::Value,
    timeout_ms: u64,
) -> Result<(HttpOutcome, serde_json::Value), ActionError> {
    let key = api_key(settings)?;
    RateLimiter::new(state_dir)
        .acquire(rate_key, min_interval_ms)
        .map_err(|e| ActionError::backend(format!("rate limiter: {e}"), serde_json::Value::Null))?;

    let url = format!("{}{}", settings.notes_api_base(), path);
    let headers = vec![
        ("authorization".to_string(), format!("Bearer {key}")),
        ("content-type".to_string(), "application/json".to_string()),
    ];
    let outcome = http_call(method, &url, &headers, Some(&body), timeout_ms);
    let parsed = classify_http(&outcome)?;
    Ok((outcome, parsed))
}

fn http_meta(outcome: &HttpOutcome) -> serde_json::Value {
    serde_json::json!({
        "httpStatus": outcome.status,
        "durationMs": outcome.duration_ms,
    })
}

// ── Router ───────────────────────────────────────────────────────────────

pub(crate) fn dispatch(
    action: &str,
    payload: &serde_json::Value,
    settings: &Settings,
    state_dir: &Path,
    timeout_override: Option<u64>,
) -> Dispatch {
    let result = route(action, payload, settings, state_dir, timeout_override);
    finish_dispatch("notes", action, result)
}

fn route(
    action: &str,
    payload: &serde_json::Value,
    settings: &Settings,
    state_dir: &Path,
    timeout_override: Option<u64>,
) -> Result<serde_json::Value, ActionError> {
    if let Some((_, reason)) = REJECTED_ACTIONS.iter().find(|(name, _)| *name == action) {
        return Err(ActionError::validation(format!(
            "action '{action}' is not supported: {reason} (supported: {})",
            NOTES_ACTIONS.join(", ")
        )));
    }
    let Some(normalized) = normalize_action(action) else {
        return Err(unknown_action(action, NOTES_ACTIONS));
    };
    let timeout_ms = settings.notes_timeout_ms(timeout_override);

    match normalized {
        // Purely local: reports whether an API key is configured without
        // spending quota on a status question.
        "health" => match settings.notes_api_key() {
            Some(_) => Ok(serde_json::json!({
                "configured": true,
                "apiBase": settings.notes_api_base(),
            })),
            None => Err(ActionError::backend(
                "notes api key not configured",
                serde_json::json!({ "configured": false }),
            )),
        },
        "create_note" => {
            let parsed: NoteWritePayload = parse_payload(payload)?;
            let content = build_document_content(&parsed)?;
            let mut body = serde_json::json!({ "content": content });
            if let Some(map) = body.as_object_mut() {
                if let Some(title) = &parsed.title {
                    map.insert("title".to_string(), serde_json::json!(title));
                }
                if let Some(author) = &parsed.author {
                    map.insert("author".to_string(), serde_json::json!(author));
                }
            }
            let (outcome, response) = api_post(
                settings,
                state_dir,
                RATE_KEY_NOTE,
                settings.note_write_interval_ms(),
                "POST",
                "/notes",
                body,
                timeout_ms,
            )?;
            Ok(write_response(normalized, &outcome, response))
        }
        "edit_note" => {
            let parsed: NoteWritePayload = parse_payload(payload)?;
            let note_id = parsed
                .note_id
                .as_deref()
                .filter(|id| !id.trim().is_empty())
                .ok_or_else(|| ActionError::validation("edit_note requires 'noteId'"))?
                .to_string();
            let content = build_document_content(&parsed)?;
            let mut body = serde_json::json!({ "content": content });
            if let (Some(map), Some(title)) = (body.as_object_mut(), &parsed.title) {
                map.insert("title".to_string(), serde_json::json!(title));
            }
            let path = format!("/notes/{}/edit", urlencoding::encode(&note_id));
            let (outcome, response) = api_post(
                settings,
                state_dir,
                RATE_KEY_NOTE,
                settings.note_write_interval_ms(),
                "POST",
                &path,
                body,
                timeout_ms,
            )?;
            Ok(write_response(normalized, &outcome, response))
        }
        "set_note" => {
            let parsed: NoteWritePayload = parse_payload(payload)?;
            let slug = parsed
                .slug
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| ActionError::validation("set_note requires 'slug'"))?
                .to_string();
            let content = build_document_content(&parsed)?;
            let mut body = serde_json::json!({ "content": content });
            if let (Some(map), Some(title)) = (body.as_object_mut(), &parsed.title) {
                map.insert("title".to_string(), serde_json::json!(title));
            }
            let path = format!("/notes/{}", urlencoding::encode(&slug));
            let (outcome, response) = api_post(
                settings,
                state_dir,
                RATE_KEY_NOTE,
                settings.note_write_interval_ms(),
                "PUT",
                &path,
                body,
                timeout_ms,
            )?;
            Ok(write_response(normalized, &outcome, response))
        }
        "upload_prepare" => {
            let parsed: UploadPreparePayload = parse_payload(payload)?;
            let filename = parsed
                .filename
                .as_deref()
                .filter(|f| !f.trim().is_empty())
                .ok_or_else(|| ActionError::validation("upload_prepare requires 'filename'"))?;
            let mut body = serde_json::json!({ "filename": filename });
            if let Some(map) = body.as_object_mut() {
                if let Some(content_type) = &parsed.content_type {
                    map.insert("contentType".to_string(), serde_json::json!(content_type));
                }
                if let Some(byte_size) = parsed.byte_size {
                    map.insert("byteSize".to_string(), serde_json::json!(byte_size));
                }
            }
            let (outcome, response) = api_post(
                settings,
                state_dir,
                RATE_KEY_UPLOAD,
                settings.upload_write_interval_ms(),
                "POST",
                "/uploads",
                body,
                timeout_ms,
            )?;
            Ok(serde_json::json!({
                "backendAction": normalized,
                "response": response,
                "http": http_meta(&outcome),
            }))
        }
        "upload_url" => {
            let parsed: UploadUrlPayload = parse_payload(payload)?;
            let raw_url = parsed
                .url
                .as_deref()
                .filter(|u| !u.trim().is_empty())
                .ok_or_else(|| ActionError::validation("upload_url requires 'url'"))?;
            let source = url::Url::parse(raw_url)
                .map_err(|e| ActionError::validation(format!("invalid 'url': {e}")))?;
            if !matches!(source.scheme(), "http" | "https") {
                return Err(ActionError::validation(
                    "'url' must use http or https",
                ));
            }
            let body = serde_json::json!({ "url": source.as_str() });
            let (outcome, response) = api_post(
                settings,
                state_dir,
                RATE_KEY_UPLOAD,
                settings.upload_write_interval_ms(),
                "POST",
                "/uploads/url",
                body,
                timeout_ms,
            )?;
            Ok(serde_json::json!({
                "backendAction": normalized,
                "response": response,
                "http": http_meta(&outcome),
            }))
        }
        other => Err(unknown_action(other, NOTES_ACTIONS)),
    }
}

fn write_response(
    normalized: &str,
    outcome: &HttpOutcome,
    response: serde_json::Value,
) -> serde_json::Value {
    let note_id = extract_note_id(&response);
    serde_json::json!({
        "backendAction": normalized,
        "noteId": note_id,
        "response": response,
        "http": http_meta(outcome),
    })
}

// ── Tests ────────────────────────────────────────────────────────────────
