use std::path::Path;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::config::Settings;
use crate::envelope::{ActionError, Dispatch, finish_dispatch, unknown_action};
use crate::exec::{
    ExecOptions, ExecOutcome, backend_failure, parse_stdout_json, run_command,
};
use crate::idempotency::IdempotencyStore;

pub(crate) const MAIL_ACTIONS: &[&str] = &[
    "health",
    "list_accounts",
    "list_folders",
    "list_messages",
    "search",
    "get_message",
    "draft_reply",
    "send_message",
    "archive",
    "delete_messages",
    "purge_folder",
    "mark_read",
    "label",
];

const DEFAULT_PAGE: i64 = 1;
const DEFAULT_PAGE_SIZE: i64 = 50;
const ARCHIVE_FOLDER: &str = "Archive";

/// One fully-built backend invocation: args appended to the configured mail
/// command, plus optional text piped to stdin. Pure data so action-to-command
/// mapping is testable without a live binary.
#[derive(Debug, PartialEq)]
pub(crate) struct MailInvocation {
    pub(crate) args: Vec<String>,
    pub(crate) stdin_text: Option<String>,
}

impl MailInvocation {
    fn new(args: Vec<String>) -> Self {
        MailInvocation {
            args,
            stdin_text: None,
        }
    }
}

// ── Payloads ─────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ScopePayload {
    account: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ListPayload {
    account: Option<String>,
    folder: Option<String>,
    page: Option<i64>,
    page_size: Option<i64>,
    query: Option<String>,
    query_tokens: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetMessagePayload {
    id: String,
    #[serde(default)]
    account: Option<String>,
    #[serde(default)]
    folder: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DraftReplyPayload {
    id: String,
    #[serde(default)]
    account: Option<String>,
    #[serde(default)]
    folder: Option<String>,
    /// Reply to all recipients instead of just the sender.
    #[serde(default)]
    all: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SendPayload {
    account: Option<String>,
    /// Raw pre-formatted message, used verbatim when present.
    template: Option<String>,
    from: Option<String>,
    to: Option<String>,
    cc: Option<String>,
    bcc: Option<String>,
    in_reply_to: Option<String>,
    references: Option<String>,
    subject: Option<String>,
    body: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BatchPayload {
    account: Option<String>,
    folder: Option<String>,
    id: Option<String>,
    ids: Vec<String>,
    label: Option<String>,
    /// For `label`: remove the flag instead of adding it.
    remove: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PurgePayload {
    folder: String,
    #[serde(default)]
    account: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct HealthPayload {
    account: Option<String>,
    folder: Option<String>,
    /// Also run a 1-item listing as a live probe.
    deep: bool,
}

fn parse_payload<T: DeserializeOwned>(payload: &serde_json::Value) -> Result<T, ActionError> {
    let value = if payload.is_null() {
        serde_json::json!({})
    } else {
        payload.clone()
    };
    serde_json::from_value(value).map_err(|e| ActionError::validation(format!("payload: {e}")))
}

// ── Command builders ─────────────────────────────────────────────────────

fn push_account(args: &mut Vec<String>, account: &Option<String>) {
    if let Some(account) = account {
        args.push("--account".to_string());
        args.push(account.clone());
    }
}

fn push_folder(args: &mut Vec<String>, folder: &Option<String>) {
    if let Some(folder) = folder {
        args.push("--folder".to_string());
        args.push(folder.clone());
    }
}

fn page_defaults(page: Option<i64>, page_size: Option<i64>) -> (i64, i64) {
    let page = page.filter(|p| *p > 0).unwrap_or(DEFAULT_PAGE);
    let page_size = page_size.filter(|s| *s > 0).unwrap_or(DEFAULT_PAGE_SIZE);
    (page, page_size)
}

fn query_tokens(payload: &ListPayload) -> Vec<String> {
    if !payload.query_tokens.is_empty() {
        return payload.query_tokens.clone();
    }
    payload
        .query
        .as_deref()
        .map(|q| q.split_whitespace().map(|t| t.to_string()).collect())
        .unwrap_or_default()
}

fn build_list_accounts(payload: &ScopePayload) -> MailInvocation {
    let mut args = vec![
        "account".to_string(),
        "list".to_string(),
        "--output".to_string(),
        "json".to_string(),
    ];
    push_account(&mut args, &payload.account);
    MailInvocation::new(args)
}

fn build_list_folders(payload: &ScopePayload) -> MailInvocation {
    let mut args = vec![
        "folder".to_string(),
        "list".to_string(),
        "--output".to_string(),
        "json".to_string(),
    ];
    push_account(&mut args, &payload.account);
    MailInvocation::new(args)
}

fn build_listing(payload: &ListPayload, settings: &Settings, tokens: Vec<String>) -> MailInvocation {
    let folder = payload.folder.clone().unwrap_or_else(|| settings.mail_folder());
    let (page, page_size) = page_defaults(payload.page, payload.page_size);
    let mut args = vec![
        "envelope".to_string(),
        "list".to_string(),
        "--folder".to_string(),
        folder,
        "--page".to_string(),
        page.to_string(),
        "--page-size".to_string(),
        page_size.to_string(),
        "--output".to_string(),
        "json".to_string(),
    ];
    push_account(&mut args, &payload.account);
    args.extend(tokens);
    MailInvocation::new(args)
}

fn build_get_message(payload: &GetMessagePayload) -> MailInvocation {
    let mut args = vec![
        "message".to_string(),
        "read".to_string(),
        payload.id.clone(),
        "--output".to_string(),
        "json".to_string(),
    ];
    push_folder(&mut args, &payload.folder);
    push_account(&mut args, &payload.account);
    MailInvocation::new(args)
}

fn build_draft_reply(payload: &DraftReplyPayload) -> MailInvocation {
    let mut args = vec![
        "template".to_string(),
        "reply".to_string(),
        payload.id.clone(),
    ];
    if payload.all {
        args.push("--all".to_string());
    }
    push_folder(&mut args, &payload.folder);
    push_account(&mut args, &payload.account);
    MailInvocation::new(args)
}

/// Render the outgoing message: the raw `template` verbatim, or the
/// structured header fields assembled into one. The returned text is both
/// what the backend sends and what the content hash covers.
fn render_send_template(payload: &SendPayload) -> Result<String, ActionError> {
    if let Some(template) = &payload.template {
        if template.trim().is_empty() {
            return Err(ActionError::validation("template must not be empty"));
        }
        return Ok(template.clone());
    }

    let to = payload
        .to
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ActionError::validation("send_message requires 'to' (or a raw 'template')"))?;
    let subject = payload
        .subject
        .as_deref()
        .ok_or_else(|| ActionError::validation("send_message requires 'subject'"))?;
    let body = payload
        .body
        .as_deref()
        .ok_or_else(|| ActionError::validation("send_message requires 'body'"))?;

    let mut template = String::new();
    if let Some(from) = &payload.from {
        template.push_str(&format!("From: {from}\n"));
    }
    template.push_str(&format!("To: {to}\n"));
    if let Some(cc) = &payload.cc {
        template.push_str(&format!("Cc: {cc}\n"));
    }
    if let Some(bcc) = &payload.bcc {
        template.push_str(&format!("Bcc: {bcc}\n"));
    }
    if let Some(in_reply_to) = &payload.in_reply_to {
        template.push_str(&format!("In-Reply-To: {in_reply_to}\n"));
    }
    if let Some(references) = &payload.references {
        template.push_str(&format!("References: {references}\n"));
    }
    template.push_str(&format!("Subject: {subject}\n"));
    template.push('\n');
    template.push_str(body);
    template.push('\n');
    Ok(template)
}

fn build_send(template: String, account: &Option<String>) -> MailInvocation {
    let mut args = vec!["template".to_string(), "send".to_string()];
    push_account(&mut args, account);
    MailInvocation {
        args,
        stdin_text: Some(template),
    }
}

/// `ids` wins when both are given; the singular `id` only seeds the batch.
fn batch_ids(payload: &BatchPayload) -> Result<Vec<String>, ActionError> {
    if !payload.ids.is_empty() {
        return Ok(payload.ids.clone());
    }
    if let Some(id) = &payload.id {
        if !id.trim().is_empty() {
            return Ok(vec![id.clone()]);
        }
    }
    Err(ActionError::validation(
        "at least one message id required ('id' or 'ids')",
    ))
}

fn build_archive(payload: &BatchPayload, ids: &[String]) -> MailInvocation {
    let mut args = vec!["message".to_string(), "move".to_string()];
    args.extend(ids.iter().cloned());
    args.push(ARCHIVE_FOLDER.to_string());
    push_folder(&mut args, &payload.folder);
    push_account(&mut args, &payload.account);
    MailInvocation::new(args)
}

fn build_delete(payload: &BatchPayload, ids: &[String]) -> MailInvocation {
    let mut args = vec!["message".to_string(), "delete".to_string()];
    args.extend(ids.iter().cloned());
    push_folder(&mut args, &payload.folder);
    push_account(&mut args, &payload.account);
    MailInvocation::new(args)
}

fn build_flag(payload: &BatchPayload, ids: &[String], flag: &str, remove: bool) -> MailInvocation {
    let op = if remove { "remove" } else { "add" };
    let mut args = vec!["flag".to_string(), op.to_string()];
    args.extend(ids.iter().cloned());
    args.push(flag.to_string());
    push_folder(&mut args, &payload.folder);
    push_account(&mut args, &payload.account);
    MailInvocation::new(args)
}

fn build_purge(payload: &PurgePayload) -> Result<MailInvocation, ActionError> {
    if payload.folder.trim().is_empty() {
        return Err(ActionError::validation("purge_folder requires 'folder'"));
    }
    let mut args = vec![
        "folder".to_string(),
        "purge".to_string(),
        payload.folder.clone(),
    ];
    push_account(&mut args, &payload.account);
    Ok(MailInvocation::new(args))
}

// ── Execution ────────────────────────────────────────────────────────────

fn run_mail(
    invocation: &MailInvocation,
    settings: &Settings,
    timeout_ms: u64,
) -> Result<(ExecOutcome, serde_json::Value), ActionError> {
    let (program, mut args) = settings.mail_command();
    args.extend(invocation.args.iter().cloned());
    let opts = ExecOptions {
        timeout_ms,
        stdin_text: invocation.stdin_text.clone(),
        ..Default::default()
    };
    let outcome = run_command(&program, &args, &opts)
        .map_err(|e| ActionError::backend(e, serde_json::json!({ "transport": true })))?;
    if !outcome.success() {
        return Err(backend_failure(&program, &outcome));
    }
    let parsed = parse_stdout_json(&outcome.stdout);
    Ok((outcome, parsed))
}

fn data_response(outcome: &ExecOutcome, parsed: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "data": parsed,
        "exec": outcome.meta_json(),
    })
}

// ── Router ───────────────────────────────────────────────────────────────

pub(crate) fn dispatch(
    action: &str,
    payload: &serde_json::Value,
    idempotency_key: Option<&str>,
    settings: &Settings,
    state_dir: &Path,
    timeout_override: Option<u64>,
) -> Dispatch {
    let result = route(
        action,
        payload,
        idempotency_key,
        settings,
        state_dir,
        timeout_override,
    );
    finish_dispatch("mail", action, result)
}

fn route(
    action: &str,
    payload: &serde_json::Value,
    idempotency_key: Option<&str>,
    settings: &Settings,
    state_dir: &Path,
    timeout_override: Option<u64>,
) -> Result<serde_json::Value, ActionError> {
    let timeout_ms = settings.mail_timeout_ms(timeout_override);
    match action {
        "health" => {
            let parsed: HealthPayload = parse_payload(payload)?;
            health(&parsed, settings, timeout_ms)
        }
        "list_accounts" => {
            let parsed: ScopePayload = parse_payload(payload)?;
            let (outcome, data) = run_mail(&build_list_accounts(&parsed), settings, timeout_ms)?;
            Ok(data_response(&outcome, data))
        }
        "list_folders" => {
            let parsed: ScopePayload = parse_payload(payload)?;
            let (outcome, data) = run_mail(&build_list_folders(&parsed), settings, timeout_ms)?;
            Ok(data_response(&outcome, data))
        }
        "list_messages" => {
            let parsed: ListPayload = parse_payload(payload)?;
            let tokens = query_tokens(&parsed);
            let (outcome, data) =
                run_mail(&build_listing(&parsed, settings, tokens), settings, timeout_ms)?;
            Ok(data_response(&outcome, data))
        }
        "search" => {
            let parsed: ListPayload = parse_payload(payload)?;
            let tokens = query_tokens(&parsed);
            if tokens.is_empty() {
                return Err(ActionError::validation(
                    "search requires 'query' or 'queryTokens'",
                ));
            }
            let (outcome, data) =
                run_mail(&build_listing(&parsed, settings, tokens), settings, timeout_ms)?;
            Ok(data_response(&outcome, data))
        }
        "get_message" => {
            let parsed: GetMessagePayload = parse_payload(payload)?;
            let (outcome, data) = run_mail(&build_get_message(&parsed), settings, timeout_ms)?;
            Ok(data_response(&outcome, data))
        }
        "draft_reply" => {
            let parsed: DraftReplyPayload = parse_payload(payload)?;
            let (outcome, _) = run_mail(&build_draft_reply(&parsed), settings, timeout_ms)?;
            Ok(serde_json::json!({
                "template": outcome.stdout,
                "exec": outcome.meta_json(),
            }))
        }
        "send_message" => {
            let parsed: SendPayload = parse_payload(payload)?;
            send_message(&parsed, idempotency_key, settings, state_dir, timeout_ms)
        }
        "archive" => {
            let parsed: BatchPayload = parse_payload(payload)?;
            let ids = batch_ids(&parsed)?;
            let (outcome, data) =
                run_mail(&build_archive(&parsed, &ids), settings, timeout_ms)?;
            Ok(batch_response(&ids, &outcome, data))
        }
        "delete_messages" => {
            let parsed: BatchPayload = parse_payload(payload)?;
            let ids = batch_ids(&parsed)?;
            let (outcome, data) = run_mail(&build_delete(&parsed, &ids), settings, timeout_ms)?;
            Ok(batch_response(&ids, &outcome, data))
        }
        "mark_read" => {
            let parsed: BatchPayload = parse_payload(payload)?;
            let ids = batch_ids(&parsed)?;
            let (outcome, data) =
                run_mail(&build_flag(&parsed, &ids, "seen", false), settings, timeout_ms)?;
            Ok(batch_response(&ids, &outcome, data))
        }
        "label" => {
            let parsed: BatchPayload = parse_payload(payload)?;
            let ids = batch_ids(&parsed)?;
            let label = parsed
                .label
                .as_deref()
                .filter(|l| !l.trim().is_empty())
                .ok_or_else(|| ActionError::validation("label requires 'label'"))?
                .to_string();
            let remove = parsed.remove;
            let (outcome, data) =
                run_mail(&build_flag(&parsed, &ids, &label, remove), settings, timeout_ms)?;
            Ok(batch_response(&ids, &outcome, data))
        }
        "purge_folder" => {
            let parsed: PurgePayload = parse_payload(payload)?;
            let invocation = build_purge(&parsed)?;
            let (outcome, data) = run_mail(&invocation, settings, timeout_ms)?;
            Ok(serde_json::json!({
                "folder": parsed.folder,
                "data": data,
                "exec": outcome.meta_json(),
            }))
        }
        other => Err(unknown_action(other, MAIL_ACTIONS)),
    }
}

/// Batch actions are one backend invocation over every id; there is no
/// per-id result stream, so failure reports the whole batch failed.
fn batch_response(
    ids: &[String],
    outcome: &ExecOutcome,
    data: serde_json::Value,
) -> serde_json::Value {
    serde_json::json!({
        "ids": ids,
        "count": ids.len(),
        "data": data,
        "exec": outcome.meta_json(),
    })
}

fn health(
    payload: &HealthPayload,
    settings: &Settings,
    timeout_ms: u64,
) -> Result<serde_json::Value, ActionError> {
    let config_path = settings.mail_config_path();
    if !config_path.exists() {
        return Err(ActionError::backend(
            format!("mail config not found at {}", config_path.display()),
            serde_json::json!({ "configPath": config_path.display().to_string() }),
        ));
    }

    let version_inv = MailInvocation::new(vec!["--version".to_string()]);
    let (version_outcome, _) = run_mail(&version_inv, settings, timeout_ms)?;

    let mut response = serde_json::json!({
        "configPath": config_path.display().to_string(),
        "binaryVersion": version_outcome.stdout.trim(),
        "deep": payload.deep,
        "exec": version_outcome.meta_json(),
    });

    if payload.deep {
        let listing = ListPayload {
            account: payload.account.clone(),
            folder: payload.folder.clone(),
            page: Some(1),
            page_size: Some(1),
            ..Default::default()
        };
        let (probe_outcome, probe_data) =
            run_mail(&build_listing(&listing, settings, Vec::new()), settings, timeout_ms)?;
        if let Some(map) = response.as_object_mut() {
            map.insert("probe".to_string(), probe_data);
            map.insert("probeExec".to_string(), probe_outcome.meta_json());
        }
    }

    Ok(response)
}

fn send_message(
    payload: &SendPayload,
    idempotency_key: Option<&str>,
    settings: &Settings,
    state_dir: &Path,
    timeout_ms: u64,
) -> Result<serde_json::Value, ActionError> {
    let template = render_send_template(payload)?;
    let content_hash = blake3::hash(template.as_bytes()).to_hex().to_string();
    let account = payload
        .account
        .clone()
        .or_else(|| settings.mail.account.clone())
        .unwrap_or_else(|| "default".to_string());

    let mut store = None;
    let mut composite = None;
    if let Some(key) = idempotency_key {
        let opened = IdempotencyStore::open(state_dir);
        let full_key = IdempotencyStore::compose_key(&account, "send_message", key);
        let check = opened.check(&full_key, &content_hash);
        if check.conflict {
            let prior = opened
                .get(&full_key)
                .map(|record| {
                    serde_json::json!({ "contentHash": record.content_hash, "ts": record.ts })
                })
                .unwrap_or(serde_json::Value::Null);
            return Err(ActionError::Conflict {
                message: format!(
                    "idempotency key '{key}' was already used with different content"
                ),
                prior,
            });
        }
        if let Some(prior) = check.duplicate {
            // Already sent once: succeed without touching the backend.
            return Ok(serde_json::json!({
                "duplicate": true,
                "contentHash": content_hash,
                "data": prior.result,
                "exec": prior.exec,
            }));
        }
        store = Some(opened);
        composite = Some(full_key);
    }

    let invocation = build_send(template, &payload.account);
    let (outcome, data) = run_mail(&invocation, settings, timeout_ms)?;

    if let (Some(store), Some(key)) = (store.as_mut(), composite.as_deref()) {
        // The send already happened; a persist failure must not fail the
        // call and push the caller into a retry/double-send.
        if let Err(err) = store.record(key, &content_hash, outcome.meta_json(), data.clone()) {
            eprintln!("[mail] idempotency record failed: {err}");
        }
    }

    Ok(serde_json::json!({
        "duplicate": false,
        "contentHash": content_hash,
        "data": data,
        "exec": outcome.meta_json(),
    }))
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MailSettings;
    use crate::envelope::{EXIT_BACKEND, EXIT_OK, EXIT_VALIDATION};
    use std::path::PathBuf;

    fn temp_state_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("deskrelay_mail_{}_{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn fake_settings(binary: &str) -> Settings {
        Settings {
            mail: MailSettings {
                binary: Some(binary.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn unknown_action_lists_supported_set() {
        let dir = temp_state_dir("unknown");
        let dispatch = dispatch(
            "explode",
            &serde_json::json!({}),
            None,
            &Settings::default(),
            &dir,
            None,
        );
        assert_eq!(dispatch.exit_code, EXIT_VALIDATION);
        assert_eq!(dispatch.body["ok"], false);
        let message = dispatch.body["error"].as_str().unwrap();
        assert!(message.contains("send_message"));
        assert!(message.contains("purge_folder"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn listing_defaults_page_and_size() {
        let payload = ListPayload::default();
        let invocation = build_listing(&payload, &Settings::default(), Vec::new());
        let args = invocation.args.join(" ");
        assert!(args.contains("--folder INBOX"));
        assert!(args.contains("--page 1"));
        assert!(args.contains("--page-size 50"));
    }

    #[test]
    fn listing_clamps_non_positive_paging() {
        let payload = ListPayload {
            page: Some(0),
            page_size: Some(-3),
            ..Default::default()
        };
        let invocation = build_listing(&payload, &Settings::default(), Vec::new());
        let args = invocation.args.join(" ");
        assert!(args.contains("--page 1"));
        assert!(args.contains("--page-size 50"));
    }

    #[test]
    fn query_tokens_win_over_query_string() {
        let payload = ListPayload {
            query: Some("from alice".to_string()),
            query_tokens: vec!["subject".to_string(), "launch".to_string()],
            ..Default::default()
        };
        assert_eq!(query_tokens(&payload), vec!["subject", "launch"]);

        let fallback = ListPayload {
            query: Some("from alice".to_string()),
            ..Default::default()
        };
        assert_eq!(query_tokens(&fallback), vec!["from", "alice"]);
    }

    #[test]
    fn batch_ids_array_wins_over_singular() {
        let payload = BatchPayload {
            id: Some("9".to_string()),
            ids: vec!["1".to_string(), "2".to_string()],
            ..Default::default()
        };
        assert_eq!(batch_ids(&payload).unwrap(), vec!["1", "2"]);

        let singular = BatchPayload {
            id: Some("9".to_string()),
            ..Default::default()
        };
        assert_eq!(batch_ids(&singular).unwrap(), vec!["9"]);

        let empty = BatchPayload::default();
        assert!(batch_ids(&empty).is_err());
    }

    #[test]
    fn archive_is_one_batch_invocation() {
        let payload = BatchPayload {
            ids: vec!["1".to_string(), "2".to_string(), "3".to_string()],
            ..Default::default()
        };
        let ids = batch_ids(&payload).unwrap();
        let invocation = build_archive(&payload, &ids);
        assert_eq!(
            invocation.args,
            vec!["message", "move", "1", "2", "3", "Archive"]
        );
    }

    #[test]
    fn purge_and_delete_build_distinct_commands() {
        let batch = BatchPayload {
            ids: vec!["4".to_string()],
            ..Default::default()
        };
        let delete = build_delete(&batch, &batch_ids(&batch).unwrap());
        assert_eq!(delete.args[..2], ["message".to_string(), "delete".to_string()]);

        let purge = build_purge(&PurgePayload {
            folder: "Newsletters".to_string(),
            account: None,
        })
        .unwrap();
        assert_eq!(purge.args, vec!["folder", "purge", "Newsletters"]);
    }

    #[test]
    fn purge_requires_folder() {
        let dir = temp_state_dir("purge");
        let dispatch = dispatch(
            "purge_folder",
            &serde_json::json!({}),
            None,
            &Settings::default(),
            &dir,
            None,
        );
        assert_eq!(dispatch.exit_code, EXIT_VALIDATION);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn mark_read_uses_seen_flag() {
        let payload = BatchPayload {
            ids: vec!["7".to_string()],
            ..Default::default()
        };
        let invocation = build_flag(&payload, &payload.ids, "seen", false);
        assert_eq!(invocation.args, vec!["flag", "add", "7", "seen"]);
        let removal = build_flag(&payload, &payload.ids, "urgent", true);
        assert_eq!(removal.args, vec!["flag", "remove", "7", "urgent"]);
    }

    #[test]
    fn send_template_from_fields_and_hash_stability() {
        let payload = SendPayload {
            to: Some("a@example.com".to_string()),
            subject: Some("hi".to_string()),
            body: Some("hello there".to_string()),
            ..Default::default()
        };
        let first = render_send_template(&payload).unwrap();
        let second = render_send_template(&payload).unwrap();
        assert_eq!(first, second);
        assert!(first.contains("To: a@example.com\n"));
        assert!(first.contains("Subject: hi\n"));
        assert!(first.ends_with("hello there\n"));
        assert_eq!(
            blake3::hash(first.as_bytes()).to_hex(),
            blake3::hash(second.as_bytes()).to_hex()
        );
    }

    #[test]
    fn raw_template_wins_over_fields() {
        let payload = SendPayload {
            template: Some("To: x@example.com\nSubject: raw\n\nbody\n".to_string()),
            to: Some("ignored@example.com".to_string()),
            ..Default::default()
        };
        let rendered = render_send_template(&payload).unwrap();
        assert!(rendered.contains("Subject: raw"));
        assert!(!rendered.contains("ignored@example.com"));
    }

    #[test]
    fn send_requires_recipient_or_template() {
        let payload = SendPayload {
            subject: Some("hi".to_string()),
            body: Some("text".to_string()),
            ..Default::default()
        };
        assert!(render_send_template(&payload).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn idempotent_send_issues_one_backend_call() {
        let dir = temp_state_dir("idem_send");
        let log = dir.join("sends.log");
        let settings = fake_settings(&format!(
            "sh -c \"echo sent >> {}; printf '{{}}'\"",
            log.display()
        ));
        let payload = serde_json::json!({
            "to": "a@example.com",
            "subject": "weekly",
            "body": "report attached"
        });

        let first = dispatch("send_message", &payload, Some("key-1"), &settings, &dir, None);
        assert_eq!(first.exit_code, EXIT_OK, "body: {}", first.body);
        assert_eq!(first.body["ok"], true);
        assert_eq!(first.body["duplicate"], false);

        let second = dispatch("send_message", &payload, Some("key-1"), &settings, &dir, None);
        assert_eq!(second.exit_code, EXIT_OK);
        assert_eq!(second.body["ok"], true);
        assert_eq!(second.body["duplicate"], true);
        assert_eq!(second.body["contentHash"], first.body["contentHash"]);

        let sends = std::fs::read_to_string(&log).unwrap();
        assert_eq!(sends.lines().count(), 1, "backend must be called exactly once");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[cfg(unix)]
    #[test]
    fn conflicting_reuse_is_rejected_without_second_send() {
        let dir = temp_state_dir("idem_conflict");
        let log = dir.join("sends.log");
        let settings = fake_settings(&format!(
            "sh -c \"echo sent >> {}; printf '{{}}'\"",
            log.display()
        ));

        let first_payload = serde_json::json!({
            "to": "a@example.com", "subject": "v1", "body": "original"
        });
        let first = dispatch("send_message", &first_payload, Some("key-9"), &settings, &dir, None);
        assert_eq!(first.exit_code, EXIT_OK, "body: {}", first.body);

        let second_payload = serde_json::json!({
            "to": "a@example.com", "subject": "v1", "body": "REWRITTEN"
        });
        let second = dispatch("send_message", &second_payload, Some("key-9"), &settings, &dir, None);
        assert_eq!(second.exit_code, EXIT_VALIDATION);
        assert_eq!(second.body["ok"], false);
        assert_eq!(second.body["conflict"], true);

        let sends = std::fs::read_to_string(&log).unwrap();
        assert_eq!(sends.lines().count(), 1, "conflicting reuse must not send");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[cfg(unix)]
    #[test]
    fn failed_send_stays_retryable_with_same_key() {
        let dir = temp_state_dir("idem_retry");
        let failing = fake_settings("sh -c \"exit 1\"");
        let payload = serde_json::json!({
            "to": "a@example.com", "subject": "s", "body": "b"
        });

        let first = dispatch("send_message", &payload, Some("key-r"), &failing, &dir, None);
        assert_eq!(first.exit_code, EXIT_BACKEND);
        assert_eq!(first.body["ok"], false);

        // Same key after a failure: not a duplicate, the send runs again.
        let working = fake_settings("sh -c \"printf '{}'\"");
        let second = dispatch("send_message", &payload, Some("key-r"), &working, &dir, None);
        assert_eq!(second.exit_code, EXIT_OK, "body: {}", second.body);
        assert_eq!(second.body["duplicate"], false);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[cfg(unix)]
    #[test]
    fn backend_failure_carries_stderr_excerpt() {
        let dir = temp_state_dir("stderr");
        let settings = fake_settings("sh -c \"echo 'cannot reach imap host' >&2; exit 2\"");
        let dispatch = dispatch(
            "list_messages",
            &serde_json::json!({}),
            None,
            &settings,
            &dir,
            None,
        );
        assert_eq!(dispatch.exit_code, EXIT_BACKEND);
        assert_eq!(dispatch.body["ok"], false);
        assert!(
            dispatch.body["stderrExcerpt"]
                .as_str()
                .unwrap()
                .contains("cannot reach imap host")
        );
        std::fs::remove_dir_all(&dir).ok();
    }
}
