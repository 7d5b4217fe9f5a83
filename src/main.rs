mod calendar;
mod cli;
mod config;
mod envelope;
mod exec;
mod idempotency;
mod mail;
mod notes;
mod rate_limit;
mod state;

use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use clap::Parser;

use crate::cli::{AdapterArgs, Cli, Command};
use crate::config::Settings;
use crate::envelope::{
    Dispatch, EXIT_CRASH, EXIT_VALIDATION, RequestEnvelope, build_response, parse_envelope,
};
use crate::state::{resolve_state_dir, write_debug_dump};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Domain {
    Mail,
    Calendar,
    Notes,
}

impl Domain {
    fn as_str(self) -> &'static str {
        match self {
            Domain::Mail => "mail",
            Domain::Calendar => "calendar",
            Domain::Notes => "notes",
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Mail(args) => run_adapter(Domain::Mail, args),
        Command::Calendar(args) => run_adapter(Domain::Calendar, args),
        Command::Notes(args) => run_adapter(Domain::Notes, args),
    };
    std::process::exit(code);
}

/// One request per process: read stdin in full, parse, dispatch, write one
/// response envelope plus newline, exit with the protocol code. No retries
/// here — retry policy belongs to whoever spawned us.
fn run_adapter(domain: Domain, args: AdapterArgs) -> i32 {
    let mut raw = String::new();
    if let Err(err) = io::stdin().read_to_string(&mut raw) {
        let body = build_response(
            domain.as_str(),
            "",
            false,
            serde_json::json!({ "error": format!("failed to read stdin: {err}") }),
        );
        emit(&body);
        return EXIT_VALIDATION;
    }

    let envelope = match parse_envelope(&raw) {
        Ok(envelope) => envelope,
        Err(err) => {
            let action = best_effort_action(&raw);
            let body = build_response(
                domain.as_str(),
                &action,
                false,
                serde_json::json!({ "error": err.message() }),
            );
            emit(&body);
            return EXIT_VALIDATION;
        }
    };

    if let Some(requested) = &envelope.domain {
        if requested != domain.as_str() {
            let body = build_response(
                domain.as_str(),
                &envelope.action,
                false,
                serde_json::json!({
                    "error": format!(
                        "envelope domain '{requested}' does not match the {} adapter",
                        domain.as_str()
                    ),
                }),
            );
            emit(&body);
            return EXIT_VALIDATION;
        }
    }

    let state_dir = resolve_state_dir(args.state_dir.clone());
    let settings = Settings::load(&state_dir);

    // Outermost boundary: anything escaping the routers still produces a
    // well-formed envelope, with a reserved exit code so callers can tell
    // "adapter crashed" from "backend rejected the request".
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        dispatch_domain(domain, &envelope, &settings, &state_dir, args.timeout_ms)
    }));
    let mut dispatch = match outcome {
        Ok(dispatch) => dispatch,
        Err(payload) => {
            let reason = panic_message(&*payload);
            eprintln!("[{}] adapter crashed: {reason}", domain.as_str());
            Dispatch {
                exit_code: EXIT_CRASH,
                body: build_response(
                    domain.as_str(),
                    &envelope.action,
                    false,
                    serde_json::json!({
                        "error": format!("adapter crashed: {reason}"),
                        "crash": true,
                    }),
                ),
            }
        }
    };

    if settings.debug_dump || args.debug_dump {
        let request: serde_json::Value =
            serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null);
        if let Some(path) = write_debug_dump(
            &state_dir,
            domain.as_str(),
            &envelope.action,
            &envelope.payload,
            &request,
            &dispatch.body,
        ) {
            if let Some(map) = dispatch.body.as_object_mut() {
                map.insert(
                    "debugFile".to_string(),
                    serde_json::json!(path.display().to_string()),
                );
            }
        }
    }

    emit(&dispatch.body);
    dispatch.exit_code
}

fn dispatch_domain(
    domain: Domain,
    envelope: &RequestEnvelope,
    settings: &Settings,
    state_dir: &Path,
    timeout_override: Option<u64>,
) -> Dispatch {
    match domain {
        Domain::Mail => mail::dispatch(
            &envelope.action,
            &envelope.payload,
            envelope.idempotency_key.as_deref(),
            settings,
            state_dir,
            timeout_override,
        ),
        Domain::Calendar => calendar::dispatch(
            &envelope.action,
            &envelope.payload,
            settings,
            timeout_override,
        ),
        Domain::Notes => notes::dispatch(
            &envelope.action,
            &envelope.payload,
            settings,
            state_dir,
            timeout_override,
        ),
    }
}

/// Echo the action on malformed-envelope failures when the raw text still
/// contains a readable one.
fn best_effort_action(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|value| {
            value
                .get("action")
                .and_then(|a| a.as_str())
                .map(|a| a.to_string())
        })
        .unwrap_or_default()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn emit(body: &serde_json::Value) {
    let text = serde_json::to_string(body).unwrap_or_else(|_| {
        r#"{"ok":false,"error":"response serialization failure"}"#.to_string()
    });
    let mut stdout = io::stdout();
    let _ = writeln!(stdout, "{text}");
    let _ = stdout.flush();
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EXIT_OK, EXIT_VALIDATION};

    fn envelope_for(action: &str, payload: serde_json::Value) -> RequestEnvelope {
        parse_envelope(
            &serde_json::json!({ "action": action, "payload": payload }).to_string(),
        )
        .unwrap()
    }

    #[test]
    fn unknown_actions_fail_uniformly_across_domains() {
        let dir = std::env::temp_dir().join(format!("deskrelay_main_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let settings = Settings::default();
        let envelope = envelope_for("no_such_action", serde_json::json!({}));

        for domain in [Domain::Mail, Domain::Calendar, Domain::Notes] {
            let dispatch = dispatch_domain(domain, &envelope, &settings, &dir, None);
            assert_eq!(dispatch.exit_code, EXIT_VALIDATION, "domain {domain:?}");
            assert_eq!(dispatch.body["ok"], false);
            assert_eq!(dispatch.body["domain"], domain.as_str());
            assert_eq!(dispatch.body["action"], "no_such_action");
            assert!(dispatch.body["error"].as_str().unwrap().contains("supported"));
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn notes_health_dispatches_through_domain_wiring() {
        let dir = std::env::temp_dir().join(format!("deskrelay_main_h_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut settings = Settings::default();
        settings.notes.api_key = Some("sk-test".to_string());
        let envelope = envelope_for("health", serde_json::json!({}));

        let dispatch = dispatch_domain(Domain::Notes, &envelope, &settings, &dir, None);
        assert_eq!(dispatch.exit_code, EXIT_OK);
        assert_eq!(dispatch.body["ok"], true);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn best_effort_action_survives_bad_envelopes() {
        assert_eq!(best_effort_action(r#"{"action": "health", "version": 9}"#), "health");
        assert_eq!(best_effort_action("{nope"), "");
    }
}
