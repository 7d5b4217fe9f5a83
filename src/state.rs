use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

pub(crate) const DEFAULT_STATE_DIR: &str = ".deskrelay";

pub(crate) fn env_optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

pub(crate) fn env_bool(name: &str, default: bool) -> bool {
    match env_optional(name) {
        Some(value) => {
            let v = value.trim().to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "yes" | "y" | "on")
        }
        None => default,
    }
}

/// CLI flag wins, then DESKRELAY_STATE_DIR, then ~/.deskrelay (falling back
/// to a relative .deskrelay when no home directory is resolvable).
pub(crate) fn resolve_state_dir(cli: Option<PathBuf>) -> PathBuf {
    if let Some(path) = cli {
        return path;
    }
    if let Some(value) = env_optional("DESKRELAY_STATE_DIR") {
        return PathBuf::from(value);
    }
    match env_optional("HOME") {
        Some(home) => PathBuf::from(home).join(DEFAULT_STATE_DIR),
        None => PathBuf::from(DEFAULT_STATE_DIR),
    }
}

pub(crate) fn load_json_file<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let data = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&data) {
        Ok(value) => Some(value),
        Err(err) => {
            eprintln!("[state] ignoring unreadable {}: {err}", path.display());
            None
        }
    }
}

/// Write-fully with tmp+rename so a crashed writer never leaves a torn file.
pub(crate) fn save_json_file<T: Serialize>(path: &Path, value: &T) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("mkdir {}: {e}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value).map_err(|e| format!("serialize: {e}"))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &json).map_err(|e| format!("write {}: {e}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).map_err(|e| format!("rename {}: {e}", path.display()))?;
    Ok(())
}

/// Keep the tail of an output stream; the end of stderr is where backends put
/// the actual failure reason.
pub(crate) fn tail_excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed.to_string();
    }
    let skipped = count - max_chars;
    let tail: String = trimmed.chars().skip(skipped).collect();
    format!("...[{skipped} chars truncated]{tail}")
}

/// Deterministic short name for a call's debug artifacts: hash of the
/// dispatch-relevant fields only, so re-running the same request maps to the
/// same file.
pub(crate) fn call_hash(domain: &str, action: &str, payload: &serde_json::Value) -> String {
    let canonical = serde_json::json!({
        "domain": domain,
        "action": action,
        "payload": payload,
    });
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let hex = blake3::hash(&bytes).to_hex().to_string();
    hex[..12].to_string()
}

/// Dump the request and response next to each other for offline
/// troubleshooting. Failure to dump never fails the call.
pub(crate) fn write_debug_dump(
    state_dir: &Path,
    domain: &str,
    action: &str,
    payload: &serde_json::Value,
    request: &serde_json::Value,
    response: &serde_json::Value,
) -> Option<PathBuf> {
    let dir = state_dir.join("debug");
    let short = call_hash(domain, action, payload);
    let path = dir.join(format!("{domain}-{action}-{short}.json"));
    let dump = serde_json::json!({
        "request": request,
        "response": response,
    });
    match save_json_file(&path, &dump) {
        Ok(()) => Some(path),
        Err(err) => {
            eprintln!("[state] debug dump failed: {err}");
            None
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("deskrelay_state_{}_{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = temp_dir("roundtrip");
        let path = dir.join("doc.json");
        let value = serde_json::json!({"lastByKey": {"note.write": 123}});
        save_json_file(&path, &value).unwrap();
        let back: serde_json::Value = load_json_file(&path).unwrap();
        assert_eq!(back, value);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = temp_dir("missing");
        let loaded: Option<serde_json::Value> = load_json_file(&dir.join("nope.json"));
        assert!(loaded.is_none());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn tail_excerpt_keeps_short_text() {
        assert_eq!(tail_excerpt("  boom  ", 100), "boom");
    }

    #[test]
    fn tail_excerpt_truncates_from_front() {
        let text = "a".repeat(50) + "FAIL";
        let excerpt = tail_excerpt(&text, 10);
        assert!(excerpt.ends_with("FAIL"));
        assert!(excerpt.contains("truncated"));
    }

    #[test]
    fn call_hash_is_deterministic_and_payload_sensitive() {
        let p1 = serde_json::json!({"folder": "INBOX"});
        let p2 = serde_json::json!({"folder": "Archive"});
        assert_eq!(call_hash("mail", "list_messages", &p1), call_hash("mail", "list_messages", &p1));
        assert_ne!(call_hash("mail", "list_messages", &p1), call_hash("mail", "list_messages", &p2));
        assert_eq!(call_hash("mail", "list_messages", &p1).len(), 12);
    }

    #[test]
    fn debug_dump_writes_named_file() {
        let dir = temp_dir("dump");
        let payload = serde_json::json!({"folder": "INBOX"});
        let path = write_debug_dump(
            &dir,
            "mail",
            "list_messages",
            &payload,
            &serde_json::json!({"action": "list_messages"}),
            &serde_json::json!({"ok": true}),
        )
        .unwrap();
        assert!(path.exists());
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("mail-list_messages-"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
