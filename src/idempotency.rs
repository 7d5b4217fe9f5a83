use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::state::{load_json_file, save_json_file};

const STORE_FILE: &str = "idempotency.json";

/// What a write action left behind the first time its key was used.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IdempotencyRecord {
    /// Hash of the semantically significant payload at first use.
    pub(crate) content_hash: String,
    /// Epoch milliseconds of the recorded (successful) execution.
    pub(crate) ts: i64,
    #[serde(default)]
    pub(crate) exec: serde_json::Value,
    #[serde(default)]
    pub(crate) result: serde_json::Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDoc {
    #[serde(default)]
    entries: BTreeMap<String, IdempotencyRecord>,
}

#[derive(Debug)]
pub(crate) struct IdempotencyCheck {
    /// Present when the key exists with a matching content hash.
    pub(crate) duplicate: Option<IdempotencyRecord>,
    /// True when the key exists with a DIFFERENT content hash. Hard stop:
    /// the caller is reusing a key for new content.
    pub(crate) conflict: bool,
}

/// File-backed key-value store for idempotent writes. One JSON document,
/// read fully and written fully per adapter invocation; retries of the same
/// logical operation are serialized by the calling layer.
#[derive(Debug)]
pub(crate) struct IdempotencyStore {
    path: PathBuf,
    doc: StoreDoc,
}

impl IdempotencyStore {
    pub(crate) fn open(state_dir: &Path) -> Self {
        let path = state_dir.join(STORE_FILE);
        let doc = load_json_file(&path).unwrap_or_default();
        IdempotencyStore { path, doc }
    }

    pub(crate) fn compose_key(account: &str, mode: &str, idempotency_key: &str) -> String {
        format!("{account}::{mode}::{idempotency_key}")
    }

    pub(crate) fn get(&self, key: &str) -> Option<&IdempotencyRecord> {
        self.doc.entries.get(key)
    }

    pub(crate) fn check(&self, key: &str, content_hash: &str) -> IdempotencyCheck {
        match self.doc.entries.get(key) {
            Some(record) if record.content_hash == content_hash => IdempotencyCheck {
                duplicate: Some(record.clone()),
                conflict: false,
            },
            Some(_) => IdempotencyCheck {
                duplicate: None,
                conflict: true,
            },
            None => IdempotencyCheck {
                duplicate: None,
                conflict: false,
            },
        }
    }

    /// Persist a record for a key. Call this only after the backend call
    /// itself succeeded; a failed attempt must stay retryable.
    pub(crate) fn record(
        &mut self,
        key: &str,
        content_hash: &str,
        exec: serde_json::Value,
        result: serde_json::Value,
    ) -> Result<(), String> {
        self.doc.entries.insert(
            key.to_string(),
            IdempotencyRecord {
                content_hash: content_hash.to_string(),
                ts: Utc::now().timestamp_millis(),
                exec,
                result,
            },
        );
        save_json_file(&self.path, &self.doc)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_state_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("deskrelay_idem_{}_{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn first_use_is_neither_duplicate_nor_conflict() {
        let dir = temp_state_dir("first");
        let store = IdempotencyStore::open(&dir);
        let key = IdempotencyStore::compose_key("work", "send_message", "k1");
        let check = store.check(&key, "hash-a");
        assert!(check.duplicate.is_none());
        assert!(!check.conflict);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn same_hash_is_duplicate() {
        let dir = temp_state_dir("dup");
        let mut store = IdempotencyStore::open(&dir);
        let key = IdempotencyStore::compose_key("work", "send_message", "k1");
        store
            .record(
                &key,
                "hash-a",
                serde_json::json!({"exitCode": 0}),
                serde_json::json!({"status": "sent"}),
            )
            .unwrap();

        let check = store.check(&key, "hash-a");
        let prior = check.duplicate.expect("expected duplicate");
        assert!(!check.conflict);
        assert_eq!(prior.content_hash, "hash-a");
        assert_eq!(prior.result["status"], "sent");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn different_hash_is_conflict() {
        let dir = temp_state_dir("conflict");
        let mut store = IdempotencyStore::open(&dir);
        let key = IdempotencyStore::compose_key("work", "send_message", "k1");
        store
            .record(&key, "hash-a", serde_json::Value::Null, serde_json::Value::Null)
            .unwrap();

        let check = store.check(&key, "hash-b");
        assert!(check.duplicate.is_none());
        assert!(check.conflict);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn records_survive_reopen() {
        let dir = temp_state_dir("reopen");
        let key = IdempotencyStore::compose_key("work", "send_message", "k2");
        {
            let mut store = IdempotencyStore::open(&dir);
            store
                .record(&key, "hash-a", serde_json::Value::Null, serde_json::Value::Null)
                .unwrap();
        }
        let store = IdempotencyStore::open(&dir);
        assert!(store.get(&key).is_some());
        assert!(store.check(&key, "hash-a").duplicate.is_some());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn keys_are_segregated_by_account_and_mode() {
        let dir = temp_state_dir("segregate");
        let mut store = IdempotencyStore::open(&dir);
        let key_a = IdempotencyStore::compose_key("work", "send_message", "k1");
        let key_b = IdempotencyStore::compose_key("home", "send_message", "k1");
        store
            .record(&key_a, "hash-a", serde_json::Value::Null, serde_json::Value::Null)
            .unwrap();

        // Same idempotency key under a different account is a fresh key.
        let check = store.check(&key_b, "hash-zzz");
        assert!(check.duplicate.is_none());
        assert!(!check.conflict);
        std::fs::remove_dir_all(&dir).ok();
    }
}
