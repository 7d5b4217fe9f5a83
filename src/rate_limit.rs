use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::state::{load_json_file, save_json_file};

const LIMITER_FILE: &str = "rate_limit.json";

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LimiterDoc {
    /// Epoch-millisecond timestamp of the last invocation per logical key.
    #[serde(default)]
    last_by_key: BTreeMap<String, i64>,
}

/// Minimum-interval limiter for quota-bound backends. Not a fair scheduler:
/// first come first served, the wait is a plain blocking sleep. Concurrent
/// adapter processes racing on the same key may both sleep and both stamp —
/// an accepted benign race at this call volume.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    path: PathBuf,
}

impl RateLimiter {
    pub(crate) fn new(state_dir: &Path) -> Self {
        RateLimiter {
            path: state_dir.join(LIMITER_FILE),
        }
    }

    /// Sleep out whatever remains of `min_interval_ms` since the key's last
    /// stamp, then stamp "now". Returns the milliseconds actually slept.
    pub(crate) fn acquire(&self, key: &str, min_interval_ms: u64) -> Result<u64, String> {
        let mut doc: LimiterDoc = load_json_file(&self.path).unwrap_or_default();
        let now = Utc::now().timestamp_millis();
        let wait_ms = doc
            .last_by_key
            .get(key)
            .map(|last| last + min_interval_ms as i64 - now)
            .filter(|wait| *wait > 0)
            .unwrap_or(0) as u64;

        if wait_ms > 0 {
            eprintln!("[rate-limit] {key}: sleeping {wait_ms}ms");
            thread::sleep(Duration::from_millis(wait_ms));
        }

        doc.last_by_key
            .insert(key.to_string(), Utc::now().timestamp_millis());
        save_json_file(&self.path, &doc)?;
        Ok(wait_ms)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_state_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("deskrelay_rate_{}_{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn first_acquire_never_sleeps() {
        let dir = temp_state_dir("first");
        let limiter = RateLimiter::new(&dir);
        let slept = limiter.acquire("note.write", 5_000).unwrap();
        assert_eq!(slept, 0);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn back_to_back_calls_are_spaced() {
        let dir = temp_state_dir("spacing");
        let limiter = RateLimiter::new(&dir);
        let interval: u64 = 150;

        limiter.acquire("note.write", interval).unwrap();
        let first_stamp: LimiterDoc = load_json_file(&dir.join(LIMITER_FILE)).unwrap();
        let first_ts = *first_stamp.last_by_key.get("note.write").unwrap();

        let slept = limiter.acquire("note.write", interval).unwrap();
        let now = Utc::now().timestamp_millis();
        assert!(slept > 0, "second immediate call should have slept");
        assert!(
            now - first_ts >= interval as i64,
            "second call started {}ms after first stamp, wanted >= {interval}",
            now - first_ts
        );
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn keys_are_independent() {
        let dir = temp_state_dir("keys");
        let limiter = RateLimiter::new(&dir);
        limiter.acquire("note.write", 60_000).unwrap();
        // A different key has no stamp and proceeds immediately.
        let slept = limiter.acquire("upload.write", 60_000).unwrap();
        assert_eq!(slept, 0);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn stale_stamp_does_not_sleep() {
        let dir = temp_state_dir("stale");
        let path = dir.join(LIMITER_FILE);
        let mut doc = LimiterDoc::default();
        doc.last_by_key
            .insert("note.write".to_string(), Utc::now().timestamp_millis() - 10_000);
        save_json_file(&path, &doc).unwrap();

        let limiter = RateLimiter::new(&dir);
        let slept = limiter.acquire("note.write", 1_000).unwrap();
        assert_eq!(slept, 0);
        std::fs::remove_dir_all(&dir).ok();
    }
}
