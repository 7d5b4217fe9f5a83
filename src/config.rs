use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::state::{env_bool, env_optional, load_json_file};

pub(crate) const DEFAULT_MAIL_BINARY: &str = "himalaya";
pub(crate) const DEFAULT_MAIL_FOLDER: &str = "INBOX";
pub(crate) const DEFAULT_NOTES_API_BASE: &str = "https://api.notewell.io/v1";

const DEFAULT_MAIL_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CALENDAR_TIMEOUT_MS: u64 = 45_000;
const DEFAULT_NOTES_TIMEOUT_MS: u64 = 20_000;
const DEFAULT_NOTE_WRITE_INTERVAL_MS: u64 = 1_200;
const DEFAULT_UPLOAD_WRITE_INTERVAL_MS: u64 = 3_000;

/// Adapter settings, read from `<state-dir>/config.json`. Every field is
/// optional; env vars override the file; accessors supply defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct Settings {
    pub(crate) mail: MailSettings,
    pub(crate) calendar: CalendarSettings,
    pub(crate) notes: NotesSettings,
    pub(crate) debug_dump: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct MailSettings {
    /// Backend command; may carry leading args ("docker exec box himalaya").
    pub(crate) binary: Option<String>,
    pub(crate) account: Option<String>,
    pub(crate) default_folder: Option<String>,
    /// Overrides the platform default config path used by the health probe.
    pub(crate) config_path: Option<String>,
    pub(crate) timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct CalendarSettings {
    /// Target for writes when the payload names no calendar. Reads always
    /// span all calendars unless the payload restricts them.
    pub(crate) default_calendar: Option<String>,
    pub(crate) timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct NotesSettings {
    pub(crate) api_base: Option<String>,
    pub(crate) api_key: Option<String>,
    pub(crate) timeout_ms: Option<u64>,
    pub(crate) note_write_interval_ms: Option<u64>,
    pub(crate) upload_write_interval_ms: Option<u64>,
}

impl Settings {
    pub(crate) fn load(state_dir: &Path) -> Settings {
        let mut settings: Settings =
            load_json_file(&state_dir.join("config.json")).unwrap_or_default();

        if let Some(value) = env_optional("DESKRELAY_MAIL_BINARY") {
            settings.mail.binary = Some(value);
        }
        if let Some(value) = env_optional("DESKRELAY_MAIL_ACCOUNT") {
            settings.mail.account = Some(value);
        }
        if let Some(value) = env_optional("DESKRELAY_MAIL_FOLDER") {
            settings.mail.default_folder = Some(value);
        }
        if let Some(value) = env_optional("DESKRELAY_CALENDAR_DEFAULT") {
            settings.calendar.default_calendar = Some(value);
        }
        if let Some(value) = env_optional("DESKRELAY_NOTES_API_BASE") {
            settings.notes.api_base = Some(value);
        }
        if let Some(value) = env_optional("DESKRELAY_NOTES_API_KEY") {
            settings.notes.api_key = Some(value);
        }
        settings.debug_dump = env_bool("DESKRELAY_DEBUG", settings.debug_dump);

        settings
    }

    /// Backend mail command split into (program, leading args).
    pub(crate) fn mail_command(&self) -> (String, Vec<String>) {
        let raw = self
            .mail
            .binary
            .clone()
            .unwrap_or_else(|| DEFAULT_MAIL_BINARY.to_string());
        match shlex::split(&raw) {
            Some(parts) if !parts.is_empty() => (parts[0].clone(), parts[1..].to_vec()),
            _ => (raw, Vec::new()),
        }
    }

    pub(crate) fn mail_folder(&self) -> String {
        self.mail
            .default_folder
            .clone()
            .unwrap_or_else(|| DEFAULT_MAIL_FOLDER.to_string())
    }

    pub(crate) fn mail_config_path(&self) -> PathBuf {
        if let Some(path) = &self.mail.config_path {
            return PathBuf::from(path);
        }
        default_mail_config_path()
    }

    pub(crate) fn mail_timeout_ms(&self, cli_override: Option<u64>) -> u64 {
        cli_override
            .or(self.mail.timeout_ms)
            .unwrap_or(DEFAULT_MAIL_TIMEOUT_MS)
    }

    pub(crate) fn calendar_timeout_ms(&self, cli_override: Option<u64>) -> u64 {
        cli_override
            .or(self.calendar.timeout_ms)
            .unwrap_or(DEFAULT_CALENDAR_TIMEOUT_MS)
    }

    pub(crate) fn notes_api_base(&self) -> String {
        let base = self
            .notes
            .api_base
            .clone()
            .unwrap_or_else(|| DEFAULT_NOTES_API_BASE.to_string());
        base.trim_end_matches('/').to_string()
    }

    pub(crate) fn notes_api_key(&self) -> Option<String> {
        self.notes.api_key.clone()
    }

    pub(crate) fn notes_timeout_ms(&self, cli_override: Option<u64>) -> u64 {
        cli_override
            .or(self.notes.timeout_ms)
            .unwrap_or(DEFAULT_NOTES_TIMEOUT_MS)
    }

    pub(crate) fn note_write_interval_ms(&self) -> u64 {
        self.notes
            .note_write_interval_ms
            .unwrap_or(DEFAULT_NOTE_WRITE_INTERVAL_MS)
    }

    pub(crate) fn upload_write_interval_ms(&self) -> u64 {
        self.notes
            .upload_write_interval_ms
            .unwrap_or(DEFAULT_UPLOAD_WRITE_INTERVAL_MS)
    }
}

/// Where the mail backend keeps its config by default. The health probe
/// checks this file exists before calling the backend healthy.
pub(crate) fn default_mail_config_path() -> PathBuf {
    if cfg!(windows) {
        if let Some(appdata) = env_optional("APPDATA") {
            return PathBuf::from(appdata).join("himalaya").join("config.toml");
        }
    }
    if let Some(xdg) = env_optional("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("himalaya").join("config.toml");
    }
    let home = env_optional("HOME").unwrap_or_else(|| ".".to_string());
    PathBuf::from(home)
        .join(".config")
        .join("himalaya")
        .join("config.toml")
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_absent() {
        let dir = std::env::temp_dir().join(format!("deskrelay_cfg_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let settings = Settings::load(&dir);
        let (program, args) = settings.mail_command();
        assert_eq!(program, DEFAULT_MAIL_BINARY);
        assert!(args.is_empty());
        assert_eq!(settings.mail_folder(), DEFAULT_MAIL_FOLDER);
        assert_eq!(settings.notes_api_base(), DEFAULT_NOTES_API_BASE);
        assert_eq!(settings.mail_timeout_ms(None), 30_000);
        assert_eq!(settings.mail_timeout_ms(Some(5)), 5);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn mail_command_splits_wrapper_form() {
        let settings = Settings {
            mail: MailSettings {
                binary: Some("docker exec box himalaya".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let (program, args) = settings.mail_command();
        assert_eq!(program, "docker");
        assert_eq!(args, vec!["exec", "box", "himalaya"]);
    }

    #[test]
    fn api_base_trailing_slash_trimmed() {
        let settings = Settings {
            notes: NotesSettings {
                api_base: Some("https://example.test/v2/".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(settings.notes_api_base(), "https://example.test/v2");
    }

    #[test]
    fn config_file_parsed_with_camel_case_keys() {
        let dir = std::env::temp_dir().join(format!("deskrelay_cfg_file_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("config.json"),
            r#"{"mail": {"defaultFolder": "Inbox-Alt", "timeoutMs": 9000},
                "notes": {"noteWriteIntervalMs": 700}}"#,
        )
        .unwrap();
        let settings = Settings::load(&dir);
        assert_eq!(settings.mail_folder(), "Inbox-Alt");
        assert_eq!(settings.mail_timeout_ms(None), 9_000);
        assert_eq!(settings.note_write_interval_ms(), 700);
        std::fs::remove_dir_all(&dir).ok();
    }
}
