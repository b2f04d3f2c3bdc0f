use std::{fs, path::Path, time::Duration};

use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub ledger_url: String,
    pub status_ttl: Duration,
    pub poll_interval: Duration,
    pub pending_notice_after: Duration,
    pub confirmation_token_ttl: Duration,
    pub confirmation_code_length: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            ledger_url: "http://127.0.0.1:8545".into(),
            status_ttl: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            pending_notice_after: Duration::from_secs(30),
            confirmation_token_ttl: Duration::from_secs(300),
            confirmation_code_length: 6,
        }
    }
}

/// Defaults, then `path` (TOML) when it exists, then `APP__*` environment overrides.
pub fn load_settings(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();
    if let Ok(raw) = fs::read_to_string(path) {
        apply_file(&mut settings, &raw);
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

pub(crate) fn apply_file(settings: &mut ClientSettings, raw: &str) {
    let table = match toml::from_str::<toml::Table>(raw) {
        Ok(table) => table,
        Err(err) => {
            warn!(error = %err, "ignoring unparseable dashboard settings file");
            return;
        }
    };
    let lookup = |key: &str| {
        table.get(key).map(|value| match value {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    };
    apply(settings, |key| lookup(&key.to_ascii_lowercase()));
}

pub(crate) fn apply_env(settings: &mut ClientSettings, env: impl Fn(&str) -> Option<String>) {
    apply(settings, |key| env(&format!("APP__{key}")));
}

fn apply(settings: &mut ClientSettings, get: impl Fn(&str) -> Option<String>) {
    if let Some(v) = get("LEDGER_URL") {
        settings.ledger_url = v;
    }
    if let Some(v) = millis(get("STATUS_TTL_MS")) {
        settings.status_ttl = v;
    }
    if let Some(v) = millis(get("POLL_INTERVAL_MS")) {
        settings.poll_interval = v;
    }
    if let Some(v) = millis(get("PENDING_NOTICE_AFTER_MS")) {
        settings.pending_notice_after = v;
    }
    if let Some(v) = get("CONFIRMATION_TOKEN_TTL_SECS")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
    {
        settings.confirmation_token_ttl = Duration::from_secs(v);
    }
    if let Some(v) = get("CONFIRMATION_CODE_LENGTH").and_then(|v| v.parse::<usize>().ok()) {
        if v > 0 {
            settings.confirmation_code_length = v;
        }
    }
}

fn millis(raw: Option<String>) -> Option<Duration> {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
