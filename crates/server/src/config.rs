use std::{fs, path::Path, time::Duration};

use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub bind_addr: String,
    pub inclusion_delay: Duration,
    pub admin_address: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8545".into(),
            inclusion_delay: Duration::from_millis(1500),
            admin_address: "0x00000000000000000000000000000000000000aa".into(),
        }
    }
}

pub fn load_settings(path: &Path) -> Settings {
    let mut settings = Settings::default();
    if let Ok(raw) = fs::read_to_string(path) {
        apply_file(&mut settings, &raw);
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file(settings: &mut Settings, raw: &str) {
    let table = match toml::from_str::<toml::Table>(raw) {
        Ok(table) => table,
        Err(err) => {
            warn!(error = %err, "ignoring unparseable ledger settings file");
            return;
        }
    };
    apply(settings, |key| {
        table
            .get(&key.to_ascii_lowercase())
            .map(|value| match value {
                toml::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
    });
}

fn apply_env(settings: &mut Settings, env: impl Fn(&str) -> Option<String>) {
    apply(settings, |key| env(&format!("APP__{key}")));
}

fn apply(settings: &mut Settings, get: impl Fn(&str) -> Option<String>) {
    if let Some(v) = get("BIND_ADDR") {
        settings.bind_addr = v;
    }
    if let Some(v) = get("INCLUSION_DELAY_MS").and_then(|v| v.trim().parse::<u64>().ok()) {
        settings.inclusion_delay = Duration::from_millis(v);
    }
    if let Some(v) = get("ADMIN_ADDRESS") {
        settings.admin_address = v;
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
