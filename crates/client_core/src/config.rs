use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;

pub const DEFAULT_SETTINGS_FILE: &str = "canvas.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub backend_url: String,
    pub database_url: String,
    pub project_name: String,
    pub autosave_debounce_ms: u64,
    pub highlight_duration_ms: u64,
    pub data_flow_duration_ms: u64,
    pub execution_speed: f64,
    pub frame_interval_ms: u64,
    pub event_log_capacity: usize,
    pub run_all_timeout_secs: u64,
    pub push_queue_capacity: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:5002".into(),
            database_url: "sqlite://./data/canvas_client.db".into(),
            project_name: "Untitled Project".into(),
            autosave_debounce_ms: 300,
            highlight_duration_ms: 1500,
            data_flow_duration_ms: 800,
            execution_speed: 1.0,
            frame_interval_ms: 16,
            event_log_capacity: 50,
            run_all_timeout_secs: 30,
            push_queue_capacity: 1024,
        }
    }
}

impl ClientSettings {
    pub fn autosave_debounce(&self) -> Duration {
        Duration::from_millis(self.autosave_debounce_ms)
    }

    pub fn highlight_duration(&self) -> Duration {
        Duration::from_millis(self.highlight_duration_ms)
    }

    pub fn data_flow_duration(&self) -> Duration {
        Duration::from_millis(self.data_flow_duration_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms.max(1))
    }

    pub fn run_all_timeout(&self) -> Duration {
        Duration::from_secs(self.run_all_timeout_secs)
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => apply_file_settings(&mut settings, &file_cfg),
            Err(err) => tracing::warn!(path = %path.display(), "ignoring bad settings file: {err}"),
        }
    }

    apply_env_settings(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn file_string(file_cfg: &HashMap<String, toml::Value>, key: &str) -> Option<String> {
    match file_cfg.get(key)? {
        toml::Value::String(v) => Some(v.clone()),
        toml::Value::Integer(v) => Some(v.to_string()),
        toml::Value::Float(v) => Some(v.to_string()),
        _ => None,
    }
}

fn apply_file_settings(settings: &mut ClientSettings, file_cfg: &HashMap<String, toml::Value>) {
    if let Some(v) = file_string(file_cfg, "backend_url") {
        settings.backend_url = v;
    }
    if let Some(v) = file_string(file_cfg, "database_url") {
        settings.database_url = v;
    }
    if let Some(v) = file_string(file_cfg, "project_name") {
        settings.project_name = v;
    }
    if let Some(v) = file_string(file_cfg, "autosave_debounce_ms").and_then(|v| v.parse().ok()) {
        settings.autosave_debounce_ms = v;
    }
    if let Some(v) = file_string(file_cfg, "highlight_duration_ms").and_then(|v| v.parse().ok()) {
        settings.highlight_duration_ms = v;
    }
    if let Some(v) = file_string(file_cfg, "execution_speed").and_then(|v| v.parse().ok()) {
        settings.execution_speed = v;
    }
    if let Some(v) = file_string(file_cfg, "frame_interval_ms").and_then(|v| v.parse().ok()) {
        settings.frame_interval_ms = v;
    }
}

fn apply_env_settings(settings: &mut ClientSettings, env: impl Fn(&str) -> Option<String>) {
    if let Some(v) = env("CANVAS_BACKEND_URL") {
        settings.backend_url = v;
    }
    if let Some(v) = env("APP__BACKEND_URL") {
        settings.backend_url = v;
    }

    if let Some(v) = env("CANVAS_DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = env("APP__PROJECT_NAME") {
        settings.project_name = v;
    }

    if let Some(parsed) = env("APP__AUTOSAVE_DEBOUNCE_MS").and_then(|v| v.parse().ok()) {
        settings.autosave_debounce_ms = parsed;
    }
    if let Some(parsed) = env("APP__HIGHLIGHT_DURATION_MS").and_then(|v| v.parse().ok()) {
        settings.highlight_duration_ms = parsed;
    }
    if let Some(parsed) = env("APP__EXECUTION_SPEED").and_then(|v| v.parse().ok()) {
        settings.execution_speed = parsed;
    }
    if let Some(parsed) = env("APP__FRAME_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        settings.frame_interval_ms = parsed;
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return ClientSettings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
