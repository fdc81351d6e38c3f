use std::collections::HashMap;

use super::*;

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(
        normalize_database_url("sqlite:data\\canvas.db"),
        "sqlite://data/canvas.db"
    );
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
}

#[test]
fn empty_database_url_falls_back_to_default() {
    assert_eq!(
        normalize_database_url("   "),
        ClientSettings::default().database_url
    );
}

#[test]
fn creates_parent_dir_for_nested_sqlite_url() {
    let temp_root = tempfile::tempdir().expect("temp dir");
    let db_path = temp_root.path().join("data").join("canvas.db");
    let raw = db_path.to_string_lossy().replace('\\', "/");

    let url = prepare_database_url(&raw).expect("prepare db url");
    assert!(url.starts_with("sqlite://"));
    assert!(temp_root.path().join("data").exists());
}

#[test]
fn file_settings_override_defaults() {
    let raw = r#"
        backend_url = "http://10.0.0.5:5002"
        project_name = "pipeline"
        autosave_debounce_ms = 500
        execution_speed = 2.5
    "#;
    let file_cfg: HashMap<String, toml::Value> = toml::from_str(raw).expect("toml");

    let mut settings = ClientSettings::default();
    apply_file_settings(&mut settings, &file_cfg);

    assert_eq!(settings.backend_url, "http://10.0.0.5:5002");
    assert_eq!(settings.project_name, "pipeline");
    assert_eq!(settings.autosave_debounce_ms, 500);
    assert_eq!(settings.execution_speed, 2.5);
    assert_eq!(settings.highlight_duration_ms, 1500);
}

#[test]
fn app_prefixed_env_wins_over_canvas_prefixed_env() {
    let env: HashMap<&str, &str> = [
        ("CANVAS_BACKEND_URL", "http://canvas:1"),
        ("APP__BACKEND_URL", "http://app:2"),
        ("CANVAS_DATABASE_URL", "sqlite://./canvas.db"),
        ("APP__FRAME_INTERVAL_MS", "33"),
        ("APP__HIGHLIGHT_DURATION_MS", "not-a-number"),
    ]
    .into_iter()
    .collect();

    let mut settings = ClientSettings::default();
    apply_env_settings(&mut settings, |key| env.get(key).map(|v| v.to_string()));

    assert_eq!(settings.backend_url, "http://app:2");
    assert_eq!(settings.database_url, "sqlite://./canvas.db");
    assert_eq!(settings.frame_interval_ms, 33);
    assert_eq!(settings.highlight_duration_ms, 1500);
}

#[test]
fn missing_settings_file_yields_defaults_before_env() {
    let temp_root = tempfile::tempdir().expect("temp dir");
    let mut settings = ClientSettings::default();
    if let Ok(raw) = fs::read_to_string(temp_root.path().join("canvas.toml")) {
        let file_cfg: HashMap<String, toml::Value> = toml::from_str(&raw).expect("toml");
        apply_file_settings(&mut settings, &file_cfg);
    }
    assert_eq!(settings, ClientSettings::default());
    assert_eq!(settings.autosave_debounce(), Duration::from_millis(300));
    assert_eq!(settings.run_all_timeout(), Duration::from_secs(30));
}
