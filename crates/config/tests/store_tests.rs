//! End-to-end tests for the config store: load pipeline, persistence,
//! encryption at rest, transactions and change events.

use std::fs;
use std::path::Path;

use anyhow::Result;
use promptdesk_config::{
    ChangeSource, ConfigError, ConfigStore, LoadMode, SectionState,
};
use serde_json::{Value, json};

fn store_in(dir: &Path) -> ConfigStore {
    ConfigStore::builder()
        .with_config_dir(dir)
        .with_environment("testing")
        .build()
        .expect("store builds")
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).expect("file readable")).expect("valid json")
}

#[test]
fn test_defaults_install_and_load() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_in(dir.path());
    store.install_defaults()?;
    let report = store.load_all();

    assert!(report.is_ok(), "failed: {:?}", report.failed);
    let mut sections = store.list_sections();
    sections.sort();
    assert_eq!(sections, vec!["app", "llm", "security", "ui"]);
    for name in &sections {
        assert_eq!(store.section_state(name), Some(SectionState::Active));
    }

    assert_eq!(store.get_value("ui", "theme"), Some(json!("light")));
    assert_eq!(store.get_value("ui", "window.width"), Some(json!(1200)));
    assert_eq!(
        store.get_value("llm", "default_model"),
        Some(json!("gpt-3.5-turbo"))
    );
    assert!(dir.path().join("app.json").exists());
    Ok(())
}

#[test]
fn test_old_document_is_migrated_on_load() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(
        dir.path().join("llm.json"),
        serde_json::to_string_pretty(&json!({
            "_version": "0.9.0",
            "api_settings": {"openai": {"api_key": "sk-test", "enabled": true}}
        }))?,
    )?;

    let store = store_in(dir.path());
    store.install_defaults()?;
    store.load("llm")?;

    assert_eq!(
        store.get_value("llm", "providers.openai.api_key"),
        Some(json!("sk-test"))
    );
    assert_eq!(store.get_value("llm", "default_provider"), Some(json!("openai")));
    assert_eq!(
        store.get_value("llm", "default_model"),
        Some(json!("gpt-3.5-turbo"))
    );
    assert!(store.validate_section("llm")?.is_valid);

    // The load published a migration-sourced event.
    assert!(
        store
            .recent_events(16)
            .iter()
            .any(|e| e.section == "llm" && e.source == ChangeSource::Migration)
    );
    Ok(())
}

#[test]
fn test_encrypted_save_roundtrips_through_reload() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_in(dir.path());
    store.install_defaults()?;
    store.load_all();

    store.set_value("security", "encryption_enabled", json!(true), false)?;
    store.set_value(
        "llm",
        "providers.openai.api_key",
        json!("sk-live-1234567890"),
        false,
    )?;

    let security_before = store.get_section("security")?;
    let llm_before = store.get_section("llm")?;
    store.save_section("security", false)?;
    store.save_section("llm", false)?;

    // Sensitive leaves are unreadable on disk.
    let raw = fs::read_to_string(dir.path().join("llm.json"))?;
    assert!(!raw.contains("sk-live-1234567890"));
    let on_disk = read_json(&dir.path().join("llm.json"));
    assert_eq!(
        on_disk["providers"]["openai"]["api_key"]["_encrypted"],
        json!(true)
    );
    assert!(on_disk.get("_encryption_info").is_some());

    store.reload_section("security")?;
    store.reload_section("llm")?;
    assert_eq!(store.get_section("security")?, security_before);
    assert_eq!(store.get_section("llm")?, llm_before);
    Ok(())
}

#[test]
fn test_plain_save_when_encryption_disabled_and_no_secrets() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_in(dir.path());
    store.install_defaults()?;
    store.load_all();

    store.set_value("ui", "theme", json!("dark"), false)?;
    store.save_section("ui", false)?;

    let on_disk = read_json(&dir.path().join("ui.json"));
    assert_eq!(on_disk["theme"], json!("dark"));
    assert!(on_disk.get("_encryption_info").is_none());
    assert_eq!(on_disk["_version"], json!("1.1.0"));
    Ok(())
}

#[test]
fn test_sequential_sets_emit_two_events_and_one_final_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_in(dir.path());
    store.register_file("app", dir.path().join("app.json"), None)?;

    store.set_value("app", "log_level", json!("DEBUG"), false)?;
    store.set_value("app", "log_level", json!("ERROR"), false)?;
    store.save_section("app", false)?;

    let on_disk = read_json(&dir.path().join("app.json"));
    assert_eq!(on_disk["log_level"], json!("ERROR"));

    let events: Vec<_> = store
        .recent_events(16)
        .into_iter()
        .filter(|e| e.source == ChangeSource::Api && e.key.as_deref() == Some("log_level"))
        .collect();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].old_value, None);
    assert_eq!(events[0].new_value, Some(json!("DEBUG")));
    assert_eq!(events[1].old_value, Some(json!("DEBUG")));
    assert_eq!(events[1].new_value, Some(json!("ERROR")));
    Ok(())
}

#[test]
fn test_unchanged_set_is_a_complete_noop() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_in(dir.path());
    store.register_file("ui", dir.path().join("ui.json"), None)?;

    store.set_value("ui", "theme", json!("dark"), false)?;
    let events_before = store.recent_events(64).len();

    let old = store.set_value("ui", "theme", json!("dark"), true)?;
    assert_eq!(old, Some(json!("dark")));
    assert_eq!(store.recent_events(64).len(), events_before);
    // Even with save_immediately, a no-op never touches the disk.
    assert!(!dir.path().join("ui.json").exists());
    Ok(())
}

#[test]
fn test_failed_immediate_save_still_emits_the_event() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_in(dir.path());
    store.install_defaults()?;
    store.load_all();

    // "neon" violates the theme enum, so the immediate save is refused.
    let err = store
        .set_value("ui", "theme", json!("neon"), true)
        .unwrap_err();
    assert!(matches!(err, ConfigError::Validation { .. }));

    // The in-memory mutation took effect and was announced regardless.
    assert_eq!(store.get_value("ui", "theme"), Some(json!("neon")));
    assert!(store.recent_events(16).iter().any(|e| {
        e.section == "ui"
            && e.key.as_deref() == Some("theme")
            && e.new_value == Some(json!("neon"))
    }));
    Ok(())
}

#[test]
fn test_failed_transaction_restores_memory_and_disk() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_in(dir.path());
    store.install_defaults()?;
    store.load_all();

    let ui_before = store.get_section("ui")?;
    let app_before = store.get_section("app")?;
    let ui_file_before = fs::read_to_string(dir.path().join("ui.json"))?;
    let app_file_before = fs::read_to_string(dir.path().join("app.json"))?;

    let result: Result<(), ConfigError> = store.transaction(|s| {
        s.set_value("ui", "theme", json!("dark"), false)?;
        s.set_value("app", "debug", json!(true), false)?;
        Err(ConfigError::NotFound {
            section: "induced failure".to_string(),
        })
    });
    assert!(result.is_err());

    assert_eq!(store.get_section("ui")?, ui_before);
    assert_eq!(store.get_section("app")?, app_before);
    assert_eq!(fs::read_to_string(dir.path().join("ui.json"))?, ui_file_before);
    assert_eq!(
        fs::read_to_string(dir.path().join("app.json"))?,
        app_file_before
    );
    Ok(())
}

#[test]
fn test_committed_transaction_persists_all_sections() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_in(dir.path());
    store.install_defaults()?;
    store.load_all();

    store.transaction(|s| {
        s.set_value("ui", "theme", json!("dark"), false)?;
        s.set_value("app", "debug", json!(true), false)?;
        Ok(())
    })?;

    assert_eq!(read_json(&dir.path().join("ui.json"))["theme"], json!("dark"));
    assert_eq!(read_json(&dir.path().join("app.json"))["debug"], json!(true));
    Ok(())
}

#[test]
fn test_strict_mode_rejects_invalid_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    // app.json violates the schema: version is not semver-shaped.
    fs::write(
        dir.path().join("app.json"),
        serde_json::to_string(&json!({"name": "x", "version": "not-semver"}))?,
    )?;

    let store = ConfigStore::builder()
        .with_config_dir(dir.path())
        .with_environment("testing")
        .with_load_mode(LoadMode::Strict)
        .build()?;
    store.install_defaults()?;

    let err = store.load("app").unwrap_err();
    assert!(matches!(err, ConfigError::Validation { .. }));
    assert_eq!(store.section_state("app"), Some(SectionState::Error));
    Ok(())
}

#[test]
fn test_lenient_mode_keeps_invalid_data_with_warnings() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(
        dir.path().join("app.json"),
        serde_json::to_string(&json!({"name": "x", "version": "not-semver"}))?,
    )?;

    let store = store_in(dir.path());
    store.install_defaults()?;
    store.load("app")?;

    assert_eq!(store.section_state("app"), Some(SectionState::Active));
    assert_eq!(store.get_value("app", "version"), Some(json!("not-semver")));
    assert!(!store.section_warnings("app").is_empty());
    Ok(())
}

#[test]
fn test_fallback_mode_backs_up_corrupt_file_and_uses_defaults() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("app.json"), "{not valid json")?;

    let store = ConfigStore::builder()
        .with_config_dir(dir.path())
        .with_environment("testing")
        .with_load_mode(LoadMode::Fallback)
        .build()?;
    store.install_defaults()?;
    store.load("app")?;

    assert_eq!(store.section_state("app"), Some(SectionState::Active));
    // Schema defaults installed in place of the corrupt content.
    assert_eq!(store.get_value("app", "log_level"), Some(json!("INFO")));

    let corrupt_backups: Vec<_> = fs::read_dir(dir.path())?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".corrupt."))
        .collect();
    assert_eq!(corrupt_backups.len(), 1);
    Ok(())
}

#[test]
fn test_environment_overlay_merges_on_top() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_in(dir.path());
    store.install_defaults()?;

    fs::write(
        dir.path().join("ui.testing.json"),
        serde_json::to_string(&json!({"theme": "dark", "window": {"width": 640}}))?,
    )?;
    store.load("ui")?;

    assert_eq!(store.get_value("ui", "theme"), Some(json!("dark")));
    assert_eq!(store.get_value("ui", "window.width"), Some(json!(640)));
    // Keys absent from the overlay keep their base values.
    assert_eq!(store.get_value("ui", "window.height"), Some(json!(800)));
    Ok(())
}

#[test]
fn test_save_backs_up_existing_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_in(dir.path());
    store.install_defaults()?;
    store.load_all();

    store.set_value("ui", "theme", json!("dark"), false)?;
    store.save_section("ui", false)?;

    let backups: Vec<_> = fs::read_dir(dir.path())?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with("ui.backup.")
        })
        .collect();
    assert_eq!(backups.len(), 1);
    Ok(())
}

#[test]
fn test_save_refuses_invalid_data_unless_forced() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_in(dir.path());
    store.install_defaults()?;
    store.load_all();

    store.set_value("ui", "theme", json!("neon"), false)?;
    let err = store.save_section("ui", false).unwrap_err();
    assert!(matches!(err, ConfigError::Validation { .. }));

    store.save_section("ui", true)?;
    assert_eq!(read_json(&dir.path().join("ui.json"))["theme"], json!("neon"));
    Ok(())
}

#[test]
fn test_delete_value_and_reset_section() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_in(dir.path());
    store.install_defaults()?;
    store.load_all();

    let removed = store.delete_value("ui", "window.maximized")?;
    assert_eq!(removed, Some(json!(false)));
    assert_eq!(store.get_value("ui", "window.maximized"), None);
    // Deleting again is a no-op.
    assert_eq!(store.delete_value("ui", "window.maximized")?, None);

    store.reset_section("ui")?;
    assert_eq!(store.get_value("ui", "theme"), Some(json!("light")));
    assert!(store.section_exists("ui"));
    assert!(
        store
            .recent_events(16)
            .iter()
            .any(|e| e.section == "ui" && e.source == ChangeSource::Reset)
    );
    Ok(())
}

#[test]
fn test_export_and_import_roundtrip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_in(dir.path());
    store.install_defaults()?;
    store.load_all();
    store.set_value("ui", "theme", json!("dark"), false)?;

    let export_path = dir.path().join("export.json");
    store.export_config(&export_path, Some(&["ui", "app"]))?;

    let exported = read_json(&export_path);
    assert_eq!(exported["ui"]["theme"], json!("dark"));
    assert!(exported.get("app").is_some());
    assert!(exported.get("security").is_none());
    assert_eq!(exported["_metadata"]["environment"], json!("testing"));

    // Drift the store, then restore it by replacing from the export.
    store.set_value("ui", "theme", json!("light"), false)?;
    store.import_config(&export_path, Some(&["ui"]), false)?;
    assert_eq!(store.get_value("ui", "theme"), Some(json!("dark")));

    // Merge mode keeps keys the import does not mention.
    store.set_value("ui", "sidebar_pinned", json!(true), false)?;
    store.set_value("ui", "theme", json!("light"), false)?;
    store.import_config(&export_path, Some(&["ui"]), true)?;
    assert_eq!(store.get_value("ui", "theme"), Some(json!("dark")));
    assert_eq!(store.get_value("ui", "sidebar_pinned"), Some(json!(true)));
    Ok(())
}

#[test]
fn test_subscribers_and_unsubscribe() -> Result<()> {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    let dir = tempfile::tempdir()?;
    let store = store_in(dir.path());

    let count = Arc::new(AtomicUsize::new(0));
    let count_clone = Arc::clone(&count);
    let id = store.subscribe(move |_| {
        count_clone.fetch_add(1, Ordering::SeqCst);
    });

    store.set_value("scratch", "a", json!(1), false)?;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    assert!(store.unsubscribe(id));
    store.set_value("scratch", "b", json!(2), false)?;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_missing_section_and_unsupported_format() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_in(dir.path());

    assert!(matches!(
        store.get_section("nope").unwrap_err(),
        ConfigError::NotFound { .. }
    ));
    assert!(matches!(
        store.load("nope").unwrap_err(),
        ConfigError::NotFound { .. }
    ));
    assert!(matches!(
        store
            .register_file("bad", dir.path().join("bad.toml"), None)
            .unwrap_err(),
        ConfigError::UnsupportedFormat { .. }
    ));
    Ok(())
}

#[test]
fn test_missing_file_loads_schema_defaults_with_warning() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_in(dir.path());
    store.register_schema(
        "plugins",
        &json!({
            "type": "object",
            "properties": {"autoload": {"type": "boolean", "default": true}}
        }),
    )?;
    store.register_file("plugins", dir.path().join("plugins.json"), None)?;

    store.load("plugins")?;
    assert_eq!(store.get_value("plugins", "autoload"), Some(json!(true)));
    assert!(
        store
            .section_warnings("plugins")
            .iter()
            .any(|w| w.contains("missing"))
    );
    Ok(())
}

#[test]
fn test_yaml_sections_roundtrip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("notes.yaml"), "pinned: true\nfolders:\n  inbox: 3\n")?;

    let store = store_in(dir.path());
    store.register_file("notes", dir.path().join("notes.yaml"), None)?;
    store.load("notes")?;

    assert_eq!(store.get_value("notes", "folders.inbox"), Some(json!(3)));
    store.set_value("notes", "pinned", json!(false), false)?;
    store.save_section("notes", false)?;
    store.reload_section("notes")?;
    assert_eq!(store.get_value("notes", "pinned"), Some(json!(false)));
    Ok(())
}

#[test]
fn test_migration_history_is_exposed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store_in(dir.path());

    let history = store.migration_history("security", "1.0.0")?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].to_version, "1.1.0");
    Ok(())
}
