//! The configuration store: sections, load/save pipelines, transactions.
//!
//! Responsibilities:
//! - Own all registered sections and their lifecycle.
//! - Run the load pipeline: read, environment overlay, decrypt, migrate,
//!   validate, install.
//! - Run the save pipeline: validate, version-stamp, encrypt, backup,
//!   atomic write.
//! - Provide transactions, export/import and change notification.
//!
//! Does NOT handle:
//! - Schema compilation (see `schema`), rule chaining (see `migrate`) or
//!   key material (see `encryption`).
//!
//! Invariants:
//! - Lock order is always registry, then one section, then an auxiliary
//!   component; two section locks are never held at once.
//! - Subscriber callbacks run with no store locks held.
//! - A save never overwrites an existing file without writing a backup
//!   first, and the final write is atomic (temp file + rename).
//! - A failed transaction leaves in-memory state exactly as it was.

mod builder;
mod defaults;
mod error;
mod section;

pub use builder::ConfigStoreBuilder;
pub use defaults::{DEFAULT_SECTIONS, builtin_schema, default_document};
pub use error::ConfigError;
pub use section::{Section, SectionFormat, SectionState};

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use secrecy::SecretString;
use serde_json::{Map, Value};

use crate::constants::{CURRENT_CONFIG_VERSION, ENCRYPTION_INFO_KEY, VERSION_KEY};
use crate::document;
use crate::encryption::{CryptoService, is_encrypted_value, is_sensitive};
use crate::events::{ChangeSource, ConfigChangeEvent, EventBus, SubscriptionId, notify};
use crate::migrate::{MigrationEngine, MigrationStep};
use crate::schema::{SchemaRegistry, ValidationReport};

/// How load-time failures are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Any parse, decrypt, migration or validation failure is an error; the
    /// section enters the `Error` state and keeps its prior data.
    Strict,
    /// Validation and decryption failures degrade to warnings; parse and IO
    /// failures remain errors.
    #[default]
    Lenient,
    /// Any failure falls back to schema defaults with a warning. Corrupt
    /// files are backed up before being abandoned.
    Fallback,
}

/// Per-section outcome aggregation for [`ConfigStore::load_all`].
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<(String, ConfigError)>,
}

impl LoadReport {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

type SectionHandle = Arc<Mutex<Section>>;

/// Thread-safe, schema-validated, versioned configuration store.
///
/// Collaborators hold an `Arc<ConfigStore>`; there is no global instance.
pub struct ConfigStore {
    config_dir: PathBuf,
    environment: String,
    load_mode: LoadMode,
    auto_save: bool,
    encrypt_at_rest: bool,
    sections: Mutex<BTreeMap<String, SectionHandle>>,
    schemas: Mutex<SchemaRegistry>,
    migrations: Mutex<MigrationEngine>,
    crypto: Mutex<CryptoService>,
    events: Mutex<EventBus>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("config_dir", &self.config_dir)
            .field("environment", &self.environment)
            .field("load_mode", &self.load_mode)
            .field("sections", &self.sections.lock().len())
            .finish_non_exhaustive()
    }
}

impl ConfigStore {
    pub fn builder() -> ConfigStoreBuilder {
        ConfigStoreBuilder::new()
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        config_dir: PathBuf,
        environment: String,
        load_mode: LoadMode,
        auto_save: bool,
        encrypt_at_rest: bool,
        crypto: CryptoService,
        event_history_limit: usize,
    ) -> Self {
        Self {
            config_dir,
            environment,
            load_mode,
            auto_save,
            encrypt_at_rest,
            sections: Mutex::new(BTreeMap::new()),
            schemas: Mutex::new(SchemaRegistry::new()),
            migrations: Mutex::new(MigrationEngine::new()),
            crypto: Mutex::new(crypto),
            events: Mutex::new(EventBus::new(event_history_limit)),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn load_mode(&self) -> LoadMode {
        self.load_mode
    }

    // === Registration ===

    /// Registers a section backed by a file. The format is inferred from
    /// the extension unless given explicitly.
    pub fn register_file(
        &self,
        name: &str,
        path: impl Into<PathBuf>,
        format: Option<SectionFormat>,
    ) -> Result<(), ConfigError> {
        let path = path.into();
        let format = format
            .or_else(|| SectionFormat::from_path(&path))
            .ok_or_else(|| ConfigError::UnsupportedFormat { path: path.clone() })?;

        let mut sections = self.sections.lock();
        match sections.get(name) {
            Some(handle) => {
                let mut section = handle.lock();
                section.path = Some(path);
                section.format = format;
            }
            None => {
                sections.insert(
                    name.to_string(),
                    Arc::new(Mutex::new(Section::with_file(name, path, format))),
                );
            }
        }
        tracing::debug!(section = %name, "Registered section file");
        Ok(())
    }

    pub fn register_schema(&self, name: &str, schema: &Value) -> Result<(), ConfigError> {
        self.schemas.lock().register(name, schema)?;
        Ok(())
    }

    pub fn register_migration(
        &self,
        from_version: &str,
        to_version: &str,
        section: &str,
        description: &str,
        transform: impl Fn(Map<String, Value>) -> Map<String, Value> + Send + Sync + 'static,
    ) -> Result<(), ConfigError> {
        self.migrations
            .lock()
            .register(from_version, to_version, section, description, transform)?;
        Ok(())
    }

    /// Installs the builtin schemas and file registrations for the standard
    /// sections, writing default documents for files that do not exist yet.
    pub fn install_defaults(&self) -> Result<(), ConfigError> {
        for name in DEFAULT_SECTIONS {
            let schema = builtin_schema(name).expect("builtin section has a schema");
            self.register_schema(name, &schema)?;

            let path = self.config_dir.join(format!("{name}.json"));
            if !path.exists() {
                let document = default_document(name).expect("builtin section has defaults");
                write_atomic(
                    &path,
                    &SectionFormat::Json.serialize(&path, &document)?,
                )?;
                tracing::info!(section = %name, path = %path.display(), "Created default config");
            }
            self.register_file(name, path, Some(SectionFormat::Json))?;
        }
        Ok(())
    }

    // === Loading ===

    /// Loads one section through the full pipeline: read, environment
    /// overlay, decrypt, migrate, validate, install.
    pub fn load(&self, name: &str) -> Result<(), ConfigError> {
        let handle = self.handle(name).ok_or_else(|| ConfigError::NotFound {
            section: name.to_string(),
        })?;

        let events = {
            let mut section = handle.lock();
            match self.run_load(&mut section) {
                Ok(applied) => {
                    section.state = SectionState::Active;
                    tracing::debug!(section = %name, "Section loaded");
                    let mut events = vec![ConfigChangeEvent::new(
                        name,
                        None,
                        None,
                        Some(Value::Object(section.data.clone())),
                        ChangeSource::Load,
                    )];
                    if !applied.is_empty() {
                        events.push(ConfigChangeEvent::new(
                            name,
                            None,
                            None,
                            Some(Value::Object(section.data.clone())),
                            ChangeSource::Migration,
                        ));
                    }
                    events
                }
                Err(e) => {
                    section.state = SectionState::Error;
                    tracing::error!(section = %name, error = %e, "Section load failed");
                    return Err(e);
                }
            }
        };
        for e in events {
            self.publish(e);
        }
        Ok(())
    }

    /// Loads every registered section, aggregating per-section failures
    /// instead of aborting at the first.
    pub fn load_all(&self) -> LoadReport {
        let names: Vec<String> = self.sections.lock().keys().cloned().collect();
        let mut report = LoadReport::default();
        for name in names {
            match self.load(&name) {
                Ok(()) => report.loaded.push(name),
                Err(e) => report.failed.push((name, e)),
            }
        }
        if !report.is_ok() {
            tracing::warn!(
                failed = report.failed.len(),
                loaded = report.loaded.len(),
                "Some sections failed to load"
            );
        }
        report
    }

    pub fn reload_section(&self, name: &str) -> Result<(), ConfigError> {
        self.load(name)
    }

    fn run_load(&self, section: &mut Section) -> Result<Vec<MigrationStep>, ConfigError> {
        let name = section.name.clone();
        section.warnings.clear();
        section.state = SectionState::Loading;

        // Read the base file, falling back to schema defaults when missing.
        let mut data = match &section.path {
            Some(path) if path.exists() => match read_document(path, section.format) {
                Ok(data) => data,
                Err(e) if self.load_mode == LoadMode::Fallback => {
                    self.backup_corrupt(path);
                    section
                        .warnings
                        .push(format!("unreadable file, using defaults: {e}"));
                    tracing::warn!(section = %name, error = %e, "Falling back to defaults");
                    self.schema_defaults(&name)
                }
                Err(e) => return Err(e),
            },
            Some(path) => {
                section.warnings.push("config file missing, using defaults".to_string());
                tracing::warn!(
                    section = %name,
                    path = %path.display(),
                    "Config file not found, using defaults"
                );
                self.schema_defaults(&name)
            }
            None => section.data.clone(),
        };

        // Environment overlay: <section>.<environment>.<ext>, merged on top.
        if let Some(path) = &section.path {
            let overlay_path = path.with_file_name(format!(
                "{name}.{}.{}",
                self.environment,
                section.format.extension()
            ));
            if overlay_path.exists() {
                match read_document(&overlay_path, section.format) {
                    Ok(overlay) => {
                        document::deep_merge(&mut data, overlay);
                        tracing::debug!(section = %name, environment = %self.environment, "Applied environment overlay");
                    }
                    Err(e) => {
                        section
                            .warnings
                            .push(format!("environment overlay skipped: {e}"));
                        tracing::warn!(section = %name, error = %e, "Skipping unreadable environment overlay");
                    }
                }
            }
        }

        // Decrypt documents flagged as encrypted.
        if data.contains_key(ENCRYPTION_INFO_KEY) || tree_has_encrypted(&data) {
            match self.crypto.lock().decrypt_tree(&data) {
                Ok(decrypted) => data = decrypted,
                Err(e) if self.load_mode == LoadMode::Strict => return Err(e.into()),
                Err(e) => {
                    section
                        .warnings
                        .push(format!("decryption failed, keeping raw values: {e}"));
                    tracing::warn!(section = %name, error = %e, "Decryption failed, keeping raw values");
                }
            }
        }

        // Migrate from the document's declared version. Absent means
        // current. The version key is wire-level metadata: it is stripped
        // here and re-stamped on save.
        section.state = SectionState::Migrating;
        let from_version = data
            .remove(VERSION_KEY)
            .as_ref()
            .and_then(Value::as_str)
            .map(str::to_string);
        let mut applied = Vec::new();
        match self
            .migrations
            .lock()
            .migrate_section(&name, data.clone(), from_version.as_deref())
        {
            Ok(outcome) => {
                if !outcome.applied.is_empty() {
                    data = outcome.data;
                    applied = outcome.applied;
                }
            }
            Err(e) => match self.load_mode {
                LoadMode::Strict => return Err(e.into()),
                LoadMode::Lenient => {
                    section.warnings.push(format!("migration failed: {e}"));
                    tracing::warn!(section = %name, error = %e, "Migration failed, keeping unmigrated data");
                }
                LoadMode::Fallback => {
                    section
                        .warnings
                        .push(format!("migration failed, using defaults: {e}"));
                    tracing::warn!(section = %name, error = %e, "Migration failed, falling back to defaults");
                    data = self.schema_defaults(&name);
                }
            },
        }

        // Validate against the registered schema.
        section.state = SectionState::Validating;
        let report = self.schemas.lock().validate(&name, &Value::Object(data.clone()));
        for warning in &report.warnings {
            tracing::warn!(section = %name, "{warning}");
        }
        section.warnings.extend(report.warnings.iter().cloned());
        if !report.is_valid {
            match self.load_mode {
                LoadMode::Strict => {
                    return Err(ConfigError::Validation {
                        section: name,
                        report,
                    });
                }
                LoadMode::Lenient => {
                    for issue in &report.errors {
                        tracing::warn!(section = %name, path = %issue.path, "{}", issue.message);
                        section
                            .warnings
                            .push(format!("{}: {}", issue.path, issue.message));
                    }
                }
                LoadMode::Fallback => {
                    tracing::warn!(
                        section = %name,
                        errors = report.errors.len(),
                        "Validation failed, falling back to defaults"
                    );
                    section
                        .warnings
                        .push(format!("validation failed with {} error(s), using defaults", report.errors.len()));
                    data = self.schema_defaults(&name);
                }
            }
        }

        section.data = data;
        Ok(applied)
    }

    // === Reads ===

    pub fn list_sections(&self) -> Vec<String> {
        self.sections.lock().keys().cloned().collect()
    }

    pub fn section_exists(&self, name: &str) -> bool {
        self.sections.lock().contains_key(name)
    }

    /// Snapshot of a section's document.
    pub fn get_section(&self, name: &str) -> Result<Map<String, Value>, ConfigError> {
        let handle = self.handle(name).ok_or_else(|| ConfigError::NotFound {
            section: name.to_string(),
        })?;
        let section = handle.lock();
        Ok(section.snapshot())
    }

    /// Looks up a dotted key. `None` when the section or key is absent.
    pub fn get_value(&self, name: &str, key: &str) -> Option<Value> {
        let handle = self.handle(name)?;
        let section = handle.lock();
        lookup(&section.data, key).cloned()
    }

    pub fn section_state(&self, name: &str) -> Option<SectionState> {
        let handle = self.handle(name)?;
        let state = handle.lock().state;
        Some(state)
    }

    pub fn section_warnings(&self, name: &str) -> Vec<String> {
        self.handle(name)
            .map(|handle| handle.lock().warnings.clone())
            .unwrap_or_default()
    }

    // === Writes ===

    /// Sets a dotted key, creating the section and intermediate objects as
    /// needed. Returns the previous value.
    ///
    /// Writing a value equal to the current one is a no-op: no event, no
    /// save. With `save_immediately` (or store-wide auto-save) the section
    /// is persisted before this returns.
    pub fn set_value(
        &self,
        name: &str,
        key: &str,
        value: Value,
        save_immediately: bool,
    ) -> Result<Option<Value>, ConfigError> {
        let handle = self.handle_or_create(name);

        let old = {
            let mut section = handle.lock();
            let old = lookup(&section.data, key).cloned();
            if old.as_ref() == Some(&value) {
                tracing::debug!(section = %name, key = %key, "Unchanged value, skipping");
                return Ok(old);
            }
            document::set_path(&mut section.data, key, value.clone());
            old
        };

        // The mutation is already committed, so the event goes out even if
        // the save below fails.
        self.publish(ConfigChangeEvent::new(
            name,
            Some(key),
            old.clone(),
            Some(value),
            ChangeSource::Api,
        ));
        if save_immediately || self.auto_save {
            self.save_section(name, false)?;
        }
        Ok(old)
    }

    /// Removes a dotted key, returning the removed value. Removing a missing
    /// key is a no-op.
    pub fn delete_value(&self, name: &str, key: &str) -> Result<Option<Value>, ConfigError> {
        let handle = self.handle(name).ok_or_else(|| ConfigError::NotFound {
            section: name.to_string(),
        })?;

        let old = {
            let mut section = handle.lock();
            document::remove_path(&mut section.data, key)
        };
        let Some(old) = old else {
            return Ok(None);
        };

        self.publish(ConfigChangeEvent::new(
            name,
            Some(key),
            Some(old.clone()),
            None,
            ChangeSource::Api,
        ));
        if self.auto_save {
            self.save_section(name, false)?;
        }
        Ok(Some(old))
    }

    /// Restores a section to its schema defaults. The section itself is
    /// never destroyed.
    pub fn reset_section(&self, name: &str) -> Result<(), ConfigError> {
        let handle = self.handle(name).ok_or_else(|| ConfigError::NotFound {
            section: name.to_string(),
        })?;
        let defaults = self.schema_defaults(name);

        let old = {
            let mut section = handle.lock();
            if section.data == defaults {
                return Ok(());
            }
            std::mem::replace(&mut section.data, defaults.clone())
        };

        tracing::info!(section = %name, "Section reset to defaults");
        self.publish(ConfigChangeEvent::new(
            name,
            None,
            Some(Value::Object(old)),
            Some(Value::Object(defaults)),
            ChangeSource::Reset,
        ));
        if self.auto_save {
            self.save_section(name, false)?;
        }
        Ok(())
    }

    // === Saving ===

    /// Persists one section: validate (unless `force`), stamp the format
    /// version, encrypt when at-rest encryption applies, back up the
    /// existing file, write atomically.
    pub fn save_section(&self, name: &str, force: bool) -> Result<(), ConfigError> {
        let handle = self.handle(name).ok_or_else(|| ConfigError::NotFound {
            section: name.to_string(),
        })?;

        let (data, path, format) = {
            let mut section = handle.lock();
            let Some(path) = section.path.clone() else {
                tracing::debug!(section = %name, "Section has no backing file, skipping save");
                return Ok(());
            };
            section.state = SectionState::Saving;
            (section.snapshot(), path, section.format)
        };

        let result = self.save_pipeline(name, data, &path, format, force);
        handle.lock().state = if result.is_ok() {
            SectionState::Active
        } else {
            SectionState::Error
        };
        result
    }

    fn save_pipeline(
        &self,
        name: &str,
        data: Map<String, Value>,
        path: &Path,
        format: SectionFormat,
        force: bool,
    ) -> Result<(), ConfigError> {
        if !force {
            let report = self.schemas.lock().validate(name, &Value::Object(data.clone()));
            if !report.is_valid {
                tracing::error!(
                    section = %name,
                    errors = report.errors.len(),
                    "Refusing to save invalid section"
                );
                return Err(ConfigError::Validation {
                    section: name.to_string(),
                    report,
                });
            }
        }

        let mut document = data;
        document.insert(
            VERSION_KEY.to_string(),
            Value::String(CURRENT_CONFIG_VERSION.to_string()),
        );

        if self.should_encrypt(name, &document) {
            document = self.crypto.lock().encrypt_tree(&document)?;
        }

        if path.exists() {
            let stamp = Utc::now().format("%Y%m%d_%H%M%S");
            let backup = path.with_file_name(format!(
                "{name}.backup.{stamp}.{}",
                format.extension()
            ));
            fs::copy(path, &backup).map_err(|e| ConfigError::io(path, e))?;
            tracing::debug!(section = %name, backup = %backup.display(), "Backed up config file");
        }

        write_atomic(path, &format.serialize(path, &document)?)?;
        tracing::info!(section = %name, path = %path.display(), "Section saved");
        Ok(())
    }

    /// Persists every file-backed section, stopping at the first failure.
    pub fn save_all(&self) -> Result<(), ConfigError> {
        for name in self.list_sections() {
            self.save_section(&name, false)?;
        }
        tracing::debug!("All sections saved");
        Ok(())
    }

    /// Whether a section's document gets encrypted on save: the store-wide
    /// flag, the security section's `encryption_enabled`, or sensitive
    /// leaves under an enabled `api_key_encryption`.
    fn should_encrypt(&self, name: &str, document: &Map<String, Value>) -> bool {
        if self.encrypt_at_rest {
            return true;
        }

        let security = if name == "security" {
            Some(document.clone())
        } else {
            self.handle("security").map(|handle| handle.lock().snapshot())
        };
        let Some(security) = security else {
            return false;
        };

        let enabled = security
            .get("encryption_enabled")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if enabled {
            return true;
        }

        let api_key_encryption = security
            .get("api_key_encryption")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        api_key_encryption && tree_has_sensitive(document)
    }

    // === Validation ===

    pub fn validate_section(&self, name: &str) -> Result<ValidationReport, ConfigError> {
        let data = self.get_section(name)?;
        Ok(self.schemas.lock().validate(name, &Value::Object(data)))
    }

    pub fn default_for(&self, name: &str) -> Value {
        self.schemas.lock().default_for(name)
    }

    pub fn sample_for(&self, name: &str) -> Value {
        self.schemas.lock().sample_for(name)
    }

    fn schema_defaults(&self, name: &str) -> Map<String, Value> {
        match self.schemas.lock().default_for(name) {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    // === Transactions ===

    /// Runs `f` against the store, persisting everything on success and
    /// restoring the pre-transaction state on failure.
    ///
    /// No partial writes: `save_all` runs only after the closure succeeds,
    /// and a failed save also rolls the in-memory state back.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Self) -> Result<T, ConfigError>,
    ) -> Result<T, ConfigError> {
        let snapshot: Vec<(String, SectionHandle, Map<String, Value>)> = {
            let sections = self.sections.lock();
            sections
                .iter()
                .map(|(name, handle)| (name.clone(), Arc::clone(handle), handle.lock().snapshot()))
                .collect()
        };

        match f(self).and_then(|value| self.save_all().map(|()| value)) {
            Ok(value) => {
                tracing::debug!("Transaction committed");
                Ok(value)
            }
            Err(e) => {
                tracing::error!(error = %e, "Transaction failed, rolling back");
                for (_, handle, data) in &snapshot {
                    handle.lock().data = data.clone();
                }
                // Sections created inside the failed transaction are removed.
                let known: Vec<&str> = snapshot.iter().map(|(name, _, _)| name.as_str()).collect();
                self.sections
                    .lock()
                    .retain(|name, _| known.contains(&name.as_str()));
                Err(e)
            }
        }
    }

    // === Export / import ===

    /// Exports the selected sections (all by default) to a single file with
    /// an `_metadata` block.
    pub fn export_config(
        &self,
        path: impl AsRef<Path>,
        sections: Option<&[&str]>,
    ) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let format = SectionFormat::from_path(path)
            .ok_or_else(|| ConfigError::UnsupportedFormat { path: path.to_path_buf() })?;

        let names: Vec<String> = match sections {
            Some(names) => names.iter().map(|n| n.to_string()).collect(),
            None => self.list_sections(),
        };

        let mut export = Map::new();
        for name in &names {
            if let Some(handle) = self.handle(name) {
                export.insert(name.clone(), Value::Object(handle.lock().snapshot()));
            }
        }
        export.insert(
            "_metadata".to_string(),
            serde_json::json!({
                "exported_at": Utc::now().to_rfc3339(),
                "environment": self.environment,
                "version": CURRENT_CONFIG_VERSION,
                "sections": names,
            }),
        );

        write_atomic(path, &format.serialize(path, &export)?)?;
        tracing::info!(path = %path.display(), sections = names.len(), "Config exported");
        Ok(())
    }

    /// Imports sections from an exported file. With `merge` the imported
    /// data is deep-merged onto the current data; otherwise it replaces it.
    pub fn import_config(
        &self,
        path: impl AsRef<Path>,
        sections: Option<&[&str]>,
        merge: bool,
    ) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let format = SectionFormat::from_path(path)
            .ok_or_else(|| ConfigError::UnsupportedFormat { path: path.to_path_buf() })?;
        let mut import = read_document(path, format)?;
        import.remove("_metadata");

        let names: Vec<String> = match sections {
            Some(names) => names.iter().map(|n| n.to_string()).collect(),
            None => import.keys().cloned().collect(),
        };

        for name in &names {
            let Some(Value::Object(incoming)) = import.get(name).cloned() else {
                continue;
            };
            let handle = self.handle_or_create(name);

            let (old, new) = {
                let mut section = handle.lock();
                let old = section.snapshot();
                if merge {
                    document::deep_merge(&mut section.data, incoming);
                } else {
                    section.data = incoming;
                }
                (old, section.snapshot())
            };
            if old == new {
                continue;
            }

            self.publish(ConfigChangeEvent::new(
                name,
                None,
                Some(Value::Object(old)),
                Some(Value::Object(new)),
                ChangeSource::Import,
            ));
            if self.auto_save {
                self.save_section(name, false)?;
            }
        }

        tracing::info!(path = %path.display(), "Config imported");
        Ok(())
    }

    // === Events ===

    pub fn subscribe(
        &self,
        callback: impl Fn(&ConfigChangeEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.events.lock().subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.lock().unsubscribe(id)
    }

    pub fn recent_events(&self, limit: usize) -> Vec<ConfigChangeEvent> {
        self.events.lock().recent(limit)
    }

    fn publish(&self, event: ConfigChangeEvent) {
        let subscribers = self.events.lock().publish(event.clone());
        notify(&subscribers, &event);
    }

    // === Encryption passthrough ===

    pub fn encryption_info(&self) -> Value {
        self.crypto.lock().encryption_info()
    }

    pub fn rotate_master_key(
        &self,
        new_password: Option<&SecretString>,
    ) -> Result<(), ConfigError> {
        self.crypto.lock().rotate_master_key(new_password)?;
        Ok(())
    }

    pub fn migration_history(
        &self,
        section: &str,
        from_version: &str,
    ) -> Result<Vec<MigrationStep>, ConfigError> {
        Ok(self.migrations.lock().migration_history(section, from_version)?)
    }

    // === Internals ===

    fn handle(&self, name: &str) -> Option<SectionHandle> {
        self.sections.lock().get(name).cloned()
    }

    fn handle_or_create(&self, name: &str) -> SectionHandle {
        let mut sections = self.sections.lock();
        Arc::clone(sections.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!(section = %name, "Created section on first write");
            let mut section = Section::new(name);
            section.state = SectionState::Active;
            Arc::new(Mutex::new(section))
        }))
    }

    fn backup_corrupt(&self, path: &Path) {
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let backup = path.with_extension(format!("corrupt.{stamp}"));
        match fs::rename(path, &backup) {
            Ok(()) => {
                tracing::warn!(
                    path = %path.display(),
                    backup = %backup.display(),
                    "Backed up corrupt config file"
                );
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to back up corrupt config file");
            }
        }
    }
}

fn lookup<'a>(data: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    let mut segments = key.split('.');
    let mut current = data.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn read_document(path: &Path, format: SectionFormat) -> Result<Map<String, Value>, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
    format.parse(path, &content)
}

/// Writes content via a temp file and rename so the target is never left
/// partially written.
fn write_atomic(path: &Path, content: &str) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ConfigError::io(parent, e))?;
    }
    let temp = path.with_extension("tmp");
    fs::write(&temp, content).map_err(|e| ConfigError::io(&temp, e))?;
    fs::rename(&temp, path).map_err(|e| ConfigError::io(path, e))?;
    Ok(())
}

fn tree_has_encrypted(data: &Map<String, Value>) -> bool {
    data.values().any(|value| match value {
        Value::Object(child) => is_encrypted_value(value) || tree_has_encrypted(child),
        _ => false,
    })
}

fn tree_has_sensitive(data: &Map<String, Value>) -> bool {
    data.iter().any(|(key, value)| {
        if key.starts_with(crate::constants::METADATA_PREFIX) {
            return false;
        }
        is_sensitive(key, value)
            || value.as_object().is_some_and(tree_has_sensitive)
    })
}
