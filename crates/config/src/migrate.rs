//! Versioned migration of section documents.
//!
//! Responsibilities:
//! - Hold an ordered set of migration rules per section.
//! - Chain rules from a document's declared version up to the current one.
//! - Audit documents for their section's required keys, as a standalone
//!   check outside the migration chain.
//!
//! Does NOT handle:
//! - Reading or writing the `_version` key (see `store`).
//! - Schema validation beyond required-key presence (see `schema`).
//!
//! Invariants:
//! - Rule selection is first-match: at each step the earliest-`from` rule
//!   whose `[from, to)` interval contains the current version is applied.
//! - A chain stops when no rule applies or the current version is reached;
//!   stopping short is not an error.
//! - A document without a declared version is assumed current and passes
//!   through untouched.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use semver::Version;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::constants::CURRENT_CONFIG_VERSION;

type TransformFn = dyn Fn(Map<String, Value>) -> Map<String, Value> + Send + Sync;

/// Errors raised while registering or applying migrations.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("invalid version '{version}': {source}")]
    InvalidVersion {
        version: String,
        #[source]
        source: semver::Error,
    },

    #[error("migration for '{section}' must move forward, got {from} -> {to}")]
    NotForward {
        section: String,
        from: Version,
        to: Version,
    },

    #[error("migrated '{section}' document is missing required key '{key}'")]
    MissingRequiredKey { section: String, key: String },
}

/// One registered migration step for a section.
#[derive(Clone)]
pub struct MigrationRule {
    pub from_version: Version,
    pub to_version: Version,
    pub section: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    transform: Arc<TransformFn>,
}

impl fmt::Debug for MigrationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationRule")
            .field("section", &self.section)
            .field("from_version", &self.from_version)
            .field("to_version", &self.to_version)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// A rule descriptor, used for migration history reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationStep {
    pub from_version: String,
    pub to_version: String,
    pub description: String,
}

/// Result of migrating one section document.
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub data: Map<String, Value>,
    pub applied: Vec<MigrationStep>,
}

/// Rule registry plus the chaining logic that walks a document from its
/// declared version to [`CURRENT_CONFIG_VERSION`].
pub struct MigrationEngine {
    rules: Vec<MigrationRule>,
    current_version: Version,
}

impl fmt::Debug for MigrationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationEngine")
            .field("current_version", &self.current_version)
            .field("rules", &self.rules.len())
            .finish()
    }
}

impl Default for MigrationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationEngine {
    /// Creates an engine pre-loaded with the builtin upgrade rules.
    pub fn new() -> Self {
        let mut engine = Self {
            rules: Vec::new(),
            current_version: Version::parse(CURRENT_CONFIG_VERSION)
                .unwrap_or_else(|_| Version::new(1, 0, 0)),
        };

        engine
            .register(
                "0.9.0",
                "1.0.0",
                "llm",
                "restructure flat API settings into per-provider entries",
                migrate_llm_v0_9_to_v1_0,
            )
            .and_then(|_| {
                engine.register(
                    "0.9.0",
                    "1.0.0",
                    "ui",
                    "group window geometry keys and seed chat defaults",
                    migrate_ui_v0_9_to_v1_0,
                )
            })
            .and_then(|_| {
                engine.register(
                    "1.0.0",
                    "1.1.0",
                    "security",
                    "add password policy and proxy settings",
                    migrate_security_v1_0_to_v1_1,
                )
            })
            .unwrap_or_else(|e| {
                // Builtin rules use literal versions and cannot fail to parse.
                unreachable!("builtin migration registration failed: {e}")
            });

        engine
    }

    pub fn current_version(&self) -> &Version {
        &self.current_version
    }

    /// Registers a migration rule. Rules must move strictly forward.
    pub fn register(
        &mut self,
        from_version: &str,
        to_version: &str,
        section: &str,
        description: &str,
        transform: impl Fn(Map<String, Value>) -> Map<String, Value> + Send + Sync + 'static,
    ) -> Result<(), MigrationError> {
        let from = parse_version(from_version)?;
        let to = parse_version(to_version)?;
        if to <= from {
            return Err(MigrationError::NotForward {
                section: section.to_string(),
                from,
                to,
            });
        }

        tracing::debug!(
            section = %section,
            from = %from,
            to = %to,
            "Registered migration rule"
        );
        self.rules.push(MigrationRule {
            from_version: from,
            to_version: to,
            section: section.to_string(),
            description: description.to_string(),
            created_at: Utc::now(),
            transform: Arc::new(transform),
        });
        Ok(())
    }

    /// Migrates a section document from `from_version` to the current
    /// version, applying each matching rule in order.
    ///
    /// `from_version: None` means the document is assumed current and is
    /// returned unchanged.
    pub fn migrate_section(
        &self,
        section: &str,
        data: Map<String, Value>,
        from_version: Option<&str>,
    ) -> Result<MigrationOutcome, MigrationError> {
        let Some(from_version) = from_version else {
            return Ok(MigrationOutcome {
                data,
                applied: Vec::new(),
            });
        };
        let from = parse_version(from_version)?;

        let path = self.find_path(section, &from);
        let mut migrated = data;
        let mut applied = Vec::with_capacity(path.len());
        for rule in &path {
            tracing::info!(
                section = %section,
                from = %rule.from_version,
                to = %rule.to_version,
                "Applying migration: {}",
                rule.description
            );
            migrated = (rule.transform)(migrated);
            applied.push(MigrationStep {
                from_version: rule.from_version.to_string(),
                to_version: rule.to_version.to_string(),
                description: rule.description.clone(),
            });
        }

        // A chain that stops short is not an error; schema validation is
        // the authority on the resulting shape.
        let reached = path
            .last()
            .map(|rule| rule.to_version.clone())
            .unwrap_or_else(|| from.clone());
        if reached < self.current_version {
            tracing::warn!(
                section = %section,
                reached = %reached,
                target = %self.current_version,
                "No migration rule covers the remaining range, stopping short"
            );
        } else if !applied.is_empty() {
            tracing::info!(
                section = %section,
                from = %from,
                to = %self.current_version,
                steps = applied.len(),
                "Migration complete"
            );
        }
        Ok(MigrationOutcome {
            data: migrated,
            applied,
        })
    }

    /// Returns the rule chain that would be applied when migrating from
    /// `from_version`, without running it.
    pub fn migration_history(
        &self,
        section: &str,
        from_version: &str,
    ) -> Result<Vec<MigrationStep>, MigrationError> {
        let from = parse_version(from_version)?;
        Ok(self
            .find_path(section, &from)
            .into_iter()
            .map(|rule| MigrationStep {
                from_version: rule.from_version.to_string(),
                to_version: rule.to_version.to_string(),
                description: rule.description.clone(),
            })
            .collect())
    }

    fn find_path(&self, section: &str, from: &Version) -> Vec<&MigrationRule> {
        let mut section_rules: Vec<&MigrationRule> = self
            .rules
            .iter()
            .filter(|rule| rule.section == section)
            .collect();
        section_rules.sort_by(|a, b| a.from_version.cmp(&b.from_version));

        let mut path = Vec::new();
        let mut current = from.clone();
        while current < self.current_version {
            let Some(rule) = section_rules
                .iter()
                .find(|rule| rule.from_version <= current && rule.to_version > current)
            else {
                break;
            };
            path.push(*rule);
            current = rule.to_version.clone();
        }
        path
    }

    /// Checks that a document carries its section's required keys.
    ///
    /// A standalone audit, deliberately not part of [`Self::migrate_section`]:
    /// a chain that stops short of the current version is a warning there,
    /// not a failure.
    pub fn verify(&self, section: &str, data: &Map<String, Value>) -> Result<(), MigrationError> {
        for key in required_keys(section) {
            if !data.contains_key(*key) {
                return Err(MigrationError::MissingRequiredKey {
                    section: section.to_string(),
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }
}

fn parse_version(raw: &str) -> Result<Version, MigrationError> {
    Version::parse(raw).map_err(|source| MigrationError::InvalidVersion {
        version: raw.to_string(),
        source,
    })
}

/// Keys a section must carry once fully migrated.
fn required_keys(section: &str) -> &'static [&'static str] {
    match section {
        "llm" => &["default_provider", "default_model", "providers"],
        "ui" => &["theme", "language"],
        "security" => &["encryption_enabled", "session_timeout"],
        "app" => &["name", "version"],
        _ => &[],
    }
}

fn migrate_llm_v0_9_to_v1_0(mut data: Map<String, Value>) -> Map<String, Value> {
    if let Some(Value::Object(old_settings)) = data.remove("api_settings") {
        let mut providers = Map::new();

        if let Some(Value::Object(openai)) = old_settings.get("openai").cloned() {
            providers.insert(
                "openai".to_string(),
                serde_json::json!({
                    "api_key": openai.get("api_key").cloned().unwrap_or_else(|| Value::String(String::new())),
                    "base_url": "https://api.openai.com/v1",
                    "models": ["gpt-3.5-turbo", "gpt-4"],
                    "enabled": openai.get("enabled").cloned().unwrap_or(Value::Bool(true)),
                    "timeout": 30.0,
                    "retry_count": 3,
                    "rate_limit": 60
                }),
            );
        }

        data.insert("providers".to_string(), Value::Object(providers));
        data.insert(
            "default_provider".to_string(),
            Value::String("openai".to_string()),
        );
        data.insert(
            "default_model".to_string(),
            Value::String("gpt-3.5-turbo".to_string()),
        );
    }
    data
}

fn migrate_ui_v0_9_to_v1_0(mut data: Map<String, Value>) -> Map<String, Value> {
    if data.contains_key("window_width") || data.contains_key("window_height") {
        let window = serde_json::json!({
            "width": data.remove("window_width").unwrap_or(serde_json::json!(800)),
            "height": data.remove("window_height").unwrap_or(serde_json::json!(600)),
            "x": data.remove("window_x").unwrap_or(serde_json::json!(100)),
            "y": data.remove("window_y").unwrap_or(serde_json::json!(100)),
            "maximized": data.remove("maximized").unwrap_or(Value::Bool(false)),
            "fullscreen": false
        });
        data.insert("window".to_string(), window);
    }

    data.entry("chat".to_string()).or_insert_with(|| {
        serde_json::json!({
            "auto_save": true,
            "history_limit": 1000,
            "word_wrap": true,
            "syntax_highlight": true,
            "show_timestamps": false,
            "export_format": "json"
        })
    });

    data
}

fn migrate_security_v1_0_to_v1_1(mut data: Map<String, Value>) -> Map<String, Value> {
    data.entry("password_policy".to_string()).or_insert_with(|| {
        serde_json::json!({
            "min_length": 8,
            "require_uppercase": true,
            "require_lowercase": true,
            "require_numbers": true,
            "require_symbols": false
        })
    });

    data.entry("proxy_settings".to_string()).or_insert_with(|| {
        serde_json::json!({
            "enabled": false,
            "host": "",
            "port": 8080,
            "username": "",
            "password": ""
        })
    });

    data
}
