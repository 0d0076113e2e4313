//! Section state and on-disk format handling.
//!
//! Responsibilities:
//! - Track a section's lifecycle state and in-memory document.
//! - Parse and serialize section files (JSON and YAML).
//!
//! Does NOT handle:
//! - Locking (the store wraps each section in its own mutex).
//! - Validation, migration or encryption (store pipeline concerns).
//!
//! Invariants:
//! - A section's document is always a JSON object at the top level.
//! - State transitions are driven exclusively by the store pipeline.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use super::error::ConfigError;

/// On-disk format of a section file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionFormat {
    Json,
    Yaml,
}

impl SectionFormat {
    /// Infers the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Some(Self::Json),
            Some("yaml") | Some("yml") => Some(Self::Yaml),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
        }
    }

    /// Parses file content into a top-level object.
    pub fn parse(self, path: &Path, content: &str) -> Result<Map<String, Value>, ConfigError> {
        let value: Value = match self {
            Self::Json => serde_json::from_str(content)
                .map_err(|e| ConfigError::parse(path, e.to_string()))?,
            Self::Yaml => serde_yaml::from_str(content)
                .map_err(|e| ConfigError::parse(path, e.to_string()))?,
        };
        match value {
            Value::Object(map) => Ok(map),
            _ => Err(ConfigError::parse(path, "expected a top-level object")),
        }
    }

    pub fn serialize(self, path: &Path, data: &Map<String, Value>) -> Result<String, ConfigError> {
        match self {
            Self::Json => serde_json::to_string_pretty(&Value::Object(data.clone()))
                .map_err(|e| ConfigError::parse(path, e.to_string())),
            Self::Yaml => serde_yaml::to_string(&Value::Object(data.clone()))
                .map_err(|e| ConfigError::parse(path, e.to_string())),
        }
    }
}

/// Lifecycle state of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionState {
    /// Registered but never loaded.
    Unloaded,
    Loading,
    Migrating,
    Validating,
    /// Loaded and serving reads/writes.
    Active,
    Saving,
    /// A strict-mode load failed; prior data (if any) is retained.
    Error,
}

/// One named configuration section and its in-memory document.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub state: SectionState,
    pub data: Map<String, Value>,
    /// Backing file, if the section is file-registered.
    pub path: Option<PathBuf>,
    pub format: SectionFormat,
    /// Warnings from the most recent load or validation.
    pub warnings: Vec<String>,
}

impl Section {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: SectionState::Unloaded,
            data: Map::new(),
            path: None,
            format: SectionFormat::Json,
            warnings: Vec::new(),
        }
    }

    pub fn with_file(name: &str, path: PathBuf, format: SectionFormat) -> Self {
        Self {
            path: Some(path),
            format,
            ..Self::new(name)
        }
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.data.clone()
    }
}
