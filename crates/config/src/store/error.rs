//! Store-level error type.
//!
//! Responsibilities:
//! - Aggregate the per-module error enums behind one store-facing type.
//! - Carry enough context (section name, file path) for actionable logs.

use std::path::PathBuf;

use thiserror::Error;

use crate::encryption::EncryptionError;
use crate::migrate::MigrationError;
use crate::schema::{SchemaError, ValidationReport};

/// Errors surfaced by [`ConfigStore`](super::ConfigStore) operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Unsupported config format: {path}")]
    UnsupportedFormat { path: PathBuf },

    #[error("Unknown section '{section}'")]
    NotFound { section: String },

    #[error("Validation failed for section '{section}': {} error(s)", .report.errors.len())]
    Validation {
        section: String,
        report: ValidationReport,
    },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error("Failed to determine a platform config directory")]
    NoConfigDir,

    #[error("Failed to parse .env file at line {error_index}")]
    DotenvParse { error_index: usize },

    #[error("Failed to read .env file: {kind}")]
    DotenvIo { kind: std::io::ErrorKind },

    #[error("Unknown error loading .env file")]
    DotenvUnknown,
}

impl ConfigError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            message: message.into(),
        }
    }
}
