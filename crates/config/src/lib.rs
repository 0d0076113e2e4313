//! Configuration management for Promptdesk.
//!
//! This crate provides the multi-section configuration store used by the
//! desktop studio: schema validation, versioned migration, encryption of
//! sensitive values at rest, environment overlays and change notification.

pub mod constants;
pub mod document;
pub mod encryption;
pub mod events;
pub mod migrate;
pub mod schema;
pub mod store;

pub use encryption::{
    CryptoService, EncryptedValue, EncryptionError, EncryptionMethod, MasterKeySource,
};
pub use events::{ChangeSource, ConfigChangeEvent, SubscriptionId};
pub use migrate::{MigrationEngine, MigrationError, MigrationOutcome, MigrationStep};
pub use schema::{SchemaError, SchemaRegistry, ValidationIssue, ValidationReport};
pub use store::{
    ConfigError, ConfigStore, ConfigStoreBuilder, LoadMode, LoadReport, Section, SectionFormat,
    SectionState,
};

/// Reads an environment variable, treating empty or whitespace-only values
/// as unset.
pub fn env_var_or_none(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
