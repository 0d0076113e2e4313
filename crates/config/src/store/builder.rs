//! Builder for [`ConfigStore`].
//!
//! Responsibilities:
//! - Resolve the config directory (explicit, env var, or platform default).
//! - Detect the active environment from `PROMPTDESK_ENV`.
//! - Configure load mode, auto-save, encryption and event history.
//! - Optionally load a `.env` file before reading environment variables.
//!
//! Invariants / Assumptions:
//! - Explicit builder values take precedence over environment variables.
//! - `load_dotenv()` must be called explicitly to enable `.env` loading.
//! - The `DOTENV_DISABLED` variable is checked before `dotenvy::dotenv()`
//!   is called.

use std::path::PathBuf;

use secrecy::SecretString;

use crate::constants::{DEFAULT_EVENT_HISTORY_LIMIT, ENVIRONMENT_ENV};
use crate::encryption::{CryptoService, EncryptionMethod, MasterKeySource};
use crate::env_var_or_none;

use super::error::ConfigError;
use super::{ConfigStore, LoadMode};

/// Environment variable overriding the config directory.
const CONFIG_DIR_ENV: &str = "PROMPTDESK_CONFIG_DIR";

/// Builder-pattern construction of a [`ConfigStore`].
pub struct ConfigStoreBuilder {
    config_dir: Option<PathBuf>,
    environment: Option<String>,
    load_mode: LoadMode,
    auto_save: bool,
    encrypt_at_rest: bool,
    encryption_method: EncryptionMethod,
    master_key_source: MasterKeySource,
    kdf_iterations: Option<u32>,
    event_history_limit: usize,
}

impl Default for ConfigStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStoreBuilder {
    pub fn new() -> Self {
        Self {
            config_dir: None,
            environment: None,
            load_mode: LoadMode::default(),
            auto_save: false,
            encrypt_at_rest: false,
            encryption_method: EncryptionMethod::AesGcm,
            master_key_source: MasterKeySource::Auto,
            kdf_iterations: None,
            event_history_limit: DEFAULT_EVENT_HISTORY_LIMIT,
        }
    }

    /// Check if dotenv loading is disabled via environment variable.
    fn dotenv_disabled() -> bool {
        matches!(
            std::env::var("DOTENV_DISABLED").ok().as_deref(),
            Some("true") | Some("1")
        )
    }

    /// Load environment variables from a `.env` file if present.
    ///
    /// Missing `.env` files are silently ignored.
    ///
    /// SAFETY: Error messages never include raw .env line contents to
    /// prevent secret leakage.
    pub fn load_dotenv(self) -> Result<Self, ConfigError> {
        if Self::dotenv_disabled() {
            return Ok(self);
        }

        match dotenvy::dotenv() {
            Ok(_) => Ok(self),
            Err(e) if Self::is_not_found(&e) => Ok(self),
            Err(dotenvy::Error::LineParse(_, idx)) => {
                Err(ConfigError::DotenvParse { error_index: idx })
            }
            Err(dotenvy::Error::Io(io_err)) => Err(ConfigError::DotenvIo {
                kind: io_err.kind(),
            }),
            Err(_) => Err(ConfigError::DotenvUnknown),
        }
    }

    fn is_not_found(err: &dotenvy::Error) -> bool {
        matches!(
            err,
            dotenvy::Error::Io(io_err) if io_err.kind() == std::io::ErrorKind::NotFound
        )
    }

    /// Override the config directory (primarily for testing).
    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    /// Set the environment name, bypassing `PROMPTDESK_ENV` detection.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(normalize_environment(&environment.into()));
        self
    }

    pub fn with_load_mode(mut self, mode: LoadMode) -> Self {
        self.load_mode = mode;
        self
    }

    /// Persist sections immediately after every effective mutation.
    pub fn with_auto_save(mut self, auto_save: bool) -> Self {
        self.auto_save = auto_save;
        self
    }

    /// Encrypt every section on save regardless of the security settings.
    pub fn with_encryption_at_rest(mut self, enabled: bool) -> Self {
        self.encrypt_at_rest = enabled;
        self
    }

    pub fn with_encryption_method(mut self, method: EncryptionMethod) -> Self {
        self.encryption_method = method;
        self
    }

    /// Derive the master key from a password instead of the env/key-file
    /// chain.
    pub fn with_master_key_password(mut self, password: String) -> Self {
        self.master_key_source = MasterKeySource::Password(SecretString::new(password.into()));
        self
    }

    pub fn with_master_key_source(mut self, source: MasterKeySource) -> Self {
        self.master_key_source = source;
        self
    }

    pub fn with_kdf_iterations(mut self, iterations: u32) -> Self {
        self.kdf_iterations = Some(iterations);
        self
    }

    pub fn with_event_history_limit(mut self, limit: usize) -> Self {
        self.event_history_limit = limit;
        self
    }

    /// Builds the store. No sections are registered; see
    /// [`ConfigStore::install_defaults`] and [`Self::build_with_defaults`].
    pub fn build(self) -> Result<ConfigStore, ConfigError> {
        let config_dir = match self.config_dir {
            Some(dir) => dir,
            None => match env_var_or_none(CONFIG_DIR_ENV) {
                Some(dir) => PathBuf::from(dir),
                None => directories::ProjectDirs::from("com", "promptdesk", "promptdesk")
                    .ok_or(ConfigError::NoConfigDir)?
                    .config_dir()
                    .to_path_buf(),
            },
        };
        std::fs::create_dir_all(&config_dir).map_err(|e| ConfigError::io(&config_dir, e))?;

        let environment = self
            .environment
            .or_else(|| env_var_or_none(ENVIRONMENT_ENV).map(|v| normalize_environment(&v)))
            .unwrap_or_else(|| "development".to_string());

        let mut crypto = CryptoService::new(config_dir.join("keys"), self.encryption_method);
        if let Some(iterations) = self.kdf_iterations {
            crypto = crypto.with_iterations(iterations);
        }
        crypto.initialize_master_key(&self.master_key_source)?;

        tracing::info!(
            config_dir = %config_dir.display(),
            environment = %environment,
            mode = ?self.load_mode,
            "Config store initialized"
        );
        Ok(ConfigStore::from_parts(
            config_dir,
            environment,
            self.load_mode,
            self.auto_save,
            self.encrypt_at_rest,
            crypto,
            self.event_history_limit,
        ))
    }

    /// Builds the store, installs the standard sections and loads them.
    ///
    /// Per-section load failures are returned only in strict mode; otherwise
    /// they have already been degraded by the load pipeline.
    pub fn build_with_defaults(self) -> Result<ConfigStore, ConfigError> {
        let strict = self.load_mode == LoadMode::Strict;
        let store = self.build()?;
        store.install_defaults()?;
        let report = store.load_all();
        if strict && let Some((_, error)) = report.failed.into_iter().next() {
            return Err(error);
        }
        Ok(store)
    }
}

/// Maps common environment spellings onto the canonical names. Unknown
/// values fall back to `development`.
fn normalize_environment(raw: &str) -> String {
    match raw.to_lowercase().as_str() {
        "prod" | "production" => "production",
        "test" | "testing" => "testing",
        "dev" | "development" => "development",
        "local" => "local",
        other => {
            tracing::warn!(value = %other, "Unknown environment, using development");
            "development"
        }
    }
    .to_string()
}
