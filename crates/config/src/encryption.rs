//! Encryption of sensitive configuration values at rest.
//!
//! Responsibilities:
//! - Provide AES-256-GCM, RSA-OAEP and XOR-obfuscation encryption methods.
//! - Derive master keys from passwords using PBKDF2-HMAC-SHA256.
//! - Manage master key material (password, env var, persisted key file).
//! - Walk section documents encrypting leaves that look sensitive.
//!
//! Does NOT handle:
//! - Config file persistence (see `store`).
//! - Deciding when at-rest encryption applies (see `store`).
//!
//! Invariants:
//! - Key material never leaves this module; callers only see wire forms.
//! - Encrypted leaves serialize as objects carrying `"_encrypted": true`.
//! - Keys with the metadata prefix (`_`) are never encrypted or decrypted.
//! - Key rotation backs up the previous key file before replacing it and
//!   restores the previous in-memory key on failure.

use std::fs;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::Utc;
use pbkdf2::pbkdf2_hmac;
use rand::RngExt;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use thiserror::Error;

use crate::constants::{
    DEFAULT_KDF_ITERATIONS, ENCRYPTION_INFO_KEY, KDF_SALT_LEN, MASTER_KEY_ENV, MASTER_KEY_FILE,
    MASTER_KEY_LEN, METADATA_PREFIX, MIN_PASSWORD_LENGTH, NONCE_LEN, RSA_KEY_BITS,
    RSA_MAX_PAYLOAD, SENSITIVE_KEY_MARKERS, SENSITIVE_VALUE_MIN_LEN,
};

/// Errors that can occur during encryption operations.
#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Invalid key size: expected {MASTER_KEY_LEN} bytes")]
    InvalidKeySize,

    #[error("Password must be at least {MIN_PASSWORD_LENGTH} characters")]
    WeakPassword,

    #[error("RSA payload of {size} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Master key is not initialized")]
    MasterKeyNotInitialized,

    #[error("Key file error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EncryptionError>;

/// Supported encryption methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionMethod {
    /// AES-256-GCM under the master key. The default; any payload size.
    AesGcm,
    /// RSA-OAEP-SHA256 with a persisted 2048-bit keypair. Small payloads only.
    Rsa,
    /// XOR against a fixed key. Not secure; development and tests only.
    Obfuscated,
}

/// Sources for the master encryption key.
#[derive(Debug, Clone, Default)]
pub enum MasterKeySource {
    /// `PROMPTDESK_MASTER_KEY` env var (hex), then the key file, generating
    /// and persisting a fresh random key on first use.
    #[default]
    Auto,
    /// Derive a key from a user-provided password.
    Password(SecretString),
}

/// Wire form of an encrypted value.
///
/// Serializes as an object carrying `"_encrypted": true` so that encrypted
/// leaves are recognizable inside otherwise plain documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedValue {
    #[serde(rename = "_encrypted")]
    pub encrypted: bool,
    pub data: String,
    pub method: EncryptionMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Caller-supplied annotations carried alongside the ciphertext.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl EncryptedValue {
    fn new(data: Vec<u8>, method: EncryptionMethod, iv: Option<&[u8]>) -> Self {
        Self {
            encrypted: true,
            data: B64.encode(data),
            method,
            iv: iv.map(|bytes| B64.encode(bytes)),
            salt: None,
            timestamp: Some(Utc::now().to_rfc3339()),
            metadata: None,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| EncryptionError::DecryptionFailed(format!("malformed wire form: {e}")))
    }
}

/// Returns true when a value is the wire form of an encrypted leaf.
pub fn is_encrypted_value(value: &Value) -> bool {
    value
        .get("_encrypted")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Whether a leaf should be encrypted at rest, by key name or by the shape
/// of its value.
pub fn is_sensitive(key: &str, value: &Value) -> bool {
    let key_lower = key.to_lowercase();
    if SENSITIVE_KEY_MARKERS
        .iter()
        .any(|marker| key_lower.contains(marker))
    {
        return true;
    }

    // Long alphanumeric strings under innocuous names are still treated as
    // credentials.
    if let Some(text) = value.as_str() {
        return text.len() > SENSITIVE_VALUE_MIN_LEN
            && text.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_');
    }

    false
}

const OBFUSCATION_KEY: &[u8] = b"promptdesk_dev_obfuscation_only";

fn xor_with_dev_key(data: &[u8]) -> Vec<u8> {
    data.iter()
        .zip(OBFUSCATION_KEY.iter().cycle())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Owner of master key material and the RSA keypair.
pub struct CryptoService {
    method: EncryptionMethod,
    iterations: u32,
    key_dir: PathBuf,
    master_key: Option<[u8; MASTER_KEY_LEN]>,
    rsa_private: Option<RsaPrivateKey>,
    rsa_public: Option<RsaPublicKey>,
}

impl std::fmt::Debug for CryptoService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoService")
            .field("method", &self.method)
            .field("iterations", &self.iterations)
            .field("key_dir", &self.key_dir)
            .field("master_key_initialized", &self.master_key.is_some())
            .field("rsa_keys_initialized", &self.rsa_private.is_some())
            .finish()
    }
}

impl CryptoService {
    pub fn new(key_dir: impl Into<PathBuf>, method: EncryptionMethod) -> Self {
        Self {
            method,
            iterations: DEFAULT_KDF_ITERATIONS,
            key_dir: key_dir.into(),
            master_key: None,
            rsa_private: None,
            rsa_public: None,
        }
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn method(&self) -> EncryptionMethod {
        self.method
    }

    /// Resolves and installs the master key from the given source.
    ///
    /// Also generates or loads the RSA keypair when the configured method is
    /// [`EncryptionMethod::Rsa`].
    pub fn initialize_master_key(&mut self, source: &MasterKeySource) -> Result<()> {
        let key = match source {
            MasterKeySource::Password(password) => self.derive_from_password(password)?,
            MasterKeySource::Auto => self.load_or_generate_key()?,
        };
        self.master_key = Some(key);

        if self.method == EncryptionMethod::Rsa {
            self.ensure_rsa_keys()?;
        }

        tracing::info!(key_dir = %self.key_dir.display(), "Master key initialized");
        Ok(())
    }

    /// Rotates the master key, backing up the previous key file.
    ///
    /// With a password the new key is derived with a fresh salt; without one
    /// a new random key is generated. On failure the previous in-memory key
    /// is restored and the error propagated.
    pub fn rotate_master_key(&mut self, new_password: Option<&SecretString>) -> Result<()> {
        let previous = self.master_key;

        let result = (|| {
            let new_key = match new_password {
                Some(password) => {
                    // A fresh salt invalidates the old derivation on purpose.
                    let salt_file = self.salt_file();
                    if salt_file.exists() {
                        fs::remove_file(&salt_file)?;
                    }
                    self.derive_from_password(password)?
                }
                None => {
                    let mut key = [0u8; MASTER_KEY_LEN];
                    rand::rng().fill(&mut key);
                    key
                }
            };

            let key_file = self.key_file();
            if key_file.exists() {
                let stamp = Utc::now().format("%Y%m%d_%H%M%S");
                let backup = self.key_dir.join(format!("{MASTER_KEY_FILE}.backup.{stamp}"));
                fs::rename(&key_file, &backup)?;
                tracing::info!(backup = %backup.display(), "Backed up previous master key");
            }
            self.persist_key(&new_key)?;
            self.master_key = Some(new_key);
            Ok(())
        })();

        if result.is_err() {
            self.master_key = previous;
            tracing::error!("Master key rotation failed, previous key restored");
        } else {
            tracing::info!("Master key rotation complete");
        }
        result
    }

    /// Encrypts a single value with the configured method.
    ///
    /// Strings are encrypted as-is; any other value is canonical-JSON
    /// encoded first so that decryption can restore the original type.
    pub fn encrypt_value(&self, value: &Value) -> Result<EncryptedValue> {
        self.encrypt_with(value, self.method)
    }

    pub fn encrypt_with(&self, value: &Value, method: EncryptionMethod) -> Result<EncryptedValue> {
        let plain = match value {
            Value::String(text) => text.clone(),
            other => serde_json::to_string(other)
                .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?,
        };
        let plain_bytes = plain.as_bytes();

        match method {
            EncryptionMethod::AesGcm => {
                let key = self.master_key.ok_or(EncryptionError::MasterKeyNotInitialized)?;
                let cipher = Aes256Gcm::new(&key.into());
                let mut nonce_bytes = [0u8; NONCE_LEN];
                rand::rng().fill(&mut nonce_bytes);
                let ciphertext = cipher
                    .encrypt(Nonce::from_slice(&nonce_bytes), plain_bytes)
                    .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;
                Ok(EncryptedValue::new(ciphertext, method, Some(&nonce_bytes)))
            }
            EncryptionMethod::Rsa => {
                if plain_bytes.len() > RSA_MAX_PAYLOAD {
                    return Err(EncryptionError::PayloadTooLarge {
                        size: plain_bytes.len(),
                        max: RSA_MAX_PAYLOAD,
                    });
                }
                let public = self
                    .rsa_public
                    .as_ref()
                    .ok_or(EncryptionError::MasterKeyNotInitialized)?;
                let ciphertext = public
                    .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plain_bytes)
                    .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;
                Ok(EncryptedValue::new(ciphertext, method, None))
            }
            EncryptionMethod::Obfuscated => {
                Ok(EncryptedValue::new(xor_with_dev_key(plain_bytes), method, None))
            }
        }
    }

    /// Decrypts a single value, dispatching on the wire form's method.
    ///
    /// JSON-shaped plaintext is re-parsed; anything else comes back as a
    /// plain string.
    pub fn decrypt_value(&self, encrypted: &EncryptedValue) -> Result<Value> {
        let ciphertext = B64
            .decode(&encrypted.data)
            .map_err(|e| EncryptionError::DecryptionFailed(e.to_string()))?;

        let plain_bytes = match encrypted.method {
            EncryptionMethod::AesGcm => {
                let key = self.master_key.ok_or(EncryptionError::MasterKeyNotInitialized)?;
                let iv = encrypted
                    .iv
                    .as_ref()
                    .ok_or_else(|| {
                        EncryptionError::DecryptionFailed("missing nonce".to_string())
                    })
                    .and_then(|iv| {
                        B64.decode(iv)
                            .map_err(|e| EncryptionError::DecryptionFailed(e.to_string()))
                    })?;
                if iv.len() != NONCE_LEN {
                    return Err(EncryptionError::DecryptionFailed(
                        "invalid nonce length".to_string(),
                    ));
                }
                let cipher = Aes256Gcm::new(&key.into());
                cipher
                    .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
                    .map_err(|e| EncryptionError::DecryptionFailed(e.to_string()))?
            }
            EncryptionMethod::Rsa => {
                let private = self
                    .rsa_private
                    .as_ref()
                    .ok_or(EncryptionError::MasterKeyNotInitialized)?;
                private
                    .decrypt(Oaep::new::<Sha256>(), &ciphertext)
                    .map_err(|e| EncryptionError::DecryptionFailed(e.to_string()))?
            }
            EncryptionMethod::Obfuscated => xor_with_dev_key(&ciphertext),
        };

        let plain = String::from_utf8(plain_bytes)
            .map_err(|e| EncryptionError::DecryptionFailed(e.to_string()))?;
        Ok(serde_json::from_str(&plain).unwrap_or(Value::String(plain)))
    }

    /// Encrypts sensitive leaves throughout a document and stamps it with
    /// an `_encryption_info` block.
    pub fn encrypt_tree(&self, data: &Map<String, Value>) -> Result<Map<String, Value>> {
        let mut encrypted = self.encrypt_tree_inner(data)?;
        encrypted.insert(
            ENCRYPTION_INFO_KEY.to_string(),
            serde_json::json!({
                "encrypted_at": Utc::now().to_rfc3339(),
                "method": self.method,
                "version": "1.0.0",
            }),
        );
        Ok(encrypted)
    }

    fn encrypt_tree_inner(&self, data: &Map<String, Value>) -> Result<Map<String, Value>> {
        let mut out = Map::new();
        for (key, value) in data {
            if key.starts_with(METADATA_PREFIX) {
                out.insert(key.clone(), value.clone());
            } else if is_encrypted_value(value) {
                // Already encrypted, leave untouched.
                out.insert(key.clone(), value.clone());
            } else if is_sensitive(key, value) {
                out.insert(key.clone(), self.encrypt_value(value)?.to_value());
            } else if let Value::Object(child) = value {
                out.insert(key.clone(), Value::Object(self.encrypt_tree_inner(child)?));
            } else {
                out.insert(key.clone(), value.clone());
            }
        }
        Ok(out)
    }

    /// Decrypts all encrypted leaves throughout a document, removing the
    /// `_encryption_info` stamp. Other metadata keys pass through unchanged.
    pub fn decrypt_tree(&self, data: &Map<String, Value>) -> Result<Map<String, Value>> {
        let mut out = Map::new();
        for (key, value) in data {
            if key == ENCRYPTION_INFO_KEY {
                continue;
            }
            if key.starts_with(METADATA_PREFIX) {
                out.insert(key.clone(), value.clone());
            } else if is_encrypted_value(value) {
                let encrypted = EncryptedValue::from_value(value)?;
                out.insert(key.clone(), self.decrypt_value(&encrypted)?);
            } else if let Value::Object(child) = value {
                out.insert(key.clone(), Value::Object(self.decrypt_tree(child)?));
            } else {
                out.insert(key.clone(), value.clone());
            }
        }
        Ok(out)
    }

    /// Non-secret summary of the service's configuration.
    pub fn encryption_info(&self) -> Value {
        serde_json::json!({
            "method": self.method,
            "key_derivation": "pbkdf2_hmac_sha256",
            "iterations": self.iterations,
            "rsa_key_bits": RSA_KEY_BITS,
            "master_key_initialized": self.master_key.is_some(),
            "rsa_keys_initialized": self.rsa_private.is_some(),
            "key_dir": self.key_dir.display().to_string(),
        })
    }

    fn key_file(&self) -> PathBuf {
        self.key_dir.join(MASTER_KEY_FILE)
    }

    fn salt_file(&self) -> PathBuf {
        self.key_dir.join(format!("{MASTER_KEY_FILE}.salt"))
    }

    fn derive_from_password(&self, password: &SecretString) -> Result<[u8; MASTER_KEY_LEN]> {
        if password.expose_secret().chars().count() < MIN_PASSWORD_LENGTH {
            return Err(EncryptionError::WeakPassword);
        }

        // The salt persists beside the key file so the same password keeps
        // deriving the same key across runs.
        let salt_file = self.salt_file();
        let salt: Vec<u8> = if salt_file.exists() {
            let encoded = fs::read_to_string(&salt_file)?;
            hex::decode(encoded.trim())
                .map_err(|e| EncryptionError::KeyDerivationFailed(e.to_string()))?
        } else {
            let mut salt = [0u8; KDF_SALT_LEN];
            rand::rng().fill(&mut salt);
            fs::create_dir_all(&self.key_dir)?;
            fs::write(&salt_file, hex::encode(salt))?;
            restrict_permissions(&salt_file)?;
            salt.to_vec()
        };

        let mut key = [0u8; MASTER_KEY_LEN];
        pbkdf2_hmac::<Sha256>(
            password.expose_secret().as_bytes(),
            &salt,
            self.iterations,
            &mut key,
        );
        Ok(key)
    }

    fn load_or_generate_key(&self) -> Result<[u8; MASTER_KEY_LEN]> {
        if let Some(encoded) = crate::env_var_or_none(MASTER_KEY_ENV) {
            return decode_key(&encoded);
        }

        let key_file = self.key_file();
        if key_file.exists() {
            let encoded = fs::read_to_string(&key_file)?;
            return decode_key(encoded.trim());
        }

        let mut key = [0u8; MASTER_KEY_LEN];
        rand::rng().fill(&mut key);
        self.persist_key(&key)?;
        tracing::info!(path = %key_file.display(), "Generated new master key");
        Ok(key)
    }

    fn persist_key(&self, key: &[u8; MASTER_KEY_LEN]) -> Result<()> {
        fs::create_dir_all(&self.key_dir)?;
        let key_file = self.key_file();
        let tmp = key_file.with_extension("key.tmp");
        fs::write(&tmp, hex::encode(key))?;
        restrict_permissions(&tmp)?;
        fs::rename(&tmp, &key_file)?;
        Ok(())
    }

    fn ensure_rsa_keys(&mut self) -> Result<()> {
        if self.rsa_private.is_some() {
            return Ok(());
        }

        let private_file = self.key_dir.join("rsa_private.pem");
        let public_file = self.key_dir.join("rsa_public.pem");

        if private_file.exists() && public_file.exists() {
            let private_pem = fs::read_to_string(&private_file)?;
            let private = RsaPrivateKey::from_pkcs8_pem(&private_pem)
                .map_err(|e| EncryptionError::KeyDerivationFailed(e.to_string()))?;
            let public_pem = fs::read_to_string(&public_file)?;
            let public = RsaPublicKey::from_public_key_pem(&public_pem)
                .map_err(|e| EncryptionError::KeyDerivationFailed(e.to_string()))?;
            self.rsa_private = Some(private);
            self.rsa_public = Some(public);
            return Ok(());
        }

        let private = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
            .map_err(|e| EncryptionError::KeyDerivationFailed(e.to_string()))?;
        let public = RsaPublicKey::from(&private);

        fs::create_dir_all(&self.key_dir)?;
        let private_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| EncryptionError::KeyDerivationFailed(e.to_string()))?;
        fs::write(&private_file, private_pem.as_bytes())?;
        restrict_permissions(&private_file)?;
        let public_pem = public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| EncryptionError::KeyDerivationFailed(e.to_string()))?;
        fs::write(&public_file, public_pem)?;

        tracing::info!(key_dir = %self.key_dir.display(), "Generated new RSA keypair");
        self.rsa_private = Some(private);
        self.rsa_public = Some(public);
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn decode_key(encoded: &str) -> Result<[u8; MASTER_KEY_LEN]> {
    let bytes = hex::decode(encoded).map_err(|_| EncryptionError::InvalidKeySize)?;
    let key: [u8; MASTER_KEY_LEN] = bytes
        .try_into()
        .map_err(|_| EncryptionError::InvalidKeySize)?;
    Ok(key)
}
