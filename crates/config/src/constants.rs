//! Centralized constants for the Promptdesk configuration subsystem.
//!
//! This module contains default values used across the crate to avoid
//! magic number duplication and improve maintainability.

// =============================================================================
// Key Derivation & Encryption Defaults
// =============================================================================

/// Default PBKDF2-HMAC-SHA256 iteration count for password-derived keys.
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

/// Minimum accepted master-key password length.
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Length of the random KDF salt in bytes.
pub const KDF_SALT_LEN: usize = 16;

/// Length of the AES-256 master key in bytes.
pub const MASTER_KEY_LEN: usize = 32;

/// Length of the AES-GCM nonce in bytes.
pub const NONCE_LEN: usize = 12;

/// RSA modulus size in bits for the asymmetric encryption method.
pub const RSA_KEY_BITS: usize = 2048;

/// Maximum RSA-OAEP-SHA256 payload: modulus bytes minus padding overhead.
pub const RSA_MAX_PAYLOAD: usize = RSA_KEY_BITS / 8 - 2 * 32 - 2;

/// Environment variable holding a hex-encoded 32-byte master key.
pub const MASTER_KEY_ENV: &str = "PROMPTDESK_MASTER_KEY";

/// File name of the persisted master key inside the key directory.
pub const MASTER_KEY_FILE: &str = "master.key";

// =============================================================================
// Sensitive-Value Heuristic
// =============================================================================

/// Key-name substrings that mark a leaf value as sensitive at rest.
pub const SENSITIVE_KEY_MARKERS: &[&str] = &[
    "api_key",
    "password",
    "token",
    "secret",
    "private_key",
    "credential",
];

/// Minimum length for an alphanumeric string value to be treated as a
/// credential even when its key name is innocuous.
pub const SENSITIVE_VALUE_MIN_LEN: usize = 20;

/// Prefix marking metadata keys that are never encrypted or validated.
pub const METADATA_PREFIX: char = '_';

// =============================================================================
// Store Defaults
// =============================================================================

/// Environment variable selecting the active configuration environment.
pub const ENVIRONMENT_ENV: &str = "PROMPTDESK_ENV";

/// Current target version that section documents are migrated to.
pub const CURRENT_CONFIG_VERSION: &str = "1.1.0";

/// Maximum number of change events retained in the in-memory history.
pub const DEFAULT_EVENT_HISTORY_LIMIT: usize = 256;

/// Document key carrying a section's declared format version.
pub const VERSION_KEY: &str = "_version";

/// Document key carrying whole-document encryption metadata.
pub const ENCRYPTION_INFO_KEY: &str = "_encryption_info";
