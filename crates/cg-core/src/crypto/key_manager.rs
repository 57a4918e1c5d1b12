//! Resolution and custody of the process-wide encryption key.
//!
//! The key is read once from an environment variable, decoded as hex (tried
//! first) or standard base64, and must be at least [`MIN_KEY_LENGTH`] bytes.
//! It is never persisted by this crate. A [`KeyManager`] is constructed
//! explicitly by the application and passed by reference; [`global`] is an
//! optional convenience wrapper over a default-named instance.

use std::env;
use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Environment variable holding the active key unless configured otherwise.
pub const DEFAULT_KEY_ENV_VAR: &str = "GOMFT_ENCRYPTION_KEY";

/// Minimum decoded key length in bytes (AES-256).
pub const MIN_KEY_LENGTH: usize = 32;

/// Length of freshly generated keys.
pub const GENERATED_KEY_LENGTH: usize = 32;

/// Hex characters of the SHA-256 digest used as a key fingerprint.
const FINGERPRINT_HEX_LEN: usize = 12;

/// Errors raised while resolving or reading the key.
///
/// Messages name the environment variable but never echo its value.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("encryption key not provided: set {0}")]
    NotProvided(String),

    #[error("encryption key in {0} has an invalid encoding (expected hex or base64)")]
    InvalidEncoding(String),

    #[error("encryption key too short: need at least {min} bytes, got {actual}")]
    TooShort { min: usize, actual: usize },

    #[error("key manager not initialized")]
    NotInitialized,
}

/// Text encodings accepted for key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyEncoding {
    Hex,
    Base64,
}

/// Holds the active symmetric key for the lifetime of the process.
///
/// The first successful [`initialize`](Self::initialize) wins; later calls
/// are no-ops even if the environment changed in between, so a running
/// process never swaps keys mid-flight.
pub struct KeyManager {
    env_var: String,
    key: OnceLock<Zeroizing<Vec<u8>>>,
}

impl KeyManager {
    /// Manager reading [`DEFAULT_KEY_ENV_VAR`].
    pub fn new() -> Self {
        Self::with_env_var(DEFAULT_KEY_ENV_VAR)
    }

    /// Manager reading the given environment variable.
    pub fn with_env_var(env_var: impl Into<String>) -> Self {
        Self {
            env_var: env_var.into(),
            key: OnceLock::new(),
        }
    }

    /// Already-initialized manager around explicit key bytes.
    ///
    /// Used for the target key of a rotation, which must not be read from
    /// the same variable as the running key.
    pub fn from_key(key: &[u8]) -> Result<Self, KeyError> {
        validate_length(key)?;
        let manager = Self::new();
        let _ = manager.key.set(Zeroizing::new(key.to_vec()));
        Ok(manager)
    }

    /// Load the key from the environment.
    pub fn initialize(&self) -> Result<(), KeyError> {
        if self.key.get().is_some() {
            debug!(env_var = %self.env_var, "Key manager already initialized, ignoring");
            return Ok(());
        }

        let raw = env::var(&self.env_var)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| KeyError::NotProvided(self.env_var.clone()))?;

        let decoded = decode_key(raw.trim())
            .ok_or_else(|| KeyError::InvalidEncoding(self.env_var.clone()))?;
        validate_length(&decoded)?;

        if self.key.set(decoded).is_ok() {
            info!(
                env_var = %self.env_var,
                fingerprint = %self.fingerprint().unwrap_or_default(),
                "Encryption key loaded"
            );
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.key.get().is_some()
    }

    /// Copy of the key bytes; mutating it does not affect the manager.
    pub fn get_primary_key(&self) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        self.key
            .get()
            .map(|k| Zeroizing::new(k.to_vec()))
            .ok_or(KeyError::NotInitialized)
    }

    pub fn get_environment_variable_name(&self) -> &str {
        &self.env_var
    }

    /// Short, non-reversible identifier of the loaded key.
    pub fn fingerprint(&self) -> Result<String, KeyError> {
        let key = self.key.get().ok_or(KeyError::NotInitialized)?;
        Ok(fingerprint(key))
    }

    /// Export a key into this manager's environment variable as base64.
    ///
    /// Development and test helper only: it mutates the process environment
    /// and does not change an already-initialized manager.
    pub fn store_key_environment(&self, key: &[u8]) -> Result<(), KeyError> {
        validate_length(key)?;
        env::set_var(&self.env_var, STANDARD.encode(key));
        debug!(env_var = %self.env_var, "Stored key in environment");
        Ok(())
    }
}

impl Default for KeyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("env_var", &self.env_var)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// Process-wide manager reading [`DEFAULT_KEY_ENV_VAR`].
///
/// Initialization is still explicit: callers must invoke
/// [`KeyManager::initialize`] on the returned instance.
pub fn global() -> &'static KeyManager {
    static GLOBAL: OnceLock<KeyManager> = OnceLock::new();
    GLOBAL.get_or_init(KeyManager::new)
}

/// Generate a fresh random key.
pub fn generate_key() -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(vec![0u8; GENERATED_KEY_LENGTH]);
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn encode_key(key: &[u8], encoding: KeyEncoding) -> Zeroizing<String> {
    Zeroizing::new(match encoding {
        KeyEncoding::Hex => hex::encode(key),
        KeyEncoding::Base64 => STANDARD.encode(key),
    })
}

/// Decode key text, trying hex before base64.
pub fn decode_key(value: &str) -> Option<Zeroizing<Vec<u8>>> {
    hex::decode(value)
        .or_else(|_| STANDARD.decode(value))
        .ok()
        .map(Zeroizing::new)
}

pub fn fingerprint(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    let mut out = hex::encode(digest);
    out.truncate(FINGERPRINT_HEX_LEN);
    out
}

fn validate_length(key: &[u8]) -> Result<(), KeyError> {
    if key.len() < MIN_KEY_LENGTH {
        return Err(KeyError::TooShort {
            min: MIN_KEY_LENGTH,
            actual: key.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(var: &str, value: &str) -> KeyManager {
        env::set_var(var, value);
        KeyManager::with_env_var(var)
    }

    #[test]
    fn test_initialize_base64_key() {
        let km = manager_with("CG_TEST_KM_BASE64", &STANDARD.encode([0u8; 32]));
        km.initialize().unwrap();
        assert_eq!(km.get_primary_key().unwrap().as_slice(), &[0u8; 32]);
    }

    #[test]
    fn test_initialize_hex_key_preferred() {
        let km = manager_with("CG_TEST_KM_HEX", &"ab".repeat(32));
        km.initialize().unwrap();
        assert_eq!(km.get_primary_key().unwrap().as_slice(), &[0xab; 32]);
    }

    #[test]
    fn test_missing_key() {
        env::remove_var("CG_TEST_KM_MISSING");
        let km = KeyManager::with_env_var("CG_TEST_KM_MISSING");
        let err = km.initialize().unwrap_err();
        assert!(matches!(err, KeyError::NotProvided(_)));
        assert!(matches!(km.get_primary_key(), Err(KeyError::NotInitialized)));
    }

    #[test]
    fn test_invalid_encoding() {
        let km = manager_with("CG_TEST_KM_BADENC", "not a key!!");
        assert!(matches!(km.initialize(), Err(KeyError::InvalidEncoding(_))));
    }

    #[test]
    fn test_short_key_rejected_without_leaking() {
        let value = STANDARD.encode(b"sixteen byte key");
        let km = manager_with("CG_TEST_KM_SHORT", &value);
        let err = km.initialize().unwrap_err();
        assert!(matches!(err, KeyError::TooShort { min: 32, actual: 16 }));
        assert!(!err.to_string().contains(&value));
    }

    #[test]
    fn test_first_initialize_wins() {
        let var = "CG_TEST_KM_ONCE";
        let km = manager_with(var, &STANDARD.encode([1u8; 32]));
        km.initialize().unwrap();

        env::set_var(var, STANDARD.encode([2u8; 32]));
        km.initialize().unwrap();
        assert_eq!(km.get_primary_key().unwrap().as_slice(), &[1u8; 32]);
    }

    #[test]
    fn test_primary_key_is_a_copy() {
        let km = KeyManager::from_key(&[7u8; 32]).unwrap();
        let mut copy = km.get_primary_key().unwrap();
        copy[0] = 0;
        assert_eq!(km.get_primary_key().unwrap()[0], 7);
    }

    #[test]
    fn test_store_key_environment() {
        let km = KeyManager::with_env_var("CG_TEST_KM_STORE");
        km.store_key_environment(&[9u8; 32]).unwrap();
        km.initialize().unwrap();
        assert_eq!(km.get_primary_key().unwrap().as_slice(), &[9u8; 32]);
        assert!(km.store_key_environment(&[1u8; 8]).is_err());
    }

    #[test]
    fn test_generate_and_encode_key() {
        let a = generate_key();
        let b = generate_key();
        assert_eq!(a.len(), GENERATED_KEY_LENGTH);
        assert_ne!(a.as_slice(), b.as_slice());

        let hex_text = encode_key(&a, KeyEncoding::Hex);
        let b64_text = encode_key(&a, KeyEncoding::Base64);
        assert_eq!(decode_key(&hex_text).unwrap().as_slice(), a.as_slice());
        assert_eq!(decode_key(&b64_text).unwrap().as_slice(), a.as_slice());
    }

    #[test]
    fn test_fingerprint_is_stable_and_short() {
        let km = KeyManager::from_key(&[3u8; 32]).unwrap();
        let fp = km.fingerprint().unwrap();
        assert_eq!(fp.len(), FINGERPRINT_HEX_LEN);
        assert_eq!(fp, fingerprint(&[3u8; 32]));
        assert_ne!(fp, fingerprint(&[4u8; 32]));
    }

    #[test]
    fn test_debug_hides_key() {
        let km = KeyManager::from_key(&[0x41; 32]).unwrap();
        let debug = format!("{:?}", km);
        assert!(!debug.contains("AAAA"));
        assert!(debug.contains("initialized: true"));
    }
}
