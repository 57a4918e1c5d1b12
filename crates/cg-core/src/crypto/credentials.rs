//! Type-aware credential encryption with the `ENC:` marker.
//!
//! [`CredentialEncryptor`] validates a value against its [`CredentialType`],
//! encrypts it with an [`EncryptionService`] and prefixes the result with
//! [`ENCRYPTED_PREFIX`]. The prefix is what lets callers, and the key
//! rotator, tell ciphertext from plaintext that has not been migrated yet.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::encryption::{EncryptionError, EncryptionService};
use crate::security::audit::SecurityAuditor;

/// Marker distinguishing encrypted values from plaintext.
pub const ENCRYPTED_PREFIX: &str = "ENC:";

/// Substring every accepted SSH private key must contain.
const SSH_PRIVATE_KEY_MARKER: &str = "PRIVATE KEY";

const MIN_PASSWORD_LENGTH: usize = 8;
const MIN_TOKEN_LENGTH: usize = 16;

/// Errors from the credential layer. None of them carries the credential.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Empty input to `encrypt` or `decrypt`.
    #[error("credential is empty")]
    Empty,

    /// `encrypt` was given a value that already has the `ENC:` prefix.
    #[error("credential is already encrypted")]
    AlreadyEncrypted,

    /// `decrypt` was given a value without the `ENC:` prefix.
    #[error("credential is not encrypted")]
    NotEncrypted,

    /// The value fails the length or format rule of its type.
    #[error("invalid {credential_type}: {reason}")]
    Validation {
        credential_type: CredentialType,
        reason: String,
    },

    /// The cipher layer rejected the value.
    #[error(transparent)]
    Encryption(#[from] EncryptionError),
}

/// Kinds of credentials, each with its own pre-encryption validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    /// At least 8 characters.
    Password,
    /// At least 16 characters.
    ApiKey,
    /// At least 16 characters.
    SecretKey,
    /// At least 16 characters.
    AccessToken,
    /// At least 16 characters.
    RefreshToken,
    /// At least 16 characters.
    OauthToken,
    /// Must contain a `PRIVATE KEY` marker.
    SshKey,
    /// Any non-empty value.
    Generic,
}

impl CredentialType {
    pub const ALL: [CredentialType; 8] = [
        Self::Password,
        Self::ApiKey,
        Self::SecretKey,
        Self::AccessToken,
        Self::RefreshToken,
        Self::OauthToken,
        Self::SshKey,
        Self::Generic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::ApiKey => "api_key",
            Self::SecretKey => "secret_key",
            Self::AccessToken => "access_token",
            Self::RefreshToken => "refresh_token",
            Self::OauthToken => "oauth_token",
            Self::SshKey => "ssh_key",
            Self::Generic => "generic",
        }
    }

    /// Minimum length in characters, if the type has one.
    pub fn min_length(self) -> Option<usize> {
        match self {
            Self::Password => Some(MIN_PASSWORD_LENGTH),
            Self::ApiKey
            | Self::SecretKey
            | Self::AccessToken
            | Self::RefreshToken
            | Self::OauthToken => Some(MIN_TOKEN_LENGTH),
            Self::SshKey | Self::Generic => None,
        }
    }

    /// Check `value` against this type's rules. Errors never contain the value.
    pub fn validate(self, value: &str) -> Result<(), CredentialError> {
        if let Some(min) = self.min_length() {
            let len = value.chars().count();
            if len < min {
                return Err(CredentialError::Validation {
                    credential_type: self,
                    reason: format!("must be at least {} characters, got {}", min, len),
                });
            }
        }
        if self == Self::SshKey && !value.contains(SSH_PRIVATE_KEY_MARKER) {
            return Err(CredentialError::Validation {
                credential_type: self,
                reason: "does not look like a private key".to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for CredentialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| format!("unknown credential type: {}", s))
    }
}

/// Encrypts and decrypts credentials, optionally auditing each operation.
#[derive(Clone)]
pub struct CredentialEncryptor {
    service: EncryptionService,
    auditor: Option<Arc<SecurityAuditor>>,
}

impl CredentialEncryptor {
    /// Encryptor without auditing.
    pub fn new(service: EncryptionService) -> Self {
        Self {
            service,
            auditor: None,
        }
    }

    /// Emit an Encryption/Decryption audit event for every operation.
    pub fn with_auditor(mut self, auditor: Arc<SecurityAuditor>) -> Self {
        self.auditor = Some(auditor);
        self
    }

    /// The underlying cipher service.
    pub fn service(&self) -> &EncryptionService {
        &self.service
    }

    /// Validate and encrypt a plaintext credential.
    pub fn encrypt(
        &self,
        value: &str,
        credential_type: CredentialType,
    ) -> Result<String, CredentialError> {
        if value.is_empty() {
            return Err(CredentialError::Empty);
        }
        if is_encrypted(value) {
            return Err(CredentialError::AlreadyEncrypted);
        }
        credential_type.validate(value)?;

        let started = Instant::now();
        let result = self.service.encrypt_string(value);
        if let Some(ref auditor) = self.auditor {
            auditor.log_encryption_event(
                credential_type.as_str(),
                None,
                started.elapsed(),
                result.as_ref().err().map(|e| e as &dyn fmt::Display),
            );
        }

        let ciphertext = result?;
        debug!(credential_type = %credential_type, "Credential encrypted");
        Ok(format!("{}{}", ENCRYPTED_PREFIX, ciphertext))
    }

    /// Decrypt an `ENC:`-prefixed credential.
    pub fn decrypt(&self, value: &str) -> Result<String, CredentialError> {
        if value.is_empty() {
            return Err(CredentialError::Empty);
        }
        let payload = value
            .strip_prefix(ENCRYPTED_PREFIX)
            .ok_or(CredentialError::NotEncrypted)?;

        let started = Instant::now();
        let result = self.service.decrypt_string(payload);
        if let Some(ref auditor) = self.auditor {
            auditor.log_decryption_event(
                "credential",
                None,
                started.elapsed(),
                result.as_ref().err().map(|e| e as &dyn fmt::Display),
            );
        }

        Ok(result?)
    }

    /// Encrypt unless `value` is empty or already encrypted; those pass through.
    pub fn encrypt_field(
        &self,
        value: &str,
        credential_type: CredentialType,
    ) -> Result<String, CredentialError> {
        if value.is_empty() || is_encrypted(value) {
            return Ok(value.to_string());
        }
        self.encrypt(value, credential_type)
    }

    /// Decrypt unless `value` is empty or plaintext; those pass through.
    pub fn decrypt_field(&self, value: &str) -> Result<String, CredentialError> {
        if value.is_empty() || !is_encrypted(value) {
            return Ok(value.to_string());
        }
        self.decrypt(value)
    }

    /// Encrypt with [`CredentialType::Password`] rules; the other helpers
    /// below do the same for their type.
    pub fn encrypt_password(&self, value: &str) -> Result<String, CredentialError> {
        self.encrypt(value, CredentialType::Password)
    }

    pub fn encrypt_api_key(&self, value: &str) -> Result<String, CredentialError> {
        self.encrypt(value, CredentialType::ApiKey)
    }

    pub fn encrypt_secret_key(&self, value: &str) -> Result<String, CredentialError> {
        self.encrypt(value, CredentialType::SecretKey)
    }

    pub fn encrypt_access_token(&self, value: &str) -> Result<String, CredentialError> {
        self.encrypt(value, CredentialType::AccessToken)
    }

    pub fn encrypt_refresh_token(&self, value: &str) -> Result<String, CredentialError> {
        self.encrypt(value, CredentialType::RefreshToken)
    }

    pub fn encrypt_oauth_token(&self, value: &str) -> Result<String, CredentialError> {
        self.encrypt(value, CredentialType::OauthToken)
    }

    pub fn encrypt_ssh_key(&self, value: &str) -> Result<String, CredentialError> {
        self.encrypt(value, CredentialType::SshKey)
    }

    pub fn encrypt_generic(&self, value: &str) -> Result<String, CredentialError> {
        self.encrypt(value, CredentialType::Generic)
    }
}

impl fmt::Debug for CredentialEncryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialEncryptor")
            .field("service", &self.service)
            .field("audited", &self.auditor.is_some())
            .finish()
    }
}

pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENCRYPTED_PREFIX)
}

/// Decide from a field name whether it holds a credential, and which kind.
///
/// Accepts snake_case, camelCase and PascalCase names.
pub fn requires_encryption(field_name: &str) -> (bool, CredentialType) {
    let snake = to_snake_case(field_name);
    let compact = snake.replace('_', "");
    let segments: Vec<&str> = snake.split('_').filter(|s| !s.is_empty()).collect();

    let detected = if compact.contains("password") || compact.contains("passwd") {
        Some(CredentialType::Password)
    } else if compact.contains("apikey") {
        Some(CredentialType::ApiKey)
    } else if compact.contains("secretkey") || compact.contains("clientsecret") {
        Some(CredentialType::SecretKey)
    } else if compact.contains("accesstoken") {
        Some(CredentialType::AccessToken)
    } else if compact.contains("refreshtoken") {
        Some(CredentialType::RefreshToken)
    } else if compact.contains("oauth") {
        Some(CredentialType::OauthToken)
    } else if segments.contains(&"ssh") || compact.contains("privatekey") {
        Some(CredentialType::SshKey)
    } else if matches!(
        segments.last(),
        Some(&("key" | "keys" | "secret" | "secrets" | "token" | "tokens"))
    ) {
        Some(CredentialType::Generic)
    } else {
        None
    };

    match detected {
        Some(t) => (true, t),
        None => (false, CredentialType::Generic),
    }
}

/// Masked preview of a credential, safe to log.
pub fn sanitize_credential(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }

    if let Some(payload) = value.strip_prefix(ENCRYPTED_PREFIX) {
        let chars: Vec<char> = payload.chars().collect();
        if chars.len() <= 8 {
            return format!("{}***", ENCRYPTED_PREFIX);
        }
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        return format!("{}{}...{}", ENCRYPTED_PREFIX, head, tail);
    }

    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        return "***".to_string();
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}...{}", head, tail)
}

fn to_snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c == '-' || c == ' ' || c == '.' {
            out.push('_');
            continue;
        }
        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            let boundary = prev.is_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_uppercase() && next_lower);
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
        }
        out.extend(c.to_lowercase());
    }
    out
}
