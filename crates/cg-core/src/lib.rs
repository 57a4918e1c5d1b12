//! Credential encryption, key lifecycle and key rotation for credguard.
//!
//! Sensitive configuration values (remote passwords, API keys, OAuth and SSH
//! credentials) are stored as `ENC:`-prefixed AES-256-CBC ciphertext. This
//! crate owns the key, the cipher, the credential-aware wrapper around it,
//! the bulk re-encryption used when the key changes, and the sanitized audit
//! trail every one of those operations writes to.

pub mod config;
pub mod crypto;
pub mod rotation;
pub mod security;

pub use config::Settings;
pub use crypto::credentials::{CredentialEncryptor, CredentialType};
pub use crypto::encryption::EncryptionService;
pub use crypto::key_manager::KeyManager;
pub use rotation::rotator::KeyRotator;
pub use rotation::stats::RotationStats;
pub use security::audit::{AuditEvent, SecurityAuditor};
pub use security::monitor::SecurityMonitor;
