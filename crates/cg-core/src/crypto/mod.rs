//! Key handling and symmetric encryption of stored credentials.
//!
//! [`key_manager`] resolves the process key from the environment,
//! [`encryption`] implements the raw AES-256-CBC + PKCS#7 primitives, and
//! [`credentials`] layers the `ENC:` wire format and per-type validation on
//! top of them.

pub mod credentials;
pub mod encryption;
pub mod key_manager;
