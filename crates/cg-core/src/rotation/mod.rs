//! Re-encryption of persisted credentials when the encryption key changes.
//!
//! Models describe their encrypted columns explicitly through
//! [`model::EncryptedModel`]; a [`model::ModelStore`] pages records in and
//! out; [`rotator::KeyRotator`] walks every record of one model and
//! [`runner`] drives several models under master and per-model timeouts.

pub mod backup;
pub mod model;
pub mod rotator;
pub mod runner;
pub mod stats;
