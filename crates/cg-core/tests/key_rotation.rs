//! End-to-end rotation scenarios across key manager, encryptor, rotator and
//! audit trail.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use cg_core::crypto::credentials::{is_encrypted, CredentialEncryptor, CredentialType, ENCRYPTED_PREFIX};
use cg_core::crypto::encryption::EncryptionService;
use cg_core::crypto::key_manager::{generate_key, KeyManager};
use cg_core::rotation::model::{EncryptedField, EncryptedModel, InMemoryModelStore};
use cg_core::rotation::rotator::{KeyRotator, RotationError};
use cg_core::security::audit::{MemoryWriter, SecurityAuditor};
use cg_core::security::monitor::SecurityMonitor;

#[derive(Debug, Clone, PartialEq)]
struct TransferRemote {
    id: u64,
    name: String,
    encrypted_source_password: String,
}

impl EncryptedModel for TransferRemote {
    fn table_name() -> &'static str {
        "transfer_remotes"
    }

    fn encrypted_fields() -> Vec<EncryptedField<Self>> {
        vec![EncryptedField::new(
            "encrypted_source_password",
            |r| &r.encrypted_source_password,
            |r, v| r.encrypted_source_password = v,
        )]
    }

    fn record_id(&self) -> String {
        self.id.to_string()
    }
}

fn plaintext_for(id: u64) -> String {
    format!("remote-password-{:04}", id)
}

fn seed(encryptor: &CredentialEncryptor, n: u64) -> InMemoryModelStore<TransferRemote> {
    let records = (1..=n)
        .map(|id| TransferRemote {
            id,
            name: format!("remote-{}", id),
            encrypted_source_password: encryptor.encrypt_password(&plaintext_for(id)).unwrap(),
        })
        .collect();
    InMemoryModelStore::new(records)
}

fn services() -> (EncryptionService, EncryptionService) {
    let a = KeyManager::from_key(&generate_key()).unwrap();
    let b = KeyManager::from_key(&generate_key()).unwrap();
    (
        EncryptionService::from_key_manager(&a).unwrap(),
        EncryptionService::from_key_manager(&b).unwrap(),
    )
}

#[tokio::test]
async fn rotated_values_decrypt_only_under_new_key() {
    let (key_a, key_b) = services();
    let enc_a = CredentialEncryptor::new(key_a.clone());
    let enc_b = CredentialEncryptor::new(key_b.clone());
    let store = seed(&enc_a, 25);

    let out = MemoryWriter::new();
    let mut rotator = KeyRotator::new(key_a, key_b, Arc::new(SecurityAuditor::new(out.clone())));
    rotator.set_batch_size(7);
    let stats = rotator.rotate_keys(&store).await.unwrap();

    assert_eq!(stats.total_records, 25);
    assert_eq!(stats.processed_records, 25);
    assert_eq!(stats.updated_records, 25);
    assert_eq!(stats.failed_records, 0);
    assert_eq!(stats.skipped_fields, 0);
    assert!(stats.errors.is_empty());

    for record in store.records().await {
        assert!(is_encrypted(&record.encrypted_source_password));
        assert_eq!(
            enc_b.decrypt(&record.encrypted_source_password).unwrap(),
            plaintext_for(record.id)
        );
        // A CBC decrypt under the wrong key can, rarely, pass padding and
        // UTF-8 checks; it can never yield the original plaintext.
        if let Ok(plain) = enc_a.decrypt(&record.encrypted_source_password) {
            assert_ne!(plain, plaintext_for(record.id));
        }
    }
}

#[tokio::test]
async fn dry_run_leaves_store_under_old_key() {
    let (key_a, key_b) = services();
    let enc_a = CredentialEncryptor::new(key_a.clone());
    let store = seed(&enc_a, 10);
    let before = store.records().await;

    let mut rotator = KeyRotator::new(key_a, key_b, Arc::new(SecurityAuditor::new(std::io::sink())));
    rotator.set_dry_run(true);
    let stats = rotator.rotate_keys(&store).await.unwrap();

    assert!(stats.dry_run);
    assert_eq!(stats.updated_records, 10);
    let after = store.records().await;
    assert_eq!(before, after);
    for record in after {
        assert_eq!(
            enc_a.decrypt(&record.encrypted_source_password).unwrap(),
            plaintext_for(record.id)
        );
    }
}

#[tokio::test]
async fn error_budget_stops_run_early() {
    let (key_a, key_b) = services();
    let enc_a = CredentialEncryptor::new(key_a.clone());
    let store = seed(&enc_a, 40);
    for id in 1..=5 {
        store.fail_save_for(id.to_string());
    }

    let mut rotator = KeyRotator::new(key_a, key_b, Arc::new(SecurityAuditor::new(std::io::sink())));
    rotator.set_max_errors(5);
    rotator.set_batch_size(10);

    match rotator.rotate_keys(&store).await {
        Err(RotationError::TooManyErrors { errors, max_errors, stats, .. }) => {
            assert_eq!(errors, 5);
            assert_eq!(max_errors, 5);
            assert_eq!(stats.failed_records, 5);
            assert!(stats.processed_records < stats.total_records);
        }
        other => panic!("expected TooManyErrors, got {:?}", other),
    }
    assert!(store.save_count() < 40);
}

#[tokio::test]
async fn audit_log_never_contains_secret_or_ciphertext() {
    let (key_a, key_b) = services();
    let out = MemoryWriter::new();
    let auditor = Arc::new(SecurityAuditor::new(out.clone()));
    let monitor = Arc::new(SecurityMonitor::new());
    monitor.set_alert_handler(Arc::new(|_: &cg_core::security::monitor::SecurityAlert| {}));
    monitor.attach(&auditor);

    let secret = "Tr0ub4dor-3-very-secret";
    let enc_a = CredentialEncryptor::new(key_a.clone()).with_auditor(auditor.clone());
    let encrypted = enc_a.encrypt(secret, CredentialType::Password).unwrap();
    let ciphertext = encrypted.trim_start_matches(ENCRYPTED_PREFIX).to_string();

    let store = InMemoryModelStore::new(vec![TransferRemote {
        id: 1,
        name: "primary".to_string(),
        encrypted_source_password: encrypted.clone(),
    }]);
    store.fail_save_for("1");

    let rotator = KeyRotator::new(key_a, key_b, auditor.clone());
    let stats = rotator.rotate_keys(&store).await.unwrap();
    assert_eq!(stats.failed_records, 1);

    // An error message that quotes the ciphertext must be sanitized too.
    auditor.log_key_rotation_event(
        "manual_check",
        Some("transfer_remotes"),
        format!("unexpected value {}", encrypted),
        Some(&format!("password={} hex={}", secret, hex::encode(secret))),
    );

    let log = out.contents();
    assert!(!log.is_empty());
    assert!(!log.contains(secret));
    assert!(!log.contains(&ciphertext));
    assert!(!log.contains(&hex::encode(secret)));
    assert!(!log.contains(&STANDARD.encode(secret)));
}

#[test]
fn zero_key_from_environment_round_trips() {
    let var = "CG_IT_ZERO_KEY";
    std::env::set_var(var, STANDARD.encode([0u8; 32]));

    let manager = KeyManager::with_env_var(var);
    manager.initialize().unwrap();
    let encryptor = CredentialEncryptor::new(EncryptionService::from_key_manager(&manager).unwrap());

    let encrypted = encryptor.encrypt("hunter2hunter2", CredentialType::Password).unwrap();
    assert!(encrypted.starts_with("ENC:"));
    assert_eq!(encryptor.decrypt(&encrypted).unwrap(), "hunter2hunter2");
}
