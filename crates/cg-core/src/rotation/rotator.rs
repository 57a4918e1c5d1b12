//! Bulk re-encryption of one model's records from an old key to a new one.
//!
//! Records are paged through a [`ModelStore`] in fixed-size batches. For
//! every registered encrypted field carrying the `ENC:` marker the value is
//! decrypted with the old key and re-encrypted with the new one. Fields the
//! old key cannot decrypt are skipped and counted separately; save and fetch
//! failures count toward an error budget that aborts the run once reached.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use super::model::{EncryptedModel, ModelStore, StoreError};
use super::stats::RotationStats;
use crate::config::{RotationSettings, DEFAULT_BATCH_SIZE, DEFAULT_MAX_ERRORS};
use crate::crypto::credentials::ENCRYPTED_PREFIX;
use crate::crypto::encryption::EncryptionService;
use crate::security::audit::{AuditEvent, EventLevel, EventType, SecurityAuditor};

/// Reasons a rotation run stops without completing.
#[derive(Debug, Error)]
pub enum RotationError {
    /// The model's table holds no records.
    #[error("no data to migrate in {0}")]
    NoDataToMigrate(String),

    /// The error budget was used up; carries the statistics gathered so far.
    #[error("rotation of {model} aborted: {errors} errors reached the limit of {max_errors}")]
    TooManyErrors {
        model: String,
        errors: usize,
        max_errors: usize,
        stats: Box<RotationStats>,
    },

    /// Counting records failed before any batch was fetched.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl RotationError {
    /// Partial statistics, when the run got far enough to have any.
    pub fn stats(&self) -> Option<&RotationStats> {
        match self {
            Self::TooManyErrors { stats, .. } => Some(stats),
            _ => None,
        }
    }
}

/// Re-encrypts every registered encrypted field from `old` to `new`.
pub struct KeyRotator {
    old: EncryptionService,
    new: EncryptionService,
    auditor: Arc<SecurityAuditor>,
    dry_run: bool,
    batch_size: usize,
    max_errors: usize,
}

impl KeyRotator {
    /// Rotator with default batch size and error budget, writing for real.
    pub fn new(old: EncryptionService, new: EncryptionService, auditor: Arc<SecurityAuditor>) -> Self {
        Self {
            old,
            new,
            auditor,
            dry_run: false,
            batch_size: DEFAULT_BATCH_SIZE,
            max_errors: DEFAULT_MAX_ERRORS,
        }
    }

    /// Apply dry-run, batch size and error budget from settings.
    pub fn with_settings(mut self, settings: &RotationSettings) -> Self {
        self.set_dry_run(settings.dry_run);
        self.set_batch_size(settings.batch_size);
        self.set_max_errors(settings.max_errors);
        self
    }

    /// In a dry run records are inspected and counted but never saved.
    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    /// Records fetched per page. Zero is treated as one.
    pub fn set_batch_size(&mut self, batch_size: usize) {
        self.batch_size = batch_size.max(1);
    }

    /// Errors tolerated before the run aborts. Zero is treated as one.
    pub fn set_max_errors(&mut self, max_errors: usize) {
        self.max_errors = max_errors.max(1);
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn max_errors(&self) -> usize {
        self.max_errors
    }

    /// Rotate every record of `M` held in `store`.
    pub async fn rotate_keys<M, S>(&self, store: &S) -> Result<RotationStats, RotationError>
    where
        M: EncryptedModel,
        S: ModelStore<M> + ?Sized,
    {
        let model = M::table_name();
        let mut stats = RotationStats::new(model, self.dry_run);

        let total = store.count().await?;
        if total == 0 {
            return Err(RotationError::NoDataToMigrate(model.to_string()));
        }
        stats.total_records = total;

        info!(
            model,
            total,
            batch_size = self.batch_size,
            dry_run = self.dry_run,
            run_id = %stats.run_id,
            "Starting key rotation"
        );
        self.auditor.log_key_rotation_event(
            "rotation_started",
            Some(model),
            format!(
                "Rotating {} records of {} (run {}, dry_run={})",
                total, model, stats.run_id, self.dry_run
            ),
            None,
        );

        let mut offset: u64 = 0;
        while offset < total {
            let batch = match store.fetch_batch(offset, self.batch_size).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(model, offset, error = %e, "Failed to fetch batch, moving on");
                    stats.record_error(format!("fetch batch at offset {}: {}", offset, e));
                    offset += self.batch_size as u64;
                    self.check_error_budget(&mut stats)?;
                    continue;
                }
            };
            if batch.is_empty() {
                break;
            }
            let fetched = batch.len() as u64;

            for mut record in batch {
                self.process_record(store, &mut record, &mut stats).await;
                self.check_error_budget(&mut stats)?;
            }

            offset += fetched;
            debug!(model, offset, total, "Batch complete");
        }

        stats.finish();
        info!(
            model,
            processed = stats.processed_records,
            updated = stats.updated_records,
            failed = stats.failed_records,
            skipped_fields = stats.skipped_fields,
            "Key rotation complete"
        );
        self.auditor.log_key_rotation_event(
            "rotation_completed",
            Some(model),
            format!(
                "Processed {} of {} records: {} updated, {} skipped, {} failed, {} fields not decryptable",
                stats.processed_records,
                stats.total_records,
                stats.updated_records,
                stats.skipped_records,
                stats.failed_records,
                stats.skipped_fields
            ),
            None,
        );
        Ok(stats)
    }

    async fn process_record<M, S>(&self, store: &S, record: &mut M, stats: &mut RotationStats)
    where
        M: EncryptedModel,
        S: ModelStore<M> + ?Sized,
    {
        let model = M::table_name();
        let id = record.record_id();

        let changed = match self.reencrypt_fields(record, stats) {
            Ok(changed) => changed,
            Err(message) => {
                stats.failed_records += 1;
                stats.record_error(format!("record {}: {}", id, message));
                self.auditor.log_event(
                    AuditEvent::failure(EventType::KeyRotation, "rotate_record", &message)
                        .with_model_type(model)
                        .with_description(format!("record {}", id)),
                );
                return;
            }
        };

        if changed.is_empty() {
            stats.processed_records += 1;
            stats.skipped_records += 1;
            return;
        }

        if self.dry_run {
            debug!(model, record_id = %id, fields = ?changed, "Dry run: would update record");
            stats.processed_records += 1;
            stats.updated_records += 1;
            return;
        }

        match store.save(record).await {
            Ok(()) => {
                stats.processed_records += 1;
                stats.updated_records += 1;
                self.auditor.log_key_rotation_event(
                    "rotate_record",
                    Some(model),
                    format!("Rotated record {} fields [{}]", id, changed.join(", ")),
                    None,
                );
            }
            Err(e) => {
                error!(model, record_id = %id, error = %e, "Failed to save rotated record");
                stats.failed_records += 1;
                stats.record_error(format!("save record {}: {}", id, e));
                self.auditor.log_key_rotation_event(
                    "rotate_record",
                    Some(model),
                    format!("record {}", id),
                    Some(&e),
                );
            }
        }
    }

    /// Re-encrypt the fields of one record in place. Returns the names of
    /// the fields whose stored value changed.
    fn reencrypt_fields<M: EncryptedModel>(
        &self,
        record: &mut M,
        stats: &mut RotationStats,
    ) -> Result<Vec<&'static str>, String> {
        let mut changed = Vec::new();

        for field in M::encrypted_fields() {
            let current = (field.get)(record);
            let Some(payload) = current.strip_prefix(ENCRYPTED_PREFIX) else {
                continue;
            };
            if payload.is_empty() {
                continue;
            }

            let plaintext = match self.old.decrypt(payload) {
                Ok(plaintext) => Zeroizing::new(plaintext),
                Err(e) => {
                    debug!(field = field.name, error = %e, "Old key cannot decrypt field, skipping");
                    stats.skipped_fields += 1;
                    continue;
                }
            };

            let ciphertext = self
                .new
                .encrypt(&plaintext)
                .map_err(|e| format!("re-encrypt {}: {}", field.name, e))?;
            let rotated = format!("{}{}", ENCRYPTED_PREFIX, ciphertext);

            if rotated != current {
                (field.set)(record, rotated);
                changed.push(field.name);
            }
        }

        Ok(changed)
    }

    fn check_error_budget(&self, stats: &mut RotationStats) -> Result<(), RotationError> {
        if stats.error_count() < self.max_errors {
            return Ok(());
        }

        stats.finish();
        error!(
            model = %stats.model,
            errors = stats.error_count(),
            max_errors = self.max_errors,
            "Too many errors, aborting key rotation"
        );
        self.auditor.log_event(
            AuditEvent::new(EventType::KeyRotation, "rotation_aborted")
                .with_level(EventLevel::Alert)
                .with_model_type(stats.model.clone())
                .with_error(format!(
                    "aborted after {} errors (limit {})",
                    stats.error_count(),
                    self.max_errors
                ))
                .with_description(format!(
                    "processed {} of {} records",
                    stats.processed_records, stats.total_records
                )),
        );

        Err(RotationError::TooManyErrors {
            model: stats.model.clone(),
            errors: stats.error_count(),
            max_errors: self.max_errors,
            stats: Box::new(stats.clone()),
        })
    }
}

impl fmt::Debug for KeyRotator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRotator")
            .field("dry_run", &self.dry_run)
            .field("batch_size", &self.batch_size)
            .field("max_errors", &self.max_errors)
            .finish()
    }
}
