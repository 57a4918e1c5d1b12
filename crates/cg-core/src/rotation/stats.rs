use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::security::sanitize::sanitize_error;

/// Outcome counters of one rotation run over one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationStats {
    pub run_id: Uuid,
    pub model: String,
    pub dry_run: bool,
    pub total_records: u64,
    /// Records inspected without a save failure.
    pub processed_records: u64,
    /// Records with at least one re-encrypted field (would-be updates in a dry run).
    pub updated_records: u64,
    /// Records inspected with nothing to rotate.
    pub skipped_records: u64,
    pub failed_records: u64,
    /// Fields left untouched because the old key could not decrypt them.
    pub skipped_fields: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
}

impl RotationStats {
    pub fn new(model: impl Into<String>, dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            model: model.into(),
            dry_run,
            total_records: 0,
            processed_records: 0,
            updated_records: 0,
            skipped_records: 0,
            failed_records: 0,
            skipped_fields: 0,
            start_time: Utc::now(),
            end_time: None,
            errors: Vec::new(),
        }
    }

    /// Append a sanitized error message.
    pub fn record_error(&mut self, message: impl AsRef<str>) {
        self.errors.push(sanitize_error(message.as_ref()));
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn finish(&mut self) {
        self.end_time = Some(Utc::now());
    }

    /// Wall-clock time of the run; measured to now while still running.
    pub fn duration(&self) -> Duration {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).to_std().unwrap_or_default()
    }
}

impl fmt::Display for RotationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: total={} processed={} updated={} skipped={} failed={} skipped_fields={} errors={} duration={:.2}s{}",
            self.model,
            self.total_records,
            self.processed_records,
            self.updated_records,
            self.skipped_records,
            self.failed_records,
            self.skipped_fields,
            self.errors.len(),
            self.duration().as_secs_f64(),
            if self.dry_run { " (dry run)" } else { "" },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_stats() {
        let stats = RotationStats::new("transfer_configs", true);
        assert_eq!(stats.model, "transfer_configs");
        assert!(stats.dry_run);
        assert_eq!(stats.error_count(), 0);
        assert!(stats.end_time.is_none());
        assert_ne!(stats.run_id, RotationStats::new("x", false).run_id);
    }

    #[test]
    fn test_errors_are_sanitized() {
        let mut stats = RotationStats::new("t", false);
        stats.record_error("save record 3 failed: value ENC:abcdefgh rejected");
        assert_eq!(stats.errors, vec!["save record 3 failed: value ENC:[REDACTED] rejected"]);
    }

    #[test]
    fn test_finish_and_display() {
        let mut stats = RotationStats::new("auth_providers", false);
        stats.total_records = 2;
        stats.processed_records = 2;
        stats.finish();
        assert!(stats.end_time.unwrap() >= stats.start_time);

        let line = stats.to_string();
        assert!(line.starts_with("auth_providers: total=2 processed=2"));
        assert!(!line.contains("dry run"));
    }
}
