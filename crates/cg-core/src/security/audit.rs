//! Audit logging for every cryptographic and key-lifecycle operation.
//!
//! Each event is one JSON object per line (JSON Lines). Events at `info` or
//! `warning` level go to the primary stream, `error` and `alert` events to
//! the error stream (which defaults to the primary one). Free-text fields are
//! sanitized before serialization so credentials, key material and
//! ciphertext never reach the log.
//!
//! # Rolling
//!
//! [`RollingFileWriter`] renames the current file with a UTC timestamp
//! suffix once it exceeds its size limit and starts a fresh one.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use super::sanitize::sanitize_error;
use crate::config::AuditSettings;

/// Default size at which a file-backed audit stream is rolled (10 MB).
pub const DEFAULT_MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Failures opening or writing audit streams. Never returned from
/// [`SecurityAuditor::log_event`]; logging failures go to `tracing`.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Opening, writing, flushing or rolling a stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An event could not be encoded as JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Kinds of audited operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A credential was encrypted.
    Encryption,
    /// A credential was decrypted.
    Decryption,
    /// The active key was loaded or checked.
    KeyAccess,
    /// Progress or failure of a rotation run.
    KeyRotation,
    /// A new key was generated.
    KeyGeneration,
    /// Raised by monitoring rather than by a crypto operation.
    SecurityAlert,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Encryption => "encryption",
            Self::Decryption => "decryption",
            Self::KeyAccess => "key_access",
            Self::KeyRotation => "key_rotation",
            Self::KeyGeneration => "key_generation",
            Self::SecurityAlert => "security_alert",
        };
        write!(f, "{}", s)
    }
}

/// Severity; selects the output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warning,
    /// Failed operation; written to the error stream.
    Error,
    /// Needs operator attention; written to the error stream.
    Alert,
}

impl EventLevel {
    /// Whether events at this level go to the error stream.
    pub fn is_error(self) -> bool {
        matches!(self, Self::Error | Self::Alert)
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Alert => "alert",
        };
        write!(f, "{}", s)
    }
}

/// A single audit record. Immutable once logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub level: EventLevel,
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl AuditEvent {
    /// Successful `info` event stamped with the current UTC time.
    pub fn new(event_type: EventType, operation: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            level: EventLevel::Info,
            operation: operation.into(),
            field_type: None,
            model_type: None,
            description: None,
            success: true,
            error: None,
            key_version: None,
            user_id: None,
            remote_ip: None,
            duration_ms: None,
        }
    }

    /// Failed `error` event carrying the error text.
    pub fn failure(
        event_type: EventType,
        operation: impl Into<String>,
        error: impl fmt::Display,
    ) -> Self {
        Self::new(event_type, operation).with_error(error)
    }

    pub fn with_level(mut self, level: EventLevel) -> Self {
        self.level = level;
        self
    }

    /// Mark the event failed. Raises the level to `error` unless it is
    /// already `error` or `alert`.
    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.success = false;
        self.error = Some(error.to_string());
        if !self.level.is_error() {
            self.level = EventLevel::Error;
        }
        self
    }

    pub fn with_field_type(mut self, field_type: impl Into<String>) -> Self {
        self.field_type = Some(field_type.into());
        self
    }

    pub fn with_model_type(mut self, model_type: impl Into<String>) -> Self {
        self.model_type = Some(model_type.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_key_version(mut self, key_version: impl Into<String>) -> Self {
        self.key_version = Some(key_version.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_remote_ip(mut self, remote_ip: impl Into<String>) -> Self {
        self.remote_ip = Some(remote_ip.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }

    /// Copy with every free-text field passed through the sanitizer.
    pub fn sanitized(mut self) -> Self {
        self.error = self.error.as_deref().map(sanitize_error);
        self.description = self.description.as_deref().map(sanitize_error);
        self
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} {} ({})",
            self.timestamp.to_rfc3339(),
            self.level,
            self.event_type,
            self.operation,
            if self.success { "success" } else { "failure" },
        )?;
        if let Some(ref model) = self.model_type {
            write!(f, " model={}", model)?;
        }
        if let Some(ref error) = self.error {
            write!(f, ": {}", error)?;
        }
        Ok(())
    }
}

/// Receives every event the auditor logs, after sanitization.
pub trait AuditObserver: Send + Sync {
    fn observe(&self, event: &AuditEvent);
}

type BoxedWriter = Box<dyn Write + Send>;

struct Streams {
    primary: BoxedWriter,
    errors: Option<BoxedWriter>,
}

/// Sanitizing, level-routing JSON Lines audit sink.
///
/// Thread-safe: concurrent [`log_event`](Self::log_event) calls are
/// serialized on an internal mutex so lines never interleave.
pub struct SecurityAuditor {
    enabled: AtomicBool,
    streams: Mutex<Streams>,
    observers: RwLock<Vec<Arc<dyn AuditObserver>>>,
    key_version: RwLock<Option<String>>,
}

impl SecurityAuditor {
    /// All events to one writer.
    pub fn new(primary: impl Write + Send + 'static) -> Self {
        Self::from_streams(Box::new(primary), None)
    }

    /// `info`/`warning` to `primary`, `error`/`alert` to `errors`.
    pub fn with_error_writer(
        primary: impl Write + Send + 'static,
        errors: impl Write + Send + 'static,
    ) -> Self {
        Self::from_streams(Box::new(primary), Some(Box::new(errors)))
    }

    /// Standard output for regular events, standard error for failures.
    pub fn stdio() -> Self {
        Self::with_error_writer(io::stdout(), io::stderr())
    }

    /// File-backed streams, rolled at `max_size` bytes.
    pub fn open(
        log_path: &Path,
        error_log_path: Option<&Path>,
        max_size: u64,
    ) -> Result<Self, AuditError> {
        let primary = RollingFileWriter::new(log_path, max_size)?;
        let errors = match error_log_path {
            Some(path) => Some(Box::new(RollingFileWriter::new(path, max_size)?) as BoxedWriter),
            None => None,
        };
        Ok(Self::from_streams(Box::new(primary), errors))
    }

    /// Build from settings: files when paths are configured, stdio otherwise.
    pub fn from_settings(settings: &AuditSettings) -> Result<Self, AuditError> {
        let auditor = match (&settings.log_path, &settings.error_log_path) {
            (Some(log), errors) => Self::open(log, errors.as_deref(), settings.max_file_size)?,
            (None, Some(errors)) => Self::from_streams(
                Box::new(io::stdout()),
                Some(Box::new(RollingFileWriter::new(errors, settings.max_file_size)?)),
            ),
            (None, None) => Self::stdio(),
        };
        if !settings.enabled {
            auditor.disable();
        }
        Ok(auditor)
    }

    fn from_streams(primary: BoxedWriter, errors: Option<BoxedWriter>) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            streams: Mutex::new(Streams { primary, errors }),
            observers: RwLock::new(Vec::new()),
            key_version: RwLock::new(None),
        }
    }

    /// Resume logging after [`disable`](Self::disable).
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Drop every event until re-enabled. Observers are not notified either.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Version stamped on convenience events that do not carry their own.
    pub fn set_key_version(&self, key_version: impl Into<String>) {
        *self
            .key_version
            .write()
            .unwrap_or_else(|p| p.into_inner()) = Some(key_version.into());
    }

    pub fn key_version(&self) -> Option<String> {
        self.key_version
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn add_observer(&self, observer: Arc<dyn AuditObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(observer);
    }

    /// Sanitize, serialize and append one event.
    ///
    /// Write failures are reported through `tracing` and never returned:
    /// auditing must not fail the audited operation.
    pub fn log_event(&self, event: AuditEvent) {
        if !self.is_enabled() {
            return;
        }

        let mut event = event.sanitized();
        if event.key_version.is_none() {
            event.key_version = self.key_version();
        }

        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, event = %event, "Failed to serialize audit event");
                return;
            }
        };

        {
            let mut guard = match self.streams.lock() {
                Ok(g) => g,
                Err(poisoned) => {
                    error!("Audit stream mutex poisoned, recovering");
                    poisoned.into_inner()
                }
            };
            let streams = &mut *guard;
            let writer = match (event.level.is_error(), streams.errors.as_mut()) {
                (true, Some(errors)) => errors,
                _ => &mut streams.primary,
            };
            if let Err(e) = write_line(writer, &line) {
                error!(error = %e, event = %event, "Failed to write audit event");
            }
        }

        let observers = self
            .observers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for observer in observers {
            observer.observe(&event);
        }
    }

    pub fn log_encryption_event(
        &self,
        field_type: &str,
        model_type: Option<&str>,
        duration: Duration,
        error: Option<&dyn fmt::Display>,
    ) {
        self.log_crypto_event(EventType::Encryption, "encrypt", field_type, model_type, duration, error);
    }

    pub fn log_decryption_event(
        &self,
        field_type: &str,
        model_type: Option<&str>,
        duration: Duration,
        error: Option<&dyn fmt::Display>,
    ) {
        self.log_crypto_event(EventType::Decryption, "decrypt", field_type, model_type, duration, error);
    }

    fn log_crypto_event(
        &self,
        event_type: EventType,
        operation: &str,
        field_type: &str,
        model_type: Option<&str>,
        duration: Duration,
        error: Option<&dyn fmt::Display>,
    ) {
        let mut event = AuditEvent::new(event_type, operation)
            .with_field_type(field_type)
            .with_duration(duration);
        if let Some(model) = model_type {
            event = event.with_model_type(model);
        }
        if let Some(e) = error {
            event = event.with_error(e);
        }
        self.log_event(event);
    }

    pub fn log_key_access_event(&self, operation: &str, error: Option<&dyn fmt::Display>) {
        let mut event = AuditEvent::new(EventType::KeyAccess, operation);
        if let Some(e) = error {
            event = event.with_error(e);
        }
        self.log_event(event);
    }

    pub fn log_key_rotation_event(
        &self,
        operation: &str,
        model_type: Option<&str>,
        description: impl Into<String>,
        error: Option<&dyn fmt::Display>,
    ) {
        let mut event =
            AuditEvent::new(EventType::KeyRotation, operation).with_description(description);
        if let Some(model) = model_type {
            event = event.with_model_type(model);
        }
        if let Some(e) = error {
            event = event.with_error(e);
        }
        self.log_event(event);
    }

    pub fn log_key_generation_event(&self, key_version: &str, error: Option<&dyn fmt::Display>) {
        let mut event =
            AuditEvent::new(EventType::KeyGeneration, "generate_key").with_key_version(key_version);
        if let Some(e) = error {
            event = event.with_error(e);
        }
        self.log_event(event);
    }

    /// Flush both streams.
    pub fn flush(&self) -> Result<(), AuditError> {
        let mut guard = self.streams.lock().unwrap_or_else(|p| p.into_inner());
        guard.primary.flush()?;
        if let Some(errors) = guard.errors.as_mut() {
            errors.flush()?;
        }
        Ok(())
    }
}

impl fmt::Debug for SecurityAuditor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityAuditor")
            .field("enabled", &self.is_enabled())
            .field("key_version", &self.key_version())
            .finish()
    }
}

/// One event per call: the record and its newline go out in a single
/// buffer, and the flush marks the record boundary for rolling writers.
fn write_line(writer: &mut BoxedWriter, line: &str) -> io::Result<()> {
    let mut record = Vec::with_capacity(line.len() + 1);
    record.extend_from_slice(line.as_bytes());
    record.push(b'\n');
    writer.write_all(&record)?;
    writer.flush()
}

// ---------------------------------------------------------------------------
// RollingFileWriter
// ---------------------------------------------------------------------------

/// Append-only file writer that rolls the file once it exceeds `max_size`.
///
/// A roll is only considered at a record boundary, i.e. on the first write
/// after a [`flush`](Write::flush), so a record is never split across files.
pub struct RollingFileWriter {
    path: PathBuf,
    max_size: u64,
    writer: Option<BufWriter<File>>,
    in_record: bool,
}

impl RollingFileWriter {
    /// Open `path` in append mode, creating parent directories.
    pub fn new(path: &Path, max_size: u64) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                info!(path = %parent.display(), "Created audit log directory");
            }
        }

        let file = Self::open_log_file(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            max_size,
            writer: Some(BufWriter::new(file)),
            in_record: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_log_file(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    /// Rename the current file to `<path>.<timestamp>` if it is over the
    /// limit. Returns `true` if a roll happened.
    fn maybe_roll(&mut self) -> io::Result<bool> {
        let len = match fs::metadata(&self.path) {
            Ok(m) => m.len(),
            Err(_) => return Ok(false),
        };
        if len < self.max_size {
            return Ok(false);
        }

        if let Some(ref mut w) = self.writer {
            let _ = w.flush();
        }
        self.writer = None;

        let timestamp = Utc::now().format("%Y%m%dT%H%M%S%.fZ");
        let rolled = PathBuf::from(format!("{}.{}", self.path.display(), timestamp));
        fs::rename(&self.path, &rolled).map_err(|e| {
            error!(
                from = %self.path.display(),
                to = %rolled.display(),
                error = %e,
                "Failed to roll audit log"
            );
            e
        })?;

        info!(old = %rolled.display(), new = %self.path.display(), "Rolled audit log");
        Ok(true)
    }
}

impl Write for RollingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.in_record {
            if let Err(e) = self.maybe_roll() {
                warn!(error = %e, "Failed to check/roll audit log");
            }
        }
        if self.writer.is_none() {
            self.writer = Some(BufWriter::new(Self::open_log_file(&self.path)?));
        }
        let written = match self.writer.as_mut() {
            Some(w) => w.write(buf)?,
            None => return Err(io::Error::new(io::ErrorKind::Other, "audit log not open")),
        };
        if written > 0 {
            self.in_record = true;
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.in_record = false;
        match self.writer.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for RollingFileWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollingFileWriter")
            .field("path", &self.path)
            .field("max_size", &self.max_size)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// MemoryWriter (for testing)
// ---------------------------------------------------------------------------

/// Shared in-memory writer; clones see the same buffer.
///
/// Useful for tests that need to inspect what the auditor wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap_or_else(|p| p.into_inner())).into_owned()
    }

    /// Parse every line as an [`AuditEvent`], skipping lines that do not parse.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.contents()
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    struct Recorder(Mutex<Vec<AuditEvent>>);

    impl AuditObserver for Recorder {
        fn observe(&self, event: &AuditEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_event_builders() {
        let event = AuditEvent::new(EventType::Encryption, "encrypt")
            .with_field_type("password")
            .with_model_type("transfer_configs")
            .with_duration(Duration::from_millis(3));
        assert!(event.success);
        assert_eq!(event.level, EventLevel::Info);
        assert_eq!(event.duration_ms, Some(3));

        let failed = AuditEvent::failure(EventType::Decryption, "decrypt", "invalid padding size");
        assert!(!failed.success);
        assert_eq!(failed.level, EventLevel::Error);
        assert_eq!(failed.error.as_deref(), Some("invalid padding size"));

        let alert = AuditEvent::new(EventType::KeyRotation, "abort")
            .with_level(EventLevel::Alert)
            .with_error("too many errors");
        assert_eq!(alert.level, EventLevel::Alert);
    }

    #[test]
    fn test_json_format_skips_empty_fields() {
        let event = AuditEvent::new(EventType::KeyAccess, "get_primary_key");
        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "key_access");
        assert_eq!(value["level"], "info");
        assert_eq!(value["success"], true);
        assert!(!value.as_object().unwrap().contains_key("error"));
        assert!(!value.as_object().unwrap().contains_key("remote_ip"));
    }

    #[test]
    fn test_writes_json_lines() {
        let out = MemoryWriter::new();
        let auditor = SecurityAuditor::new(out.clone());

        auditor.log_encryption_event("password", None, Duration::from_millis(1), None);
        auditor.log_decryption_event("api_key", Some("notification_services"), Duration::ZERO, None);
        auditor.log_key_generation_event("abc123", None);

        let content = out.contents();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in &lines {
            let _: AuditEvent = serde_json::from_str(line).unwrap();
        }

        let events = out.events();
        assert_eq!(events[0].event_type, EventType::Encryption);
        assert_eq!(events[1].model_type.as_deref(), Some("notification_services"));
        assert_eq!(events[2].key_version.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_level_routing() {
        let primary = MemoryWriter::new();
        let errors = MemoryWriter::new();
        let auditor = SecurityAuditor::with_error_writer(primary.clone(), errors.clone());

        auditor.log_event(AuditEvent::new(EventType::KeyAccess, "read"));
        auditor.log_event(AuditEvent::new(EventType::KeyAccess, "read").with_level(EventLevel::Warning));
        auditor.log_event(AuditEvent::failure(EventType::Decryption, "decrypt", "bad"));
        auditor.log_event(AuditEvent::new(EventType::SecurityAlert, "alert").with_level(EventLevel::Alert));

        assert_eq!(primary.events().len(), 2);
        let errs = errors.events();
        assert_eq!(errs.len(), 2);
        assert!(errs.iter().all(|e| e.level.is_error()));
    }

    #[test]
    fn test_errors_are_sanitized() {
        let out = MemoryWriter::new();
        let auditor = SecurityAuditor::new(out.clone());

        auditor.log_event(AuditEvent::failure(
            EventType::Decryption,
            "decrypt",
            "failed on ENC:q83vEjRWeJq83vEjRWeJq83vEjRWeJ== with password=hunter2hunter2",
        ));

        let content = out.contents();
        assert!(!content.contains("hunter2hunter2"));
        assert!(!content.contains("q83vEjRWeJ"));
        assert!(content.contains("ENC:[REDACTED]"));
    }

    #[test]
    fn test_disable_gates_logging() {
        let out = MemoryWriter::new();
        let auditor = SecurityAuditor::new(out.clone());
        auditor.disable();
        assert!(!auditor.is_enabled());
        auditor.log_key_access_event("read", None);
        assert!(out.contents().is_empty());

        auditor.enable();
        auditor.log_key_access_event("read", None);
        assert_eq!(out.events().len(), 1);
    }

    #[test]
    fn test_key_version_stamp() {
        let out = MemoryWriter::new();
        let auditor = SecurityAuditor::new(out.clone());
        auditor.set_key_version("0a1b2c3d4e5f");
        auditor.log_key_access_event("read", None);
        auditor.log_key_generation_event("ffffffffffff", None);

        let events = out.events();
        assert_eq!(events[0].key_version.as_deref(), Some("0a1b2c3d4e5f"));
        assert_eq!(events[1].key_version.as_deref(), Some("ffffffffffff"));
    }

    #[test]
    fn test_observers_see_sanitized_events() {
        let auditor = SecurityAuditor::new(io::sink());
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        auditor.add_observer(recorder.clone());

        auditor.log_event(AuditEvent::failure(EventType::Encryption, "encrypt", "token=abc"));

        let seen = recorder.0.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].error.as_deref(), Some("token=[REDACTED]"));
    }

    #[test]
    fn test_concurrent_logging_does_not_interleave() {
        let out = MemoryWriter::new();
        let auditor = Arc::new(SecurityAuditor::new(out.clone()));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let auditor = auditor.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        auditor.log_key_rotation_event("rotate_record", Some("t"), format!("worker {}", i), None);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let content = out.contents();
        assert_eq!(content.lines().count(), 400);
        for line in content.lines() {
            let _: AuditEvent = serde_json::from_str(line).unwrap();
        }
    }

    #[test]
    fn test_file_auditor_creates_dirs_and_appends() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("nested").join("audit.log");
        let err_path = dir.path().join("nested").join("audit-error.log");

        {
            let auditor = SecurityAuditor::open(&log_path, Some(&err_path), DEFAULT_MAX_LOG_SIZE).unwrap();
            auditor.log_key_access_event("read", None);
            auditor.log_key_access_event("read", Some(&"denied"));
        }
        {
            let auditor = SecurityAuditor::open(&log_path, Some(&err_path), DEFAULT_MAX_LOG_SIZE).unwrap();
            auditor.log_key_access_event("read", None);
        }

        assert_eq!(fs::read_to_string(&log_path).unwrap().lines().count(), 2);
        assert_eq!(fs::read_to_string(&err_path).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_rolling_file_writer() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("audit.log");
        let auditor = SecurityAuditor::open(&log_path, None, 4 * 1024).unwrap();

        let description = "x".repeat(500);
        for _ in 0..40 {
            auditor.log_key_rotation_event("rotate_record", None, description.as_str(), None);
        }

        assert!(log_path.exists());
        let rolled: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("audit.log."))
            .collect();
        assert!(!rolled.is_empty(), "At least one rolled log file should exist");
    }

    #[test]
    fn test_rolling_file_writer_keeps_records_whole() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("audit.log");
        let mut writer = RollingFileWriter::new(&log_path, 1).unwrap();

        // Larger than the BufWriter capacity, so it bypasses the buffer.
        let big = "a".repeat(10_000);
        writer.write_all(big.as_bytes()).unwrap();
        writer.write_all(b"\n").unwrap();
        writer.flush().unwrap();

        writer.write_all(b"bbbb").unwrap();
        writer.write_all(b"\n").unwrap();
        writer.flush().unwrap();

        let mut contents: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| fs::read_to_string(e.path()).unwrap())
            .collect();
        contents.sort_by_key(|c| c.len());

        assert_eq!(contents, vec!["bbbb\n".to_string(), format!("{}\n", big)]);
        assert_eq!(fs::read_to_string(&log_path).unwrap(), "bbbb\n");
    }

    #[test]
    fn test_long_events_survive_rolling() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("audit.log");
        let auditor = SecurityAuditor::open(&log_path, None, 1024).unwrap();

        let description = "y".repeat(20_000);
        for _ in 0..3 {
            auditor.log_key_rotation_event("rotate_record", None, description.as_str(), None);
        }

        let mut events = 0;
        for entry in fs::read_dir(dir.path()).unwrap().filter_map(|e| e.ok()) {
            let text = fs::read_to_string(entry.path()).unwrap();
            assert!(text.is_empty() || text.ends_with('\n'));
            for line in text.lines() {
                let event: AuditEvent = serde_json::from_str(line).unwrap();
                assert_eq!(event.description.as_deref(), Some(description.as_str()));
                events += 1;
            }
        }
        assert_eq!(events, 3);
    }

    #[test]
    fn test_from_settings_disabled() {
        let dir = TempDir::new().unwrap();
        let settings = AuditSettings {
            enabled: false,
            log_path: Some(dir.path().join("audit.log")),
            error_log_path: None,
            max_file_size: DEFAULT_MAX_LOG_SIZE,
        };
        let auditor = SecurityAuditor::from_settings(&settings).unwrap();
        assert!(!auditor.is_enabled());
    }
}
