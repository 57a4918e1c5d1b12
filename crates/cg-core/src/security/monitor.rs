//! Threshold alerting and reporting over the audit event stream.
//!
//! A [`SecurityMonitor`] is fed events either directly through
//! [`SecurityMonitor::process_event`] or by attaching it to a
//! [`SecurityAuditor`] as an observer. Alerts are handed to an
//! [`AlertHandler`] off the calling thread.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use super::audit::{AuditEvent, AuditObserver, EventType, SecurityAuditor};
use crate::config::MonitorSettings;

/// Substrings that indicate a possible breach.
const PERMISSION_MARKERS: [&str; 3] = ["unauthorized", "permission", "access denied"];

/// Failures while writing a report.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The report writer failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The report could not be encoded as JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Bucket an event's error text falls into, see [`classify_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Mentions decryption.
    DecryptionError,
    /// Mentions encryption (but not decryption).
    EncryptionError,
    /// Mentions a key.
    KeyError,
    /// Contains a breach marker; always raises a critical alert.
    PermissionError,
    /// Anything else.
    OtherError,
}

/// Classify an error message by case-insensitive substring match.
pub fn classify_error(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    if PERMISSION_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorClass::PermissionError
    } else if lower.contains("decrypt") {
        ErrorClass::DecryptionError
    } else if lower.contains("encrypt") {
        ErrorClass::EncryptionError
    } else if lower.contains("key") {
        ErrorClass::KeyError
    } else {
        ErrorClass::OtherError
    }
}

/// Severity of a [`SecurityAlert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    /// Volume notice, e.g. many key rotation events.
    Info,
    /// Failure threshold reached for encryption or decryption.
    Warning,
    /// Possible active breach.
    Critical,
}

/// One alert raised by the monitor. Not persisted here; handed to the
/// configured [`AlertHandler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityAlert {
    /// Timestamp of the event that triggered the alert.
    pub timestamp: DateTime<Utc>,
    pub level: AlertLevel,
    pub event_type: EventType,
    pub message: String,
    /// Counter value when the alert fired (1 for breach alerts).
    pub count: u64,
    /// Extra context such as operation and model; sanitized values only.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

/// Sink for raised alerts. Called off the thread that processed the event.
pub trait AlertHandler: Send + Sync {
    fn handle(&self, alert: &SecurityAlert);
}

impl<F> AlertHandler for F
where
    F: Fn(&SecurityAlert) + Send + Sync,
{
    fn handle(&self, alert: &SecurityAlert) {
        self(alert)
    }
}

/// Writes each alert as one JSON line.
pub struct JsonAlertHandler {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl JsonAlertHandler {
    /// Handler writing to `writer`, flushed after every alert.
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    /// Handler writing to standard error.
    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }
}

impl AlertHandler for JsonAlertHandler {
    fn handle(&self, alert: &SecurityAlert) {
        let line = match serde_json::to_string(alert) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "Failed to serialize security alert");
                return;
            }
        };
        let mut writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            error!(error = %e, "Failed to write security alert");
        }
    }
}

impl fmt::Debug for JsonAlertHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonAlertHandler").finish_non_exhaustive()
    }
}

/// Summary of monitored activity in a time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorReport {
    pub generated_at: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total_events: u64,
    pub events_by_type: BTreeMap<EventType, u64>,
    pub failures_by_type: BTreeMap<EventType, u64>,
    pub errors_by_class: BTreeMap<ErrorClass, u64>,
    pub alerts: Vec<SecurityAlert>,
    pub last_seen: BTreeMap<EventType, DateTime<Utc>>,
}

#[derive(Default)]
struct MonitorState {
    thresholds: HashMap<EventType, u64>,
    counters: HashMap<EventType, u64>,
    last_seen: HashMap<EventType, DateTime<Utc>>,
    error_counts: HashMap<ErrorClass, u64>,
    history: VecDeque<AuditEvent>,
    alerts: VecDeque<SecurityAlert>,
}

/// Counts audit events and raises alerts on thresholds and breach markers.
pub struct SecurityMonitor {
    state: RwLock<MonitorState>,
    handler: RwLock<Arc<dyn AlertHandler>>,
    history_limit: usize,
}

impl SecurityMonitor {
    /// Default thresholds, JSON alerts to standard error.
    pub fn new() -> Self {
        Self::from_settings(&MonitorSettings::default())
    }

    pub fn from_settings(settings: &MonitorSettings) -> Self {
        let mut state = MonitorState::default();
        state
            .thresholds
            .insert(EventType::Decryption, settings.decryption_failure_threshold);
        state
            .thresholds
            .insert(EventType::Encryption, settings.encryption_failure_threshold);
        state
            .thresholds
            .insert(EventType::KeyRotation, settings.key_rotation_threshold);

        Self {
            state: RwLock::new(state),
            handler: RwLock::new(Arc::new(JsonAlertHandler::stderr())),
            history_limit: settings.history_limit.max(1),
        }
    }

    /// Register this monitor as an observer of `auditor`.
    pub fn attach(self: &Arc<Self>, auditor: &SecurityAuditor) {
        auditor.add_observer(self.clone());
    }

    /// A threshold of zero disables alerting for that event type.
    pub fn set_alert_threshold(&self, event_type: EventType, count: u64) {
        let mut state = self.write_state();
        state.thresholds.insert(event_type, count);
        state.counters.insert(event_type, 0);
    }

    /// Replace the alert sink. Alerts already dispatched keep the old one.
    pub fn set_alert_handler(&self, handler: Arc<dyn AlertHandler>) {
        *self.handler.write().unwrap_or_else(|p| p.into_inner()) = handler;
    }

    /// Update counters and history with `event` and dispatch any alerts it
    /// raises. Encryption and decryption count failures only; key rotation
    /// counts every event.
    pub fn process_event(&self, event: &AuditEvent) {
        let mut raised = Vec::new();
        {
            let mut state = self.write_state();

            let seen = state.last_seen.entry(event.event_type).or_insert(event.timestamp);
            if event.timestamp > *seen {
                *seen = event.timestamp;
            }

            if let Some(ref message) = event.error {
                let class = classify_error(message);
                *state.error_counts.entry(class).or_insert(0) += 1;

                if class == ErrorClass::PermissionError {
                    raised.push(SecurityAlert {
                        timestamp: event.timestamp,
                        level: AlertLevel::Critical,
                        event_type: event.event_type,
                        message: "Possible unauthorized access detected".to_string(),
                        count: 1,
                        details: event_details(event),
                    });
                }
            }

            if counts_toward_threshold(event) {
                let threshold = state.thresholds.get(&event.event_type).copied().unwrap_or(0);
                let counter = state.counters.entry(event.event_type).or_insert(0);
                *counter += 1;
                if threshold > 0 && *counter >= threshold {
                    let count = *counter;
                    *counter = 0;
                    raised.push(threshold_alert(event, count));
                }
            }

            state.history.push_back(event.clone());
            while state.history.len() > self.history_limit {
                state.history.pop_front();
            }
            for alert in &raised {
                state.alerts.push_back(alert.clone());
            }
            while state.alerts.len() > self.history_limit {
                state.alerts.pop_front();
            }
        }

        for alert in raised {
            self.dispatch(alert);
        }
    }

    /// Current running count toward the threshold of `event_type`.
    pub fn counter(&self, event_type: EventType) -> u64 {
        self.read_state().counters.get(&event_type).copied().unwrap_or(0)
    }

    /// Errors seen so far in `class`. Never reset.
    pub fn error_count(&self, class: ErrorClass) -> u64 {
        self.read_state().error_counts.get(&class).copied().unwrap_or(0)
    }

    /// Alerts raised so far, oldest first, bounded by the history limit.
    pub fn alerts(&self) -> Vec<SecurityAlert> {
        self.read_state().alerts.iter().cloned().collect()
    }

    /// Summarize events and alerts with timestamps in `[start, end]`,
    /// write the summary as pretty JSON and return it.
    pub fn generate_report(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        writer: &mut dyn Write,
    ) -> Result<MonitorReport, MonitorError> {
        let report = {
            let state = self.read_state();
            let in_window = |ts: &DateTime<Utc>| *ts >= start && *ts <= end;

            let mut report = MonitorReport {
                generated_at: Utc::now(),
                start,
                end,
                total_events: 0,
                events_by_type: BTreeMap::new(),
                failures_by_type: BTreeMap::new(),
                errors_by_class: BTreeMap::new(),
                alerts: state
                    .alerts
                    .iter()
                    .filter(|a| in_window(&a.timestamp))
                    .cloned()
                    .collect(),
                last_seen: state.last_seen.iter().map(|(k, v)| (*k, *v)).collect(),
            };

            for event in state.history.iter().filter(|e| in_window(&e.timestamp)) {
                report.total_events += 1;
                *report.events_by_type.entry(event.event_type).or_insert(0) += 1;
                if !event.success {
                    *report.failures_by_type.entry(event.event_type).or_insert(0) += 1;
                }
                if let Some(ref message) = event.error {
                    *report.errors_by_class.entry(classify_error(message)).or_insert(0) += 1;
                }
            }
            report
        };

        serde_json::to_writer_pretty(&mut *writer, &report)?;
        writeln!(writer)?;
        debug!(events = report.total_events, alerts = report.alerts.len(), "Generated security report");
        Ok(report)
    }

    fn dispatch(&self, alert: SecurityAlert) {
        match alert.level {
            AlertLevel::Critical => warn!(event_type = %alert.event_type, message = %alert.message, "Critical security alert"),
            _ => debug!(event_type = %alert.event_type, count = alert.count, "Security alert raised"),
        }

        let handler = self.handler.read().unwrap_or_else(|p| p.into_inner()).clone();
        let task = move || handler.handle(&alert);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn_blocking(task);
            }
            Err(_) => {
                std::thread::spawn(task);
            }
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, MonitorState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, MonitorState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for SecurityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditObserver for SecurityMonitor {
    fn observe(&self, event: &AuditEvent) {
        self.process_event(event);
    }
}

impl fmt::Debug for SecurityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read_state();
        f.debug_struct("SecurityMonitor")
            .field("history", &state.history.len())
            .field("alerts", &state.alerts.len())
            .finish()
    }
}

/// Key rotations count by volume; everything else counts failures.
fn counts_toward_threshold(event: &AuditEvent) -> bool {
    match event.event_type {
        EventType::KeyRotation => true,
        _ => !event.success,
    }
}

fn threshold_alert(event: &AuditEvent, count: u64) -> SecurityAlert {
    let (level, message) = match event.event_type {
        EventType::KeyRotation => (AlertLevel::Info, format!("{} key rotation events", count)),
        other => (AlertLevel::Warning, format!("{} {} failures", count, other)),
    };
    SecurityAlert {
        timestamp: event.timestamp,
        level,
        event_type: event.event_type,
        message,
        count,
        details: event_details(event),
    }
}

fn event_details(event: &AuditEvent) -> BTreeMap<String, String> {
    let mut details = BTreeMap::new();
    details.insert("operation".to_string(), event.operation.clone());
    if let Some(ref model) = event.model_type {
        details.insert("model_type".to_string(), model.clone());
    }
    if let Some(ref field) = event.field_type {
        details.insert("field_type".to_string(), field.clone());
    }
    if let Some(ref error) = event.error {
        details.insert("error".to_string(), error.clone());
    }
    details
}
