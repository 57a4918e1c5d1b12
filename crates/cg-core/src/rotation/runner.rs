//! Drives rotation of several models under a master deadline.
//!
//! Each model gets its own worker deadline, capped by the master one. A
//! model that runs out of time is abandoned and the run moves on; writes it
//! already committed stay committed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

use super::model::{EncryptedModel, ModelStore};
use super::rotator::{KeyRotator, RotationError};
use super::stats::RotationStats;
use crate::config::RotationSettings;
use crate::security::audit::{AuditEvent, EventLevel, EventType, SecurityAuditor};

/// One model's pending rotation.
pub struct RotationJob<'a> {
    pub model: String,
    future: BoxFuture<'a, Result<RotationStats, RotationError>>,
}

impl<'a> RotationJob<'a> {
    pub fn new<M, S>(rotator: &'a KeyRotator, store: &'a S) -> Self
    where
        M: EncryptedModel,
        S: ModelStore<M> + ?Sized,
    {
        Self {
            model: M::table_name().to_string(),
            future: Box::pin(rotator.rotate_keys::<M, S>(store)),
        }
    }

    /// Wrap an arbitrary rotation future.
    pub fn from_future(
        model: impl Into<String>,
        future: BoxFuture<'a, Result<RotationStats, RotationError>>,
    ) -> Self {
        Self {
            model: model.into(),
            future,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerOptions {
    pub master_timeout: Duration,
    pub worker_timeout: Duration,
    pub concurrent: bool,
}

impl RunnerOptions {
    pub fn from_settings(settings: &RotationSettings) -> Self {
        Self {
            master_timeout: settings.master_timeout(),
            worker_timeout: settings.worker_timeout(),
            concurrent: settings.concurrent,
        }
    }
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self::from_settings(&RotationSettings::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModelOutcome {
    Completed {
        stats: RotationStats,
    },
    Failed {
        error: String,
        stats: Option<RotationStats>,
    },
    TimedOut {
        after: Duration,
    },
}

impl ModelOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn stats(&self) -> Option<&RotationStats> {
        match self {
            Self::Completed { stats } => Some(stats),
            Self::Failed { stats, .. } => stats.as_ref(),
            Self::TimedOut { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelResult {
    pub model: String,
    pub outcome: ModelOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RotationSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<ModelResult>,
}

impl RotationSummary {
    pub fn is_success(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_completed())
    }

    /// Models that failed or timed out.
    pub fn unsuccessful_models(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.outcome.is_completed())
            .map(|r| r.model.as_str())
            .collect()
    }
}

/// Run every job, sequentially or concurrently, and collect the outcomes in
/// job order.
pub async fn run_rotation_jobs(
    jobs: Vec<RotationJob<'_>>,
    options: RunnerOptions,
    auditor: &SecurityAuditor,
) -> RotationSummary {
    let started_at = Utc::now();
    let started = Instant::now();
    let master_deadline = started + options.master_timeout;

    info!(
        models = jobs.len(),
        concurrent = options.concurrent,
        master_timeout_secs = options.master_timeout.as_secs(),
        worker_timeout_secs = options.worker_timeout.as_secs(),
        "Starting multi-model key rotation"
    );

    let results = if options.concurrent {
        join_all(
            jobs.into_iter()
                .map(|job| run_job(job, options.worker_timeout, master_deadline, auditor)),
        )
        .await
    } else {
        let mut results = Vec::with_capacity(jobs.len());
        for job in jobs {
            results.push(run_job(job, options.worker_timeout, master_deadline, auditor).await);
        }
        results
    };

    RotationSummary {
        started_at,
        finished_at: Utc::now(),
        results,
    }
}

async fn run_job(
    job: RotationJob<'_>,
    worker_timeout: Duration,
    master_deadline: Instant,
    auditor: &SecurityAuditor,
) -> ModelResult {
    let RotationJob { model, future } = job;
    let started = Instant::now();

    if started >= master_deadline {
        log_timeout(auditor, &model, Duration::ZERO, "master deadline passed before start");
        return ModelResult {
            model,
            outcome: ModelOutcome::TimedOut {
                after: Duration::ZERO,
            },
        };
    }

    let deadline = (started + worker_timeout).min(master_deadline);
    let outcome = match timeout_at(deadline, future).await {
        Ok(Ok(stats)) => ModelOutcome::Completed { stats },
        Ok(Err(e)) => {
            warn!(model = %model, error = %e, "Model rotation failed");
            ModelOutcome::Failed {
                error: e.to_string(),
                stats: e.stats().cloned(),
            }
        }
        Err(_) => {
            let after = started.elapsed();
            log_timeout(auditor, &model, after, "worker deadline reached");
            ModelOutcome::TimedOut { after }
        }
    };

    ModelResult { model, outcome }
}

fn log_timeout(auditor: &SecurityAuditor, model: &str, after: Duration, reason: &str) {
    warn!(model, elapsed_ms = after.as_millis() as u64, reason, "Model rotation timed out");
    auditor.log_event(
        AuditEvent::new(EventType::KeyRotation, "rotation_timeout")
            .with_level(EventLevel::Error)
            .with_model_type(model)
            .with_duration(after)
            .with_error(format!("rotation timed out: {}", reason)),
    );
}
