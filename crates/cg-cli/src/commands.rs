use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use zeroize::Zeroizing;

use cg_core::crypto::credentials::{CredentialEncryptor, CredentialType};
use cg_core::crypto::encryption::EncryptionService;
use cg_core::crypto::key_manager::{self, KeyEncoding, KeyManager};
use cg_core::rotation::backup::backup_to_dir;
use cg_core::rotation::runner::{run_rotation_jobs, ModelOutcome, RotationJob, RunnerOptions};
use cg_core::rotation::stats::RotationStats;
use cg_core::security::audit::{AuditEvent, SecurityAuditor};
use cg_core::security::monitor::SecurityMonitor;
use cg_core::{KeyRotator, Settings};
use cg_db::models::{rotatable_tables, AuthProvider, NotificationService, TransferConfig};
use cg_db::Database;

const KEY_CHECK: &str = "credguard-key-check";

/// Stdout carries command output, so the audit trail defaults to stderr
/// unless a log file is configured.
fn open_auditor(settings: &Settings) -> Result<Arc<SecurityAuditor>> {
    let auditor = if settings.audit.log_path.is_some() {
        SecurityAuditor::from_settings(&settings.audit).context("failed to open audit log")?
    } else {
        let auditor = SecurityAuditor::new(io::stderr());
        if !settings.audit.enabled {
            auditor.disable();
        }
        auditor
    };
    Ok(Arc::new(auditor))
}

fn load_key(env_var: &str) -> Result<KeyManager> {
    let manager = KeyManager::with_env_var(env_var);
    manager
        .initialize()
        .with_context(|| format!("failed to load key from ${}", env_var))?;
    Ok(manager)
}

pub fn generate_key(settings: &Settings, encoding: KeyEncoding) -> Result<()> {
    let auditor = open_auditor(settings)?;
    let key = key_manager::generate_key();
    let encoded = key_manager::encode_key(&key, encoding);
    let fingerprint = key_manager::fingerprint(&key);
    auditor.log_key_generation_event(&fingerprint, None);

    let mut out = io::stdout().lock();
    writeln!(out, "{}", encoded.as_str())?;
    writeln!(out)?;
    writeln!(out, "Fingerprint: {}", fingerprint)?;
    writeln!(out, "To rotate existing credentials to this key:")?;
    writeln!(out, "  export {}=<key above>", settings.new_key_env_var)?;
    writeln!(out, "  credguard rotate-encryption-key")?;
    writeln!(out, "then set {} to the new key and restart services.", settings.key_env_var)?;
    Ok(())
}

pub fn verify_key(settings: &Settings) -> Result<()> {
    let auditor = open_auditor(settings)?;
    let manager = match load_key(&settings.key_env_var) {
        Ok(m) => m,
        Err(e) => {
            auditor.log_key_access_event("verify_key", Some(&format!("{:#}", e)));
            return Err(e);
        }
    };
    let fingerprint = manager.fingerprint()?;
    auditor.set_key_version(&fingerprint);

    let service = EncryptionService::from_key_manager(&manager)?;
    let round_trip = service
        .encrypt_string(KEY_CHECK)
        .and_then(|ct| service.decrypt_string(&ct));
    match round_trip {
        Ok(plain) if plain == KEY_CHECK => {}
        Ok(_) => bail!("key check returned the wrong plaintext"),
        Err(e) => {
            auditor.log_key_access_event("verify_key", Some(&e));
            return Err(e.into());
        }
    }
    auditor.log_key_access_event("verify_key", None);

    println!("Key in ${} is valid (fingerprint {})", settings.key_env_var, fingerprint);
    Ok(())
}

pub fn encrypt(settings: &Settings, credential_type: CredentialType) -> Result<()> {
    let auditor = open_auditor(settings)?;
    let manager = load_key(&settings.key_env_var)?;
    auditor.set_key_version(manager.fingerprint()?);
    let encryptor =
        CredentialEncryptor::new(EncryptionService::from_key_manager(&manager)?).with_auditor(auditor);

    let mut input = Zeroizing::new(String::new());
    io::stdin()
        .read_to_string(&mut input)
        .context("failed to read credential from stdin")?;
    let value = input.trim_end_matches(['\r', '\n']);

    let encrypted = encryptor.encrypt(value, credential_type)?;
    println!("{}", encrypted);
    Ok(())
}

fn confirm(models: &[&str]) -> Result<bool> {
    let mut err = io::stderr().lock();
    writeln!(err, "About to re-encrypt every credential in: {}", models.join(", "))?;
    writeln!(err, "Services must be stopped while this runs.")?;
    write!(err, "Type 'yes' to continue: ")?;
    err.flush()?;

    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    Ok(answer.trim() == "yes")
}

fn select_models(requested: &[String]) -> Result<Vec<&'static str>> {
    let known = rotatable_tables();
    if requested.is_empty() {
        return Ok(known);
    }
    let mut selected = Vec::new();
    for name in requested {
        match known.iter().find(|t| **t == name.as_str()) {
            Some(t) if !selected.contains(t) => selected.push(*t),
            Some(_) => {}
            None => bail!("unknown model {:?}; expected one of {}", name, known.join(", ")),
        }
    }
    Ok(selected)
}

pub async fn rotate_encryption_key(
    settings: &Settings,
    database_url: &str,
    models: &[String],
    yes: bool,
) -> Result<()> {
    let rotation = &settings.rotation;
    let selected = select_models(models)?;

    let auditor = open_auditor(settings)?;
    let monitor = Arc::new(SecurityMonitor::from_settings(&settings.monitor));
    monitor.attach(&auditor);

    let old_key = load_key(&settings.key_env_var)?;
    let new_key = load_key(&settings.new_key_env_var)?;
    let old_fp = old_key.fingerprint()?;
    let new_fp = new_key.fingerprint()?;
    if old_fp == new_fp {
        bail!(
            "${} and ${} hold the same key ({})",
            settings.key_env_var,
            settings.new_key_env_var,
            old_fp
        );
    }
    auditor.set_key_version(&new_fp);
    info!(old = %old_fp, new = %new_fp, dry_run = rotation.dry_run, "Starting key rotation");

    if !rotation.dry_run && !yes && !confirm(&selected)? {
        bail!("rotation cancelled");
    }

    let db = Database::connect(database_url).await?;
    db.ping().await?;
    let transfers = db.store::<TransferConfig>()?;
    let notifications = db.store::<NotificationService>()?;
    let providers = db.store::<AuthProvider>()?;

    if rotation.backup_before_rotate && !rotation.dry_run {
        for model in &selected {
            let dir = rotation.backup_dir.as_path();
            let batch = rotation.batch_size;
            let (path, count) = match *model {
                "transfer_configs" => {
                    backup_to_dir::<TransferConfig, _>(&transfers, batch, dir).await
                }
                "notification_services" => {
                    backup_to_dir::<NotificationService, _>(&notifications, batch, dir).await
                }
                _ => backup_to_dir::<AuthProvider, _>(&providers, batch, dir).await,
            }
            .with_context(|| format!("backup of {} failed; nothing was rotated", model))?;
            println!("Backed up {} records of {} to {}", count, model, path.display());
        }
    }

    let rotator = KeyRotator::new(
        EncryptionService::from_key_manager(&old_key)?,
        EncryptionService::from_key_manager(&new_key)?,
        auditor.clone(),
    )
    .with_settings(rotation);

    let jobs = selected
        .iter()
        .map(|model| match *model {
            "transfer_configs" => RotationJob::new::<TransferConfig, _>(&rotator, &transfers),
            "notification_services" => {
                RotationJob::new::<NotificationService, _>(&rotator, &notifications)
            }
            _ => RotationJob::new::<AuthProvider, _>(&rotator, &providers),
        })
        .collect();

    let summary = run_rotation_jobs(jobs, RunnerOptions::from_settings(rotation), &auditor).await;
    db.close().await;

    for result in &summary.results {
        match &result.outcome {
            ModelOutcome::Completed { stats } => print_stats(stats),
            ModelOutcome::Failed { error, stats } => {
                println!("{}: FAILED: {}", result.model, error);
                if let Some(stats) = stats {
                    print_stats(stats);
                }
            }
            ModelOutcome::TimedOut { after } => {
                println!("{}: TIMED OUT after {:?}", result.model, after);
            }
        }
    }
    let alerts = monitor.alerts();
    if !alerts.is_empty() {
        warn!(count = alerts.len(), "Security alerts raised during rotation");
    }
    auditor.flush()?;

    if !summary.is_success() {
        bail!(
            "rotation incomplete for: {}",
            summary.unsuccessful_models().join(", ")
        );
    }
    if rotation.dry_run {
        println!("Dry run complete; no records were written.");
    } else {
        println!(
            "Rotation complete. Set {} to the new key (fingerprint {}) and restart services.",
            settings.key_env_var, new_fp
        );
    }
    Ok(())
}

fn print_stats(stats: &RotationStats) {
    println!("{}", stats);
    for error in &stats.errors {
        println!("  - {}", error);
    }
}

/// Replay a JSON Lines audit log through a fresh monitor and print its report.
pub fn report(
    settings: &Settings,
    audit_log: &Path,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
) -> Result<()> {
    let file = File::open(audit_log)
        .with_context(|| format!("failed to open {}", audit_log.display()))?;
    let monitor = replay(&settings.monitor, BufReader::new(file))?;

    let start = since.unwrap_or(DateTime::<Utc>::MIN_UTC);
    let end = until.unwrap_or_else(Utc::now);
    monitor.generate_report(start, end, &mut io::stdout().lock())?;
    Ok(())
}

fn replay(
    settings: &cg_core::config::MonitorSettings,
    reader: impl BufRead,
) -> Result<SecurityMonitor> {
    let mut monitor_settings = settings.clone();
    monitor_settings.history_limit = usize::MAX;
    let monitor = SecurityMonitor::from_settings(&monitor_settings);
    // Alerts land in the report.
    monitor.set_alert_handler(Arc::new(|_: &cg_core::security::monitor::SecurityAlert| {}));

    let mut skipped = 0usize;
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEvent>(&line) {
            Ok(event) => monitor.process_event(&event),
            Err(e) => {
                skipped += 1;
                warn!(line = n + 1, error = %e, "Skipping malformed audit record");
            }
        }
    }
    if skipped > 0 {
        warn!(skipped, "Some audit records could not be parsed");
    }
    Ok(monitor)
}
