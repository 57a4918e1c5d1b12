//! Runtime settings, loaded from TOML with environment overrides.
//!
//! Every field has a default, so an absent file is not an error. Lookup
//! order for the file is the explicit path, then `CREDGUARD_CONFIG`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::crypto::key_manager::DEFAULT_KEY_ENV_VAR;
use crate::security::audit::DEFAULT_MAX_LOG_SIZE;

pub const CONFIG_ENV_VAR: &str = "CREDGUARD_CONFIG";
pub const DEFAULT_NEW_KEY_ENV_VAR: &str = "GOMFT_NEW_ENCRYPTION_KEY";

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_MAX_ERRORS: usize = 50;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {name}: {value:?}")]
    InvalidOverride { name: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Variable holding the active key.
    pub key_env_var: String,
    /// Variable holding the target key of a rotation.
    pub new_key_env_var: String,
    pub audit: AuditSettings,
    pub rotation: RotationSettings,
    pub monitor: MonitorSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            key_env_var: DEFAULT_KEY_ENV_VAR.to_string(),
            new_key_env_var: DEFAULT_NEW_KEY_ENV_VAR.to_string(),
            audit: AuditSettings::default(),
            rotation: RotationSettings::default(),
            monitor: MonitorSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub enabled: bool,
    /// Primary stream; standard output when unset.
    pub log_path: Option<PathBuf>,
    /// Error/alert stream; standard error when unset.
    pub error_log_path: Option<PathBuf>,
    pub max_file_size: u64,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            log_path: None,
            error_log_path: None,
            max_file_size: DEFAULT_MAX_LOG_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationSettings {
    pub batch_size: usize,
    pub max_errors: usize,
    pub dry_run: bool,
    pub master_timeout_secs: u64,
    pub worker_timeout_secs: u64,
    pub backup_before_rotate: bool,
    pub backup_dir: PathBuf,
    pub concurrent: bool,
}

impl RotationSettings {
    pub fn master_timeout(&self) -> Duration {
        Duration::from_secs(self.master_timeout_secs)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_errors: DEFAULT_MAX_ERRORS,
            dry_run: false,
            master_timeout_secs: 3600,
            worker_timeout_secs: 600,
            backup_before_rotate: true,
            backup_dir: PathBuf::from("./backups"),
            concurrent: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub decryption_failure_threshold: u64,
    pub encryption_failure_threshold: u64,
    pub key_rotation_threshold: u64,
    /// Events retained for reports.
    pub history_limit: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            decryption_failure_threshold: 5,
            encryption_failure_threshold: 5,
            key_rotation_threshold: 10,
            history_limit: 10_000,
        }
    }
}

impl Settings {
    /// Load from `path`, or from `CREDGUARD_CONFIG`, or defaults; then apply
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(CONFIG_ENV_VAR).map(PathBuf::from));

        let mut settings = match path {
            Some(ref p) => Self::from_file(p)?,
            None => {
                debug!("No config file given, using defaults");
                Self::default()
            }
        };

        settings.apply_overrides(|name| env::var(name).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `CREDGUARD_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CREDGUARD_AUDIT_LOG") {
            self.audit.log_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("CREDGUARD_AUDIT_ERROR_LOG") {
            self.audit.error_log_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("CREDGUARD_BATCH_SIZE") {
            self.rotation.batch_size = parse_override("CREDGUARD_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("CREDGUARD_MAX_ERRORS") {
            self.rotation.max_errors = parse_override("CREDGUARD_MAX_ERRORS", &v)?;
        }
        if let Some(v) = lookup("CREDGUARD_DRY_RUN") {
            self.rotation.dry_run = parse_bool("CREDGUARD_DRY_RUN", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rotation.batch_size == 0 {
            return Err(ConfigError::Zero("rotation.batch_size"));
        }
        if self.rotation.max_errors == 0 {
            return Err(ConfigError::Zero("rotation.max_errors"));
        }
        Ok(())
    }
}

fn parse_override(name: &'static str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidOverride {
            name,
            value: value.to_string(),
        })
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidOverride {
            name,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.key_env_var, "GOMFT_ENCRYPTION_KEY");
        assert_eq!(s.rotation.batch_size, 100);
        assert_eq!(s.rotation.max_errors, 50);
        assert!(s.rotation.backup_before_rotate);
        assert_eq!(s.audit.max_file_size, 10 * 1024 * 1024);
        assert_eq!(s.monitor.key_rotation_threshold, 10);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let s = Settings::from_toml(
            r#"
            key_env_var = "MY_KEY"

            [rotation]
            batch_size = 25
            dry_run = true

            [audit]
            log_path = "/var/log/credguard/audit.log"
            "#,
        )
        .unwrap();
        assert_eq!(s.key_env_var, "MY_KEY");
        assert_eq!(s.new_key_env_var, DEFAULT_NEW_KEY_ENV_VAR);
        assert_eq!(s.rotation.batch_size, 25);
        assert!(s.rotation.dry_run);
        assert_eq!(s.rotation.max_errors, 50);
        assert_eq!(
            s.audit.log_path.as_deref(),
            Some(Path::new("/var/log/credguard/audit.log"))
        );
        assert!(s.audit.enabled);
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CREDGUARD_BATCH_SIZE", "10"),
            ("CREDGUARD_MAX_ERRORS", "3"),
            ("CREDGUARD_DRY_RUN", "yes"),
            ("CREDGUARD_AUDIT_LOG", "/tmp/a.log"),
        ]
        .into_iter()
        .collect();

        let mut s = Settings::default();
        s.apply_overrides(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(s.rotation.batch_size, 10);
        assert_eq!(s.rotation.max_errors, 3);
        assert!(s.rotation.dry_run);
        assert_eq!(s.audit.log_path, Some(PathBuf::from("/tmp/a.log")));
        assert_eq!(s.audit.error_log_path, None);
    }

    #[test]
    fn test_invalid_override() {
        let mut s = Settings::default();
        let err = s
            .apply_overrides(|k| (k == "CREDGUARD_BATCH_SIZE").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { name: "CREDGUARD_BATCH_SIZE", .. }));

        let err = s
            .apply_overrides(|k| (k == "CREDGUARD_DRY_RUN").then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { .. }));
    }

    #[test]
    fn test_zero_rejected() {
        let mut s = Settings::default();
        s.rotation.batch_size = 0;
        assert!(matches!(s.validate(), Err(ConfigError::Zero(_))));

        let mut s = Settings::default();
        s.rotation.max_errors = 0;
        assert!(matches!(s.validate(), Err(ConfigError::Zero(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credguard.toml");
        fs::write(&path, "[monitor]\nhistory_limit = 42\n").unwrap();

        let s = Settings::load(Some(&path)).unwrap();
        assert_eq!(s.monitor.history_limit, 42);

        fs::write(&path, "[rotation\nbatch_size = ").unwrap();
        assert!(matches!(Settings::load(Some(&path)), Err(ConfigError::Parse { .. })));

        let missing = dir.path().join("missing.toml");
        assert!(matches!(Settings::load(Some(&missing)), Err(ConfigError::Read { .. })));
    }
}
