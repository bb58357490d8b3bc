//! Broker configuration parsing and validation.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::packages::PackageEntry;
use crate::{AppError, Result};

/// Worker-process launch settings used by the child-process supervisor.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkerConfig {
    /// Worker binary executed once per caller.
    pub command: String,
    /// Arguments passed to the worker binary.
    #[serde(default)]
    pub args: Vec<String>,
    /// Time allowed for the worker's ready line.
    #[serde(default = "default_startup_timeout_seconds")]
    pub startup_timeout_seconds: u64,
    /// Suffix appended to the caller package to name its worker process.
    #[serde(default = "default_process_name_suffix")]
    pub process_name_suffix: String,
}

impl WorkerConfig {
    /// Startup timeout as a [`Duration`].
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_seconds)
    }
}

/// Storage settings for per-caller sdk data directories.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StorageConfig {
    /// Root under which `ce/` and `de/` trees are created.
    pub root: PathBuf,
}

fn default_startup_timeout_seconds() -> u64 {
    10
}

fn default_process_name_suffix() -> String {
    "_sdk_sandbox".into()
}

fn default_true() -> bool {
    true
}

/// Broker configuration parsed from `broker.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BrokerConfig {
    /// Whether a bound worker is restarted by the platform after it dies.
    #[serde(default)]
    pub auto_restart_on_death: bool,
    /// Kill a caller whose worker died while it had sdks loaded and no
    /// death observer registered.
    #[serde(default = "default_true")]
    pub kill_caller_on_sandbox_death: bool,
    /// Initial kill-switch state.
    #[serde(default)]
    pub sandbox_disabled: bool,
    /// Storage directory settings.
    pub storage: StorageConfig,
    /// Worker launch settings.
    pub worker: WorkerConfig,
    /// Optional static package table.
    #[serde(default)]
    pub packages: Vec<PackageEntry>,
}

impl BrokerConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Restart policy handed to every connection broker.
    #[must_use]
    pub fn restart_policy(&self) -> crate::sandbox::broker::RestartPolicy {
        if self.auto_restart_on_death {
            crate::sandbox::broker::RestartPolicy::RestartWhileBound
        } else {
            crate::sandbox::broker::RestartPolicy::Never
        }
    }

    fn validate(&self) -> Result<()> {
        if self.worker.command.trim().is_empty() {
            return Err(AppError::Config("worker.command must not be empty".into()));
        }

        if self.worker.startup_timeout_seconds == 0 {
            return Err(AppError::Config(
                "worker.startup_timeout_seconds must be greater than zero".into(),
            ));
        }

        let mut seen = HashSet::new();
        for entry in &self.packages {
            if !seen.insert((entry.uid, entry.package_name.as_str())) {
                return Err(AppError::Config(format!(
                    "duplicate package entry {} for uid {}",
                    entry.package_name, entry.uid
                )));
            }
        }

        Ok(())
    }
}
