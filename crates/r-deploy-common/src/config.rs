//! ---
//! deploy_section: "01-core-functionality"
//! deploy_subsection: "module"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "Shared primitives and utilities for the deployment engine."
//! deploy_version: "v0.0.0-prealpha"
//! deploy_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_initial_version() -> String {
    "1.0.0".to_owned()
}

fn default_component_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_suite_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_event_buffer() -> usize {
    64
}

fn default_snapshot_directory() -> PathBuf {
    PathBuf::from("target/deploy/snapshots")
}

fn default_journal_path() -> PathBuf {
    PathBuf::from("target/deploy/journal.log")
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

/// Primary configuration object for the deployment engine.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default = "default_initial_version")]
    pub initial_version: String,
    /// Deadline applied to every `describe_state`, `apply` and `restore_state` call.
    #[serde(default = "default_component_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub component_timeout: Duration,
    /// Deadline applied to a single verification suite run.
    #[serde(default = "default_suite_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub suite_timeout: Duration,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where a [`DeployConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedDeployConfig {
    pub config: DeployConfig,
    pub source: PathBuf,
}

impl DeployConfig {
    pub const ENV_CONFIG_PATH: &'static str = "R_DEPLOY_CONFIG";

    /// Load configuration from disk, respecting the `R_DEPLOY_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedDeployConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedDeployConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedDeployConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<DeployConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse the configured starting version.
    pub fn initial_version(&self) -> Result<Version> {
        r_deploy_versioning::parse_version(&self.initial_version)
            .with_context(|| format!("invalid initial_version '{}'", self.initial_version))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.initial_version()?;
        if self.component_timeout.is_zero() {
            return Err(anyhow!("component_timeout must be greater than zero"));
        }
        if self.suite_timeout.is_zero() {
            return Err(anyhow!("suite_timeout must be greater than zero"));
        }
        if self.event_buffer == 0 {
            return Err(anyhow!("event_buffer must hold at least one event"));
        }
        Ok(())
    }
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            initial_version: default_initial_version(),
            component_timeout: default_component_timeout(),
            suite_timeout: default_suite_timeout(),
            event_buffer: default_event_buffer(),
            snapshot: SnapshotConfig::default(),
            journal: JournalConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl std::str::FromStr for DeployConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: DeployConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Encoding used when sealing snapshots into the on-disk archive.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFormat {
    #[default]
    Json,
    Cbor,
}

impl SnapshotFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            SnapshotFormat::Json => "json",
            SnapshotFormat::Cbor => "cbor",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Mirror every captured snapshot into the on-disk archive.
    #[serde(default)]
    pub archive: bool,
    #[serde(default = "default_snapshot_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub format: SnapshotFormat,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            archive: false,
            directory: default_snapshot_directory(),
            format: SnapshotFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_journal_path")]
    pub path: PathBuf,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_journal_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Filter directive used when neither `R_DEPLOY_LOG` nor `RUST_LOG` is set.
    #[serde(default)]
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            filter: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}
