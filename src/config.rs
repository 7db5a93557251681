use crate::expression::{self, Parameters};
use crate::operations::{OperationPipeline, OperationSpec};
use crate::strategy::TimeoutStrategy;
use crate::supervisor::SupervisorOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration loaded from build-timeout.toml.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    pub job: JobConfig,
    pub timeout: TimeoutConfig,
    pub supervisor: SupervisorConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub name: String,
    pub command: String,
    pub parameters: Parameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct TimeoutConfig {
    /// Fail instead of abort. Only consulted when `operations` is empty.
    pub fail_build: bool,
    /// Also describe the execution as timed out. Only consulted when
    /// `operations` is empty.
    pub write_description: bool,
    pub strategy: TimeoutStrategy,
    /// Run in order when the strategy fires.
    pub operations: Vec<OperationSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub poll_interval_ms: u64,
    pub interrupt_grace_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub status_file: PathBuf,
    pub history_file: PathBuf,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to write config {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

// --- Default implementations ---

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            name: "build".to_string(),
            command: String::new(),
            parameters: Parameters::new(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            interrupt_grace_secs: 30,
            minimum_timeout_secs: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            status_file: PathBuf::from(".build-timeout/status.json"),
            history_file: PathBuf::from(".build-timeout/history.json"),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents, path)
    }

    /// Like `load`, but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::Read { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.supervisor.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "supervisor.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            poll_interval: Duration::from_millis(self.supervisor.poll_interval_ms),
            interrupt_grace: Duration::from_secs(self.supervisor.interrupt_grace_secs),
            minimum_timeout: self
                .supervisor
                .minimum_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_else(expression::minimum_timeout),
        }
    }

    pub fn pipeline(&self) -> OperationPipeline {
        if self.timeout.operations.is_empty() {
            OperationPipeline::legacy(self.timeout.fail_build, self.timeout.write_description)
        } else {
            OperationPipeline::from_specs(&self.timeout.operations)
        }
    }
}
