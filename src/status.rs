/// Status file: JSON snapshot of the current or last execution.
///
/// Uses atomic write pattern: write to temp file then rename.
use crate::supervisor::ExecutionReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Running,
    Restarting,
    Finished,
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    pub pid: u32,
    pub state: SupervisorState,
    pub job: String,
    pub attempt: u32,
    pub strategy: String,
    pub last_update: DateTime<Utc>,
    pub report: Option<ExecutionReport>,
}

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("failed to serialize status: {source}")]
    Serialize { source: serde_json::Error },
    #[error("failed to write temp status file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to rename {} -> {}: {source}", from.display(), to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read status file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse status file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Serialize `value` to `path` so readers never see a partial write.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StatusError> {
    let json =
        serde_json::to_string_pretty(value).map_err(|e| StatusError::Serialize { source: e })?;

    let dir = path.parent().unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "status".to_string());
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
        path: tmp_path.clone(),
        source: e,
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| StatusError::Rename {
        from: tmp_path,
        to: path.to_path_buf(),
        source: e,
    })?;

    Ok(())
}

pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        write_json_atomic(&self.path, data)
    }

    pub fn read(&self) -> Result<StatusData, StatusError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|source| StatusError::Read {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| StatusError::Parse {
            path: self.path.clone(),
            source,
        })
    }
}

/// Builds `StatusData` for each state transition of the CLI loop.
pub struct StatusTracker {
    file: StatusFile,
    pid: u32,
    job: String,
    strategy: String,
    attempt: u32,
}

impl StatusTracker {
    pub fn new(status_path: PathBuf, job: impl Into<String>, strategy: impl Into<String>) -> Self {
        Self {
            file: StatusFile::new(status_path),
            pid: std::process::id(),
            job: job.into(),
            strategy: strategy.into(),
            attempt: 0,
        }
    }

    pub fn set_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
    }

    /// Write the status file. Failures are logged, never fatal.
    pub fn update(&self, state: SupervisorState, report: Option<&ExecutionReport>) {
        let data = StatusData {
            pid: self.pid,
            state,
            job: self.job.clone(),
            attempt: self.attempt,
            strategy: self.strategy.clone(),
            last_update: Utc::now(),
            report: report.cloned(),
        };

        if let Err(e) = self.file.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }
}
