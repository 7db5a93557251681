/// Record of past executions, persisted as JSON next to the status file.
///
/// The elastic and likely-stuck strategies derive their timeout from how long
/// earlier successful executions took.
use crate::job::BuildResult;
use crate::status::{self, StatusError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Records kept on disk; older ones are dropped.
const MAX_RECORDS: usize = 50;

/// Successful executions averaged for a duration estimate.
const ESTIMATE_SAMPLE: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub result: BuildResult,
    pub timed_out: bool,
}

impl ExecutionRecord {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("failed to read history file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse history file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Write(#[from] StatusError),
}

/// Oldest record first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildHistory {
    records: Vec<ExecutionRecord>,
}

impl BuildHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `path`; a missing file is an empty history.
    pub fn load(path: &Path) -> Result<Self, HistoryError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(HistoryError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&contents).map_err(|source| HistoryError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), HistoryError> {
        status::write_json_atomic(path, self)?;
        Ok(())
    }

    pub fn push(&mut self, record: ExecutionRecord) {
        self.records.push(record);
        if self.records.len() > MAX_RECORDS {
            let excess = self.records.len() - MAX_RECORDS;
            self.records.drain(..excess);
        }
    }

    pub fn records(&self) -> &[ExecutionRecord] {
        &self.records
    }

    /// Durations of the most recent successful executions that did not time
    /// out, newest first, at most `limit`.
    pub fn successful_durations(&self, limit: usize) -> Vec<Duration> {
        self.records
            .iter()
            .rev()
            .filter(|r| r.result == BuildResult::Success && !r.timed_out)
            .take(limit)
            .map(ExecutionRecord::duration)
            .collect()
    }

    /// Average duration of the last few successful executions.
    pub fn estimated_duration(&self) -> Option<Duration> {
        average(&self.successful_durations(ESTIMATE_SAMPLE))
    }
}

pub fn average(durations: &[Duration]) -> Option<Duration> {
    if durations.is_empty() {
        return None;
    }
    let total: Duration = durations.iter().sum();
    Some(total / durations.len() as u32)
}
