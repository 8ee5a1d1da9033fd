//! Query abstraction over a tracking backend
//!
//! The verifier only reads. Both storage modes answer the same four
//! questions, so the verifier stays mode-agnostic.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while querying a backend
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem error reading a file store
    #[error("I/O error at {path}: {message}")]
    Io { path: String, message: String },
    /// Stored data could not be parsed
    #[error("corrupt store data at {location}: {message}")]
    Corrupt { location: String, message: String },
    /// The server answered with a non-success status
    #[error("{method} {url} failed with status {status}: {body}")]
    Http {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },
    /// The request never produced a response
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    /// The requested entity does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
}

impl StoreError {
    pub(crate) fn io(path: impl fmt::Display, err: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn corrupt(location: impl fmt::Display, message: impl fmt::Display) -> Self {
        StoreError::Corrupt {
            location: location.to_string(),
            message: message.to_string(),
        }
    }
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Scheduled,
    Finished,
    Failed,
    Killed,
}

impl RunStatus {
    /// Numeric code as persisted by the file store
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(RunStatus::Running),
            2 => Some(RunStatus::Scheduled),
            3 => Some(RunStatus::Finished),
            4 => Some(RunStatus::Failed),
            5 => Some(RunStatus::Killed),
            _ => None,
        }
    }

    /// Name as used on the HTTP API
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "RUNNING" => Some(RunStatus::Running),
            "SCHEDULED" => Some(RunStatus::Scheduled),
            "FINISHED" => Some(RunStatus::Finished),
            "FAILED" => Some(RunStatus::Failed),
            "KILLED" => Some(RunStatus::Killed),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Scheduled => "SCHEDULED",
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
            RunStatus::Killed => "KILLED",
        }
    }
}

/// An experiment as seen by the harness
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Experiment {
    pub experiment_id: String,
    pub name: String,
    pub artifact_location: String,
    pub lifecycle_stage: String,
}

/// Run identity and lifecycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunInfo {
    pub run_id: String,
    pub experiment_id: String,
    pub run_name: String,
    pub status: Option<RunStatus>,
    pub lifecycle_stage: String,
    pub artifact_uri: String,
}

/// Recorded values of a run; metrics hold the latest value per key
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunData {
    pub metrics: BTreeMap<String, f64>,
    pub params: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Run {
    pub info: RunInfo,
    pub data: RunData,
}

/// One entry of an artifact listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    /// Path relative to the run's artifact root
    pub path: String,
    pub is_dir: bool,
    pub file_size: Option<u64>,
}

/// Read-only view of a tracking backend
#[async_trait]
pub trait TrackingStore: Send + Sync {
    /// Location this store reads from, for messages
    fn describe(&self) -> String;

    /// Look up an experiment by id
    async fn get_experiment(&self, experiment_id: &str) -> Result<Experiment, StoreError>;

    /// Look up an experiment by name; `None` if there is no such experiment
    async fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>, StoreError>;

    /// All active runs in the given experiments
    async fn search_runs(&self, experiment_ids: &[String]) -> Result<Vec<Run>, StoreError>;

    /// Top-level entries of a run's artifact root, sorted by path
    async fn list_artifacts(&self, run_id: &str) -> Result<Vec<FileInfo>, StoreError>;
}
