//! Tracking target handed to clients through the environment
//!
//! A client-under-test learns where to record its run from exactly one
//! environment variable, [`TRACKING_URI_ENV`]. The value is either a bare
//! absolute filesystem path (file store) or `http://host:port` (server).

use std::fmt;
use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::Serialize;
use thiserror::Error;

/// The single environment variable naming the tracking backend
pub const TRACKING_URI_ENV: &str = "MLFLOW_TRACKING_URI";

/// How a client-under-test reaches the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Client writes directly into a local directory
    FileStore,
    /// Client talks to a tracking server over HTTP
    HttpServer,
}

impl StorageMode {
    /// Both modes, in the order the matrix runs them
    pub const ALL: [StorageMode; 2] = [StorageMode::FileStore, StorageMode::HttpServer];

    /// Short scheme-like label used in reports and CLI flags
    pub fn label(&self) -> &'static str {
        match self {
            StorageMode::FileStore => "file",
            StorageMode::HttpServer => "http",
        }
    }

    /// Parse a CLI label (`file` / `http`)
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "file" => Some(StorageMode::FileStore),
            "http" => Some(StorageMode::HttpServer),
            _ => None,
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Errors from parsing a tracking target value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("tracking target is empty")]
    Empty,
    #[error("file store path must be absolute: {0}")]
    RelativePath(String),
    #[error("unsupported tracking URI scheme '{scheme}' in {value}")]
    UnsupportedScheme { scheme: String, value: String },
    #[error("invalid tracking URI {value}: {reason}")]
    InvalidUri { value: String, reason: String },
}

/// A resolved tracking backend location
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackingTarget {
    /// Root directory of a file store
    File(PathBuf),
    /// Base URI of a tracking server (no trailing slash, no path)
    Http(Url),
}

impl TrackingTarget {
    /// File store rooted at `root`
    pub fn file<P: AsRef<Path>>(root: P) -> Self {
        TrackingTarget::File(root.as_ref().to_path_buf())
    }

    /// Tracking server listening on `host:port`
    pub fn http(host: &str, port: u16) -> Result<Self, TargetError> {
        let value = format!("http://{}:{}", host, port);
        let url = Url::parse(&value).map_err(|e| TargetError::InvalidUri {
            value: value.clone(),
            reason: e.to_string(),
        })?;
        Ok(TrackingTarget::Http(url))
    }

    /// Parse an environment value using the path-or-URI grammar
    pub fn parse(value: &str) -> Result<Self, TargetError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(TargetError::Empty);
        }

        if Path::new(value).is_absolute() {
            return Ok(TrackingTarget::File(PathBuf::from(value)));
        }

        // No scheme separator: a relative path, which clients would resolve
        // against their own working directory.
        if !value.contains(':') {
            return Err(TargetError::RelativePath(value.to_string()));
        }

        let url = Url::parse(value).map_err(|e| TargetError::InvalidUri {
            value: value.to_string(),
            reason: e.to_string(),
        })?;

        match url.scheme() {
            "http" | "https" => Ok(TrackingTarget::Http(url)),
            "file" => url
                .to_file_path()
                .map(TrackingTarget::File)
                .map_err(|_| TargetError::InvalidUri {
                    value: value.to_string(),
                    reason: "file URI does not name a local path".to_string(),
                }),
            other => Err(TargetError::UnsupportedScheme {
                scheme: other.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Storage mode implied by this target
    pub fn mode(&self) -> StorageMode {
        match self {
            TrackingTarget::File(_) => StorageMode::FileStore,
            TrackingTarget::Http(_) => StorageMode::HttpServer,
        }
    }

    /// Value exported as [`TRACKING_URI_ENV`] to a client-under-test
    pub fn env_value(&self) -> String {
        match self {
            TrackingTarget::File(path) => path.display().to_string(),
            TrackingTarget::Http(url) => url.as_str().trim_end_matches('/').to_string(),
        }
    }
}

impl fmt::Display for TrackingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.env_value())
    }
}
