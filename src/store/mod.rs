//! Read-side access to tracking backends
//!
//! - `FileStore`: reads the on-disk file-store layout directly
//! - `RestStore`: queries a tracking server's HTTP API

pub mod file;
pub mod rest;
pub mod traits;

use std::time::Duration;

pub use file::FileStore;
pub use rest::RestStore;
pub use traits::{Experiment, FileInfo, Run, RunData, RunInfo, RunStatus, StoreError, TrackingStore};

use crate::core::TrackingTarget;

/// Open the query interface matching a tracking target
pub fn open_store(
    target: &TrackingTarget,
    timeout: Duration,
) -> Result<Box<dyn TrackingStore>, StoreError> {
    match target {
        TrackingTarget::File(root) => Ok(Box::new(FileStore::new(root))),
        TrackingTarget::Http(url) => Ok(Box::new(RestStore::new(url.as_str(), timeout)?)),
    }
}

/// Lenient field decoding shared by the YAML and JSON readers: ids and
/// int64 fields show up either as numbers or as strings depending on the
/// writer.
pub(crate) mod lenient {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Int(i64),
        Float(f64),
        Str(String),
    }

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(match Scalar::deserialize(d)? {
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Str(s) => s,
        })
    }

    pub fn opt_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        Ok(match Option::<Scalar>::deserialize(d)? {
            None => None,
            Some(Scalar::Int(i)) => Some(i),
            Some(Scalar::Float(f)) => Some(f as i64),
            Some(Scalar::Str(s)) => s.parse().ok(),
        })
    }

    pub fn f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        match Scalar::deserialize(d)? {
            Scalar::Int(i) => Ok(i as f64),
            Scalar::Float(f) => Ok(f),
            Scalar::Str(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}
