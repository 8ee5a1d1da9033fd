//! Types shared across the harness: targets, configuration, errors

pub mod config;
pub mod error;
pub mod target;

pub use config::{HarnessConfig, HelperRequirement, RetryPolicy, ServerCommand};
pub use error::HarnessError;
pub use target::{StorageMode, TargetError, TrackingTarget, TRACKING_URI_ENV};
