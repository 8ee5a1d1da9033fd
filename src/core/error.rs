//! Harness error taxonomy

use thiserror::Error;

use crate::verify::VerifyError;
use crate::workload::WorkloadError;

/// Everything that can end a conformance case early
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The harness host cannot support the case (no free port, missing
    /// helper executable, unwritable scratch space). Never retried.
    #[error("environment error: {0}")]
    Environment(String),

    /// The server never answered within the polling window
    #[error("server did not start: {uri} (no response after {attempts} attempts)")]
    ReadinessTimeout { uri: String, attempts: u32 },

    /// The server process exited while the harness waited for it
    #[error("server process for {uri} exited: {status}")]
    BackendCrashed { uri: String, status: String },

    /// The client-under-test did not complete cleanly
    #[error(transparent)]
    Workload(#[from] WorkloadError),

    /// Backend state diverged from the expected run
    #[error(transparent)]
    Verification(#[from] VerifyError),
}

impl HarnessError {
    pub fn environment(msg: impl Into<String>) -> Self {
        HarnessError::Environment(msg.into())
    }
}
