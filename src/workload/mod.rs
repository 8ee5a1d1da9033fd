//! The recording workload: what clients must do, and running them

pub mod runner;
pub mod spec;

pub use runner::{WorkloadError, WorkloadRun, WorkloadRunner};
pub use spec::{
    ArtifactSpec, ExpectedRun, MetricPoint, WorkloadSpec, DEFAULT_EXPERIMENT_ID,
    DEFAULT_EXPERIMENT_NAME,
};
