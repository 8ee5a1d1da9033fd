//! Post-workload assertions against a tracking backend
//!
//! `BackendVerifier` looks up the expected experiment, requires exactly one
//! run in it and then compares every recorded field with the expected run.
//! All divergent fields are collected before failing, so one report shows
//! the complete picture.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::store::{Run, StoreError, TrackingStore};
use crate::workload::ExpectedRun;

/// One field whose observed value differs from the expected one
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    /// Dotted field name, e.g. `metrics.metric0`
    pub field: String,
    pub expected: String,
    /// `None` when the field is absent
    pub observed: Option<String>,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.observed {
            Some(observed) => write!(
                f,
                "{}: expected {}, observed {}",
                self.field, self.expected, observed
            ),
            None => write!(f, "{}: expected {}, observed nothing", self.field, self.expected),
        }
    }
}

/// Verification failures
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("failed to query backend: {0}")]
    Store(#[from] StoreError),

    #[error("experiment {name:?} does not exist")]
    ExperimentMissing { name: String },

    #[error("expected {expected} run(s) in experiment {experiment_id}, found {observed}")]
    RunCount {
        experiment_id: String,
        expected: usize,
        observed: usize,
    },

    #[error("{} field(s) differ: {}", .0.len(), render_mismatches(.0))]
    Mismatches(Vec<Mismatch>),
}

impl VerifyError {
    /// Field-level mismatches, if that is what this error is
    pub fn mismatches(&self) -> &[Mismatch] {
        match self {
            VerifyError::Mismatches(list) => list,
            _ => &[],
        }
    }
}

fn render_mismatches(list: &[Mismatch]) -> String {
    list.iter()
        .map(Mismatch::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// The run that passed verification
#[derive(Debug, Clone)]
pub struct VerifiedRun {
    pub experiment_id: String,
    pub run: Run,
    pub artifact_paths: Vec<String>,
}

/// Checks a backend against an [`ExpectedRun`]
pub struct BackendVerifier<'a> {
    store: &'a dyn TrackingStore,
    expected: &'a ExpectedRun,
}

impl<'a> BackendVerifier<'a> {
    pub fn new(store: &'a dyn TrackingStore, expected: &'a ExpectedRun) -> Self {
        BackendVerifier { store, expected }
    }

    pub async fn verify(&self) -> Result<VerifiedRun, VerifyError> {
        let name = &self.expected.experiment_name;
        let experiment = self
            .store
            .get_experiment_by_name(name)
            .await?
            .ok_or_else(|| VerifyError::ExperimentMissing { name: name.clone() })?;
        debug!(
            backend = %self.store.describe(),
            experiment_id = %experiment.experiment_id,
            "found experiment"
        );

        let mut runs = self
            .store
            .search_runs(std::slice::from_ref(&experiment.experiment_id))
            .await?;
        if runs.len() != 1 {
            return Err(VerifyError::RunCount {
                experiment_id: experiment.experiment_id,
                expected: 1,
                observed: runs.len(),
            });
        }
        let run = runs.remove(0);

        let artifacts = self.store.list_artifacts(&run.info.run_id).await?;
        let artifact_paths: Vec<String> = artifacts.into_iter().map(|f| f.path).collect();

        let mismatches = self.compare(&run, &artifact_paths);
        if !mismatches.is_empty() {
            return Err(VerifyError::Mismatches(mismatches));
        }

        info!(
            backend = %self.store.describe(),
            run_id = %run.info.run_id,
            "backend state matches the expected run"
        );
        Ok(VerifiedRun {
            experiment_id: experiment.experiment_id,
            run,
            artifact_paths,
        })
    }

    /// Every field of `run` that differs from the expected run
    pub fn compare(&self, run: &Run, artifact_paths: &[String]) -> Vec<Mismatch> {
        let mut mismatches = Vec::new();

        for (key, expected) in &self.expected.metrics {
            let observed = run.data.metrics.get(key);
            // Exact comparison: the workload is deterministic
            if observed != Some(expected) {
                mismatches.push(Mismatch {
                    field: format!("metrics.{}", key),
                    expected: format_value(*expected),
                    observed: observed.map(|v| format_value(*v)),
                });
            }
        }

        compare_strings("tags", &self.expected.tags, &run.data.tags, &mut mismatches);
        compare_strings(
            "params",
            &self.expected.params,
            &run.data.params,
            &mut mismatches,
        );

        if artifact_paths != self.expected.artifact_paths.as_slice() {
            mismatches.push(Mismatch {
                field: "artifacts".to_string(),
                expected: format!("{:?}", self.expected.artifact_paths),
                observed: Some(format!("{:?}", artifact_paths)),
            });
        }

        mismatches
    }
}

fn compare_strings(
    section: &str,
    expected: &BTreeMap<String, String>,
    observed: &BTreeMap<String, String>,
    mismatches: &mut Vec<Mismatch>,
) {
    for (key, value) in expected {
        let found = observed.get(key);
        if found != Some(value) {
            mismatches.push(Mismatch {
                field: format!("{}.{}", section, key),
                expected: format!("{:?}", value),
                observed: found.map(|v| format!("{:?}", v)),
            });
        }
    }
}

fn format_value(v: f64) -> String {
    format!("{:?}", v)
}
