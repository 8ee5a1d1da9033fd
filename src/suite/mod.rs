//! The conformance matrix driver
//!
//! For every client-under-test and every storage mode: create a fresh root
//! that does not exist yet, provision a backend for it, run the client,
//! verify what landed in the backend and tear everything down. Each
//! combination reports on its own; one failure never stops the others.

pub mod report;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::backend::{BackendHandle, BackendProvisioner};
use crate::core::{HarnessConfig, HarnessError, StorageMode};
use crate::store::open_store;
use crate::verify::{BackendVerifier, VerifyError};
use crate::workload::{WorkloadRunner, WorkloadSpec};

pub use report::{CaseReport, Outcome, Stage, Summary, SuiteReport, REPORT_SCHEMA_VERSION};

/// Client implementations exercised when none are named explicitly
pub const DEFAULT_CLIENTS: [&str; 2] = ["go", "py"];

/// Directory searched for the default clients
pub const DEFAULT_CLIENTS_DIR: &str = "conformance";

/// One client implementation under test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientUnderTest {
    /// Short implementation name used in reports (e.g. `go`)
    pub name: String,
    pub binary: PathBuf,
}

impl ClientUnderTest {
    pub fn new(name: impl Into<String>, binary: impl Into<PathBuf>) -> Self {
        ClientUnderTest {
            name: name.into(),
            binary: binary.into(),
        }
    }

    /// Parse `NAME=PATH`
    pub fn parse(spec: &str) -> Result<Self, String> {
        match spec.split_once('=') {
            Some((name, path)) if !name.is_empty() && !path.is_empty() => {
                Ok(ClientUnderTest::new(name, path))
            }
            _ => Err(format!("expected NAME=PATH, got {:?}", spec)),
        }
    }
}

/// The fixed registry: one binary per implementation, named after it
pub fn default_registry(clients_dir: &Path) -> Vec<ClientUnderTest> {
    DEFAULT_CLIENTS
        .iter()
        .map(|name| ClientUnderTest::new(*name, clients_dir.join(name)))
        .collect()
}

/// One (client, mode) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Combination {
    pub client: ClientUnderTest,
    pub mode: StorageMode,
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client.name, self.mode.label())
    }
}

type CaseResult = Result<(), (Stage, HarnessError)>;

pub struct ConformanceSuite {
    config: HarnessConfig,
    clients: Vec<ClientUnderTest>,
    workload: WorkloadSpec,
}

impl ConformanceSuite {
    pub fn new(config: HarnessConfig, clients: Vec<ClientUnderTest>) -> Self {
        ConformanceSuite {
            config,
            clients,
            workload: WorkloadSpec::canonical(),
        }
    }

    /// Replace the workload the clients are expected to have performed
    pub fn with_workload(mut self, workload: WorkloadSpec) -> Self {
        self.workload = workload;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// The matrix, client-major
    pub fn combinations(&self) -> Vec<Combination> {
        self.clients
            .iter()
            .flat_map(|client| {
                self.config.modes.iter().map(move |mode| Combination {
                    client: client.clone(),
                    mode: *mode,
                })
            })
            .collect()
    }

    /// Run every combination and collect the outcomes in matrix order
    pub async fn run(&self) -> SuiteReport {
        let combinations = self.combinations();
        info!(
            combinations = combinations.len(),
            parallelism = self.config.parallelism,
            "running conformance matrix"
        );

        let mut results: Vec<(usize, CaseReport)> =
            stream::iter(combinations.into_iter().enumerate())
                .map(|(index, combination)| async move {
                    (index, self.run_case(&combination).await)
                })
                .buffer_unordered(self.config.parallelism.max(1))
                .collect()
                .await;
        results.sort_by_key(|(index, _)| *index);

        let report = SuiteReport {
            cases: results.into_iter().map(|(_, case)| case).collect(),
        };
        let summary = report.summary();
        info!(
            total = summary.total,
            passed = summary.passed,
            failed = summary.failed,
            "conformance matrix finished"
        );
        report
    }

    /// Run a single combination in its own scratch space
    pub async fn run_case(&self, combination: &Combination) -> CaseReport {
        let start = Instant::now();
        let client = &combination.client.name;
        let mode = combination.mode;

        let scratch = match tempfile::Builder::new()
            .prefix(&format!("tracking-conformance-{}-{}-", client, mode.label()))
            .tempdir()
        {
            Ok(dir) => dir,
            Err(e) => {
                let error = HarnessError::environment(format!(
                    "failed to create scratch directory: {}",
                    e
                ));
                warn!(case = %combination, error = %error, "case failed");
                return CaseReport::failed(client, mode, Stage::Setup, &error, elapsed_ms(start));
            }
        };
        // The backend must bootstrap its root from nothing
        let root = scratch.path().join("mlruns");

        let result = self.execute(combination, &root).await;
        let duration_ms = elapsed_ms(start);

        let mut report = match result {
            Ok(()) => {
                info!(case = %combination, duration_ms, "case passed");
                CaseReport::passed(client, mode, duration_ms)
            }
            Err((stage, error)) => {
                warn!(case = %combination, stage = stage.label(), error = %error, "case failed");
                CaseReport::failed(client, mode, stage, &error, duration_ms)
            }
        };

        if self.config.keep_scratch {
            let kept = scratch.keep();
            report.scratch_dir = Some(kept.display().to_string());
        } else if let Err(e) = scratch.close() {
            warn!(case = %combination, error = %e, "failed to remove scratch directory");
        }
        report
    }

    async fn execute(&self, combination: &Combination, root: &Path) -> CaseResult {
        let provisioner =
            BackendProvisioner::new(&self.config).map_err(|e| (Stage::Provision, e))?;
        let mut handle = provisioner
            .provision(combination.mode, root)
            .await
            .map_err(|e| (Stage::Provision, e))?;

        let result = self.exercise(combination, &mut handle).await;
        handle.shutdown().await;
        result
    }

    async fn exercise(&self, combination: &Combination, handle: &mut BackendHandle) -> CaseResult {
        let runner = WorkloadRunner::new(self.config.workload_timeout)
            .with_passthrough_env(self.config.passthrough_env.clone());
        runner
            .run(&combination.client.binary, handle.target())
            .await
            .map_err(|e| (Stage::Workload, HarnessError::from(e)))?;

        if !handle.is_alive() {
            return Err((
                Stage::Workload,
                HarnessError::BackendCrashed {
                    uri: handle.target().env_value(),
                    status: "exited while the client was running".to_string(),
                },
            ));
        }

        let store = open_store(handle.target(), self.config.probe_timeout)
            .map_err(|e| (Stage::Verify, HarnessError::from(VerifyError::from(e))))?;
        let expected = self.workload.expected_run();
        BackendVerifier::new(store.as_ref(), &expected)
            .verify()
            .await
            .map_err(|e| (Stage::Verify, HarnessError::from(e)))?;
        Ok(())
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry() {
        let clients = default_registry(Path::new("conformance"));
        assert_eq!(
            clients,
            vec![
                ClientUnderTest::new("go", "conformance/go"),
                ClientUnderTest::new("py", "conformance/py"),
            ]
        );
    }

    #[test]
    fn test_parse_client() {
        let client = ClientUnderTest::parse("rust=/opt/bin/client").unwrap();
        assert_eq!(client, ClientUnderTest::new("rust", "/opt/bin/client"));
        assert!(ClientUnderTest::parse("rust").is_err());
        assert!(ClientUnderTest::parse("=/x").is_err());
    }

    #[test]
    fn test_combinations_are_client_major() {
        let suite = ConformanceSuite::new(
            HarnessConfig::default(),
            default_registry(Path::new("bin")),
        );
        let names: Vec<String> = suite.combinations().iter().map(|c| c.to_string()).collect();
        assert_eq!(names, vec!["go/file", "go/http", "py/file", "py/http"]);

        let file_only = ConformanceSuite::new(
            HarnessConfig::default().with_modes(vec![StorageMode::FileStore]),
            default_registry(Path::new("bin")),
        );
        assert_eq!(file_only.combinations().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_client_fails_at_workload_stage() {
        let config = HarnessConfig::default().with_modes(vec![StorageMode::FileStore]);
        let suite = ConformanceSuite::new(
            config,
            vec![ClientUnderTest::new("ghost", "/nonexistent/ghost-client")],
        );
        let report = suite.run().await;
        assert_eq!(report.cases.len(), 1);
        assert_eq!(report.cases[0].stage, Stage::Workload);
        assert_eq!(report.cases[0].outcome, Outcome::Failed);
        assert!(!report.all_passed());
    }
}
