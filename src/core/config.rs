//! Harness configuration parameters

use std::path::PathBuf;
use std::time::Duration;

use crate::core::target::StorageMode;

/// Environment variable pointing at a directory with a bundled copy of the
/// server's HTTP helper
pub const HELPER_DIR_ENV: &str = "TRACKING_CONFORMANCE_HELPER_DIR";

/// Bounded retry schedule used for readiness polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of probe attempts (default: 10)
    pub attempts: u32,
    /// Pause between consecutive attempts (default: 500ms)
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }
}

/// A helper executable the server process needs on its `PATH`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperRequirement {
    /// Executable file name (e.g. `gunicorn`)
    pub name: String,
    /// Directory holding a bundled copy, used when `name` is not on `PATH`
    pub bundled_dir: Option<PathBuf>,
}

/// How to launch the tracking server
///
/// Arguments may contain the placeholders `{root}`, `{host}` and `{port}`,
/// substituted per launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub helper: Option<HelperRequirement>,
}

impl Default for ServerCommand {
    fn default() -> Self {
        Self {
            program: PathBuf::from("mlflow"),
            args: [
                "server",
                "--backend-store-uri",
                "{root}",
                "--no-serve-artifacts",
                "--host",
                "{host}",
                "--port",
                "{port}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            helper: Some(HelperRequirement {
                name: "gunicorn".to_string(),
                bundled_dir: std::env::var_os(HELPER_DIR_ENV).map(PathBuf::from),
            }),
        }
    }
}

impl ServerCommand {
    /// Command with no helper requirement
    pub fn new<P: Into<PathBuf>>(program: P, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            helper: None,
        }
    }

    pub fn with_helper(mut self, helper: HelperRequirement) -> Self {
        self.helper = Some(helper);
        self
    }

    /// Substitute placeholders for one launch
    pub fn render_args(&self, root: &str, host: &str, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{root}", root)
                    .replace("{host}", host)
                    .replace("{port}", &port)
            })
            .collect()
    }
}

/// Configuration for a conformance run
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Readiness polling for server mode (default: 10 x 500ms)
    pub readiness: RetryPolicy,
    /// Per-request timeout for readiness probes and backend queries (default: 5s)
    pub probe_timeout: Duration,
    /// Upper bound on one client run; `None` waits forever (default: 300s)
    pub workload_timeout: Option<Duration>,
    /// Tracking server launch command
    pub server: ServerCommand,
    /// Host the server binds to (default: 127.0.0.1)
    pub host: String,
    /// Storage modes in the matrix (default: file, http)
    pub modes: Vec<StorageMode>,
    /// Combinations run at once (default: 1)
    pub parallelism: usize,
    /// Parent environment variables forwarded to clients in addition to the target
    pub passthrough_env: Vec<String>,
    /// Leave per-case scratch directories on disk
    pub keep_scratch: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            readiness: RetryPolicy::default(),
            probe_timeout: Duration::from_secs(5),
            workload_timeout: Some(Duration::from_secs(300)),
            server: ServerCommand::default(),
            host: "127.0.0.1".to_string(),
            modes: StorageMode::ALL.to_vec(),
            parallelism: 1,
            passthrough_env: Vec::new(),
            keep_scratch: false,
        }
    }
}

impl HarnessConfig {
    pub fn with_readiness(mut self, readiness: RetryPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_workload_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.workload_timeout = timeout;
        self
    }

    pub fn with_server(mut self, server: ServerCommand) -> Self {
        self.server = server;
        self
    }

    pub fn with_modes(mut self, modes: Vec<StorageMode>) -> Self {
        self.modes = modes;
        self
    }

    /// Values below 1 are treated as 1
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_passthrough_env(mut self, names: Vec<String>) -> Self {
        self.passthrough_env = names;
        self
    }

    pub fn with_keep_scratch(mut self, keep: bool) -> Self {
        self.keep_scratch = keep;
        self
    }
}
