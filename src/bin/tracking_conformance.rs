//! Conformance suite entry point
//!
//! Runs every registered client-under-test against every storage mode and
//! prints one line per combination. Exit status: 0 when every combination
//! passes, 1 when any fails, 2 when the harness itself could not run.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tracking_conformance::core::{HarnessConfig, RetryPolicy, ServerCommand, StorageMode};
use tracking_conformance::suite::{
    default_registry, ClientUnderTest, ConformanceSuite, DEFAULT_CLIENTS_DIR,
};

const EXIT_HARNESS_ERROR: u8 = 2;

#[derive(Parser, Debug)]
#[command(version, about = "Cross-implementation conformance suite for tracking clients")]
struct Cli {
    /// Directory holding the default `go` and `py` client binaries
    #[arg(long, default_value = DEFAULT_CLIENTS_DIR)]
    clients_dir: PathBuf,

    /// Client under test; replaces the default registry when given
    #[arg(long = "client", value_name = "NAME=PATH", value_parser = ClientUnderTest::parse)]
    clients: Vec<ClientUnderTest>,

    /// Storage mode to run (file, http); both when omitted
    #[arg(long = "mode", value_name = "MODE", value_parser = parse_mode)]
    modes: Vec<StorageMode>,

    /// Tracking server executable
    #[arg(long)]
    server_program: Option<PathBuf>,

    /// Directory with a bundled copy of the server's HTTP helper
    #[arg(long)]
    helper_dir: Option<PathBuf>,

    /// Combinations to run concurrently
    #[arg(long, default_value_t = 1)]
    parallel: usize,

    /// Kill a client after this many seconds (0 waits forever)
    #[arg(long, default_value_t = 300)]
    workload_timeout_secs: u64,

    #[arg(long, default_value_t = 10)]
    readiness_attempts: u32,

    #[arg(long, default_value_t = 500)]
    readiness_interval_ms: u64,

    /// Extra environment variable forwarded to clients
    #[arg(long = "pass-env", value_name = "NAME")]
    pass_env: Vec<String>,

    /// Keep per-combination scratch directories
    #[arg(long)]
    keep_scratch: bool,

    /// Write a JSON report to this path
    #[arg(long)]
    json: Option<PathBuf>,
}

fn parse_mode(value: &str) -> Result<StorageMode, String> {
    StorageMode::from_label(value)
        .ok_or_else(|| format!("unknown mode {:?} (expected file or http)", value))
}

impl Cli {
    fn config(&self) -> HarnessConfig {
        let mut server = ServerCommand::default();
        if let Some(program) = &self.server_program {
            server.program = program.clone();
        }
        if let (Some(dir), Some(helper)) = (&self.helper_dir, server.helper.as_mut()) {
            helper.bundled_dir = Some(dir.clone());
        }

        let modes = if self.modes.is_empty() {
            StorageMode::ALL.to_vec()
        } else {
            self.modes.clone()
        };
        let workload_timeout =
            (self.workload_timeout_secs > 0).then(|| Duration::from_secs(self.workload_timeout_secs));

        HarnessConfig::default()
            .with_server(server)
            .with_modes(modes)
            .with_parallelism(self.parallel)
            .with_workload_timeout(workload_timeout)
            .with_readiness(RetryPolicy::new(
                self.readiness_attempts,
                Duration::from_millis(self.readiness_interval_ms),
            ))
            .with_passthrough_env(self.pass_env.clone())
            .with_keep_scratch(self.keep_scratch)
    }

    fn clients(&self) -> Vec<ClientUnderTest> {
        if self.clients.is_empty() {
            default_registry(&self.clients_dir)
        } else {
            self.clients.clone()
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::from(EXIT_HARNESS_ERROR)
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let suite = ConformanceSuite::new(cli.config(), cli.clients());

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let report = runtime.block_on(suite.run());

    print!("{}", report.render_text());
    if let Some(path) = &cli.json {
        report
            .write_json(path)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
    }

    Ok(if report.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
