//! Client-under-test execution
//!
//! Runs one client binary with a minimal environment that names the tracking
//! target, waits for it to exit and treats anything but exit status 0 as a
//! conformance failure. There are no retries: clients are deterministic.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{info, warn};

#[cfg(unix)]
use crate::backend::server::signal_process_group;
use crate::core::{TrackingTarget, TRACKING_URI_ENV};

/// Bytes of stderr kept in failure reports
const STDERR_TAIL: usize = 4096;

/// How long to keep reading stderr once the client has exited
const STDERR_GRACE: Duration = Duration::from_millis(500);

/// Errors from running a client-under-test
#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("failed to launch {}: {source}", .binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} exited with {status}{}", .binary.display(), stderr_suffix(.stderr))]
    Exited {
        binary: PathBuf,
        /// Exit code; `None` when killed by a signal
        code: Option<i32>,
        status: String,
        stderr: String,
    },

    #[error("{} did not finish within {after:?} and was killed", .binary.display())]
    TimedOut { binary: PathBuf, after: Duration },
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!("; stderr:\n{}", stderr.trim_end())
    }
}

/// A client run that exited cleanly
#[derive(Debug, Clone)]
pub struct WorkloadRun {
    pub duration: Duration,
    /// Tail of the client's stderr
    pub stderr: String,
}

/// Launches client-under-test binaries
#[derive(Debug, Clone, Default)]
pub struct WorkloadRunner {
    timeout: Option<Duration>,
    passthrough_env: Vec<String>,
}

impl WorkloadRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        WorkloadRunner {
            timeout,
            passthrough_env: Vec::new(),
        }
    }

    /// Forward these parent environment variables as well, when set
    pub fn with_passthrough_env(mut self, names: Vec<String>) -> Self {
        self.passthrough_env = names;
        self
    }

    /// The complete environment a client sees
    pub fn client_env(&self, target: &TrackingTarget) -> Vec<(String, String)> {
        let mut vars: Vec<(String, String)> = self
            .passthrough_env
            .iter()
            .filter(|name| name.as_str() != TRACKING_URI_ENV)
            .filter_map(|name| env::var(name).ok().map(|value| (name.clone(), value)))
            .collect();
        vars.push((TRACKING_URI_ENV.to_string(), target.env_value()));
        vars
    }

    /// Run `binary` against `target` and wait for a clean exit
    pub async fn run(
        &self,
        binary: &Path,
        target: &TrackingTarget,
    ) -> Result<WorkloadRun, WorkloadError> {
        let mut command = Command::new(binary);
        command
            .env_clear()
            .envs(self.client_env(target))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Everything the client forks shares its group and is killed with it
        #[cfg(unix)]
        command.process_group(0);

        info!(binary = %binary.display(), target = %target, "running client");
        let start = Instant::now();

        let mut child = command.spawn().map_err(|source| WorkloadError::Spawn {
            binary: binary.to_path_buf(),
            source,
        })?;
        let pid = child.id();
        let stderr_reader = child.stderr.take().map(|pipe| tokio::spawn(read_tail(pipe)));

        let waited = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait()).await.ok(),
            None => Some(child.wait().await),
        };

        // Background processes left by the client must not outlive the case
        #[cfg(unix)]
        if let Some(pid) = pid {
            signal_process_group(pid, "KILL");
        }
        #[cfg(not(unix))]
        let _ = pid;

        let status = match waited {
            Some(status) => status.map_err(|source| WorkloadError::Spawn {
                binary: binary.to_path_buf(),
                source,
            })?,
            None => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                let limit = self.timeout.unwrap_or_default();
                warn!(binary = %binary.display(), ?limit, "client timed out");
                return Err(WorkloadError::TimedOut {
                    binary: binary.to_path_buf(),
                    after: limit,
                });
            }
        };

        let duration = start.elapsed();
        let stderr = match stderr_reader {
            // A process that left the group may still hold the pipe open
            Some(reader) => match tokio::time::timeout(STDERR_GRACE, reader).await {
                Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                _ => String::new(),
            },
            None => String::new(),
        };

        if !status.success() {
            warn!(binary = %binary.display(), %status, "client failed");
            return Err(WorkloadError::Exited {
                binary: binary.to_path_buf(),
                code: status.code(),
                status: status.to_string(),
                stderr: tail(&stderr, STDERR_TAIL).to_string(),
            });
        }

        info!(binary = %binary.display(), ?duration, "client finished");
        Ok(WorkloadRun { duration, stderr })
    }
}

/// Read `pipe` to EOF, keeping only the last `STDERR_TAIL` bytes
async fn read_tail<R: AsyncRead + Unpin>(mut pipe: R) -> Vec<u8> {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                kept.extend_from_slice(&chunk[..n]);
                if kept.len() > 2 * STDERR_TAIL {
                    kept.drain(..kept.len() - STDERR_TAIL);
                }
            }
        }
    }
    kept
}

/// Last `max` bytes of `s`, on a char boundary
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_env_is_minimal() {
        let runner = WorkloadRunner::new(None);
        let env = runner.client_env(&TrackingTarget::file("/tmp/abc123"));
        assert_eq!(
            env,
            vec![(TRACKING_URI_ENV.to_string(), "/tmp/abc123".to_string())]
        );
    }

    #[test]
    fn test_passthrough_cannot_override_target() {
        let runner = WorkloadRunner::new(None).with_passthrough_env(vec![
            TRACKING_URI_ENV.to_string(),
            "TRACKING_CONFORMANCE_SURELY_UNSET".to_string(),
        ]);
        let env = runner.client_env(&TrackingTarget::http("127.0.0.1", 5000).unwrap());
        assert_eq!(
            env,
            vec![(TRACKING_URI_ENV.to_string(), "http://127.0.0.1:5000".to_string())]
        );
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("hello", 10), "hello");
        assert_eq!(tail("hello", 3), "llo");
        assert_eq!(tail("aé", 1), "");
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let runner = WorkloadRunner::new(Some(Duration::from_secs(5)));
        let err = runner
            .run(
                Path::new("/nonexistent/tracking-client"),
                &TrackingTarget::file("/tmp/x"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkloadError::Spawn { .. }));
    }

    #[cfg(unix)]
    mod processes {
        use super::*;
        use crate::testing::write_client_script;

        fn target() -> TrackingTarget {
            TrackingTarget::file("/tmp/tracking-conformance-unused")
        }

        #[tokio::test]
        async fn test_timeout_kills_forked_processes() {
            let dir = tempfile::tempdir().unwrap();
            let marker = dir.path().join("marker");
            let body = format!("(sleep 1; touch '{}') &\nwait", marker.display());
            let client = write_client_script(dir.path(), "forking", &body).unwrap();

            let runner = WorkloadRunner::new(Some(Duration::from_millis(300)));
            let err = runner.run(&client, &target()).await.unwrap_err();
            assert!(matches!(err, WorkloadError::TimedOut { .. }));

            tokio::time::sleep(Duration::from_millis(1500)).await;
            assert!(!marker.exists(), "forked process outlived the timeout");
        }

        #[tokio::test]
        async fn test_background_process_does_not_delay_clean_exit() {
            let dir = tempfile::tempdir().unwrap();
            let marker = dir.path().join("marker");
            let body = format!(
                "echo 'warming up' >&2\n(sleep 1; touch '{}') &\nsleep 5 &\nexit 0",
                marker.display()
            );
            let client = write_client_script(dir.path(), "daemonizing", &body).unwrap();

            let start = Instant::now();
            let run = WorkloadRunner::new(Some(Duration::from_secs(3)))
                .run(&client, &target())
                .await
                .unwrap();
            assert!(start.elapsed() < Duration::from_secs(3));
            assert!(run.stderr.contains("warming up"), "stderr: {}", run.stderr);

            tokio::time::sleep(Duration::from_millis(1500)).await;
            assert!(!marker.exists(), "background process outlived the client");
        }

        #[tokio::test]
        async fn test_unbounded_run_returns_when_client_exits() {
            let dir = tempfile::tempdir().unwrap();
            let client = write_client_script(dir.path(), "daemonizing", "sleep 30 &\nexit 0").unwrap();

            let runner = WorkloadRunner::new(None);
            let target = target();
            let run = runner.run(&client, &target);
            let result = tokio::time::timeout(Duration::from_secs(10), run).await;
            assert!(result.expect("runner waited on the background process").is_ok());
        }

        #[tokio::test]
        async fn test_nonzero_exit_reports_code_and_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let client =
                write_client_script(dir.path(), "failing", "echo 'no such run' >&2\nexit 3").unwrap();

            let err = WorkloadRunner::new(Some(Duration::from_secs(10)))
                .run(&client, &target())
                .await
                .unwrap_err();
            match err {
                WorkloadError::Exited { code, stderr, .. } => {
                    assert_eq!(code, Some(3));
                    assert!(stderr.contains("no such run"));
                }
                other => panic!("expected exit failure, got {:?}", other),
            }
        }
    }
}
