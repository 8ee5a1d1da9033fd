//! Tracking server provisioning
//!
//! `BackendProvisioner` turns a fresh root directory into a live backend:
//! for file mode that is just the directory, for server mode it spawns the
//! tracking server on an ephemeral loopback port and waits until it answers.
//! The spawned process is owned by the returned [`BackendHandle`] and is
//! terminated when the handle is dropped or shut down, on every exit path.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use reqwest::StatusCode;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::backend::port::allocate_port;
use crate::backend::wait::{wait_until, Attempt, WaitOutcome};
use crate::core::{
    HarnessConfig, HarnessError, HelperRequirement, StorageMode, TrackingTarget,
};

/// Path of the endpoint polled for readiness (experiment `0` lookup)
pub const READINESS_PATH: &str = "/api/2.0/mlflow/experiments/get?experiment_id=0";

/// A live backend for one conformance case
#[derive(Debug)]
pub struct BackendHandle {
    root_dir: PathBuf,
    target: TrackingTarget,
    server: Option<ServerProcess>,
}

/// The tracking server child process, terminated on drop
#[derive(Debug)]
pub struct ServerProcess {
    child: Child,
    port: u16,
    terminated: bool,
}

impl BackendHandle {
    /// Storage mode this backend serves
    pub fn mode(&self) -> StorageMode {
        self.target.mode()
    }

    /// Root directory of the backing file store
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Value to hand to clients and the verifier
    pub fn target(&self) -> &TrackingTarget {
        &self.target
    }

    /// Server port, if this is a server-mode backend
    pub fn port(&self) -> Option<u16> {
        self.server.as_ref().map(|s| s.port)
    }

    /// Whether the owned server process is still running (file mode: always true)
    pub fn is_alive(&mut self) -> bool {
        match self.server.as_mut() {
            Some(server) => server.exit_status().is_none(),
            None => true,
        }
    }

    /// Terminate the server (if any) and wait for it to exit
    pub async fn shutdown(mut self) {
        if let Some(mut server) = self.server.take() {
            server.shutdown().await;
        }
    }
}

impl ServerProcess {
    fn new(child: Child, port: u16) -> Self {
        Self {
            child,
            port,
            terminated: false,
        }
    }

    /// Exit status if the process has exited, rendered for reports
    fn exit_status(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unknown ({})", e)),
        }
    }

    /// Signal the whole process group, then the child itself
    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        // The server runs in its own process group, so worker processes it
        // forked go down with it.
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            signal_process_group(pid, "TERM");
        }

        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "server process already gone");
        }
    }

    async fn shutdown(&mut self) {
        self.terminate();
        match tokio::time::timeout(std::time::Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(status)) => debug!(port = self.port, %status, "tracking server stopped"),
            Ok(Err(e)) => warn!(port = self.port, error = %e, "failed waiting for tracking server"),
            Err(_) => warn!(port = self.port, "tracking server did not exit within 5s"),
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        // Best-effort synchronous cleanup
        self.terminate();
    }
}

/// Starts backends according to a [`HarnessConfig`]
pub struct BackendProvisioner<'a> {
    config: &'a HarnessConfig,
    http: reqwest::Client,
}

impl<'a> BackendProvisioner<'a> {
    pub fn new(config: &'a HarnessConfig) -> Result<Self, HarnessError> {
        let http = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()
            .map_err(|e| HarnessError::environment(format!("failed to create HTTP client: {}", e)))?;
        Ok(BackendProvisioner { config, http })
    }

    /// Provision a backend of the given mode rooted at `root_dir`
    pub async fn provision(
        &self,
        mode: StorageMode,
        root_dir: &Path,
    ) -> Result<BackendHandle, HarnessError> {
        match mode {
            StorageMode::FileStore => Ok(Self::file_store(root_dir)),
            StorageMode::HttpServer => self.start(root_dir).await,
        }
    }

    /// File mode needs no process, only the root directory
    pub fn file_store(root_dir: &Path) -> BackendHandle {
        BackendHandle {
            root_dir: root_dir.to_path_buf(),
            target: TrackingTarget::file(root_dir),
            server: None,
        }
    }

    /// Spawn the tracking server for `root_dir` and wait until it answers
    pub async fn start(&self, root_dir: &Path) -> Result<BackendHandle, HarnessError> {
        let server = &self.config.server;
        let port = allocate_port()?;
        let target = TrackingTarget::http(&self.config.host, port)
            .map_err(|e| HarnessError::environment(e.to_string()))?;

        let augmented_path = match &server.helper {
            Some(helper) => helper_search_path(helper, env::var_os("PATH"))?,
            None => None,
        };

        let root = root_dir.display().to_string();
        let args = server.render_args(&root, &self.config.host, port);

        info!(
            port,
            root = %root_dir.display(),
            program = %server.program.display(),
            "starting tracking server"
        );

        let mut command = Command::new(&server.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(path) = augmented_path {
            command.env("PATH", path);
        }
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|e| {
            HarnessError::environment(format!(
                "failed to start tracking server `{}`: {}",
                server.program.display(),
                e
            ))
        })?;

        // From here on the process is owned by the handle
        let mut handle = BackendHandle {
            root_dir: root_dir.to_path_buf(),
            target,
            server: Some(ServerProcess::new(child, port)),
        };

        self.wait_for_ready(&mut handle).await?;
        Ok(handle)
    }

    /// Poll the readiness endpoint, distinguishing slow start from a crash
    async fn wait_for_ready(&self, handle: &mut BackendHandle) -> Result<(), HarnessError> {
        let uri = handle.target.env_value();
        let probe_url = format!("{}{}", uri, READINESS_PATH);

        let Some(server) = handle.server.as_mut() else {
            return Ok(());
        };

        let outcome = wait_until(&self.config.readiness, |attempt| {
            let exited = server.exit_status();
            let http = self.http.clone();
            let url = probe_url.clone();
            async move {
                if let Some(status) = exited {
                    return Attempt::Abort(status);
                }
                match probe(&http, &url).await {
                    Some(status) => {
                        debug!(attempt, %status, "tracking server responded");
                        Attempt::Ready(status.to_string())
                    }
                    None => {
                        debug!(attempt, url = %url, "tracking server not ready");
                        Attempt::Retry
                    }
                }
            }
        })
        .await;

        match outcome {
            WaitOutcome::Ready { attempts, .. } => {
                if let Some(status) = server.exit_status() {
                    return Err(HarnessError::BackendCrashed { uri, status });
                }
                info!(uri = %uri, attempts, "tracking server is up");
                Ok(())
            }
            WaitOutcome::Aborted { value: status, .. } => {
                warn!(uri = %uri, %status, "tracking server exited during startup");
                Err(HarnessError::BackendCrashed { uri, status })
            }
            WaitOutcome::TimedOut { attempts } => {
                if let Some(status) = server.exit_status() {
                    return Err(HarnessError::BackendCrashed { uri, status });
                }
                Err(HarnessError::ReadinessTimeout { uri, attempts })
            }
        }
    }
}

/// Send `signal` to every process in the group led by `pid`
#[cfg(unix)]
pub(crate) fn signal_process_group(pid: u32, signal: &str) {
    let _ = std::process::Command::new("kill")
        .args([format!("-{}", signal), "--".to_string(), format!("-{}", pid)])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

/// One readiness probe. Any HTTP response counts, error statuses included;
/// transport failures (refused, reset, timed out) mean "not yet".
pub async fn probe(http: &reqwest::Client, url: &str) -> Option<StatusCode> {
    match http.get(url).send().await {
        Ok(response) => Some(response.status()),
        Err(_) => None,
    }
}

/// Decide the `PATH` the server child needs so `helper` resolves.
///
/// Returns `Ok(None)` when the helper is already on `current`, or the
/// augmented search path with the bundled directory prepended. The parent
/// process environment is never modified.
pub fn helper_search_path(
    helper: &HelperRequirement,
    current: Option<OsString>,
) -> Result<Option<OsString>, HarnessError> {
    let dirs: Vec<PathBuf> = current
        .as_ref()
        .map(|p| env::split_paths(p).collect())
        .unwrap_or_default();

    if find_executable(&helper.name, &dirs).is_some() {
        return Ok(None);
    }

    let bundled = helper.bundled_dir.as_ref().ok_or_else(|| {
        HarnessError::environment(format!(
            "`{}` is not on PATH and no bundled copy is configured",
            helper.name
        ))
    })?;

    if find_executable(&helper.name, std::slice::from_ref(bundled)).is_none() {
        return Err(HarnessError::environment(format!(
            "could not find {} binary at {}",
            helper.name,
            bundled.join(&helper.name).display()
        )));
    }

    let mut search = Vec::with_capacity(dirs.len() + 1);
    search.push(bundled.clone());
    search.extend(dirs);
    env::join_paths(search)
        .map(Some)
        .map_err(|e| HarnessError::environment(format!("invalid PATH entry: {}", e)))
}

fn find_executable(name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn make_executable(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn helper(bundled: Option<&Path>) -> HelperRequirement {
        HelperRequirement {
            name: "gunicorn".to_string(),
            bundled_dir: bundled.map(Path::to_path_buf),
        }
    }

    #[test]
    fn test_helper_on_path_needs_no_change() {
        let on_path = tempfile::tempdir().unwrap();
        make_executable(on_path.path(), "gunicorn");
        let current = env::join_paths([on_path.path()]).unwrap();

        let result = helper_search_path(&helper(None), Some(current)).unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_bundled_dir_is_prepended() {
        let on_path = tempfile::tempdir().unwrap();
        let bundle = tempfile::tempdir().unwrap();
        make_executable(bundle.path(), "gunicorn");
        let current = env::join_paths([on_path.path()]).unwrap();

        let result = helper_search_path(&helper(Some(bundle.path())), Some(current))
            .unwrap()
            .expect("PATH should be augmented");
        let dirs: Vec<PathBuf> = env::split_paths(&result).collect();
        assert_eq!(dirs, vec![bundle.path().to_path_buf(), on_path.path().to_path_buf()]);
    }

    #[test]
    fn test_missing_bundle_is_fatal() {
        let on_path = tempfile::tempdir().unwrap();
        let empty_bundle = tempfile::tempdir().unwrap();
        let current = env::join_paths([on_path.path()]).unwrap();

        let err = helper_search_path(&helper(Some(empty_bundle.path())), Some(current.clone()))
            .unwrap_err();
        assert!(matches!(err, HarnessError::Environment(ref msg) if msg.contains("could not find gunicorn")));

        let err = helper_search_path(&helper(None), Some(current)).unwrap_err();
        assert!(matches!(err, HarnessError::Environment(_)));
    }

    #[test]
    fn test_non_executable_file_is_ignored() {
        let on_path = tempfile::tempdir().unwrap();
        fs::write(on_path.path().join("gunicorn"), "not a program").unwrap();
        let current = env::join_paths([on_path.path()]).unwrap();

        assert!(helper_search_path(&helper(None), Some(current)).is_err());
    }

    #[test]
    fn test_file_store_handle_has_no_process() {
        let mut handle = BackendProvisioner::file_store(Path::new("/tmp/root-x"));
        assert_eq!(handle.mode(), StorageMode::FileStore);
        assert_eq!(handle.port(), None);
        assert!(handle.is_alive());
        assert_eq!(handle.target().env_value(), "/tmp/root-x");
    }
}
