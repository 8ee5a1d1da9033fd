//! Testing utilities for harness integration tests
//!
//! Provides fixtures that stand in for the external collaborators:
//! - `write_file_store_run`: lays down the run a compliant client would record
//! - `file_store_client_script`: a shell client that records that run itself
//! - `TrackingTestServer`: an in-process read-only tracking server

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::warn;

use crate::api::create_tracking_router;
use crate::core::{HarnessError, TrackingTarget};
use crate::store::file::{
    file_uri, now_millis, write_yaml, RunMeta, ARTIFACTS_DIR, META_FILE, METRICS_DIR, PARAMS_DIR,
    TAGS_DIR,
};
use crate::store::{FileStore, StoreError};
use crate::workload::{WorkloadSpec, DEFAULT_EXPERIMENT_ID};

/// Run status code for FINISHED in the file store
const STATUS_FINISHED: i64 = 3;

fn create_dir(path: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(path).map_err(|e| StoreError::io(path.display(), e))
}

fn write_file(path: &Path, contents: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).map_err(|e| StoreError::io(path.display(), e))
}

/// Record `spec` as run `run_id` in the default experiment under `root`,
/// bootstrapping the store if needed. Returns the run directory.
pub fn write_file_store_run(
    root: &Path,
    spec: &WorkloadSpec,
    run_id: &str,
) -> Result<PathBuf, StoreError> {
    let store = FileStore::bootstrap(root)?;
    let run_dir = store.root().join(DEFAULT_EXPERIMENT_ID).join(run_id);
    let artifacts = run_dir.join(ARTIFACTS_DIR);
    create_dir(&artifacts)?;

    let start = now_millis();
    let meta = RunMeta {
        artifact_uri: file_uri(&artifacts),
        experiment_id: DEFAULT_EXPERIMENT_ID.to_string(),
        lifecycle_stage: "active".to_string(),
        run_id: run_id.to_string(),
        run_uuid: run_id.to_string(),
        run_name: "conformance".to_string(),
        start_time: Some(start),
        end_time: Some(start),
        status: Some(serde_yaml::Value::Number(STATUS_FINISHED.into())),
    };
    write_yaml(&run_dir.join(META_FILE), &meta)?;

    for (key, points) in &spec.metrics {
        let lines: String = points
            .iter()
            .enumerate()
            .map(|(i, p)| format!("{} {} {}\n", start + i as i64, p.value, p.step))
            .collect();
        write_file(&run_dir.join(METRICS_DIR).join(key), &lines)?;
    }
    for (key, value) in &spec.params {
        write_file(&run_dir.join(PARAMS_DIR).join(key), value)?;
    }
    for (key, value) in &spec.tags {
        write_file(&run_dir.join(TAGS_DIR).join(key), value)?;
    }
    for artifact in &spec.artifacts {
        write_file(&artifacts.join(&artifact.path), &artifact.contents)?;
    }
    Ok(run_dir)
}

/// Write an executable `#!/bin/sh` script to `dir/name`
///
/// Clients run with a cleared environment, so the script gets a fixed `PATH`.
#[cfg(unix)]
pub fn write_client_script(dir: &Path, name: &str, body: &str) -> io::Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(
        &path,
        format!("#!/bin/sh\nPATH=/usr/bin:/bin\nexport PATH\nset -e\n{}\n", body),
    )?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

/// Shell commands that record `spec` as run `run_id` in the file store whose
/// root is the value of the shell expression `root_expr`
/// (e.g. `"$MLFLOW_TRACKING_URI"`). `run_id` is expanded by the shell, so
/// `run-$$` gives every invocation its own id.
pub fn file_store_client_script(root_expr: &str, spec: &WorkloadSpec, run_id: &str) -> String {
    let mut script = String::new();
    script.push_str(&format!("ROOT={}\n", root_expr));
    script.push_str(&format!("RUN=\"$ROOT/{}/{}\"\n", DEFAULT_EXPERIMENT_ID, run_id));
    script.push_str(&format!(
        "mkdir -p \"$RUN/{}\" \"$RUN/{}\" \"$RUN/{}\" \"$RUN/{}\"\n",
        METRICS_DIR, PARAMS_DIR, TAGS_DIR, ARTIFACTS_DIR
    ));
    script.push_str(&format!(
        "[ -f \"$ROOT/{id}/{meta}\" ] || printf '%s\\n' \"experiment_id: '{id}'\" 'name: Default' \
         'lifecycle_stage: active' \"artifact_location: $ROOT/{id}\" > \"$ROOT/{id}/{meta}\"\n",
        id = DEFAULT_EXPERIMENT_ID,
        meta = META_FILE
    ));
    script.push_str(&format!(
        "printf '%s\\n' \"run_id: {run}\" \"experiment_id: '{id}'\" 'status: {status}' \
         'lifecycle_stage: active' \"artifact_uri: $RUN/{artifacts}\" > \"$RUN/{meta}\"\n",
        run = run_id,
        id = DEFAULT_EXPERIMENT_ID,
        status = STATUS_FINISHED,
        artifacts = ARTIFACTS_DIR,
        meta = META_FILE
    ));
    for (key, points) in &spec.metrics {
        let file = format!("\"$RUN/{}/{}\"", METRICS_DIR, key);
        script.push_str(&format!(": > {}\n", file));
        for (i, point) in points.iter().enumerate() {
            script.push_str(&format!(
                "echo '{} {} {}' >> {}\n",
                1_700_000_000_000_i64 + i as i64,
                point.value,
                point.step,
                file
            ));
        }
    }
    for (dir, values) in [(PARAMS_DIR, &spec.params), (TAGS_DIR, &spec.tags)] {
        for (key, value) in values {
            script.push_str(&format!(
                "printf '%s' '{}' > \"$RUN/{}/{}\"\n",
                value, dir, key
            ));
        }
    }
    for artifact in &spec.artifacts {
        script.push_str(&format!(
            "printf '%s' '{}' > \"$RUN/{}/{}\"\n",
            artifact.contents, ARTIFACTS_DIR, artifact.path
        ));
    }
    script
}

/// An in-process read-only tracking server over a file store
pub struct TrackingTestServer {
    target: TrackingTarget,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TrackingTestServer {
    /// Bootstrap `root` and serve it on an ephemeral loopback port
    pub async fn start<P: AsRef<Path>>(root: P) -> Result<Self, HarnessError> {
        let store = FileStore::bootstrap(root.as_ref())
            .map_err(|e| HarnessError::environment(e.to_string()))?;
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| HarnessError::environment(format!("failed to bind test server: {}", e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| HarnessError::environment(e.to_string()))?;
        let target = TrackingTarget::http(&addr.ip().to_string(), addr.port())
            .map_err(|e| HarnessError::environment(e.to_string()))?;

        let app = create_tracking_router(Arc::new(store));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "test tracking server failed");
            }
        });

        Ok(TrackingTestServer {
            target,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// `http://127.0.0.1:<port>`
    pub fn target(&self) -> &TrackingTarget {
        &self.target
    }

    /// Stop serving
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TrackingTestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
