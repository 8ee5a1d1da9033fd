//! File-store reader
//!
//! Layout under the root directory:
//! - `<experiment_id>/meta.yaml` - experiment metadata
//! - `<experiment_id>/<run_id>/meta.yaml` - run metadata
//! - `<run>/metrics/<key>` - one `timestamp value [step]` line per point
//! - `<run>/params/<key>`, `<run>/tags/<key>` - raw values
//! - `<run>/artifacts/` - default artifact root
//!
//! Keys may contain `/`, in which case the files are nested. Entries whose
//! names start with `.` (such as `.trash`) are not experiments.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use super::lenient;
use super::traits::{
    Experiment, FileInfo, Run, RunData, RunInfo, RunStatus, StoreError, TrackingStore,
};
use crate::workload::{DEFAULT_EXPERIMENT_ID, DEFAULT_EXPERIMENT_NAME};

pub(crate) const META_FILE: &str = "meta.yaml";
pub(crate) const METRICS_DIR: &str = "metrics";
pub(crate) const PARAMS_DIR: &str = "params";
pub(crate) const TAGS_DIR: &str = "tags";
pub(crate) const ARTIFACTS_DIR: &str = "artifacts";

const LIFECYCLE_ACTIVE: &str = "active";
const LIFECYCLE_DELETED: &str = "deleted";

fn active() -> String {
    LIFECYCLE_ACTIVE.to_string()
}

/// Contents of an experiment's `meta.yaml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ExperimentMeta {
    #[serde(default)]
    pub artifact_location: String,
    #[serde(deserialize_with = "lenient::string")]
    pub experiment_id: String,
    #[serde(default = "active")]
    pub lifecycle_stage: String,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub creation_time: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub last_update_time: Option<i64>,
    pub name: String,
}

/// Contents of a run's `meta.yaml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RunMeta {
    #[serde(default)]
    pub artifact_uri: String,
    #[serde(deserialize_with = "lenient::string")]
    pub experiment_id: String,
    #[serde(default = "active")]
    pub lifecycle_stage: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub run_uuid: String,
    #[serde(default)]
    pub run_name: String,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub start_time: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub end_time: Option<i64>,
    /// Integer code from the file store; some writers use the status name
    #[serde(default)]
    pub status: Option<serde_yaml::Value>,
}

impl RunMeta {
    fn id(&self) -> &str {
        if self.run_id.is_empty() {
            &self.run_uuid
        } else {
            &self.run_id
        }
    }

    fn status(&self) -> Option<RunStatus> {
        match self.status.as_ref()? {
            serde_yaml::Value::Number(n) => n.as_i64().and_then(RunStatus::from_code),
            serde_yaml::Value::String(s) => RunStatus::from_name(s),
            _ => None,
        }
    }
}

/// One parsed line of a metric file
#[derive(Debug, Clone, Copy, PartialEq)]
struct MetricLine {
    timestamp: i64,
    value: f64,
    step: i64,
}

impl MetricLine {
    /// Ordering the backend uses to pick a metric's reported value
    fn latest_order(&self, other: &Self) -> Ordering {
        (self.step, self.timestamp)
            .cmp(&(other.step, other.timestamp))
            .then_with(|| self.value.total_cmp(&other.value))
    }
}

fn parse_metric_line(line: &str) -> Option<MetricLine> {
    let mut parts = line.split_whitespace();
    let timestamp = parts.next()?.parse().ok()?;
    let value = parts.next()?.parse().ok()?;
    let step = match parts.next() {
        Some(step) => step.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(MetricLine {
        timestamp,
        value,
        step,
    })
}

/// Reads a file store rooted at a directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        FileStore {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root and the default experiment if they do not exist yet
    pub fn bootstrap<P: AsRef<Path>>(root: P) -> Result<Self, StoreError> {
        let store = FileStore::new(root);
        let exp_dir = store.root.join(DEFAULT_EXPERIMENT_ID);
        if exp_dir.join(META_FILE).is_file() {
            return Ok(store);
        }

        fs::create_dir_all(&exp_dir).map_err(|e| StoreError::io(exp_dir.display(), e))?;
        let now = now_millis();
        let meta = ExperimentMeta {
            artifact_location: file_uri(&exp_dir),
            experiment_id: DEFAULT_EXPERIMENT_ID.to_string(),
            lifecycle_stage: LIFECYCLE_ACTIVE.to_string(),
            creation_time: Some(now),
            last_update_time: Some(now),
            name: DEFAULT_EXPERIMENT_NAME.to_string(),
        };
        write_yaml(&exp_dir.join(META_FILE), &meta)?;
        Ok(store)
    }

    /// All experiments, keyed by directory
    fn experiments(&self) -> Result<Vec<(PathBuf, ExperimentMeta)>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(self.root.display(), e)),
        };

        let mut experiments = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(self.root.display(), e))?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            let dir = entry.path();
            let meta_path = dir.join(META_FILE);
            if !meta_path.is_file() {
                continue;
            }
            let meta: ExperimentMeta = read_yaml(&meta_path)?;
            experiments.push((dir, meta));
        }
        experiments.sort_by(|a, b| a.1.experiment_id.cmp(&b.1.experiment_id));
        Ok(experiments)
    }

    fn experiment_dir(&self, experiment_id: &str) -> Result<(PathBuf, ExperimentMeta), StoreError> {
        self.experiments()?
            .into_iter()
            .find(|(_, meta)| meta.experiment_id == experiment_id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "experiment",
                id: experiment_id.to_string(),
            })
    }

    /// Locate a run directory by id across experiments
    fn run_dir(&self, run_id: &str) -> Result<PathBuf, StoreError> {
        for (dir, _) in self.experiments()? {
            let candidate = dir.join(run_id);
            if candidate.join(META_FILE).is_file() {
                return Ok(candidate);
            }
        }
        Err(StoreError::NotFound {
            kind: "run",
            id: run_id.to_string(),
        })
    }

    fn read_run(&self, run_dir: &Path) -> Result<Run, StoreError> {
        let meta: RunMeta = read_yaml(&run_dir.join(META_FILE))?;

        let mut metrics = BTreeMap::new();
        for (key, path) in list_keyed_files(&run_dir.join(METRICS_DIR))? {
            if let Some(latest) = read_latest_metric(&path)? {
                metrics.insert(key, latest.value);
            }
        }

        let params = read_keyed_values(&run_dir.join(PARAMS_DIR))?;
        let tags = read_keyed_values(&run_dir.join(TAGS_DIR))?;

        let run_id = match meta.id() {
            "" => dir_name(run_dir),
            id => id.to_string(),
        };

        Ok(Run {
            info: RunInfo {
                run_id,
                experiment_id: meta.experiment_id.clone(),
                run_name: meta.run_name.clone(),
                status: meta.status(),
                lifecycle_stage: meta.lifecycle_stage.clone(),
                artifact_uri: meta.artifact_uri.clone(),
            },
            data: RunData {
                metrics,
                params,
                tags,
            },
        })
    }

    /// Directory a run's artifacts live in
    fn artifact_root(&self, run_dir: &Path, artifact_uri: &str) -> PathBuf {
        if artifact_uri.starts_with("file:") {
            if let Some(path) = Url::parse(artifact_uri)
                .ok()
                .and_then(|url| url.to_file_path().ok())
            {
                return path;
            }
        } else if Path::new(artifact_uri).is_absolute() {
            return PathBuf::from(artifact_uri);
        }
        run_dir.join(ARTIFACTS_DIR)
    }
}

#[async_trait]
impl TrackingStore for FileStore {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    async fn get_experiment(&self, experiment_id: &str) -> Result<Experiment, StoreError> {
        let (_, meta) = self.experiment_dir(experiment_id)?;
        Ok(to_experiment(meta))
    }

    async fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>, StoreError> {
        Ok(self
            .experiments()?
            .into_iter()
            .map(|(_, meta)| meta)
            .find(|meta| meta.name == name)
            .map(to_experiment))
    }

    async fn search_runs(&self, experiment_ids: &[String]) -> Result<Vec<Run>, StoreError> {
        let mut runs = Vec::new();
        for experiment_id in experiment_ids {
            let (exp_dir, _) = self.experiment_dir(experiment_id)?;
            let entries = fs::read_dir(&exp_dir).map_err(|e| StoreError::io(exp_dir.display(), e))?;
            let mut run_dirs = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|e| StoreError::io(exp_dir.display(), e))?;
                let path = entry.path();
                if path.is_dir() && path.join(META_FILE).is_file() {
                    run_dirs.push(path);
                }
            }
            run_dirs.sort();

            for run_dir in run_dirs {
                let run = self.read_run(&run_dir)?;
                if run.info.lifecycle_stage != LIFECYCLE_DELETED {
                    runs.push(run);
                }
            }
        }
        Ok(runs)
    }

    async fn list_artifacts(&self, run_id: &str) -> Result<Vec<FileInfo>, StoreError> {
        let run_dir = self.run_dir(run_id)?;
        let meta: RunMeta = read_yaml(&run_dir.join(META_FILE))?;
        let root = self.artifact_root(&run_dir, &meta.artifact_uri);

        let entries = match fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(root.display(), e)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(root.display(), e))?;
            let metadata = entry
                .metadata()
                .map_err(|e| StoreError::io(entry.path().display(), e))?;
            files.push(FileInfo {
                path: entry.file_name().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                file_size: if metadata.is_dir() {
                    None
                } else {
                    Some(metadata.len())
                },
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }
}

fn to_experiment(meta: ExperimentMeta) -> Experiment {
    Experiment {
        experiment_id: meta.experiment_id,
        name: meta.name,
        artifact_location: meta.artifact_location,
        lifecycle_stage: meta.lifecycle_stage,
    }
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Files under `dir`, keyed by their `/`-joined relative path
fn list_keyed_files(dir: &Path) -> Result<Vec<(String, PathBuf)>, StoreError> {
    let mut out = Vec::new();
    collect_keyed_files(dir, "", &mut out)?;
    out.sort();
    Ok(out)
}

fn collect_keyed_files(
    dir: &Path,
    prefix: &str,
    out: &mut Vec<(String, PathBuf)>,
) -> Result<(), StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(StoreError::io(dir.display(), e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir.display(), e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let key = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };
        let path = entry.path();
        if path.is_dir() {
            collect_keyed_files(&path, &key, out)?;
        } else {
            out.push((key, path));
        }
    }
    Ok(())
}

fn read_keyed_values(dir: &Path) -> Result<BTreeMap<String, String>, StoreError> {
    list_keyed_files(dir)?
        .into_iter()
        .map(|(key, path)| {
            fs::read_to_string(&path)
                .map(|value| (key, value))
                .map_err(|e| StoreError::io(path.display(), e))
        })
        .collect()
}

fn read_latest_metric(path: &Path) -> Result<Option<MetricLine>, StoreError> {
    let content = fs::read_to_string(path).map_err(|e| StoreError::io(path.display(), e))?;
    let mut latest: Option<MetricLine> = None;
    for (line_num, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let point = parse_metric_line(line).ok_or_else(|| {
            StoreError::corrupt(
                format!("{}:{}", path.display(), line_num + 1),
                format!("invalid metric line {:?}", line),
            )
        })?;
        latest = match latest {
            Some(current) if current.latest_order(&point) == Ordering::Greater => Some(current),
            _ => Some(point),
        };
    }
    Ok(latest)
}

fn read_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, StoreError> {
    let content = fs::read_to_string(path).map_err(|e| StoreError::io(path.display(), e))?;
    serde_yaml::from_str(&content).map_err(|e| StoreError::corrupt(path.display(), e))
}

pub(crate) fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let content = serde_yaml::to_string(value).map_err(|e| StoreError::corrupt(path.display(), e))?;
    fs::write(path, content).map_err(|e| StoreError::io(path.display(), e))
}

pub(crate) fn file_uri(path: &Path) -> String {
    Url::from_file_path(path)
        .map(|url| url.to_string())
        .unwrap_or_else(|_| path.display().to_string())
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
