//! Tracking server reader over the HTTP API (`/api/2.0/mlflow/...`)
//!
//! The wire types are public so the read-only server in
//! [`crate::testing`] can answer with exactly what this client expects.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::lenient;
use super::traits::{
    Experiment, FileInfo, Run, RunData, RunInfo, RunStatus, StoreError, TrackingStore,
};

/// Prefix of every tracking API endpoint
pub const API_PREFIX: &str = "/api/2.0/mlflow";

/// Page size for run searches
const SEARCH_PAGE_SIZE: i64 = 1000;

fn active() -> String {
    "active".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentDto {
    #[serde(deserialize_with = "lenient::string")]
    pub experiment_id: String,
    pub name: String,
    #[serde(default)]
    pub artifact_location: String,
    #[serde(default = "active")]
    pub lifecycle_stage: String,
}

/// Response of `experiments/get` and `experiments/get-by-name`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetExperimentResponse {
    pub experiment: ExperimentDto,
}

/// Body of `runs/search`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRunsRequest {
    pub experiment_ids: Vec<String>,
    #[serde(default)]
    pub max_results: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchRunsResponse {
    #[serde(default)]
    pub runs: Vec<RunDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDto {
    pub info: RunInfoDto,
    #[serde(default)]
    pub data: RunDataDto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfoDto {
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub run_uuid: String,
    #[serde(deserialize_with = "lenient::string")]
    pub experiment_id: String,
    #[serde(default)]
    pub run_name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "active")]
    pub lifecycle_stage: String,
    #[serde(default)]
    pub artifact_uri: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunDataDto {
    #[serde(default)]
    pub metrics: Vec<MetricDto>,
    #[serde(default)]
    pub params: Vec<KeyValueDto>,
    #[serde(default)]
    pub tags: Vec<KeyValueDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDto {
    pub key: String,
    #[serde(deserialize_with = "lenient::f64")]
    pub value: f64,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub timestamp: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub step: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValueDto {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// Response of `artifacts/list`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListArtifactsResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_uri: Option<String>,
    #[serde(default)]
    pub files: Vec<FileInfoDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfoDto {
    pub path: String,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub file_size: Option<i64>,
}

/// Error body returned by the tracking server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDto {
    pub error_code: String,
    #[serde(default)]
    pub message: String,
}

impl From<ExperimentDto> for Experiment {
    fn from(dto: ExperimentDto) -> Self {
        Experiment {
            experiment_id: dto.experiment_id,
            name: dto.name,
            artifact_location: dto.artifact_location,
            lifecycle_stage: dto.lifecycle_stage,
        }
    }
}

impl From<&Experiment> for ExperimentDto {
    fn from(exp: &Experiment) -> Self {
        ExperimentDto {
            experiment_id: exp.experiment_id.clone(),
            name: exp.name.clone(),
            artifact_location: exp.artifact_location.clone(),
            lifecycle_stage: exp.lifecycle_stage.clone(),
        }
    }
}

impl From<RunDto> for Run {
    fn from(dto: RunDto) -> Self {
        let run_id = if dto.info.run_id.is_empty() {
            dto.info.run_uuid
        } else {
            dto.info.run_id
        };

        // The server reports one entry per key; keep the latest if it repeats
        let mut latest: BTreeMap<String, &MetricDto> = BTreeMap::new();
        for metric in &dto.data.metrics {
            let replace = match latest.get(&metric.key) {
                Some(current) => later_metric(current, metric) != Ordering::Greater,
                None => true,
            };
            if replace {
                latest.insert(metric.key.clone(), metric);
            }
        }
        let metrics = latest.into_iter().map(|(k, m)| (k, m.value)).collect();

        Run {
            info: RunInfo {
                run_id,
                experiment_id: dto.info.experiment_id,
                run_name: dto.info.run_name,
                status: dto.info.status.as_deref().and_then(RunStatus::from_name),
                lifecycle_stage: dto.info.lifecycle_stage,
                artifact_uri: dto.info.artifact_uri,
            },
            data: RunData {
                metrics,
                params: dto
                    .data
                    .params
                    .into_iter()
                    .map(|kv| (kv.key, kv.value))
                    .collect(),
                tags: dto
                    .data
                    .tags
                    .into_iter()
                    .map(|kv| (kv.key, kv.value))
                    .collect(),
            },
        }
    }
}

impl From<&Run> for RunDto {
    fn from(run: &Run) -> Self {
        let pairs = |map: &BTreeMap<String, String>| {
            map.iter()
                .map(|(k, v)| KeyValueDto {
                    key: k.clone(),
                    value: v.clone(),
                })
                .collect()
        };
        RunDto {
            info: RunInfoDto {
                run_id: run.info.run_id.clone(),
                run_uuid: run.info.run_id.clone(),
                experiment_id: run.info.experiment_id.clone(),
                run_name: run.info.run_name.clone(),
                status: run.info.status.map(|s| s.name().to_string()),
                lifecycle_stage: run.info.lifecycle_stage.clone(),
                artifact_uri: run.info.artifact_uri.clone(),
            },
            data: RunDataDto {
                metrics: run
                    .data
                    .metrics
                    .iter()
                    .map(|(k, v)| MetricDto {
                        key: k.clone(),
                        value: *v,
                        timestamp: None,
                        step: None,
                    })
                    .collect(),
                params: pairs(&run.data.params),
                tags: pairs(&run.data.tags),
            },
        }
    }
}

impl From<FileInfoDto> for FileInfo {
    fn from(dto: FileInfoDto) -> Self {
        FileInfo {
            path: dto.path,
            is_dir: dto.is_dir,
            file_size: dto.file_size.and_then(|s| u64::try_from(s).ok()),
        }
    }
}

impl From<&FileInfo> for FileInfoDto {
    fn from(info: &FileInfo) -> Self {
        FileInfoDto {
            path: info.path.clone(),
            is_dir: info.is_dir,
            file_size: info.file_size.and_then(|s| i64::try_from(s).ok()),
        }
    }
}

fn later_metric(a: &MetricDto, b: &MetricDto) -> Ordering {
    (a.step.unwrap_or(0), a.timestamp.unwrap_or(0))
        .cmp(&(b.step.unwrap_or(0), b.timestamp.unwrap_or(0)))
}

/// Queries a tracking server
#[derive(Debug, Clone)]
pub struct RestStore {
    base_url: String,
    client: reqwest::Client,
}

impl RestStore {
    /// Create a client for the server at `base_url` (trailing slash ignored)
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Transport {
                url: base_url.to_string(),
                message: e.to_string(),
            })?;
        Ok(RestStore {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, StoreError> {
        let raw = format!("{}{}/{}", self.base_url, API_PREFIX, path);
        Url::parse_with_params(&raw, query).map_err(|e| StoreError::Transport {
            url: raw,
            message: e.to_string(),
        })
    }

    async fn send(
        &self,
        method: &'static str,
        request: reqwest::RequestBuilder,
        url: &Url,
    ) -> Result<(StatusCode, String), StoreError> {
        debug!(method, url = %url, "tracking API request");
        let response = request.send().await.map_err(|e| StoreError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|e| StoreError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        Ok((status, body))
    }

    fn decode<T: DeserializeOwned>(
        method: &'static str,
        url: &Url,
        status: StatusCode,
        body: String,
    ) -> Result<T, StoreError> {
        if !status.is_success() {
            return Err(StoreError::Http {
                method,
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|e| {
            StoreError::corrupt(url, format!("unexpected response body ({}): {}", e, body))
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, StoreError> {
        let url = self.endpoint(path, query)?;
        let (status, body) = self.send("GET", self.client.get(url.clone()), &url).await?;
        Self::decode("GET", &url, status, body)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        payload: &B,
    ) -> Result<T, StoreError> {
        let url = self.endpoint(path, &[])?;
        let request = self.client.post(url.clone()).json(payload);
        let (status, body) = self.send("POST", request, &url).await?;
        Self::decode("POST", &url, status, body)
    }
}

/// Whether an error body says the entity does not exist
fn is_missing(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::NOT_FOUND {
        return true;
    }
    serde_json::from_str::<ErrorDto>(body)
        .map(|e| e.error_code == "RESOURCE_DOES_NOT_EXIST")
        .unwrap_or(false)
}

#[async_trait]
impl TrackingStore for RestStore {
    fn describe(&self) -> String {
        self.base_url.clone()
    }

    async fn get_experiment(&self, experiment_id: &str) -> Result<Experiment, StoreError> {
        let response: GetExperimentResponse = self
            .get("experiments/get", &[("experiment_id", experiment_id)])
            .await?;
        Ok(response.experiment.into())
    }

    async fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>, StoreError> {
        let url = self.endpoint("experiments/get-by-name", &[("experiment_name", name)])?;
        let (status, body) = self.send("GET", self.client.get(url.clone()), &url).await?;
        if !status.is_success() && is_missing(status, &body) {
            return Ok(None);
        }
        let response: GetExperimentResponse = Self::decode("GET", &url, status, body)?;
        Ok(Some(response.experiment.into()))
    }

    async fn search_runs(&self, experiment_ids: &[String]) -> Result<Vec<Run>, StoreError> {
        let mut runs = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let request = SearchRunsRequest {
                experiment_ids: experiment_ids.to_vec(),
                max_results: Some(SEARCH_PAGE_SIZE),
                page_token: page_token.take(),
            };
            let response: SearchRunsResponse = self.post("runs/search", &request).await?;
            runs.extend(response.runs.into_iter().map(Run::from));

            match response.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(runs)
    }

    async fn list_artifacts(&self, run_id: &str) -> Result<Vec<FileInfo>, StoreError> {
        let response: ListArtifactsResponse =
            self.get("artifacts/list", &[("run_id", run_id)]).await?;
        let mut files: Vec<FileInfo> = response.files.into_iter().map(FileInfo::from).collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }
}
