//! Read-only tracking HTTP API
//!
//! Serves the query endpoints the harness itself uses, answered from any
//! [`TrackingStore`]:
//! - `GET  /api/2.0/mlflow/experiments/get?experiment_id=`
//! - `GET  /api/2.0/mlflow/experiments/get-by-name?experiment_name=`
//! - `POST /api/2.0/mlflow/runs/search`
//! - `GET  /api/2.0/mlflow/artifacts/list?run_id=`
//!
//! Errors use the tracking server's `{error_code, message}` body.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::debug;

use crate::store::rest::{
    ErrorDto, ExperimentDto, FileInfoDto, GetExperimentResponse, ListArtifactsResponse, RunDto,
    SearchRunsRequest, SearchRunsResponse, API_PREFIX,
};
use crate::store::{StoreError, TrackingStore};

/// Store shared by all handlers
pub type SharedStore = Arc<dyn TrackingStore>;

/// Page size when the request does not choose one
const DEFAULT_MAX_RESULTS: i64 = 1000;

type ApiError = (StatusCode, Json<ErrorDto>);

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorDto {
            error_code: code.to_string(),
            message: message.into(),
        }),
    )
}

fn store_error(err: StoreError) -> ApiError {
    match err {
        StoreError::NotFound { .. } => {
            api_error(StatusCode::NOT_FOUND, "RESOURCE_DOES_NOT_EXIST", err.to_string())
        }
        other => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            other.to_string(),
        ),
    }
}

fn required(value: Option<String>, name: &str) -> Result<String, ApiError> {
    value.filter(|v| !v.is_empty()).ok_or_else(|| {
        api_error(
            StatusCode::BAD_REQUEST,
            "INVALID_PARAMETER_VALUE",
            format!("missing value for required parameter '{}'", name),
        )
    })
}

#[derive(Debug, Deserialize)]
pub struct ExperimentQuery {
    pub experiment_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExperimentByNameQuery {
    pub experiment_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ArtifactsQuery {
    pub run_id: Option<String>,
}

/// Create an axum router serving the query API from `store`
pub fn create_tracking_router(store: SharedStore) -> Router {
    Router::new()
        .route(
            &format!("{}/experiments/get", API_PREFIX),
            get(handle_get_experiment),
        )
        .route(
            &format!("{}/experiments/get-by-name", API_PREFIX),
            get(handle_get_experiment_by_name),
        )
        .route(&format!("{}/runs/search", API_PREFIX), post(handle_search_runs))
        .route(
            &format!("{}/artifacts/list", API_PREFIX),
            get(handle_list_artifacts),
        )
        .with_state(store)
}

/// Handle GET experiments/get
pub async fn handle_get_experiment(
    State(store): State<SharedStore>,
    Query(query): Query<ExperimentQuery>,
) -> Result<Json<GetExperimentResponse>, ApiError> {
    let id = required(query.experiment_id, "experiment_id")?;
    debug!(experiment_id = %id, "get experiment");
    let experiment = store.get_experiment(&id).await.map_err(store_error)?;
    Ok(Json(GetExperimentResponse {
        experiment: ExperimentDto::from(&experiment),
    }))
}

/// Handle GET experiments/get-by-name
pub async fn handle_get_experiment_by_name(
    State(store): State<SharedStore>,
    Query(query): Query<ExperimentByNameQuery>,
) -> Result<Json<GetExperimentResponse>, ApiError> {
    let name = required(query.experiment_name, "experiment_name")?;
    debug!(experiment_name = %name, "get experiment by name");
    match store.get_experiment_by_name(&name).await.map_err(store_error)? {
        Some(experiment) => Ok(Json(GetExperimentResponse {
            experiment: ExperimentDto::from(&experiment),
        })),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            "RESOURCE_DOES_NOT_EXIST",
            format!("Could not find experiment with name '{}'", name),
        )),
    }
}

/// Handle POST runs/search; `page_token` is the offset of the next page
pub async fn handle_search_runs(
    State(store): State<SharedStore>,
    Json(request): Json<SearchRunsRequest>,
) -> Result<Json<SearchRunsResponse>, ApiError> {
    let max_results = request.max_results.unwrap_or(DEFAULT_MAX_RESULTS);
    if max_results < 1 {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "INVALID_PARAMETER_VALUE",
            format!("invalid max_results {}", max_results),
        ));
    }
    let offset = match request.page_token.as_deref() {
        None | Some("") => 0,
        Some(token) => token.parse::<usize>().map_err(|_| {
            api_error(
                StatusCode::BAD_REQUEST,
                "INVALID_PARAMETER_VALUE",
                format!("invalid page token {:?}", token),
            )
        })?,
    };

    let runs = store
        .search_runs(&request.experiment_ids)
        .await
        .map_err(store_error)?;
    debug!(experiments = ?request.experiment_ids, total = runs.len(), offset, "search runs");

    let page_size = usize::try_from(max_results).unwrap_or(usize::MAX);
    let end = offset.saturating_add(page_size).min(runs.len());
    let page: Vec<RunDto> = runs
        .iter()
        .skip(offset)
        .take(end.saturating_sub(offset))
        .map(RunDto::from)
        .collect();
    let next_page_token = (end < runs.len()).then(|| end.to_string());

    Ok(Json(SearchRunsResponse {
        runs: page,
        next_page_token,
    }))
}

/// Handle GET artifacts/list (top level of the run's artifact root)
pub async fn handle_list_artifacts(
    State(store): State<SharedStore>,
    Query(query): Query<ArtifactsQuery>,
) -> Result<Json<ListArtifactsResponse>, ApiError> {
    let run_id = required(query.run_id, "run_id")?;
    debug!(run_id = %run_id, "list artifacts");
    let files = store.list_artifacts(&run_id).await.map_err(store_error)?;
    Ok(Json(ListArtifactsResponse {
        root_uri: None,
        files: files.iter().map(FileInfoDto::from).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileStore;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::fs;
    use std::path::Path;
    use tower::util::ServiceExt;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn store_with_runs(root: &Path, count: usize) -> SharedStore {
        FileStore::bootstrap(root).unwrap();
        for i in 0..count {
            let run_dir = root.join("0").join(format!("run{}", i));
            write(
                &run_dir.join("meta.yaml"),
                &format!("experiment_id: '0'\nrun_id: run{}\nstatus: 3\n", i),
            );
            write(&run_dir.join("metrics/metric0"), "1 10.0 9\n");
            write(&run_dir.join("artifacts/artifact0.txt"), "hello\n");
        }
        Arc::new(FileStore::new(root))
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn search_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/2.0/mlflow/runs/search")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_experiment_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_tracking_router(store_with_runs(dir.path(), 0));

        let response = app
            .oneshot(get_request("/api/2.0/mlflow/experiments/get?experiment_id=0"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let result: GetExperimentResponse = body_json(response).await;
        assert_eq!(result.experiment.name, "Default");
    }

    #[tokio::test]
    async fn test_unknown_experiment_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_tracking_router(store_with_runs(dir.path(), 0));

        let response = app
            .clone()
            .oneshot(get_request(
                "/api/2.0/mlflow/experiments/get-by-name?experiment_name=Other",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let error: ErrorDto = body_json(response).await;
        assert_eq!(error.error_code, "RESOURCE_DOES_NOT_EXIST");

        let response = app
            .oneshot(get_request("/api/2.0/mlflow/experiments/get?experiment_id=42"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_missing_parameter_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_tracking_router(store_with_runs(dir.path(), 0));

        let response = app
            .oneshot(get_request("/api/2.0/mlflow/artifacts/list"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_search_runs_paginates() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_tracking_router(store_with_runs(dir.path(), 3));

        let response = app
            .clone()
            .oneshot(search_request(r#"{"experiment_ids": ["0"], "max_results": 2}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let first: SearchRunsResponse = body_json(response).await;
        assert_eq!(first.runs.len(), 2);
        assert_eq!(first.next_page_token.as_deref(), Some("2"));

        let response = app
            .oneshot(search_request(
                r#"{"experiment_ids": ["0"], "max_results": 2, "page_token": "2"}"#,
            ))
            .await
            .unwrap();
        let second: SearchRunsResponse = body_json(response).await;
        assert_eq!(second.runs.len(), 1);
        assert_eq!(second.runs[0].info.run_id, "run2");
        assert!(second.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_list_artifacts_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_tracking_router(store_with_runs(dir.path(), 1));

        let response = app
            .oneshot(get_request("/api/2.0/mlflow/artifacts/list?run_id=run0"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let result: ListArtifactsResponse = body_json(response).await;
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].path, "artifact0.txt");
        assert_eq!(result.files[0].file_size, Some(6));
    }
}
