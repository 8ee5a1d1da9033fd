//! Verifier integration tests
//!
//! The same recorded runs are checked through both query paths: reading the
//! file store directly and asking a tracking server over HTTP. Both must
//! reach the same verdict.

use std::time::Duration;

use tracking_conformance::store::{open_store, FileStore, TrackingStore};
use tracking_conformance::testing::{write_file_store_run, TrackingTestServer};
use tracking_conformance::verify::{BackendVerifier, VerifyError};
use tracking_conformance::workload::{MetricPoint, WorkloadSpec};
use tracking_conformance::TrackingTarget;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

async fn verify_both_ways(
    root: &std::path::Path,
) -> (Result<(), VerifyError>, Result<(), VerifyError>) {
    let expected = WorkloadSpec::canonical().expected_run();

    let file_store = FileStore::new(root);
    let direct = BackendVerifier::new(&file_store, &expected)
        .verify()
        .await
        .map(|_| ());

    let server = TrackingTestServer::start(root).await.unwrap();
    let rest = open_store(server.target(), QUERY_TIMEOUT).unwrap();
    let over_http = BackendVerifier::new(rest.as_ref(), &expected)
        .verify()
        .await
        .map(|_| ());
    server.shutdown();

    (direct, over_http)
}

#[tokio::test]
async fn test_canonical_run_passes_in_both_modes() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("mlruns");
    write_file_store_run(&root, &WorkloadSpec::canonical(), "run1").unwrap();

    let (direct, over_http) = verify_both_ways(&root).await;
    direct.unwrap();
    over_http.unwrap();
}

#[tokio::test]
async fn test_wrong_values_are_reported_in_both_modes() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("mlruns");

    let mut spec = WorkloadSpec::canonical();
    // Off-by-one client: logs i instead of i + 1
    for point in spec.metrics.get_mut("metric0").unwrap() {
        point.value -= 1.0;
    }
    spec.params.insert("param0".to_string(), "value1".to_string());
    write_file_store_run(&root, &spec, "run1").unwrap();

    let (direct, over_http) = verify_both_ways(&root).await;
    for result in [direct, over_http] {
        let err = result.unwrap_err();
        let fields: Vec<&str> = err.mismatches().iter().map(|m| m.field.as_str()).collect();
        assert_eq!(fields, vec!["metrics.metric0", "params.param0"]);
        assert_eq!(err.mismatches()[0].observed.as_deref(), Some("9.0"));
    }
}

#[tokio::test]
async fn test_out_of_order_steps_report_highest_step() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("mlruns");

    let mut spec = WorkloadSpec::canonical();
    let points = spec.metrics.get_mut("metric0").unwrap();
    // The last write is not the highest step
    points.push(MetricPoint { step: 3, value: 42.0 });
    write_file_store_run(&root, &spec, "run1").unwrap();

    let (direct, over_http) = verify_both_ways(&root).await;
    direct.unwrap();
    over_http.unwrap();
}

#[tokio::test]
async fn test_duplicate_runs_fail_run_count() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("mlruns");
    write_file_store_run(&root, &WorkloadSpec::canonical(), "run1").unwrap();
    write_file_store_run(&root, &WorkloadSpec::canonical(), "run2").unwrap();

    let (direct, over_http) = verify_both_ways(&root).await;
    for result in [direct, over_http] {
        assert!(matches!(
            result,
            Err(VerifyError::RunCount {
                expected: 1,
                observed: 2,
                ..
            })
        ));
    }
}

#[tokio::test]
async fn test_extra_artifact_fails() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("mlruns");
    let run_dir = write_file_store_run(&root, &WorkloadSpec::canonical(), "run1").unwrap();
    std::fs::write(run_dir.join("artifacts/extra.txt"), "x").unwrap();

    let (direct, over_http) = verify_both_ways(&root).await;
    for result in [direct, over_http] {
        let err = result.unwrap_err();
        assert_eq!(err.mismatches().len(), 1);
        assert_eq!(err.mismatches()[0].field, "artifacts");
    }
}

#[tokio::test]
async fn test_missing_root_has_no_default_experiment() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("never-created");
    let expected = WorkloadSpec::canonical().expected_run();

    let store = FileStore::new(&root);
    let err = BackendVerifier::new(&store, &expected)
        .verify()
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::ExperimentMissing { .. }));
    assert!(!root.exists());
}

#[tokio::test]
async fn test_bootstrapped_store_without_runs() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("mlruns");
    let server = TrackingTestServer::start(&root).await.unwrap();
    let expected = WorkloadSpec::canonical().expected_run();

    let store = open_store(server.target(), QUERY_TIMEOUT).unwrap();
    let experiment = store.get_experiment("0").await.unwrap();
    assert_eq!(experiment.name, "Default");

    let err = BackendVerifier::new(store.as_ref(), &expected)
        .verify()
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::RunCount { observed: 0, .. }));
}

#[tokio::test]
async fn test_unreachable_server_is_store_error() {
    let port = tracking_conformance::backend::allocate_port().unwrap();
    let target = TrackingTarget::http("127.0.0.1", port).unwrap();
    let expected = WorkloadSpec::canonical().expected_run();

    let store = open_store(&target, Duration::from_secs(1)).unwrap();
    let err = BackendVerifier::new(store.as_ref(), &expected)
        .verify()
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::Store(_)));
}
