//! The fixed recording workload and the run it must produce
//!
//! Every client-under-test performs the same sequence of calls. The
//! expected backend state is derived from that sequence rather than
//! restated, so the two cannot drift apart.

use std::collections::BTreeMap;

/// Name of the experiment clients record into when none is chosen
pub const DEFAULT_EXPERIMENT_NAME: &str = "Default";
/// Id the default experiment is bootstrapped with
pub const DEFAULT_EXPERIMENT_ID: &str = "0";

/// One logged metric point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricPoint {
    pub step: i64,
    pub value: f64,
}

/// A file the client uploads as an artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSpec {
    /// Path relative to the run's artifact root
    pub path: String,
    pub contents: String,
}

/// The hard-coded sequence of tracking calls
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadSpec {
    /// Metric key to points, in the order they are logged
    pub metrics: BTreeMap<String, Vec<MetricPoint>>,
    pub tags: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
    pub artifacts: Vec<ArtifactSpec>,
}

impl WorkloadSpec {
    /// `metric0` = 1.0..=10.0 at steps 0..=9, `tag0`/`param0` = "value0",
    /// and `artifact0.txt` containing `hello`.
    pub fn canonical() -> Self {
        let points = (0..10)
            .map(|i| MetricPoint {
                step: i,
                value: (i + 1) as f64,
            })
            .collect();

        WorkloadSpec {
            metrics: BTreeMap::from([("metric0".to_string(), points)]),
            tags: BTreeMap::from([("tag0".to_string(), "value0".to_string())]),
            params: BTreeMap::from([("param0".to_string(), "value0".to_string())]),
            artifacts: vec![ArtifactSpec {
                path: "artifact0.txt".to_string(),
                contents: "hello\n".to_string(),
            }],
        }
    }

    /// The backend state this workload must leave behind
    pub fn expected_run(&self) -> ExpectedRun {
        let metrics = self
            .metrics
            .iter()
            .filter_map(|(key, points)| latest_point(points).map(|p| (key.clone(), p.value)))
            .collect();

        let mut artifact_paths: Vec<String> =
            self.artifacts.iter().map(|a| a.path.clone()).collect();
        artifact_paths.sort();

        ExpectedRun {
            experiment_name: DEFAULT_EXPERIMENT_NAME.to_string(),
            metrics,
            tags: self.tags.clone(),
            params: self.params.clone(),
            artifact_paths,
        }
    }
}

/// The point a backend reports as a metric's value: highest step wins,
/// later writes win ties.
fn latest_point(points: &[MetricPoint]) -> Option<&MetricPoint> {
    points
        .iter()
        .enumerate()
        .max_by_key(|(order, p)| (p.step, *order))
        .map(|(_, p)| p)
}

/// Assertion target for the verifier
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedRun {
    /// Experiment that must hold exactly one run
    pub experiment_name: String,
    /// Latest value per metric key
    pub metrics: BTreeMap<String, f64>,
    pub tags: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
    /// Exact, sorted top-level artifact listing
    pub artifact_paths: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_metric_points() {
        let spec = WorkloadSpec::canonical();
        let points = &spec.metrics["metric0"];
        assert_eq!(points.len(), 10);
        assert_eq!(points[0], MetricPoint { step: 0, value: 1.0 });
        assert_eq!(points[9], MetricPoint { step: 9, value: 10.0 });
    }

    #[test]
    fn test_expected_run_from_canonical() {
        let expected = WorkloadSpec::canonical().expected_run();
        assert_eq!(expected.experiment_name, "Default");
        assert_eq!(expected.metrics.get("metric0"), Some(&10.0));
        assert_eq!(expected.tags.get("tag0").map(String::as_str), Some("value0"));
        assert_eq!(expected.params.get("param0").map(String::as_str), Some("value0"));
        assert_eq!(expected.artifact_paths, vec!["artifact0.txt".to_string()]);
    }

    #[test]
    fn test_latest_point_prefers_step_over_write_order() {
        let points = [
            MetricPoint { step: 5, value: 1.0 },
            MetricPoint { step: 2, value: 2.0 },
            MetricPoint { step: 5, value: 3.0 },
        ];
        assert_eq!(latest_point(&points).map(|p| p.value), Some(3.0));
        assert_eq!(latest_point(&[]), None);
    }
}
