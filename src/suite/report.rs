//! Per-combination outcomes and the suite report

use std::fmt::Write as _;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use crate::core::{HarnessError, StorageMode};
use crate::verify::Mismatch;

/// Bumped whenever the JSON report layout changes
pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// Where a case stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Scratch directory creation
    Setup,
    /// Backend provisioning (port, helper, server readiness)
    Provision,
    /// Client-under-test run
    Workload,
    /// Backend queries and assertions
    Verify,
    /// Every step succeeded
    Complete,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Setup => "setup",
            Stage::Provision => "provision",
            Stage::Workload => "workload",
            Stage::Verify => "verify",
            Stage::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed,
}

/// Result of one (client, mode) combination
#[derive(Debug, Clone, Serialize)]
pub struct CaseReport {
    pub client: String,
    pub mode: StorageMode,
    pub outcome: Outcome,
    /// Last stage reached
    pub stage: Stage,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mismatches: Vec<Mismatch>,
    /// Scratch root left on disk, when kept
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<String>,
}

impl CaseReport {
    pub fn passed(client: &str, mode: StorageMode, duration_ms: u64) -> Self {
        CaseReport {
            client: client.to_string(),
            mode,
            outcome: Outcome::Passed,
            stage: Stage::Complete,
            duration_ms,
            message: None,
            mismatches: Vec::new(),
            scratch_dir: None,
        }
    }

    pub fn failed(
        client: &str,
        mode: StorageMode,
        stage: Stage,
        error: &HarnessError,
        duration_ms: u64,
    ) -> Self {
        let mismatches = match error {
            HarnessError::Verification(e) => e.mismatches().to_vec(),
            _ => Vec::new(),
        };
        CaseReport {
            client: client.to_string(),
            mode,
            outcome: Outcome::Failed,
            stage,
            duration_ms,
            message: Some(error.to_string()),
            mismatches,
            scratch_dir: None,
        }
    }

    pub fn is_passed(&self) -> bool {
        self.outcome == Outcome::Passed
    }

    /// `client/mode`, the sub-test name
    pub fn name(&self) -> String {
        format!("{}/{}", self.client, self.mode.label())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

/// Outcomes of every combination, in matrix order
#[derive(Debug, Clone, Default)]
pub struct SuiteReport {
    pub cases: Vec<CaseReport>,
}

#[derive(Serialize)]
struct ReportRef<'a> {
    schema_version: u32,
    summary: Summary,
    results: &'a [CaseReport],
}

impl SuiteReport {
    pub fn summary(&self) -> Summary {
        let passed = self.cases.iter().filter(|c| c.is_passed()).count();
        Summary {
            total: self.cases.len(),
            passed,
            failed: self.cases.len() - passed,
        }
    }

    /// True iff every combination passed (an empty matrix does not pass)
    pub fn all_passed(&self) -> bool {
        !self.cases.is_empty() && self.cases.iter().all(CaseReport::is_passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CaseReport> {
        self.cases.iter().filter(|c| !c.is_passed())
    }

    /// One line per combination, mismatches indented below, then a summary
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for case in &self.cases {
            let verdict = if case.is_passed() { "PASS" } else { "FAIL" };
            let _ = write!(
                out,
                "{} {} ({} ms)",
                verdict,
                case.name(),
                case.duration_ms
            );
            if !case.is_passed() {
                let _ = write!(out, " [{}]", case.stage.label());
            }
            out.push('\n');

            if case.mismatches.is_empty() {
                if let Some(message) = &case.message {
                    for line in message.lines() {
                        let _ = writeln!(out, "    {}", line);
                    }
                }
            } else {
                for mismatch in &case.mismatches {
                    let _ = writeln!(out, "    {}", mismatch);
                }
            }
            if let Some(dir) = &case.scratch_dir {
                let _ = writeln!(out, "    scratch: {}", dir);
            }
        }

        let summary = self.summary();
        let _ = writeln!(
            out,
            "{} combinations: {} passed, {} failed",
            summary.total, summary.passed, summary.failed
        );
        out
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        let report = ReportRef {
            schema_version: REPORT_SCHEMA_VERSION,
            summary: self.summary(),
            results: &self.cases,
        };
        serde_json::to_string_pretty(&report).context("format JSON report")
    }

    /// Write the JSON report to `path`, creating parent directories
    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let json = self.to_json()?;
        let file = fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", json).with_context(|| format!("write {}", path.display()))?;
        writer
            .flush()
            .with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::VerifyError;

    fn sample() -> SuiteReport {
        let mismatch = HarnessError::Verification(VerifyError::Mismatches(vec![Mismatch {
            field: "metrics.metric0".to_string(),
            expected: "10.0".to_string(),
            observed: Some("9.0".to_string()),
        }]));
        SuiteReport {
            cases: vec![
                CaseReport::passed("go", StorageMode::FileStore, 12),
                CaseReport::failed("go", StorageMode::HttpServer, Stage::Verify, &mismatch, 30),
            ],
        }
    }

    #[test]
    fn test_summary_and_all_passed() {
        let report = sample();
        assert_eq!(
            report.summary(),
            Summary {
                total: 2,
                passed: 1,
                failed: 1
            }
        );
        assert!(!report.all_passed());
        assert_eq!(report.failures().count(), 1);
        assert!(!SuiteReport::default().all_passed());
    }

    #[test]
    fn test_render_text_lists_each_case() {
        let text = sample().render_text();
        assert!(text.contains("PASS go/file (12 ms)"));
        assert!(text.contains("FAIL go/http (30 ms) [verify]"));
        assert!(text.contains("    metrics.metric0: expected 10.0, observed 9.0"));
        assert!(text.ends_with("2 combinations: 1 passed, 1 failed\n"));
    }

    #[test]
    fn test_json_report_is_stable_and_ordered() {
        let report = sample();
        let one = report.to_json().unwrap();
        let two = report.to_json().unwrap();
        assert_eq!(one, two);

        let value: serde_json::Value = serde_json::from_str(&one).unwrap();
        assert_eq!(value["schema_version"], REPORT_SCHEMA_VERSION);
        assert_eq!(value["results"][0]["mode"], "file_store");
        assert_eq!(value["results"][1]["stage"], "verify");
        assert_eq!(value["results"][1]["mismatches"][0]["observed"], "9.0");
        assert!(value["results"][0].get("message").is_none());

        let schema = one.find("\"schema_version\"").unwrap();
        let results = one.find("\"results\"").unwrap();
        assert!(schema < results);
    }

    #[test]
    fn test_write_json_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/report.json");
        sample().write_json(&path).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("\"summary\""));
    }
}
