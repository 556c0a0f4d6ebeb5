//! Machine-readable suite report.

use std::fs;
use std::path::Path;

use aither_regress_error::{RegressError, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::case::{CaseReport, CaseStatus};
use crate::suite::{SuiteOptions, SuiteSummary, TargetOs};

/// Version of the JSON layout written by [`write_suite_report_json`].
pub const SUITE_REPORT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub schema_version: u32,
    pub target_os: TargetOs,
    pub solver_path: String,
    pub launcher_path: Option<String>,
    pub tolerance: f64,
    pub all_passed: bool,
    pub total_runs: usize,
    pub passed_runs: usize,
    pub failed_runs: usize,
    pub errored_runs: usize,
    pub skipped_runs: Vec<String>,
    pub cases: Vec<CaseReport>,
}

impl SuiteReport {
    #[must_use]
    pub fn from_summary(options: &SuiteOptions, summary: &SuiteSummary) -> Self {
        Self {
            schema_version: SUITE_REPORT_SCHEMA_VERSION,
            target_os: options.target_os,
            solver_path: options.solver_path.to_string_lossy().into_owned(),
            launcher_path: options
                .launcher_path
                .as_ref()
                .map(|path| path.to_string_lossy().into_owned()),
            tolerance: options.tolerance,
            all_passed: summary.all_passed(),
            total_runs: summary.reports.len() + summary.skipped.len(),
            passed_runs: summary.count(CaseStatus::Passed),
            failed_runs: summary.count(CaseStatus::Failed),
            errored_runs: summary.count(CaseStatus::Errored),
            skipped_runs: summary.skipped.clone(),
            cases: summary.reports.clone(),
        }
    }
}

/// Write `report` as pretty-printed JSON.
///
/// # Errors
///
/// Returns [`RegressError::Report`] on serialization or write failure.
pub fn write_suite_report_json(path: &Path, report: &SuiteReport) -> Result<()> {
    let payload = serde_json::to_string_pretty(report)
        .map_err(|error| RegressError::report(format!("suite_report_serialize_failed: {error}")))?;
    fs::write(path, payload).map_err(|error| {
        RegressError::report(format!(
            "suite_report_write_failed path={} error={error}",
            path.display()
        ))
    })?;
    info!(path = %path.display(), runs = report.total_runs, "suite report written");
    Ok(())
}

/// Read a report written by [`write_suite_report_json`].
///
/// # Errors
///
/// Returns [`RegressError::Report`] when the file is unreadable or malformed.
pub fn read_suite_report_json(path: &Path) -> Result<SuiteReport> {
    let payload = fs::read_to_string(path).map_err(|error| {
        RegressError::report(format!(
            "suite_report_read_failed path={} error={error}",
            path.display()
        ))
    })?;
    serde_json::from_str(&payload)
        .map_err(|error| RegressError::report(format!("suite_report_parse_failed: {error}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::case::TestCaseConfig;

    fn sample_summary() -> SuiteSummary {
        let config = TestCaseConfig::new("couette").with_ignored_indices([3]);
        let errored = CaseReport::errored(
            &config,
            Path::new("testCases/couette"),
            &RegressError::InputFileMissing {
                path: "testCases/couette/couette.inp".into(),
            },
        );
        SuiteSummary {
            reports: vec![errored],
            skipped: vec!["wallLaw".to_owned()],
        }
    }

    #[test]
    fn counts_follow_summary() {
        let report = SuiteReport::from_summary(&SuiteOptions::default(), &sample_summary());
        assert_eq!(report.schema_version, SUITE_REPORT_SCHEMA_VERSION);
        assert!(!report.all_passed);
        assert_eq!(report.total_runs, 2);
        assert_eq!(report.errored_runs, 1);
        assert_eq!(report.passed_runs, 0);
        assert_eq!(report.launcher_path.as_deref(), Some("mpirun"));
    }

    #[test]
    fn json_uses_readable_names() {
        let report = SuiteReport::from_summary(
            &SuiteOptions {
                target_os: TargetOs::MacOs,
                ..SuiteOptions::default()
            },
            &sample_summary(),
        );
        let value = serde_json::to_value(&report).expect("serialize");
        assert_eq!(value["target_os"], "macOS");
        assert_eq!(value["cases"][0]["status"], "errored");
        assert_eq!(value["cases"][0]["run_id"], "couette");
        assert_eq!(
            value["cases"][0]["comparison"]["metrics"]
                .as_array()
                .map(Vec::len),
            Some(4)
        );
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("summary.json");
        let report = SuiteReport::from_summary(&SuiteOptions::default(), &sample_summary());
        write_suite_report_json(&path, &report).expect("write");
        let loaded = read_suite_report_json(&path).expect("read");
        assert_eq!(loaded, report);
    }

    #[test]
    fn unwritable_path_is_report_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing").join("summary.json");
        let report = SuiteReport::from_summary(&SuiteOptions::default(), &sample_summary());
        let err = write_suite_report_json(&path, &report).expect_err("no parent dir");
        assert!(matches!(err, RegressError::Report { .. }));
        assert!(!err.is_case_local());
    }
}
