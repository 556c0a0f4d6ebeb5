//! Regression harness for the aither flow solver.
//!
//! Drives each regression case through the same steps: rewrite the input
//! deck's iteration directives, launch the solver under a launcher, wait for
//! it with heartbeats and an optional deadline, read the final residuals, and
//! compare them against reference values with a relative tolerance.
//!
//! Every operation takes its working directory explicitly.

pub mod case;
pub mod comparator;
pub mod input;
pub mod report;
pub mod residuals;
pub mod suite;
pub mod supervisor;

pub use case::{CaseReport, CaseRunOptions, CaseStatus, TestCase, TestCaseConfig};
pub use comparator::{ComparisonResult, MetricComparison, compare_residuals};
pub use report::{SuiteReport, read_suite_report_json, write_suite_report_json};
pub use suite::{
    PlannedRun, RegressionSuite, SuiteOptions, SuiteSummary, TargetOs, canonical_regression_suite,
    plan_suite, run_suite, validate_suite,
};
pub use supervisor::{CancelFlag, LaunchCommand, RunOutcome, SupervisorOptions, Termination};
