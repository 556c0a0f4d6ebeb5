//! Canonical regression suite and sequential suite driver.
//!
//! Cases run strictly one after another: the restart run consumes state
//! written by the run before it, and several cases share the launcher's
//! processor slots. A case-local error is recorded against that case and the
//! driver moves on; the suite passes only when every run passes.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;

use aither_regress_error::{RegressError, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::case::{
    CaseReport, CaseRunOptions, CaseStatus, DEFAULT_LAUNCHER, DEFAULT_SOLVER, TestCase,
    TestCaseConfig,
};
use crate::comparator::DEFAULT_RELATIVE_TOLERANCE;
use crate::supervisor::CancelFlag;

/// Iteration budget of the full-length cases.
pub const ITERATIONS_FULL: u64 = 100;
/// Iteration budget of the short (turbulent) cases.
pub const ITERATIONS_SHORT: u64 = 20;
/// Iteration budget of the shock-tube restart run.
pub const ITERATIONS_RESTART: u64 = 50;
/// Restart state file consumed by the shock-tube restart run.
pub const SHOCK_TUBE_RESTART_FILE: &str = "shockTube_50.rst";

/// Operating system the suite targets; decides the processor budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TargetOs {
    #[default]
    #[serde(rename = "linux")]
    Linux,
    #[serde(rename = "macOS")]
    MacOs,
    #[serde(rename = "windows")]
    Windows,
}

impl TargetOs {
    /// Largest processor count any case may use on this platform.
    #[must_use]
    pub const fn max_processors(self) -> u32 {
        match self {
            Self::Linux | Self::Windows => 2,
            Self::MacOs => 1,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::MacOs => "macOS",
            Self::Windows => "windows",
        }
    }
}

/// Settings shared by every case of the canonical suite.
#[derive(Debug, Clone, PartialEq)]
pub struct SuiteOptions {
    pub solver_path: PathBuf,
    pub launcher_path: Option<PathBuf>,
    pub target_os: TargetOs,
    pub tolerance: f64,
}

impl Default for SuiteOptions {
    fn default() -> Self {
        Self {
            solver_path: PathBuf::from(DEFAULT_SOLVER),
            launcher_path: Some(PathBuf::from(DEFAULT_LAUNCHER)),
            target_os: TargetOs::default(),
            tolerance: DEFAULT_RELATIVE_TOLERANCE,
        }
    }
}

/// Ordered list of runs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegressionSuite {
    pub cases: Vec<TestCaseConfig>,
}

impl RegressionSuite {
    #[must_use]
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Keep only the runs of the named cases, in suite order.
    ///
    /// A name matches a case name (which selects its restart run as well) or
    /// a run id.
    ///
    /// # Errors
    ///
    /// Returns [`RegressError::InvalidConfig`] naming the first unknown case.
    pub fn select(&self, names: &[String]) -> Result<Self> {
        if names.is_empty() {
            return Ok(self.clone());
        }
        for name in names {
            let known = self
                .cases
                .iter()
                .any(|config| config.name() == name.as_str() || config.run_id() == *name);
            if !known {
                return Err(RegressError::invalid_config(
                    name.clone(),
                    "not part of the regression suite",
                ));
            }
        }
        let cases = self
            .cases
            .iter()
            .filter(|config| {
                names
                    .iter()
                    .any(|name| config.name() == name.as_str() || config.run_id() == *name)
            })
            .cloned()
            .collect();
        Ok(Self { cases })
    }
}

fn processor_dependent(processors: u32, two_procs: &[f64], one_proc: &[f64]) -> Vec<f64> {
    if processors == 2 {
        two_procs.to_vec()
    } else {
        one_proc.to_vec()
    }
}

/// The solver's canonical regression suite: 13 runs in a fixed order.
#[must_use]
pub fn canonical_regression_suite(options: &SuiteOptions) -> RegressionSuite {
    let max_procs = options.target_os.max_processors();
    let base = |name: &str| {
        TestCaseConfig::new(name)
            .with_run_directory(name)
            .with_solver_path(options.solver_path.clone())
            .with_launcher_path(options.launcher_path.clone())
            .with_tolerance(options.tolerance)
    };

    let shock_tube = base("shockTube")
        .with_processors(1)
        .with_iterations(ITERATIONS_FULL)
        .with_expected_residuals([5.0503e-1, 4.4569e-1, 1.0e0, 1.0e0, 2.6181e-1])
        .with_ignored_indices([2, 3]);
    let shock_tube_restart = shock_tube.with_restart(ITERATIONS_RESTART, SHOCK_TUBE_RESTART_FILE);

    let cases = vec![
        // laminar, inviscid, lu-sgs
        base("subsonicCylinder")
            .with_processors(1)
            .with_iterations(ITERATIONS_FULL)
            .with_expected_residuals([1.5371e-1, 1.4991e-1, 1.5910e-1, 8.2250e-1, 1.5297e-1])
            .with_ignored_indices([3]),
        // multi-block, ausmpw+
        base("multiblockCylinder")
            .with_processors(max_procs)
            .with_iterations(ITERATIONS_FULL)
            .with_expected_residuals([2.3117e-1, 2.5907e-1, 4.0735e-1, 1.0640e0, 2.2955e-1])
            .with_ignored_indices([3]),
        // bdf2, weno
        shock_tube,
        shock_tube_restart,
        // explicit euler
        base("supersonicWedge")
            .with_processors(1)
            .with_iterations(ITERATIONS_FULL)
            .with_expected_residuals([4.1813e-1, 4.2549e-1, 3.6525e-1, 3.9971e-1, 4.0998e-1])
            .with_ignored_indices([3]),
        // dplur
        base("transonicBump")
            .with_processors(1)
            .with_iterations(ITERATIONS_FULL)
            .with_expected_residuals([1.1839e-1, 6.8615e-2, 8.4925e-2, 1.0000e0, 9.9669e-2])
            .with_ignored_indices([3]),
        base("viscousFlatPlate")
            .with_processors(max_procs)
            .with_iterations(ITERATIONS_FULL)
            .with_expected_residuals(processor_dependent(
                max_procs,
                &[7.7239e-2, 2.4713e-1, 5.6557e-2, 8.4112e-1, 7.9342e-2],
                &[7.6467e-2, 2.4714e-1, 4.0109e-2, 8.3161e-1, 7.9240e-2],
            ))
            .with_ignored_indices([3]),
        // k-w wilcox
        base("turbFlatPlate")
            .with_processors(max_procs)
            .with_iterations(ITERATIONS_SHORT)
            .with_expected_residuals(processor_dependent(
                max_procs,
                &[2.2326e-1, 2.9704e-1, 4.5442e-1, 2.4928e-1, 2.1792e-1, 7.9769e-7, 2.3288e-4],
                &[2.1828e-1, 2.9702e-1, 4.5628e-1, 2.4928e-1, 2.1361e-1, 7.9753e-7, 2.3287e-4],
            ))
            .with_ignored_indices([2]),
        // k-w sst, c-grid
        base("rae2822")
            .with_processors(max_procs)
            .with_iterations(ITERATIONS_SHORT)
            .with_expected_residuals(processor_dependent(
                max_procs,
                &[5.5472e-1, 7.2623e-1, 5.0035e-1, 4.8794e-1, 4.9827e-1, 2.4542e-5, 9.3450e-5],
                &[5.5195e-1, 7.2220e-1, 5.0410e-1, 6.9139e-1, 4.9487e-1, 2.4542e-5, 9.2871e-5],
            ))
            .with_ignored_indices([3]),
        // periodic bcs, moving isothermal wall
        base("couette")
            .with_processors(1)
            .with_iterations(ITERATIONS_FULL)
            .with_expected_residuals([1.1343e-1, 5.0725e-1, 7.4086e-2, 4.7218e-1, 2.2789e-1])
            .with_ignored_indices([3]),
        // wall law bc, blusgs
        base("wallLaw")
            .with_processors(max_procs)
            .with_iterations(ITERATIONS_SHORT)
            .with_expected_residuals(processor_dependent(
                max_procs,
                &[8.1949e-1, 1.0542e-1, 1.3522e-1, 9.2939e-1, 8.5213e-1, 6.0529e-2, 6.7596e-5],
                &[8.1310e-1, 1.0392e-1, 1.3302e-1, 9.2927e-1, 8.4532e-1, 6.0527e-2, 6.7585e-5],
            ))
            .with_ignored_indices([1]),
        base("thermallyPerfect")
            .with_processors(max_procs)
            .with_iterations(ITERATIONS_SHORT)
            .with_expected_residuals(processor_dependent(
                max_procs,
                &[5.8862e-1, 3.8007e-1, 4.9681e-1, 8.4268e-3, 6.0802e-1, 3.5653e-2, 1.4414e-2],
                &[5.8862e-1, 3.8007e-1, 4.9681e-1, 1.9063e-3, 6.0803e-1, 3.5651e-2, 1.4414e-2],
            ))
            .with_ignored_indices([3]),
        // all 8 block-to-block orientations
        base("uniformFlow")
            .with_processors(1)
            .with_iterations(ITERATIONS_SHORT)
            .with_expected_residuals([
                2.6167e-1, 3.2443e-1, 1.8594e-1, 1.8633e-1, 2.5828e-1, 7.7757e-9, 2.4621e-9,
            ]),
    ];

    RegressionSuite { cases }
}

/// Validate a suite, returning a deterministic list of problems.
#[must_use]
pub fn validate_suite(suite: &RegressionSuite) -> Vec<String> {
    let mut diagnostics = Vec::new();
    if suite.is_empty() {
        diagnostics.push("suite_empty".to_owned());
    }
    let mut seen = BTreeSet::new();
    for config in &suite.cases {
        let run_id = config.run_id();
        if !seen.insert(run_id.clone()) {
            diagnostics.push(format!("duplicate_run_id run_id={run_id}"));
        }
        for problem in config.diagnostics() {
            diagnostics.push(format!("case={run_id} {problem}"));
        }
    }
    diagnostics
}

/// One run as it would be launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedRun {
    pub run_id: String,
    pub run_directory: PathBuf,
    pub iterations: u64,
    pub command: String,
}

/// Describe every run without touching the filesystem.
#[must_use]
pub fn plan_suite(suite: &RegressionSuite, options: &CaseRunOptions) -> Vec<PlannedRun> {
    suite
        .cases
        .iter()
        .map(|config| PlannedRun {
            run_id: config.run_id(),
            run_directory: options.run_dir_for(config),
            iterations: config.iterations(),
            command: config.launch_command().render(),
        })
        .collect()
}

/// Per-run reports of a suite execution.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SuiteSummary {
    pub reports: Vec<CaseReport>,
    /// Runs never started because the suite was cancelled.
    pub skipped: Vec<String>,
}

impl SuiteSummary {
    /// Logical AND over every run's pass vector.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.skipped.is_empty() && self.reports.iter().all(CaseReport::passed)
    }

    #[must_use]
    pub fn count(&self, status: CaseStatus) -> usize {
        self.reports
            .iter()
            .filter(|report| report.status == status)
            .count()
    }

    /// Process exit status: 0 when every run passed, 1 otherwise.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.all_passed())
    }
}

/// Run every case of `suite` in order, printing summaries to `out`.
///
/// # Errors
///
/// Returns [`RegressError::InvalidConfig`] when the suite fails validation
/// (nothing is run) and propagates errors that are not local to a case.
pub fn run_suite<W: Write>(
    suite: &RegressionSuite,
    options: &CaseRunOptions,
    out: &mut W,
) -> Result<SuiteSummary> {
    let diagnostics = validate_suite(suite);
    if !diagnostics.is_empty() {
        return Err(RegressError::invalid_config("suite", diagnostics.join("; ")));
    }

    info!(
        runs = suite.len(),
        tests_root = %options.tests_root.display(),
        "regression suite starting"
    );
    let mut summary = SuiteSummary::default();
    for config in &suite.cases {
        let cancelled = options
            .supervisor
            .cancel
            .as_ref()
            .is_some_and(CancelFlag::is_cancelled);
        if cancelled {
            warn!(case = %config.run_id(), "suite cancelled, skipping run");
            summary.skipped.push(config.run_id());
            continue;
        }

        let mut case = TestCase::new(config.clone());
        match case.run(options, out) {
            Ok(report) => summary.reports.push(report),
            Err(err) if err.is_case_local() => {
                error!(case = %config.run_id(), kind = ?err.kind(), error = %err, "case errored");
                let run_dir = options.run_dir_for(config);
                summary
                    .reports
                    .push(CaseReport::errored(config, &run_dir, &err));
            }
            Err(err) => return Err(err),
        }
    }

    if summary.all_passed() {
        writeln!(out, "All tests passed!")?;
    } else {
        writeln!(out, "ERROR: Some tests failed")?;
    }
    info!(
        passed = summary.count(CaseStatus::Passed),
        failed = summary.count(CaseStatus::Failed),
        errored = summary.count(CaseStatus::Errored),
        skipped = summary.skipped.len(),
        "regression suite finished"
    );
    Ok(summary)
}
