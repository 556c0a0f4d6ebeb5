//! Regression case configuration and execution lifecycle.
//!
//! A case run walks `Created -> Executing -> {Passed, Failed, Errored}`:
//! rewrite the input deck, launch the solver under supervision, read the
//! final residuals, compare them, and print a human-readable summary. All
//! paths are resolved against an explicit tests root; the process working
//! directory is never changed.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use aither_regress_error::{RegressError, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::comparator::{ComparisonResult, DEFAULT_RELATIVE_TOLERANCE, compare_residuals};
use crate::input::{input_file_name, rewrite_input_file};
use crate::residuals::read_last_residuals;
use crate::supervisor::{
    LaunchCommand, RunOutcome, SupervisorOptions, Termination, elapsed_ms_u64, format_elapsed,
    run_supervised,
};

/// Default iteration budget for a case.
pub const DEFAULT_ITERATIONS: u64 = 100;
/// Default solver executable.
pub const DEFAULT_SOLVER: &str = "aither";
/// Default distributed-run launcher.
pub const DEFAULT_LAUNCHER: &str = "mpirun";

const BANNER_RULE: &str = "----------";

/// Immutable configuration of one regression run.
///
/// Built with the `with_*` methods; a restart run is derived with
/// [`TestCaseConfig::with_restart`], which leaves the source untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseConfig {
    name: String,
    iterations: u64,
    processors: u32,
    expected_residuals: Vec<f64>,
    ignored_indices: BTreeSet<usize>,
    run_directory: PathBuf,
    solver_path: PathBuf,
    launcher_path: Option<PathBuf>,
    tolerance: f64,
    restart_file: Option<String>,
}

impl TestCaseConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            iterations: DEFAULT_ITERATIONS,
            processors: 1,
            expected_residuals: vec![1.0; 5],
            ignored_indices: BTreeSet::new(),
            run_directory: PathBuf::from("."),
            solver_path: PathBuf::from(DEFAULT_SOLVER),
            launcher_path: Some(PathBuf::from(DEFAULT_LAUNCHER)),
            tolerance: DEFAULT_RELATIVE_TOLERANCE,
            restart_file: None,
        }
    }

    #[must_use]
    pub fn with_iterations(mut self, iterations: u64) -> Self {
        self.iterations = iterations;
        self
    }

    #[must_use]
    pub fn with_processors(mut self, processors: u32) -> Self {
        self.processors = processors;
        self
    }

    #[must_use]
    pub fn with_expected_residuals(mut self, residuals: impl Into<Vec<f64>>) -> Self {
        self.expected_residuals = residuals.into();
        self
    }

    #[must_use]
    pub fn with_ignored_indices(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.ignored_indices = indices.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_run_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run_directory = dir.into();
        self
    }

    #[must_use]
    pub fn with_solver_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.solver_path = path.into();
        self
    }

    /// `None` runs the solver without a launcher.
    #[must_use]
    pub fn with_launcher_path(mut self, path: Option<PathBuf>) -> Self {
        self.launcher_path = path;
        self
    }

    #[must_use]
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Derive a restart run of this case.
    ///
    /// Only the iteration budget and restart fields change; expectations,
    /// ignored indices and paths carry over.
    #[must_use]
    pub fn with_restart(&self, iterations: u64, restart_file: impl Into<String>) -> Self {
        Self {
            iterations,
            restart_file: Some(restart_file.into()),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifier unique within a suite: the case name, suffixed for restarts.
    #[must_use]
    pub fn run_id(&self) -> String {
        if self.is_restart() {
            format!("{}_restart", self.name)
        } else {
            self.name.clone()
        }
    }

    #[must_use]
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    #[must_use]
    pub fn processors(&self) -> u32 {
        self.processors
    }

    #[must_use]
    pub fn expected_residuals(&self) -> &[f64] {
        &self.expected_residuals
    }

    #[must_use]
    pub fn ignored_indices(&self) -> &BTreeSet<usize> {
        &self.ignored_indices
    }

    #[must_use]
    pub fn run_directory(&self) -> &Path {
        &self.run_directory
    }

    #[must_use]
    pub fn solver_path(&self) -> &Path {
        &self.solver_path
    }

    #[must_use]
    pub fn launcher_path(&self) -> Option<&Path> {
        self.launcher_path.as_deref()
    }

    #[must_use]
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    #[must_use]
    pub fn is_restart(&self) -> bool {
        self.restart_file.is_some()
    }

    #[must_use]
    pub fn restart_file(&self) -> Option<&str> {
        self.restart_file.as_deref()
    }

    /// Number of metrics that take part in pass/fail.
    #[must_use]
    pub fn tracked_metric_count(&self) -> usize {
        (0..self.expected_residuals.len())
            .filter(|index| !self.ignored_indices.contains(index))
            .count()
    }

    /// Solver invocation for this configuration.
    #[must_use]
    pub fn launch_command(&self) -> LaunchCommand {
        LaunchCommand {
            launcher: self.launcher_path.clone(),
            processors: self.processors,
            solver: self.solver_path.clone(),
            input_file: input_file_name(&self.name),
            restart_file: self.restart_file.clone(),
            output_file: format!("{}.out", self.name),
        }
    }

    /// Invariant violations, in a deterministic order.
    #[must_use]
    pub fn diagnostics(&self) -> Vec<String> {
        let mut diagnostics = Vec::new();
        if self.name.trim().is_empty() {
            diagnostics.push("case_name_empty".to_owned());
        }
        if self.expected_residuals.is_empty() {
            diagnostics.push("expected_residuals_empty".to_owned());
        }
        if self.processors == 0 {
            diagnostics.push("processors_zero".to_owned());
        }
        if !(self.tolerance.is_finite() && self.tolerance >= 0.0) {
            diagnostics.push(format!("tolerance_invalid value={}", self.tolerance));
        }
        let metric_count = self.expected_residuals.len();
        for &index in &self.ignored_indices {
            if index >= metric_count {
                diagnostics.push(format!(
                    "ignored_index_out_of_range index={index} metrics={metric_count}"
                ));
            }
        }
        for (index, &value) in self.expected_residuals.iter().enumerate() {
            if self.ignored_indices.contains(&index) {
                continue;
            }
            if !value.is_normal() || value < 0.0 {
                diagnostics.push(format!(
                    "expected_residual_unusable index={index} value={value}"
                ));
            }
        }
        if self
            .restart_file
            .as_deref()
            .is_some_and(|file| file.trim().is_empty())
        {
            diagnostics.push("restart_file_empty".to_owned());
        }
        diagnostics
    }

    /// Check the configuration invariants.
    ///
    /// # Errors
    ///
    /// Returns [`RegressError::InvalidConfig`] listing every violation.
    pub fn validate(&self) -> Result<()> {
        let diagnostics = self.diagnostics();
        if diagnostics.is_empty() {
            return Ok(());
        }
        Err(RegressError::invalid_config(
            self.run_id(),
            diagnostics.join(", "),
        ))
    }
}

/// Lifecycle state of a [`TestCase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Created,
    Executing,
    Passed,
    Failed,
    Errored,
}

/// Settings shared by every case of a run.
#[derive(Debug, Clone)]
pub struct CaseRunOptions {
    /// Base directory that case run directories are resolved against.
    pub tests_root: PathBuf,
    pub supervisor: SupervisorOptions,
}

impl Default for CaseRunOptions {
    fn default() -> Self {
        Self {
            tests_root: PathBuf::from("."),
            supervisor: SupervisorOptions::default(),
        }
    }
}

impl CaseRunOptions {
    /// Absolute-or-relative run directory of `config` under the tests root.
    #[must_use]
    pub fn run_dir_for(&self, config: &TestCaseConfig) -> PathBuf {
        self.tests_root.join(config.run_directory())
    }
}

/// Outcome of one case run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseReport {
    pub run_id: String,
    pub case_name: String,
    pub run_directory: String,
    pub command: String,
    pub status: CaseStatus,
    pub exit_code: Option<i32>,
    pub termination: Option<Termination>,
    pub elapsed_ms: u64,
    pub comparison: ComparisonResult,
    pub reason: Option<String>,
}

impl CaseReport {
    /// Report for a case that could not complete.
    ///
    /// Every tracked metric is recorded as failed.
    #[must_use]
    pub fn errored(config: &TestCaseConfig, run_dir: &Path, error: &RegressError) -> Self {
        let comparison = compare_residuals(
            &[],
            config.expected_residuals(),
            config.ignored_indices(),
            None,
            config.tolerance(),
        );
        Self {
            run_id: config.run_id(),
            case_name: config.name().to_owned(),
            run_directory: run_dir.to_string_lossy().into_owned(),
            command: config.launch_command().render(),
            status: CaseStatus::Errored,
            exit_code: None,
            termination: None,
            elapsed_ms: 0,
            comparison,
            reason: Some(error.to_string()),
        }
    }

    #[must_use]
    pub fn passed_flags(&self) -> Vec<bool> {
        self.comparison.passed_flags()
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.status == CaseStatus::Passed
    }
}

/// One regression case and its lifecycle state.
#[derive(Debug, Clone)]
pub struct TestCase {
    config: TestCaseConfig,
    status: CaseStatus,
}

impl TestCase {
    #[must_use]
    pub fn new(config: TestCaseConfig) -> Self {
        Self {
            config,
            status: CaseStatus::Created,
        }
    }

    #[must_use]
    pub fn config(&self) -> &TestCaseConfig {
        &self.config
    }

    #[must_use]
    pub fn status(&self) -> CaseStatus {
        self.status
    }

    /// Execute the case and print its summary to `out`.
    ///
    /// # Errors
    ///
    /// Returns an error (and leaves the case `Errored`) when the
    /// configuration is invalid, the input deck is missing, the solver cannot
    /// be launched, or a cleanly-exited solver left an unreadable residual log.
    pub fn run<W: Write>(&mut self, options: &CaseRunOptions, out: &mut W) -> Result<CaseReport> {
        self.status = CaseStatus::Executing;
        let run_dir = options.run_dir_for(&self.config);
        writeln!(
            out,
            "{BANNER_RULE} Starting Test: {} {BANNER_RULE}",
            self.config.run_id()
        )?;
        writeln!(out, "Current directory: {}", run_dir.display())?;

        let result = execute_case(&self.config, &run_dir, options, out);
        match &result {
            Ok(report) => {
                self.status = report.status;
            }
            Err(error) => {
                self.status = CaseStatus::Errored;
                warn!(case = %self.config.run_id(), error = %error, "case errored");
                writeln!(out, "ERROR: {error}")?;
                if let Some(hint) = error.suggestion() {
                    writeln!(out, "Hint: {hint}")?;
                }
            }
        }
        writeln!(
            out,
            "{BANNER_RULE} End Test: {} {BANNER_RULE}",
            self.config.run_id()
        )?;
        writeln!(out)?;
        writeln!(out)?;
        result
    }
}

fn execute_case<W: Write>(
    config: &TestCaseConfig,
    run_dir: &Path,
    options: &CaseRunOptions,
    out: &mut W,
) -> Result<CaseReport> {
    config.validate()?;

    writeln!(out, "Modifying input file...")?;
    rewrite_input_file(run_dir, config.name(), config.iterations())?;

    let command = config.launch_command();
    let rendered = command.render();
    writeln!(out, "{rendered}")?;
    let mut heartbeat_error = None;
    let outcome = run_supervised(&command, run_dir, &options.supervisor, |elapsed| {
        if heartbeat_error.is_none() {
            if let Err(error) = writeln!(out, "----- Run Time: {} -----", format_elapsed(elapsed)) {
                heartbeat_error = Some(error);
            }
        }
    })?;
    if let Some(error) = heartbeat_error {
        return Err(error.into());
    }
    writeln!(out, "{}", describe_outcome(&outcome, &options.supervisor))?;

    let tracked = config.expected_residuals().len();
    let (actual, parse_failure) = match read_last_residuals(run_dir, config.name(), tracked) {
        Ok(residuals) => (residuals.into_inner(), None),
        Err(error) if !outcome.succeeded() => (Vec::new(), Some(error.to_string())),
        Err(error) => return Err(error),
    };
    let comparison = compare_residuals(
        &actual,
        config.expected_residuals(),
        config.ignored_indices(),
        if outcome.termination == Termination::Exited {
            outcome.exit_code
        } else {
            None
        },
        config.tolerance(),
    );

    let status = if comparison.all_passed() && outcome.succeeded() {
        CaseStatus::Passed
    } else {
        CaseStatus::Failed
    };
    if status == CaseStatus::Passed {
        writeln!(out, "All tests for {} PASSED!", config.run_id())?;
    } else {
        writeln!(out, "Tests for {} FAILED!", config.run_id())?;
    }
    writeln!(
        out,
        "Residuals should be: {}",
        format_residuals(&comparison.expected_values())
    )?;
    writeln!(
        out,
        "Residuals are: {}",
        format_residuals(&comparison.compared_values())
    )?;
    if !config.ignored_indices().is_empty() {
        let ignored: Vec<usize> = config.ignored_indices().iter().copied().collect();
        writeln!(out, "Ignored metric indices: {ignored:?}")?;
    }
    writeln!(out, "Test Duration: {}", format_elapsed(outcome.elapsed))?;

    info!(
        case = %config.run_id(),
        status = ?status,
        failed_metrics = comparison.failed_count(),
        elapsed_ms = elapsed_ms_u64(outcome.elapsed),
        "case finished"
    );

    let reason = match (failure_reason(&outcome, &comparison), parse_failure) {
        (Some(primary), Some(detail)) => Some(format!("{primary}: {detail}")),
        (primary, detail) => primary.or(detail),
    };
    Ok(CaseReport {
        run_id: config.run_id(),
        case_name: config.name().to_owned(),
        run_directory: run_dir.to_string_lossy().into_owned(),
        command: rendered,
        status,
        exit_code: outcome.exit_code,
        termination: Some(outcome.termination),
        elapsed_ms: elapsed_ms_u64(outcome.elapsed),
        comparison,
        reason,
    })
}

fn describe_outcome(outcome: &RunOutcome, options: &SupervisorOptions) -> String {
    match outcome.termination {
        Termination::Exited if outcome.exit_code == Some(0) => {
            "Simulation completed with no errors".to_owned()
        }
        Termination::Exited => match outcome.exit_code {
            Some(code) => format!("ERROR: Simulation terminated with errors (exit code {code})"),
            None => "ERROR: Simulation terminated by a signal".to_owned(),
        },
        Termination::TimedOut => format!(
            "ERROR: Simulation exceeded its {} deadline and was terminated",
            format_elapsed(options.timeout.unwrap_or(Duration::ZERO))
        ),
        Termination::Cancelled => "ERROR: Simulation was cancelled".to_owned(),
    }
}

fn failure_reason(outcome: &RunOutcome, comparison: &ComparisonResult) -> Option<String> {
    match outcome.termination {
        Termination::TimedOut => return Some("timeout_exceeded".to_owned()),
        Termination::Cancelled => return Some("cancelled".to_owned()),
        Termination::Exited => {}
    }
    if outcome.exit_code != Some(0) {
        return Some(match outcome.exit_code {
            Some(code) => format!("solver_exit_code={code}"),
            None => "solver_killed_by_signal".to_owned(),
        });
    }
    let failed = comparison.failed_count();
    if failed > 0 {
        return Some(format!("tolerance_miss metrics={failed}"));
    }
    None
}

/// Render residuals as `[1.5371e-1, 1.4991e-1]`.
#[must_use]
pub fn format_residuals(values: &[f64]) -> String {
    let mut rendered = String::from("[");
    for (position, value) in values.iter().enumerate() {
        if position > 0 {
            rendered.push_str(", ");
        }
        let _ = write!(rendered, "{value:e}");
    }
    rendered.push(']');
    rendered
}
