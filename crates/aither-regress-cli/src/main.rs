//! `regression-tests`: run the aither regression suite.
//!
//! Exit status is 0 when every run passes, 1 when any run fails or errors,
//! and 2 for usage errors.

use std::ffi::OsString;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use aither_regress_error::RegressError;
use aither_regress_harness::comparator::DEFAULT_RELATIVE_TOLERANCE;
use aither_regress_harness::{
    CaseRunOptions, SuiteOptions, SuiteReport, SupervisorOptions, TargetOs,
    canonical_regression_suite, plan_suite, run_suite, write_suite_report_json,
};
use clap::{Parser, ValueEnum};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OperatingSystem {
    #[value(name = "linux")]
    Linux,
    #[value(name = "macOS")]
    MacOs,
    #[value(name = "windows")]
    Windows,
}

impl From<OperatingSystem> for TargetOs {
    fn from(os: OperatingSystem) -> Self {
        match os {
            OperatingSystem::Linux => Self::Linux,
            OperatingSystem::MacOs => Self::MacOs,
            OperatingSystem::Windows => Self::Windows,
        }
    }
}

/// Run the aither regression cases and compare their residuals.
#[derive(Debug, Parser)]
#[command(name = "regression-tests", version)]
struct Cli {
    /// Path to aither executable.
    #[arg(short = 'a', long = "aitherPath", default_value = "aither")]
    aither_path: PathBuf,

    /// Operating system that tests will run on.
    #[arg(short = 'o', long = "operatingSystem", value_enum, default_value = "linux")]
    operating_system: OperatingSystem,

    /// Path to mpirun.
    #[arg(short = 'm', long = "mpirunPath", default_value = "mpirun")]
    mpirun_path: PathBuf,

    /// Only run the named case (repeatable).
    #[arg(long = "case", value_name = "NAME")]
    cases: Vec<String>,

    /// Directory holding one subdirectory per case.
    #[arg(long, default_value = ".")]
    tests_root: PathBuf,

    /// Kill a solver run after this many seconds.
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    timeout_secs: Option<u64>,

    /// Relative tolerance for residual comparison.
    #[arg(long, default_value_t = DEFAULT_RELATIVE_TOLERANCE, value_parser = parse_tolerance)]
    tolerance: f64,

    /// Write a JSON summary of the run to this path.
    #[arg(long, value_name = "PATH")]
    summary_json: Option<PathBuf>,

    /// Print the planned runs without launching anything.
    #[arg(long)]
    dry_run: bool,
}

fn parse_tolerance(raw: &str) -> Result<f64, String> {
    let value: f64 = raw
        .parse()
        .map_err(|error| format!("invalid tolerance {raw:?}: {error}"))?;
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(format!("tolerance must be a non-negative number, got {raw}"))
    }
}

fn write_error<E: Write>(err: &mut E, error: &RegressError) {
    let _ = writeln!(err, "error: {error}");
    if let Some(hint) = error.suggestion() {
        let _ = writeln!(err, "hint: {hint}");
    }
}

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();

    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    let exit_code = run(std::env::args_os(), &mut stdout, &mut stderr);
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

fn run<I, W, E>(args: I, out: &mut W, err: &mut E) -> i32
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(parse_error) => {
            let code = if parse_error.use_stderr() {
                let _ = write!(err, "{}", parse_error.render());
                2
            } else {
                let _ = write!(out, "{}", parse_error.render());
                0
            };
            return code;
        }
    };
    debug!(?cli, "arguments parsed");

    let suite_options = SuiteOptions {
        solver_path: cli.aither_path.clone(),
        launcher_path: Some(cli.mpirun_path.clone()),
        target_os: cli.operating_system.into(),
        tolerance: cli.tolerance,
    };
    let suite = match canonical_regression_suite(&suite_options).select(&cli.cases) {
        Ok(suite) => suite,
        Err(select_error) => {
            write_error(err, &select_error);
            return 2;
        }
    };
    let run_options = CaseRunOptions {
        tests_root: cli.tests_root.clone(),
        supervisor: SupervisorOptions {
            timeout: cli.timeout_secs.map(Duration::from_secs),
            ..SupervisorOptions::default()
        },
    };

    if cli.dry_run {
        let plan = plan_suite(&suite, &run_options);
        for (position, planned) in plan.iter().enumerate() {
            let _ = writeln!(
                out,
                "{:>2}. {} [{} iterations] in {}: {}",
                position + 1,
                planned.run_id,
                planned.iterations,
                planned.run_directory.display(),
                planned.command
            );
        }
        return 0;
    }

    let summary = match run_suite(&suite, &run_options, out) {
        Ok(summary) => summary,
        Err(run_error) => {
            error!(error = %run_error, "regression suite aborted");
            write_error(err, &run_error);
            return 1;
        }
    };

    if let Some(path) = &cli.summary_json {
        let report = SuiteReport::from_summary(&suite_options, &summary);
        if let Err(report_error) = write_suite_report_json(path, &report) {
            write_error(err, &report_error);
            return 1;
        }
    }
    summary.exit_code()
}
