//! Solver process launch and supervision.
//!
//! The solver is started as a child process in the case run directory with
//! stdout redirected to `<case>.out`. The supervisor polls it with
//! `try_wait`, reports elapsed-time heartbeats, and terminates it when a
//! deadline expires or a cancellation flag is raised. Without a deadline or a
//! flag it waits for the solver to exit on its own.
//!
//! On Unix the child leads its own process group, so termination reaches the
//! solver ranks the launcher forked: `SIGTERM` to the group, then `SIGKILL`
//! to whatever is left once the grace period runs out.

use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use aither_regress_error::{RegressError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Default delay between two `try_wait` polls.
pub const DEFAULT_POLL_INTERVAL_MILLIS: u64 = 500;
/// Default delay between two elapsed-time heartbeats.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 60;
/// Default time a terminated solver gets to exit before it is killed.
pub const DEFAULT_TERMINATE_GRACE_MILLIS: u64 = 2_000;

const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// One solver invocation: `<launcher> -np <procs> <solver> <case>.inp [<restart>] > <case>.out`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    /// Distributed-run launcher (`mpirun`); `None` runs the solver directly.
    pub launcher: Option<PathBuf>,
    pub processors: u32,
    pub solver: PathBuf,
    /// Input deck, relative to the run directory.
    pub input_file: String,
    /// Restart state file, passed as a second positional argument.
    pub restart_file: Option<String>,
    /// File receiving the solver stdout, relative to the run directory.
    pub output_file: String,
}

impl LaunchCommand {
    /// Program actually spawned.
    #[must_use]
    pub fn program(&self) -> &Path {
        self.launcher.as_deref().unwrap_or(&self.solver)
    }

    /// Arguments passed to [`Self::program`].
    #[must_use]
    pub fn args(&self) -> Vec<OsString> {
        let mut args = Vec::with_capacity(6);
        if self.launcher.is_some() {
            args.push(OsString::from("-np"));
            args.push(OsString::from(self.processors.to_string()));
            args.push(self.solver.clone().into_os_string());
        }
        args.push(OsString::from(&self.input_file));
        if let Some(restart) = &self.restart_file {
            args.push(OsString::from(restart));
        }
        args
    }

    /// Shell rendering of the invocation, including the stdout redirection.
    #[must_use]
    pub fn render(&self) -> String {
        let mut rendered = shell_escape(&self.program().to_string_lossy());
        for arg in self.args() {
            rendered.push(' ');
            rendered.push_str(&shell_escape(&arg.to_string_lossy()));
        }
        rendered.push_str(" > ");
        rendered.push_str(&shell_escape(&self.output_file));
        rendered
    }
}

/// Cooperative cancellation flag shared with the supervisor.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Polling, heartbeat and deadline settings.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Clamped to `1ms..=1s`.
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Kill the solver after this long. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelFlag>,
    /// Delay between the polite and the forced termination signal.
    pub terminate_grace: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MILLIS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            timeout: None,
            cancel: None,
            terminate_grace: Duration::from_millis(DEFAULT_TERMINATE_GRACE_MILLIS),
        }
    }
}

/// How the solver process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Exited,
    TimedOut,
    Cancelled,
}

/// Result of one supervised launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
    pub termination: Termination,
}

impl RunOutcome {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == Some(0)
    }
}

/// Launch `command` in `run_dir` and block until it ends.
///
/// `on_heartbeat` receives the elapsed time each time at least
/// `heartbeat_interval` has passed since the previous report.
///
/// # Errors
///
/// Returns [`RegressError::Spawn`] when the program cannot be started and
/// [`RegressError::Supervise`] when the child cannot be polled or reaped.
pub fn run_supervised<F>(
    command: &LaunchCommand,
    run_dir: &Path,
    options: &SupervisorOptions,
    on_heartbeat: F,
) -> Result<RunOutcome>
where
    F: FnMut(Duration),
{
    let mut child = spawn_solver(command, run_dir)?;
    info!(
        command = %command.render(),
        run_dir = %run_dir.display(),
        pid = child.id(),
        "solver launched"
    );
    let outcome = wait_for_child(&mut child, options, on_heartbeat)?;
    info!(
        exit_code = ?outcome.exit_code,
        elapsed_ms = elapsed_ms_u64(outcome.elapsed),
        termination = ?outcome.termination,
        "solver finished"
    );
    Ok(outcome)
}

fn spawn_solver(command: &LaunchCommand, run_dir: &Path) -> Result<Child> {
    let stdout_file = File::create(run_dir.join(&command.output_file))?;
    let mut process = Command::new(command.program());
    process
        .args(command.args())
        .current_dir(run_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_file))
        .stderr(Stdio::inherit());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        process.process_group(0);
    }
    process
        .spawn()
        .map_err(|source| RegressError::Spawn {
            program: command.program().to_string_lossy().into_owned(),
            source,
        })
}

fn wait_for_child<F>(
    child: &mut Child,
    options: &SupervisorOptions,
    mut on_heartbeat: F,
) -> Result<RunOutcome>
where
    F: FnMut(Duration),
{
    let started_at = Instant::now();
    let mut last_report = started_at;
    let poll_interval = options
        .poll_interval
        .clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL);

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return Ok(RunOutcome {
                    exit_code: status.code(),
                    elapsed: started_at.elapsed(),
                    termination: Termination::Exited,
                });
            }
            Ok(None) => {
                if let Some(termination) = stop_requested(options, started_at) {
                    warn!(pid = child.id(), reason = ?termination, "terminating solver");
                    let status = terminate_child(child, options.terminate_grace, poll_interval)?;
                    return Ok(RunOutcome {
                        exit_code: status.code(),
                        elapsed: started_at.elapsed(),
                        termination,
                    });
                }
                let now = Instant::now();
                if now.duration_since(last_report) >= options.heartbeat_interval {
                    let elapsed = now.duration_since(started_at);
                    debug!(elapsed_ms = elapsed_ms_u64(elapsed), "solver heartbeat");
                    on_heartbeat(elapsed);
                    last_report = now;
                }
                thread::sleep(poll_interval);
            }
            Err(error) => {
                return Err(RegressError::supervise(format!(
                    "try_wait_failed error={error}"
                )));
            }
        }
    }
}

fn reap(child: &mut Child) -> Result<ExitStatus> {
    child
        .wait()
        .map_err(|error| RegressError::supervise(format!("wait_after_kill_failed error={error}")))
}

#[cfg(unix)]
fn terminate_child(
    child: &mut Child,
    grace: Duration,
    poll_interval: Duration,
) -> Result<ExitStatus> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw_pid) = i32::try_from(child.id()) else {
        let _ = child.kill();
        return reap(child);
    };
    let group = Pid::from_raw(raw_pid);
    if let Err(errno) = killpg(group, Signal::SIGTERM) {
        debug!(pgid = raw_pid, %errno, "SIGTERM to process group failed");
    }

    // The group outlives the launcher while forked ranks are still running.
    let deadline = Instant::now() + grace;
    let mut status = None;
    loop {
        if status.is_none() {
            status = child.try_wait().map_err(|error| {
                RegressError::supervise(format!("try_wait_after_term_failed error={error}"))
            })?;
        }
        let group_alive = killpg(group, None).is_ok();
        if !group_alive && status.is_some() {
            break;
        }
        if Instant::now() >= deadline {
            if group_alive {
                warn!(pgid = raw_pid, "solver ignored SIGTERM, sending SIGKILL");
                if let Err(errno) = killpg(group, Signal::SIGKILL) {
                    debug!(pgid = raw_pid, %errno, "SIGKILL to process group failed");
                }
            }
            break;
        }
        thread::sleep(poll_interval);
    }
    match status {
        Some(status) => Ok(status),
        None => reap(child),
    }
}

#[cfg(not(unix))]
fn terminate_child(
    child: &mut Child,
    _grace: Duration,
    _poll_interval: Duration,
) -> Result<ExitStatus> {
    let _ = child.kill();
    reap(child)
}

fn stop_requested(options: &SupervisorOptions, started_at: Instant) -> Option<Termination> {
    if options.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
        return Some(Termination::Cancelled);
    }
    match options.timeout {
        Some(timeout) if started_at.elapsed() >= timeout => Some(Termination::TimedOut),
        _ => None,
    }
}

/// Format a duration as `H:MM:SS.mmm`.
#[must_use]
pub fn format_elapsed(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;
    let millis = duration.subsec_millis();
    format!("{hours}:{minutes:02}:{seconds:02}.{millis:03}")
}

pub(crate) fn elapsed_ms_u64(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn shell_escape(raw: &str) -> String {
    if !raw.is_empty()
        && raw
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || b"/._-=+:".contains(&byte))
    {
        return raw.to_owned();
    }
    let escaped = raw.replace('\'', "'\"'\"'");
    format!("'{escaped}'")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mpirun_command(restart: Option<&str>) -> LaunchCommand {
        LaunchCommand {
            launcher: Some(PathBuf::from("mpirun")),
            processors: 2,
            solver: PathBuf::from("aither"),
            input_file: "shockTube.inp".to_owned(),
            restart_file: restart.map(str::to_owned),
            output_file: "shockTube.out".to_owned(),
        }
    }

    #[test]
    fn renders_launcher_command() {
        assert_eq!(
            mpirun_command(None).render(),
            "mpirun -np 2 aither shockTube.inp > shockTube.out"
        );
    }

    #[test]
    fn renders_restart_argument() {
        assert_eq!(
            mpirun_command(Some("shockTube_50.rst")).render(),
            "mpirun -np 2 aither shockTube.inp shockTube_50.rst > shockTube.out"
        );
    }

    #[test]
    fn direct_launch_drops_np() {
        let mut command = mpirun_command(None);
        command.launcher = None;
        assert_eq!(command.program(), Path::new("aither"));
        assert_eq!(command.render(), "aither shockTube.inp > shockTube.out");
    }

    #[test]
    fn render_quotes_spaces() {
        let mut command = mpirun_command(None);
        command.solver = PathBuf::from("/opt/my solver/aither");
        assert_eq!(
            command.render(),
            "mpirun -np 2 '/opt/my solver/aither' shockTube.inp > shockTube.out"
        );
    }

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed(Duration::from_millis(500)), "0:00:00.500");
        assert_eq!(format_elapsed(Duration::from_secs(61)), "0:01:01.000");
        assert_eq!(
            format_elapsed(Duration::from_secs(3_600 + 125) + Duration::from_millis(7)),
            "1:02:05.007"
        );
    }

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_cancelled());
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn stop_requested_prefers_cancel() {
        let flag = CancelFlag::new();
        flag.cancel();
        let options = SupervisorOptions {
            timeout: Some(Duration::ZERO),
            cancel: Some(flag),
            ..SupervisorOptions::default()
        };
        assert_eq!(
            stop_requested(&options, Instant::now()),
            Some(Termination::Cancelled)
        );
        assert_eq!(stop_requested(&SupervisorOptions::default(), Instant::now()), None);
    }

    #[test]
    fn outcome_success_requires_clean_exit() {
        let ok = RunOutcome {
            exit_code: Some(0),
            elapsed: Duration::ZERO,
            termination: Termination::Exited,
        };
        assert!(ok.succeeded());
        assert!(
            !RunOutcome {
                termination: Termination::TimedOut,
                ..ok
            }
            .succeeded()
        );
        assert!(
            !RunOutcome {
                exit_code: Some(3),
                ..ok
            }
            .succeeded()
        );
    }
}
