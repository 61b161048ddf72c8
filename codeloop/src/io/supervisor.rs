//! Execution supervisor: run the materialized project and classify its fate.
//!
//! The [`ProjectRunner`] trait decouples the session loop from real process
//! execution. Tests use scripted runners that return predetermined outcomes.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::{ExitReport, classify_exit};
use crate::core::types::ExecutionOutcome;
use crate::io::config::SupervisorConfig;
use crate::io::interrupt::Interrupt;
use crate::io::process::{CapturedStream, Echo, ProcessGroup, StreamReader};

/// Environment-level failure the model cannot fix. Fatal to the session.
#[derive(Debug, Error)]
pub enum SupervisorFault {
    #[error("cannot spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("permission denied spawning {program}: {source}")]
    Permission {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed waiting on project process: {0}")]
    Wait(#[source] io::Error),
    #[error("failed to terminate project process group: {0}")]
    Signal(String),
}

/// Abstraction over project execution.
pub trait ProjectRunner {
    /// Run the project at `root` and return its terminal outcome.
    ///
    /// `on_running` is called once if the process outlives the startup window.
    /// No process started by the call may outlive it.
    fn run(
        &self,
        root: &Path,
        on_running: &mut dyn FnMut(),
    ) -> Result<ExecutionOutcome, SupervisorFault>;
}

impl<T: ProjectRunner + ?Sized> ProjectRunner for &T {
    fn run(
        &self,
        root: &Path,
        on_running: &mut dyn FnMut(),
    ) -> Result<ExecutionOutcome, SupervisorFault> {
        (**self).run(root, on_running)
    }
}

/// Runs the project entry point as a child process group.
pub struct Supervisor<I> {
    config: SupervisorConfig,
    interrupt: I,
}

enum RunEnd {
    Exited(ExitStatus),
    Interrupted,
    TimedOut,
}

impl<I: Interrupt> Supervisor<I> {
    pub fn new(config: SupervisorConfig, interrupt: I) -> Self {
        Self { config, interrupt }
    }

    fn command_for(&self, root: &Path, entry: &Path) -> Command {
        let mut cmd = Command::new(&self.config.command[0]);
        cmd.args(&self.config.command[1..])
            .arg(entry)
            .current_dir(root);
        cmd
    }

    fn spawn_readers(&self, group: &mut ProcessGroup) -> Vec<StreamReader> {
        let (out_echo, err_echo) = if self.config.echo_output {
            (Echo::Stdout, Echo::Stderr)
        } else {
            (Echo::Off, Echo::Off)
        };
        let limit = self.config.capture_limit_bytes;
        let markers = &self.config.error_markers;
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = group.take_stdout() {
            readers.push(StreamReader::spawn(stdout, limit, markers.clone(), out_echo));
        }
        if let Some(stderr) = group.take_stderr() {
            readers.push(StreamReader::spawn(stderr, limit, markers.clone(), err_echo));
        }
        readers
    }

    fn watch(
        &self,
        group: &mut ProcessGroup,
        on_running: &mut dyn FnMut(),
    ) -> Result<RunEnd, SupervisorFault> {
        let window = self.config.startup_window();
        let poll = self.config.poll_interval();
        let max_running = self.config.max_running();
        let started = Instant::now();
        let mut running_since: Option<Instant> = None;

        loop {
            if let Some(status) = group.wait_timeout(poll).map_err(SupervisorFault::Wait)? {
                debug!(exit_code = ?status.code(), "project process exited");
                return Ok(RunEnd::Exited(status));
            }
            if self.interrupt.take() {
                info!(running = running_since.is_some(), "operator stopped the project");
                return Ok(RunEnd::Interrupted);
            }
            match running_since {
                None if started.elapsed() >= window => {
                    info!(
                        window_ms = window.as_millis() as u64,
                        "project outlived startup window, treating it as a service"
                    );
                    running_since = Some(Instant::now());
                    on_running();
                }
                Some(since) if max_running.is_some_and(|limit| since.elapsed() >= limit) => {
                    warn!("project exceeded max running time");
                    return Ok(RunEnd::TimedOut);
                }
                _ => {}
            }
        }
    }
}

impl<I: Interrupt> ProjectRunner for Supervisor<I> {
    #[instrument(skip_all, fields(root = %root.display()))]
    fn run(
        &self,
        root: &Path,
        on_running: &mut dyn FnMut(),
    ) -> Result<ExecutionOutcome, SupervisorFault> {
        let Some(entry) = discover_entry(root, &self.config.entry_candidates) else {
            let expected = self.config.entry_candidates.join(", ");
            warn!(%expected, "no entry point found");
            return Ok(ExecutionOutcome::Crashed {
                trace: format!("no entry point found in the project root; expected one of: {expected}"),
            });
        };

        let program = self.config.command[0].clone();
        let cmd = self.command_for(root, &entry);
        let mut group = ProcessGroup::spawn(cmd, self.config.terminate_grace()).map_err(
            |source| match source.kind() {
                io::ErrorKind::PermissionDenied => SupervisorFault::Permission {
                    program: program.clone(),
                    source,
                },
                _ => SupervisorFault::Spawn {
                    program: program.clone(),
                    source,
                },
            },
        )?;
        info!(pid = group.id(), entry = %entry.display(), "project started");
        let mut readers = self.spawn_readers(&mut group);

        // Presses from before the run belong to the session, not to this process.
        let _ = self.interrupt.take();
        let end = self.watch(&mut group, on_running);

        let report = group
            .terminate()
            .map_err(|err| SupervisorFault::Signal(format!("{err:#}")))?;
        if report.lingering {
            warn!("some project processes could not be reaped");
        }
        let end = end?;

        for reader in &mut readers {
            if !reader.wait_done(self.config.terminate_grace()) {
                warn!("output pipe still open after termination; using partial capture");
            }
        }

        let outcome = match end {
            RunEnd::Interrupted => ExecutionOutcome::UserInterrupted,
            RunEnd::TimedOut => ExecutionOutcome::TimedOut,
            RunEnd::Exited(status) => {
                let mut captured = readers.iter().map(StreamReader::snapshot);
                let stdout = captured.next().unwrap_or_default();
                let stderr = captured.next().unwrap_or_default();
                classify(status, &stdout, &stderr, &self.config.error_markers)
            }
        };
        info!(outcome = outcome.label(), "project run classified");
        Ok(outcome)
    }
}

fn classify(
    status: ExitStatus,
    stdout: &CapturedStream,
    stderr: &CapturedStream,
    markers: &[String],
) -> ExecutionOutcome {
    classify_exit(
        &ExitReport {
            code: status.code(),
            signal: status.signal(),
            stdout: &stdout.text,
            stderr: &stderr.text,
            marker_seen: stdout.marker_seen || stderr.marker_seen,
        },
        markers,
    )
}

/// First candidate that exists as a file under `root`.
pub fn discover_entry(root: &Path, candidates: &[String]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(|candidate| root.join(candidate))
        .find(|path| path.is_file())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use super::*;
    use crate::io::interrupt::NoInterrupt;
    use crate::test_support::InterruptAfter;

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            command: vec!["sh".to_string()],
            entry_candidates: vec!["main.sh".to_string()],
            startup_window_ms: 300,
            poll_interval_ms: 20,
            terminate_grace_ms: 1_000,
            max_running_secs: None,
            capture_limit_bytes: 4_096,
            error_markers: vec!["Traceback (most recent call last)".to_string()],
            echo_output: false,
        }
    }

    fn project(script: &str) -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("main.sh"), script).expect("write script");
        temp
    }

    fn run_with<I: Interrupt>(
        config: SupervisorConfig,
        interrupt: I,
        root: &Path,
    ) -> (Result<ExecutionOutcome, SupervisorFault>, u32) {
        let supervisor = Supervisor::new(config, interrupt);
        let mut running_calls = 0;
        let outcome = supervisor.run(root, &mut || running_calls += 1);
        (outcome, running_calls)
    }

    #[test]
    fn clean_exit_within_window() {
        let temp = project("echo hello\n");
        let (outcome, running) = run_with(config(), NoInterrupt, temp.path());
        assert_eq!(outcome.expect("run"), ExecutionOutcome::CleanExit);
        assert_eq!(running, 0);
    }

    #[test]
    fn nonzero_exit_is_crash_with_stderr() {
        let temp = project("echo 'NameError: name x is not defined' >&2\nexit 3\n");
        let (outcome, _) = run_with(config(), NoInterrupt, temp.path());
        let ExecutionOutcome::Crashed { trace } = outcome.expect("run") else {
            panic!("expected crash");
        };
        assert!(trace.contains("status 3"));
        assert!(trace.contains("NameError"));
    }

    #[test]
    fn traceback_with_zero_exit_is_crash() {
        let temp = project("echo 'Traceback (most recent call last):' >&2\necho 'oops' >&2\n");
        let (outcome, _) = run_with(config(), NoInterrupt, temp.path());
        assert!(matches!(outcome.expect("run"), ExecutionOutcome::Crashed { .. }));
    }

    #[test]
    fn missing_entry_point_is_model_correctable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (outcome, _) = run_with(config(), NoInterrupt, temp.path());
        let ExecutionOutcome::Crashed { trace } = outcome.expect("run") else {
            panic!("expected crash");
        };
        assert!(trace.contains("main.sh"));
    }

    #[test]
    fn missing_interpreter_is_supervisor_fault() {
        let temp = project("echo hello\n");
        let mut cfg = config();
        cfg.command = vec!["/nonexistent/interpreter".to_string()];
        let (outcome, _) = run_with(cfg, NoInterrupt, temp.path());
        assert!(matches!(outcome, Err(SupervisorFault::Spawn { .. })));
    }

    #[test]
    fn chatty_process_does_not_stall() {
        let temp = project(
            "i=0\nwhile [ $i -lt 20000 ]; do echo \"line $i with some padding\"; i=$((i+1)); done\n",
        );
        let (outcome, _) = run_with(config(), NoInterrupt, temp.path());
        assert_eq!(outcome.expect("run"), ExecutionOutcome::CleanExit);
    }

    #[test]
    fn self_exit_while_running_is_classified() {
        let temp = project("sleep 1\necho 'late failure' >&2\nexit 2\n");
        let (outcome, running) = run_with(config(), NoInterrupt, temp.path());
        assert!(matches!(outcome.expect("run"), ExecutionOutcome::Crashed { .. }));
        assert_eq!(running, 1);
    }

    #[test]
    fn running_service_times_out_when_bounded() {
        let temp = project("sleep 30\n");
        let mut cfg = config();
        cfg.max_running_secs = Some(1);
        let (outcome, running) = run_with(cfg, NoInterrupt, temp.path());
        assert_eq!(outcome.expect("run"), ExecutionOutcome::TimedOut);
        assert_eq!(running, 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn interrupt_stops_service_and_all_descendants() {
        let temp = project("sleep 30 &\necho $! > child.pid\nwait\n");
        let interrupt = InterruptAfter::new(Duration::from_millis(800));
        let (outcome, running) = run_with(config(), interrupt, temp.path());

        assert_eq!(outcome.expect("run"), ExecutionOutcome::UserInterrupted);
        assert_eq!(running, 1);

        let pid: u32 = fs::read_to_string(temp.path().join("child.pid"))
            .expect("pid file")
            .trim()
            .parse()
            .expect("pid");
        assert!(crate::test_support::process_gone(pid), "descendant {pid} still alive");
    }
}
