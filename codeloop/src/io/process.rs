//! Helpers for running a child in its own process group with bounded output capture.

use std::io::{self, Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::classifier::find_marker;

const REAP_POLL: Duration = Duration::from_millis(20);
const READ_CHUNK: usize = 8192;

/// Where a reader thread mirrors the output it captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Echo {
    Off,
    Stdout,
    Stderr,
}

/// Captured tail of one output stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedStream {
    /// Most recent bytes, lossily decoded.
    pub text: String,
    /// Bytes discarded from the front to respect the capture limit.
    pub dropped: usize,
    /// Whether an error marker appeared anywhere in the stream.
    pub marker_seen: bool,
}

#[derive(Debug, Default)]
struct CaptureState {
    tail: Vec<u8>,
    dropped: usize,
    marker_seen: bool,
}

/// Background thread draining one pipe so the child never blocks on a full buffer.
pub struct StreamReader {
    state: Arc<Mutex<CaptureState>>,
    limit: usize,
    done: Receiver<()>,
    finished: bool,
}

impl StreamReader {
    /// Start draining `reader`, keeping the last `limit` bytes.
    pub fn spawn<R: Read + Send + 'static>(
        reader: R,
        limit: usize,
        markers: Vec<String>,
        echo: Echo,
    ) -> Self {
        let state = Arc::new(Mutex::new(CaptureState::default()));
        let (done_tx, done) = mpsc::channel();
        let thread_state = Arc::clone(&state);
        thread::spawn(move || {
            if let Err(err) = drain(reader, limit, &markers, echo, &thread_state) {
                warn!(err = %err, "output reader stopped");
            }
            let _ = done_tx.send(());
        });
        Self {
            state,
            limit,
            done,
            finished: false,
        }
    }

    /// Wait until the pipe reaches EOF. Returns `false` if `timeout` expired first,
    /// which happens when an escaped descendant still holds the pipe open.
    pub fn wait_done(&mut self, timeout: Duration) -> bool {
        if self.finished {
            return true;
        }
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                self.finished = true;
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    pub fn snapshot(&self) -> CapturedStream {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let start = state.tail.len().saturating_sub(self.limit);
        CapturedStream {
            text: String::from_utf8_lossy(&state.tail[start..]).into_owned(),
            dropped: state.dropped + start,
            marker_seen: state.marker_seen,
        }
    }
}

fn drain<R: Read>(
    mut reader: R,
    limit: usize,
    markers: &[String],
    echo: Echo,
    state: &Mutex<CaptureState>,
) -> Result<()> {
    let mut chunk = [0u8; READ_CHUNK];
    let mut window = MarkerWindow::new(markers);
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err).context("read output"),
        };
        let bytes = &chunk[..n];

        match echo {
            Echo::Off => {}
            Echo::Stdout => write_echo(&mut io::stdout().lock(), bytes),
            Echo::Stderr => write_echo(&mut io::stderr().lock(), bytes),
        }

        let marker = window.scan(bytes, markers);
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        state.marker_seen |= marker;
        state.tail.extend_from_slice(bytes);
        // Compact lazily so chatty children do not pay a memmove per read.
        if state.tail.len() > limit.saturating_mul(2) {
            let excess = state.tail.len() - limit;
            state.tail.drain(..excess);
            state.dropped += excess;
        }
    }
    Ok(())
}

/// Marker search across read boundaries.
///
/// Keeps the last `longest marker - 1` bytes of the previous read, so a marker
/// split between two reads is still found, and memory stays bounded however
/// long a line is.
#[derive(Debug)]
struct MarkerWindow {
    carry: Vec<u8>,
    keep: usize,
}

impl MarkerWindow {
    fn new(markers: &[String]) -> Self {
        let longest = markers.iter().map(String::len).max().unwrap_or(0);
        Self {
            carry: Vec::new(),
            keep: longest.saturating_sub(1),
        }
    }

    fn scan(&mut self, bytes: &[u8], markers: &[String]) -> bool {
        self.carry.extend_from_slice(bytes);
        let found = find_marker(&String::from_utf8_lossy(&self.carry), markers).is_some();
        let excess = self.carry.len().saturating_sub(self.keep);
        self.carry.drain(..excess);
        found
    }
}

fn write_echo<W: Write>(writer: &mut W, bytes: &[u8]) {
    if let Err(err) = writer.write_all(bytes).and_then(|()| writer.flush()) {
        debug!(err = %err, "failed to echo child output");
    }
}

/// How the last termination of a process group went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminateReport {
    /// Strongest signal that had to be sent, if any member was still alive.
    pub signal: Option<Signal>,
    /// Members still present after SIGKILL (e.g. unreaped zombies).
    pub lingering: bool,
}

/// A spawned child that leads its own process group.
///
/// Dropping the handle terminates the whole group, so every exit path of the
/// caller reaps descendants such as spawned sub-servers.
pub struct ProcessGroup {
    child: Child,
    pgid: Pid,
    status: Option<ExitStatus>,
    grace: Duration,
    terminated: bool,
}

impl ProcessGroup {
    /// Spawn `cmd` as the leader of a new process group with piped output and null stdin.
    pub fn spawn(mut cmd: Command, grace: Duration) -> io::Result<Self> {
        cmd.process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = cmd.spawn()?;
        let pgid = Pid::from_raw(child.id() as i32);
        debug!(pid = child.id(), "spawned process group leader");
        Ok(Self {
            child,
            pgid,
            status: None,
            grace,
            terminated: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Exit status of the leader, if it has exited and been reaped.
    pub fn status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Wait up to `timeout` for the leader to exit.
    pub fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        let status = self.child.wait_timeout(timeout)?;
        self.status = status;
        Ok(status)
    }

    /// Whether any process in the group still exists.
    pub fn group_alive(&self) -> Result<bool> {
        match killpg(self.pgid, None) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(Errno::EPERM) => Ok(true),
            Err(err) => Err(err).with_context(|| format!("check process group {}", self.pgid)),
        }
    }

    /// Terminate every process in the group: SIGTERM, wait, SIGKILL, wait, reap.
    #[instrument(skip_all, fields(pgid = %self.pgid))]
    pub fn terminate(&mut self) -> Result<TerminateReport> {
        self.terminated = true;
        let mut report = TerminateReport {
            signal: None,
            lingering: false,
        };

        for signal in [Signal::SIGTERM, Signal::SIGKILL] {
            self.reap_leader()?;
            if !self.group_alive()? {
                break;
            }
            debug!(?signal, "signalling process group");
            match killpg(self.pgid, signal) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("send {signal} to process group {}", self.pgid));
                }
            }
            report.signal = Some(signal);
            if self.wait_group_gone(self.grace)? {
                break;
            }
        }

        if self.status.is_none() {
            let status = self.child.wait().context("reap process group leader")?;
            self.status = Some(status);
        }
        if self.group_alive()? {
            warn!("process group still has members after SIGKILL");
            report.lingering = true;
        }
        Ok(report)
    }

    fn reap_leader(&mut self) -> Result<()> {
        if self.status.is_none() {
            self.status = self.child.try_wait().context("poll process group leader")?;
        }
        Ok(())
    }

    fn wait_group_gone(&mut self, grace: Duration) -> Result<bool> {
        let deadline = Instant::now() + grace;
        loop {
            self.reap_leader()?;
            if !self.group_alive()? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(REAP_POLL);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if self.terminated {
            return;
        }
        if let Err(err) = self.terminate() {
            warn!(err = %format!("{err:#}"), "failed to terminate process group on drop");
        }
    }
}
