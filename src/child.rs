//! Child process lifecycle: fork, track, reap
//!
//! Every child spawned here must be reaped exactly once. Reaping happens
//! either through [`ChildSupervisor::wait`] on its handle or through
//! [`ChildSupervisor::reap_all`] after a SIGCHLD notification. SIGCHLD
//! notifications coalesce, so a single one may stand for several exits.

use crate::errors::{SupervisorError, SupervisorResult};
use crate::signal::{self, SignalKind};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Exit code used when the child's work panics
pub const PANIC_EXIT_CODE: i32 = 101;

const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// Parent-side handle to a spawned child.
///
/// Not `Clone`: [`ChildSupervisor::wait`] consumes it, so a status can only
/// be collected once through the handle.
#[derive(Debug, PartialEq, Eq)]
pub struct ProcessHandle {
    pid: Pid,
}

impl ProcessHandle {
    pub fn pid(&self) -> Pid {
        self.pid
    }
}

/// How a child terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Called exit with this code
    Exited(i32),
    /// Killed by a signal
    Signaled(Signal),
}

/// Status of one reaped child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub pid: Pid,
    pub outcome: ExitOutcome,
}

impl ExitReport {
    fn from_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(pid, code) => Some(Self {
                pid,
                outcome: ExitOutcome::Exited(code),
            }),
            WaitStatus::Signaled(pid, sig, _) => Some(Self {
                pid,
                outcome: ExitOutcome::Signaled(sig),
            }),
            _ => None,
        }
    }

    /// Exit code, when the child exited normally
    pub fn code(&self) -> Option<i32> {
        match self.outcome {
            ExitOutcome::Exited(code) => Some(code),
            ExitOutcome::Signaled(_) => None,
        }
    }

    /// Terminating signal, when the child was killed
    pub fn signal(&self) -> Option<Signal> {
        match self.outcome {
            ExitOutcome::Signaled(sig) => Some(sig),
            ExitOutcome::Exited(_) => None,
        }
    }

    pub fn success(&self) -> bool {
        self.code() == Some(0)
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.outcome {
            ExitOutcome::Exited(code) => write!(f, "process {} exited with status {}", self.pid, code),
            ExitOutcome::Signaled(sig) => write!(f, "process {} killed by {}", self.pid, sig),
        }
    }
}

/// Tracks the children this process created until they are reaped
#[derive(Debug, Default)]
pub struct ChildSupervisor {
    running: HashSet<Pid>,
}

impl ChildSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fork a child that runs `work` and exits with its return value.
    ///
    /// The child never returns into the caller's continuation. A panic in
    /// `work` exits with [`PANIC_EXIT_CODE`]. Output written with `print!`
    /// and no trailing newline may be lost, since the child leaves with
    /// `_exit` and skips buffered stdio teardown.
    pub fn spawn<F>(&mut self, work: F) -> SupervisorResult<ProcessHandle>
    where
        F: FnOnce() -> i32,
    {
        // SAFETY: the child only runs `work` and then `_exit`s
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                self.running.insert(child);
                debug!(pid = %child, "child spawned");
                Ok(ProcessHandle { pid: child })
            }
            Ok(ForkResult::Child) => {
                let code = panic::catch_unwind(AssertUnwindSafe(work)).unwrap_or(PANIC_EXIT_CODE);
                // SAFETY: leaves without running the parent's atexit handlers or destructors
                unsafe { libc::_exit(code) }
            }
            Err(e) => {
                warn!(error = %e, "fork failed");
                Err(SupervisorError::SpawnFailure {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Reap one terminated child.
    ///
    /// Non-blocking returns `Ok(None)` when nothing has terminated yet or no
    /// children exist. Blocking with no children is [`SupervisorError::NoChildren`].
    pub fn wait_any_child(&mut self, blocking: bool) -> SupervisorResult<Option<ExitReport>> {
        let flags = if blocking {
            None
        } else {
            Some(WaitPidFlag::WNOHANG)
        };

        loop {
            match waitpid(Pid::from_raw(-1), flags) {
                Ok(WaitStatus::StillAlive) => return Ok(None),
                Ok(status) => {
                    if let Some(report) = ExitReport::from_status(status) {
                        self.forget(report);
                        return Ok(Some(report));
                    }
                    // stopped or continued, not terminal
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) if blocking => return Err(SupervisorError::NoChildren),
                Err(Errno::ECHILD) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reap every child that has already terminated.
    ///
    /// Call this on each SIGCHLD notification; one notification may cover
    /// several exits.
    ///
    /// Children reaped before a failing `waitpid` are still returned; the
    /// error is only propagated when nothing was reaped.
    pub fn reap_all(&mut self) -> SupervisorResult<Vec<ExitReport>> {
        let reports = drain(|| self.wait_any_child(false))?;
        if reports.len() > 1 {
            debug!(count = reports.len(), "drained several children at once");
        }
        Ok(reports)
    }

    /// Block until the child behind `handle` terminates
    pub fn wait(&mut self, handle: ProcessHandle) -> SupervisorResult<ExitReport> {
        let pid = handle.pid;
        if !self.running.contains(&pid) {
            return Err(SupervisorError::AlreadyReaped { pid: pid.as_raw() });
        }

        match wait_for(pid) {
            Ok(report) => {
                self.forget(report);
                Ok(report)
            }
            Err(Errno::ECHILD) => {
                self.running.remove(&pid);
                Err(SupervisorError::UnknownChild { pid: pid.as_raw() })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send `kind` to one child
    pub fn signal(&self, handle: &ProcessHandle, kind: SignalKind) -> SupervisorResult<()> {
        if !self.running.contains(&handle.pid) {
            return Err(SupervisorError::AlreadyReaped {
                pid: handle.pid.as_raw(),
            });
        }
        signal::send_signal(handle.pid, kind)
    }

    /// Whether `pid` was spawned here and is not reaped yet
    pub fn is_running(&self, pid: Pid) -> bool {
        self.running.contains(&pid)
    }

    /// Children spawned and not yet reaped
    pub fn unreaped(&self) -> usize {
        self.running.len()
    }

    /// Pids of children not yet reaped
    pub fn pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.running.iter().copied()
    }

    /// Terminate and reap every remaining child
    pub fn shutdown(&mut self) {
        if self.running.is_empty() {
            return;
        }
        info!(count = self.running.len(), "terminating remaining children");

        for pid in self.running.clone() {
            if let Err(e) = signal::send_signal(pid, SignalKind::Terminate) {
                warn!(%pid, error = %e, "SIGTERM failed");
            }
        }
        thread::sleep(SHUTDOWN_GRACE);

        for pid in self.running.clone() {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    if let Err(e) = signal::send_signal(pid, SignalKind::Kill) {
                        warn!(%pid, error = %e, "SIGKILL failed");
                    }
                    match wait_for(pid) {
                        Ok(report) => debug!(%report, "child killed"),
                        Err(e) => warn!(%pid, error = %e, "failed to reap killed child"),
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(%pid, error = %e, "child already gone"),
            }
            self.running.remove(&pid);
        }
    }

    fn forget(&mut self, report: ExitReport) {
        if !self.running.remove(&report.pid) {
            // reaped a child spawned outside this supervisor
            debug!(pid = %report.pid, "reaped untracked child");
        }
        debug!(%report, "child reaped");
    }
}

/// Blocking `waitpid` on one pid until it reports a terminal status
fn wait_for(pid: Pid) -> nix::Result<ExitReport> {
    loop {
        match waitpid(pid, None) {
            Ok(status) => {
                if let Some(report) = ExitReport::from_status(status) {
                    return Ok(report);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Collect reports from `next` until it runs dry or fails
fn drain<F>(mut next: F) -> SupervisorResult<Vec<ExitReport>>
where
    F: FnMut() -> SupervisorResult<Option<ExitReport>>,
{
    let mut reports = Vec::new();
    loop {
        match next() {
            Ok(Some(report)) => reports.push(report),
            Ok(None) => return Ok(reports),
            Err(e) if reports.is_empty() => return Err(e),
            Err(e) => {
                warn!(error = %e, reaped = reports.len(), "drain interrupted, keeping reaped children");
                return Ok(reports);
            }
        }
    }
}

impl Drop for ChildSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
