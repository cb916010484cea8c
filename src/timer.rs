//! One-shot SIGALRM deadline
//!
//! Only one deadline can be outstanding per process. Arming again replaces
//! the old deadline, and the guard cancels whatever is left when dropped.
//! A deadline is only armed while the SIGALRM exit binding is still in
//! place; without it the alarm would kill the process with the default
//! disposition instead of the configured exit.

use crate::errors::{SupervisorError, SupervisorResult};
use crate::registry::{self, SignalRegistry};
use crate::signal::SignalKind;
use nix::unistd::alarm;
use std::io::BufRead;
use tracing::{debug, warn};

/// Message written to stdout when the deadline fires
pub const DEFAULT_TIMEOUT_NOTICE: &str = "Time is up! Exiting...\n";

/// Arms and cancels the process alarm
#[derive(Debug)]
pub struct TimerGuard {
    armed_for: Option<u32>,
}

impl TimerGuard {
    /// Bind SIGALRM to terminate the process with `exit_code`.
    ///
    /// When the deadline fires, `notice` goes to stdout and the process
    /// exits immediately. Nothing after that point runs.
    pub fn install(
        registry: &mut SignalRegistry,
        exit_code: i32,
        notice: &'static str,
    ) -> SupervisorResult<Self> {
        registry.register_exit(SignalKind::Alarm, exit_code, notice)?;
        Ok(Self { armed_for: None })
    }

    /// Schedule the deadline `seconds` from now.
    ///
    /// Replaces any outstanding deadline and returns the seconds it had left.
    /// `arm(0)` is the same as [`TimerGuard::cancel`]. Fails with
    /// [`SupervisorError::DeadlineUnbound`] once the registry that held the
    /// exit binding was dropped or rebound SIGALRM.
    pub fn arm(&mut self, seconds: u32) -> SupervisorResult<Option<u32>> {
        if seconds == 0 {
            return Ok(self.cancel());
        }
        if !registry::exit_bound(SignalKind::Alarm) {
            warn!(seconds, "refusing to arm a deadline without its exit binding");
            return Err(SupervisorError::DeadlineUnbound);
        }
        let previous = alarm::set(seconds);
        self.armed_for = Some(seconds);
        debug!(seconds, ?previous, "deadline armed");
        Ok(previous)
    }

    /// Disarm the deadline; returns the seconds it had left, if any
    pub fn cancel(&mut self) -> Option<u32> {
        let remaining = alarm::cancel();
        if self.armed_for.take().is_some() {
            debug!(?remaining, "deadline cancelled");
        }
        remaining
    }

    /// Seconds the current deadline was armed for
    pub fn armed_for(&self) -> Option<u32> {
        self.armed_for
    }

    /// Whether a deadline is outstanding
    pub fn is_armed(&self) -> bool {
        self.armed_for.is_some()
    }

    /// Read one line, giving up with process termination after `seconds`.
    ///
    /// The deadline is cancelled right after the read returns, before the
    /// line is handed back, so it can never fire later. `Ok(None)` means EOF.
    pub fn read_line_before_deadline<R: BufRead>(
        &mut self,
        mut reader: R,
        seconds: u32,
    ) -> SupervisorResult<Option<String>> {
        let mut line = String::new();
        self.arm(seconds)?;
        let read = reader.read_line(&mut line);
        self.cancel();

        match read? {
            0 => Ok(None),
            _ => Ok(Some(line)),
        }
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        if self.is_armed() {
            self.cancel();
        }
    }
}
