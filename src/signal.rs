//! Signal kinds and one-off delivery helpers

use crate::errors::SupervisorResult;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use signal_hook::consts::signal::*;
use std::fmt;

/// Signals the supervisor knows how to talk about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Hangup signal
    Hangup,
    /// Interrupt signal (Ctrl+C)
    Interrupt,
    /// Quit signal
    Quit,
    /// Kill signal, cannot be caught
    Kill,
    /// User-defined signal 1
    User1,
    /// User-defined signal 2
    User2,
    /// Broken pipe
    Pipe,
    /// Timer expiry
    Alarm,
    /// Termination signal
    Terminate,
    /// A child stopped or terminated
    Child,
    /// Stop signal, cannot be caught
    Stop,
}

impl SignalKind {
    /// All kinds, in signal number order
    pub const ALL: [SignalKind; 11] = [
        Self::Hangup,
        Self::Interrupt,
        Self::Quit,
        Self::Kill,
        Self::User1,
        Self::User2,
        Self::Pipe,
        Self::Alarm,
        Self::Terminate,
        Self::Child,
        Self::Stop,
    ];

    /// Raw signal number
    pub fn as_raw(self) -> i32 {
        match self {
            Self::Hangup => SIGHUP,
            Self::Interrupt => SIGINT,
            Self::Quit => SIGQUIT,
            Self::Kill => SIGKILL,
            Self::User1 => SIGUSR1,
            Self::User2 => SIGUSR2,
            Self::Pipe => SIGPIPE,
            Self::Alarm => SIGALRM,
            Self::Terminate => SIGTERM,
            Self::Child => SIGCHLD,
            Self::Stop => SIGSTOP,
        }
    }

    /// Create from signal number
    pub fn from_raw(sig: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_raw() == sig)
    }

    /// The matching `nix` signal
    pub fn as_nix(self) -> Signal {
        match self {
            Self::Hangup => Signal::SIGHUP,
            Self::Interrupt => Signal::SIGINT,
            Self::Quit => Signal::SIGQUIT,
            Self::Kill => Signal::SIGKILL,
            Self::User1 => Signal::SIGUSR1,
            Self::User2 => Signal::SIGUSR2,
            Self::Pipe => Signal::SIGPIPE,
            Self::Alarm => Signal::SIGALRM,
            Self::Terminate => Signal::SIGTERM,
            Self::Child => Signal::SIGCHLD,
            Self::Stop => Signal::SIGSTOP,
        }
    }

    /// Whether a handler may be installed for this signal
    pub fn is_overridable(self) -> bool {
        !signal_hook::consts::FORBIDDEN.contains(&self.as_raw())
    }

    /// Conventional name, e.g. `SIGINT`
    pub fn name(self) -> &'static str {
        self.as_nix().as_str()
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<SignalKind> for Signal {
    fn from(kind: SignalKind) -> Self {
        kind.as_nix()
    }
}

/// Deliver `kind` to the calling thread.
///
/// When the signal is unblocked its handler has run by the time this returns.
pub fn raise_self(kind: SignalKind) -> SupervisorResult<()> {
    signal::raise(kind.as_nix())?;
    Ok(())
}

/// Send a signal to a single process
pub fn send_signal(pid: Pid, kind: SignalKind) -> SupervisorResult<()> {
    signal::kill(pid, kind.as_nix())?;
    Ok(())
}
