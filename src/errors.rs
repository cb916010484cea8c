//! Error handling for the supervisor
//!
//! Uses `thiserror` for library errors with variants callers can match on.
//! Binaries wrap these in `anyhow` at the top level.

use crate::signal::SignalKind;
use std::io;
use thiserror::Error;

/// Errors raised while registering handlers, spawning or reaping children
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// IO operation failed
    #[error("IO operation failed: {0}")]
    Io(#[from] io::Error),

    /// A system call reported an errno
    #[error("System call failed: {0}")]
    Os(#[from] nix::Error),

    /// fork(2) could not create a child
    #[error("Failed to spawn process: {reason}")]
    SpawnFailure { reason: String },

    /// The platform does not let this signal be caught
    #[error("Signal {signal} cannot be caught or overridden")]
    NonOverridableSignal { signal: SignalKind },

    /// Another registry already owns the process dispositions
    #[error("A signal registry is already active in this process")]
    RegistryInUse,

    /// SIGALRM no longer carries the exit binding a deadline needs
    #[error("No exit binding for SIGALRM; the deadline cannot be armed")]
    DeadlineUnbound,

    /// Blocking wait with nothing left to wait for
    #[error("No child processes to wait for")]
    NoChildren,

    /// The pid was never spawned by this supervisor
    #[error("Process {pid} is not a child of this supervisor")]
    UnknownChild { pid: i32 },

    /// Status of this child was already retrieved
    #[error("Process {pid} was already reaped")]
    AlreadyReaped { pid: i32 },

    /// Bad configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Error with added context
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<SupervisorError>,
    },
}

impl SupervisorError {
    /// Whether the error is a reaping bookkeeping problem rather than an OS failure
    pub fn is_reap_error(&self) -> bool {
        matches!(
            self,
            Self::NoChildren | Self::UnknownChild { .. } | Self::AlreadyReaped { .. }
        )
    }
}

/// Result type alias for supervisor operations
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Error context extension trait for adding context to errors
pub trait ErrorContext<T> {
    /// Add context to an error
    fn context<C>(self, context: C) -> SupervisorResult<T>
    where
        C: Into<String>;

    /// Add context lazily (only evaluated on error)
    fn with_context<C, F>(self, f: F) -> SupervisorResult<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: Into<SupervisorError>,
{
    fn context<C>(self, context: C) -> SupervisorResult<T>
    where
        C: Into<String>,
    {
        self.map_err(|e| SupervisorError::Context {
            context: context.into(),
            source: Box::new(e.into()),
        })
    }

    fn with_context<C, F>(self, f: F) -> SupervisorResult<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|e| SupervisorError::Context {
            context: f().into(),
            source: Box::new(e.into()),
        })
    }
}
