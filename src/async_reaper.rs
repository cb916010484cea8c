//! SIGCHLD-driven reaping for code already running inside tokio
//!
//! tokio installs its own SIGCHLD handler, so do not combine this with a
//! [`crate::SignalRegistry`] binding for [`crate::SignalKind::Child`] in the
//! same process.

use crate::child::{ChildSupervisor, ExitReport};
use crate::errors::SupervisorResult;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::debug;

/// Waits for SIGCHLD and drains terminated children
pub struct AsyncReaper {
    sigchld: Signal,
}

impl AsyncReaper {
    /// Subscribe to SIGCHLD. Must be called from within a tokio runtime.
    pub fn new() -> SupervisorResult<Self> {
        Ok(Self {
            sigchld: signal(SignalKind::child())?,
        })
    }

    /// Wait for the next notification and reap everything that terminated.
    ///
    /// Children that exited before the first call are picked up too, since
    /// notifications are checked against a fresh drain first.
    pub async fn next_exits(
        &mut self,
        children: &mut ChildSupervisor,
    ) -> SupervisorResult<Vec<ExitReport>> {
        loop {
            let reports = children.reap_all()?;
            if !reports.is_empty() || children.unreaped() == 0 {
                return Ok(reports);
            }
            if self.sigchld.recv().await.is_none() {
                return Ok(Vec::new());
            }
            debug!("SIGCHLD received");
        }
    }
}
