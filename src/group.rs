//! Process group signaling
//!
//! Membership is tracked by the OS; only the group id is needed here.

use crate::errors::{ErrorContext, SupervisorResult};
use crate::signal::SignalKind;
use nix::sys::signal::killpg;
use nix::unistd::{getpgrp, getpid, setpgid, Pid};
use tracing::{debug, info};

/// Process group id of the caller
pub fn group_id_of_self() -> Pid {
    getpgrp()
}

/// Send `kind` to every process in `group`, the caller included if it is a member.
///
/// Fire-and-forget: no acknowledgment, no ordering across recipients.
pub fn broadcast_to_group(kind: SignalKind, group: Pid) -> SupervisorResult<()> {
    info!(signal = %kind, %group, "broadcasting to process group");
    killpg(group, kind.as_nix()).with_context(|| format!("killpg({group}, {kind}) failed"))
}

/// Send `kind` to the caller's own process group
pub fn broadcast_to_own_group(kind: SignalKind) -> SupervisorResult<()> {
    broadcast_to_group(kind, group_id_of_self())
}

/// Make the caller the leader of a fresh process group.
///
/// Children forked afterwards join it, so group broadcasts stay inside this
/// process tree. Returns the new group id.
pub fn lead_new_group() -> SupervisorResult<Pid> {
    let me = getpid();
    if getpgrp() == me {
        return Ok(me);
    }
    setpgid(Pid::from_raw(0), Pid::from_raw(0)).context("setpgid(0, 0) failed")?;
    debug!(group = %me, "now leading a new process group");
    Ok(me)
}
