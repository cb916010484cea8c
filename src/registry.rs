//! Signal registry with deferred handlers
//!
//! The OS only ever sees one `extern "C"` trampoline. In signal context it
//! bumps a per-signal counter, re-installs itself for rearming bindings, or
//! writes a notice and `_exit`s for exit bindings. Everything else (closures,
//! logging, allocation) happens later from [`SignalRegistry::dispatch`] on the
//! normal control flow.
//!
//! Dispositions are process-wide, so only one registry may be alive per
//! process at a time.

use crate::errors::{SupervisorError, SupervisorResult};
use crate::signal::SignalKind;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Standard signals are numbered 1..=31 on every supported platform
const SLOTS: usize = 32;

const MODE_UNBOUND: u8 = 0;
const MODE_RECORD: u8 = 1;
const MODE_ONESHOT: u8 = 2;
const MODE_REARM: u8 = 3;
const MODE_EXIT: u8 = 4;

#[allow(clippy::declare_interior_mutable_const)]
const PENDING_INIT: AtomicU32 = AtomicU32::new(0);
#[allow(clippy::declare_interior_mutable_const)]
const MODE_INIT: AtomicU8 = AtomicU8::new(MODE_UNBOUND);
#[allow(clippy::declare_interior_mutable_const)]
const CODE_INIT: AtomicI32 = AtomicI32::new(0);
#[allow(clippy::declare_interior_mutable_const)]
const NOTICE_INIT: AtomicPtr<u8> = AtomicPtr::new(std::ptr::null_mut());
#[allow(clippy::declare_interior_mutable_const)]
const LEN_INIT: AtomicUsize = AtomicUsize::new(0);

// Shared with the trampoline; must stay lock-free
static PENDING: [AtomicU32; SLOTS] = [PENDING_INIT; SLOTS];
static MODE: [AtomicU8; SLOTS] = [MODE_INIT; SLOTS];
static EXIT_CODE: [AtomicI32; SLOTS] = [CODE_INIT; SLOTS];
static EXIT_NOTICE: [AtomicPtr<u8>; SLOTS] = [NOTICE_INIT; SLOTS];
static EXIT_NOTICE_LEN: [AtomicUsize; SLOTS] = [LEN_INIT; SLOTS];

static CLAIMED: AtomicBool = AtomicBool::new(false);

fn slot_of(signum: i32) -> Option<usize> {
    usize::try_from(signum).ok().filter(|&slot| slot > 0 && slot < SLOTS)
}

extern "C" fn trampoline(signum: libc::c_int) {
    let Some(slot) = slot_of(signum) else {
        return;
    };

    match MODE[slot].load(Ordering::SeqCst) {
        MODE_REARM => {
            // Re-register first so a back-to-back delivery is not lost to SIG_DFL
            if let Ok(sig) = Signal::try_from(signum) {
                let _ = unsafe { signal::sigaction(sig, &os_action(Delivery::Rearming)) };
            }
            PENDING[slot].fetch_add(1, Ordering::SeqCst);
        }
        MODE_RECORD => {
            PENDING[slot].fetch_add(1, Ordering::SeqCst);
        }
        MODE_ONESHOT => {
            // The kernel already restored SIG_DFL
            MODE[slot].store(MODE_UNBOUND, Ordering::SeqCst);
            PENDING[slot].fetch_add(1, Ordering::SeqCst);
        }
        MODE_EXIT => {
            let notice = EXIT_NOTICE[slot].load(Ordering::SeqCst);
            let len = EXIT_NOTICE_LEN[slot].load(Ordering::SeqCst);
            if !notice.is_null() && len > 0 {
                // SAFETY: the pointer and length come from a `&'static str`
                unsafe {
                    libc::write(libc::STDOUT_FILENO, notice as *const libc::c_void, len);
                }
            }
            // SAFETY: _exit is async-signal-safe and skips the atexit handlers
            unsafe { libc::_exit(EXIT_CODE[slot].load(Ordering::SeqCst)) }
        }
        _ => {}
    }
}

/// How the OS keeps a binding installed across deliveries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Stays installed until replaced or unregistered
    Persistent,
    /// Reverts to the default disposition after one delivery
    OneShot,
    /// Reverts like `OneShot`, but the trampoline re-registers itself first
    Rearming,
}

fn os_action(delivery: Delivery) -> SigAction {
    let flags = match delivery {
        Delivery::Persistent => SaFlags::SA_RESTART,
        Delivery::OneShot | Delivery::Rearming => SaFlags::SA_RESTART | SaFlags::SA_RESETHAND,
    };
    SigAction::new(SigHandler::Handler(trampoline), flags, SigSet::empty())
}

/// Deferred handler, run once per recorded delivery
pub type Handler = Box<dyn FnMut(SignalKind) + Send>;

struct Binding {
    delivery: Delivery,
    handler: Option<Handler>,
}

/// Owned, process-singleton table of signal bindings
pub struct SignalRegistry {
    bindings: HashMap<SignalKind, Binding>,
    poll_interval: Duration,
}

impl SignalRegistry {
    /// Default sleep between polls in [`SignalRegistry::wait`]
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

    /// Claim the process-wide dispositions.
    ///
    /// Fails with [`SupervisorError::RegistryInUse`] while another registry is alive.
    pub fn new() -> SupervisorResult<Self> {
        if CLAIMED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SupervisorError::RegistryInUse);
        }
        Ok(Self {
            bindings: HashMap::new(),
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        })
    }

    /// Set how often [`SignalRegistry::wait`] checks for deliveries
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Install a persistent handler, replacing any prior binding for `kind`
    pub fn register<F>(&mut self, kind: SignalKind, handler: F) -> SupervisorResult<()>
    where
        F: FnMut(SignalKind) + Send + 'static,
    {
        self.register_with(kind, Delivery::Persistent, handler)
    }

    /// Install a handler with an explicit delivery mode
    pub fn register_with<F>(
        &mut self,
        kind: SignalKind,
        delivery: Delivery,
        handler: F,
    ) -> SupervisorResult<()>
    where
        F: FnMut(SignalKind) + Send + 'static,
    {
        self.bind(kind, delivery, Some(Box::new(handler)))
    }

    /// Record deliveries of `kind` without a handler; read them with [`SignalRegistry::take_pending`]
    pub fn watch(&mut self, kind: SignalKind, delivery: Delivery) -> SupervisorResult<()> {
        self.bind(kind, delivery, None)
    }

    /// Terminate the process from signal context when `kind` arrives.
    ///
    /// `notice` is written to stdout with `write(2)` before `_exit(code)`.
    pub fn register_exit(
        &mut self,
        kind: SignalKind,
        code: i32,
        notice: &'static str,
    ) -> SupervisorResult<()> {
        let slot = Self::checked_slot(kind)?;

        EXIT_CODE[slot].store(code, Ordering::SeqCst);
        EXIT_NOTICE[slot].store(notice.as_ptr() as *mut u8, Ordering::SeqCst);
        EXIT_NOTICE_LEN[slot].store(notice.len(), Ordering::SeqCst);
        MODE[slot].store(MODE_EXIT, Ordering::SeqCst);

        self.install(kind, Delivery::Persistent)?;
        self.bindings.insert(
            kind,
            Binding {
                delivery: Delivery::Persistent,
                handler: None,
            },
        );
        debug!(signal = %kind, code, "exit binding installed");
        Ok(())
    }

    /// Restore the default disposition for `kind`
    pub fn unregister(&mut self, kind: SignalKind) -> SupervisorResult<()> {
        if self.bindings.remove(&kind).is_none() {
            return Ok(());
        }
        restore_default(kind)?;
        debug!(signal = %kind, "binding removed");
        Ok(())
    }

    /// Whether the OS still routes `kind` to this registry
    pub fn is_active(&self, kind: SignalKind) -> bool {
        self.bindings.contains_key(&kind)
            && slot_of(kind.as_raw())
                .map(|slot| MODE[slot].load(Ordering::SeqCst) != MODE_UNBOUND)
                .unwrap_or(false)
    }

    /// Delivery mode of the current binding, if any
    pub fn delivery(&self, kind: SignalKind) -> Option<Delivery> {
        self.bindings.get(&kind).map(|binding| binding.delivery)
    }

    /// Deliveries recorded for `kind` and not yet consumed
    pub fn pending(&self, kind: SignalKind) -> u32 {
        slot_of(kind.as_raw())
            .map(|slot| PENDING[slot].load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Consume and return the deliveries recorded for `kind`
    pub fn take_pending(&mut self, kind: SignalKind) -> u32 {
        slot_of(kind.as_raw())
            .map(|slot| PENDING[slot].swap(0, Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Run every handler once per recorded delivery.
    ///
    /// Returns how many handler invocations ran.
    pub fn dispatch(&mut self) -> usize {
        self.bindings
            .iter_mut()
            .map(|(kind, binding)| run_pending(*kind, binding))
            .sum()
    }

    /// Poll [`SignalRegistry::dispatch`] until a handler ran or `timeout` elapsed
    pub fn wait(&mut self, timeout: Duration) -> usize {
        let start = Instant::now();
        loop {
            let invoked = self.dispatch();
            if invoked > 0 || start.elapsed() >= timeout {
                return invoked;
            }
            thread::sleep(self.poll_interval.min(timeout.saturating_sub(start.elapsed())));
        }
    }

    /// Raise `kind` against this thread and run its handler before returning.
    ///
    /// Only `kind`'s handler runs; deliveries recorded for other signals stay
    /// pending. Returns how many times that handler was invoked.
    pub fn raise(&mut self, kind: SignalKind) -> SupervisorResult<usize> {
        crate::signal::raise_self(kind)?;
        Ok(self
            .bindings
            .get_mut(&kind)
            .map(|binding| run_pending(kind, binding))
            .unwrap_or(0))
    }

    fn checked_slot(kind: SignalKind) -> SupervisorResult<usize> {
        if !kind.is_overridable() {
            warn!(signal = %kind, "refusing to register a handler for a non-overridable signal");
            return Err(SupervisorError::NonOverridableSignal { signal: kind });
        }
        slot_of(kind.as_raw()).ok_or(SupervisorError::NonOverridableSignal { signal: kind })
    }

    fn bind(
        &mut self,
        kind: SignalKind,
        delivery: Delivery,
        handler: Option<Handler>,
    ) -> SupervisorResult<()> {
        let slot = Self::checked_slot(kind)?;

        let mode = match delivery {
            Delivery::Persistent => MODE_RECORD,
            Delivery::OneShot => MODE_ONESHOT,
            Delivery::Rearming => MODE_REARM,
        };
        MODE[slot].store(mode, Ordering::SeqCst);

        self.install(kind, delivery)?;
        if self.bindings.insert(kind, Binding { delivery, handler }).is_some() {
            debug!(signal = %kind, ?delivery, "binding replaced");
        } else {
            debug!(signal = %kind, ?delivery, "binding installed");
        }
        Ok(())
    }

    fn install(&self, kind: SignalKind, delivery: Delivery) -> SupervisorResult<()> {
        // SAFETY: the trampoline only touches atomics, sigaction, write and _exit
        unsafe { signal::sigaction(kind.as_nix(), &os_action(delivery)) }.map_err(|e| {
            if let Some(slot) = slot_of(kind.as_raw()) {
                MODE[slot].store(MODE_UNBOUND, Ordering::SeqCst);
            }
            warn!(signal = %kind, error = %e, "sigaction failed");
            SupervisorError::from(e)
        })?;
        Ok(())
    }
}

fn run_pending(kind: SignalKind, binding: &mut Binding) -> usize {
    let Some(handler) = binding.handler.as_mut() else {
        return 0;
    };
    let Some(slot) = slot_of(kind.as_raw()) else {
        return 0;
    };
    let count = PENDING[slot].swap(0, Ordering::SeqCst);
    for _ in 0..count {
        handler(kind);
    }
    count as usize
}

/// Whether `kind` currently terminates the process through an exit binding
pub(crate) fn exit_bound(kind: SignalKind) -> bool {
    slot_of(kind.as_raw())
        .map(|slot| MODE[slot].load(Ordering::SeqCst) == MODE_EXIT)
        .unwrap_or(false)
}

fn restore_default(kind: SignalKind) -> SupervisorResult<()> {
    if let Some(slot) = slot_of(kind.as_raw()) {
        MODE[slot].store(MODE_UNBOUND, Ordering::SeqCst);
        PENDING[slot].store(0, Ordering::SeqCst);
    }
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    unsafe { signal::sigaction(kind.as_nix(), &default) }?;
    Ok(())
}

impl Drop for SignalRegistry {
    fn drop(&mut self) {
        for kind in self.bindings.keys() {
            if let Err(e) = restore_default(*kind) {
                warn!(signal = %kind, error = %e, "failed to restore default disposition");
            }
        }
        CLAIMED.store(false, Ordering::SeqCst);
    }
}
