//! Idle loop tying the registry, children and timer together
//!
//! Signal context only records deliveries. [`Supervisor::poll`] turns those
//! records into [`Event`]s on the main thread, reaping every terminated child
//! whenever a SIGCHLD was seen.

use crate::child::{ChildSupervisor, ExitReport, ProcessHandle};
use crate::config::{SpawnFailurePolicy, SupervisorConfig};
use crate::errors::SupervisorResult;
use crate::registry::{Delivery, SignalRegistry};
use crate::signal::SignalKind;
use crate::timer::{TimerGuard, DEFAULT_TIMEOUT_NOTICE};
use std::ops::ControlFlow;
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info};

/// Something the idle loop observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A watched signal arrived
    Signal(SignalKind),
    /// A child was reaped
    ChildExited(ExitReport),
    /// The tick interval elapsed
    Tick,
}

/// One supervising process: its bindings, its children and its settings
pub struct Supervisor {
    registry: SignalRegistry,
    children: ChildSupervisor,
    watched: Vec<SignalKind>,
    config: SupervisorConfig,
}

impl Supervisor {
    /// Claim the signal registry and start watching SIGCHLD
    pub fn new(config: SupervisorConfig) -> SupervisorResult<Self> {
        config.validate()?;
        let mut registry = SignalRegistry::new()?.with_poll_interval(config.poll_interval);
        registry.watch(SignalKind::Child, Delivery::Persistent)?;

        Ok(Self {
            registry,
            children: ChildSupervisor::new(),
            watched: Vec::new(),
            config,
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn registry(&mut self) -> &mut SignalRegistry {
        &mut self.registry
    }

    pub fn children(&mut self) -> &mut ChildSupervisor {
        &mut self.children
    }

    /// Report deliveries of `kind` as [`Event::Signal`]
    pub fn watch(&mut self, kind: SignalKind) -> SupervisorResult<()> {
        self.registry.watch(kind, Delivery::Persistent)?;
        if !self.watched.contains(&kind) {
            self.watched.push(kind);
        }
        Ok(())
    }

    /// Fork a child, honoring the configured spawn failure policy.
    ///
    /// With [`SpawnFailurePolicy::LogAndContinue`] a failed fork is logged and
    /// `Ok(None)` is returned.
    pub fn spawn<F>(&mut self, work: F) -> SupervisorResult<Option<ProcessHandle>>
    where
        F: FnOnce() -> i32,
    {
        match self.children.spawn(work) {
            Ok(handle) => Ok(Some(handle)),
            Err(e) => match self.config.spawn_failure {
                SpawnFailurePolicy::Propagate => Err(e),
                SpawnFailurePolicy::LogAndContinue => {
                    error!(error = %e, "spawn failed, continuing without the child");
                    Ok(None)
                }
            },
        }
    }

    /// Bind SIGALRM so an expired deadline exits with the configured code
    pub fn timer(&mut self) -> SupervisorResult<TimerGuard> {
        TimerGuard::install(
            &mut self.registry,
            self.config.timeout_exit_code,
            DEFAULT_TIMEOUT_NOTICE,
        )
    }

    /// Collect everything recorded since the last poll
    pub fn poll(&mut self) -> SupervisorResult<Vec<Event>> {
        let mut events = Vec::new();

        self.registry.dispatch();

        for &kind in &self.watched {
            if kind == SignalKind::Child {
                continue;
            }
            for _ in 0..self.registry.take_pending(kind) {
                events.push(Event::Signal(kind));
            }
        }

        let notifications = self.registry.take_pending(SignalKind::Child);
        if notifications > 0 {
            let reports = self.children.reap_all()?;
            debug!(notifications, reaped = reports.len(), "SIGCHLD handled");
            if self.watched.contains(&SignalKind::Child) {
                events.push(Event::Signal(SignalKind::Child));
            }
            events.extend(reports.into_iter().map(Event::ChildExited));
        }

        Ok(events)
    }

    /// Run the idle loop until `on_event` breaks
    pub fn run<F>(&mut self, mut on_event: F) -> SupervisorResult<()>
    where
        F: FnMut(&mut Self, Event) -> ControlFlow<()>,
    {
        info!(pid = %nix::unistd::getpid(), "supervisor loop started");
        let mut last_tick = Instant::now();

        if on_event(self, Event::Tick).is_break() {
            return Ok(());
        }

        loop {
            let mut events = self.poll()?;
            if last_tick.elapsed() >= self.config.tick_interval {
                last_tick = Instant::now();
                events.push(Event::Tick);
            }

            for event in events {
                if on_event(self, event).is_break() {
                    info!("supervisor loop stopped");
                    return Ok(());
                }
            }

            thread::sleep(self.config.poll_interval);
        }
    }
}
