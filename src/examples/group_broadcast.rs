/// Signaling a whole process group
///
/// Two children inherit the SIGUSR1 binding. After five seconds the parent
/// sends SIGUSR1 to its own group with killpg, and every member, the parent
/// included, reports the delivery on its own. Stop with Ctrl-C.
use anyhow::{Context, Result};
use nix::unistd::getpid;
use signal_supervisor::group::{broadcast_to_group, group_id_of_self, lead_new_group};
use signal_supervisor::logging::init_tracing;
use signal_supervisor::{ChildSupervisor, Delivery, SignalKind, SignalRegistry, SupervisorConfig};
use std::thread;
use std::time::Duration;

const CHILDREN: usize = 2;
const BROADCAST_DELAY: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    let config = SupervisorConfig::from_env().context("invalid configuration")?;
    init_tracing(&config.log_filter);

    let group = lead_new_group()?;

    let mut registry = SignalRegistry::new()?.with_poll_interval(config.poll_interval);
    registry.register_with(SignalKind::User1, Delivery::Rearming, |_| {
        println!("Process {} received SIGUSR1.", getpid());
    })?;

    let tick = config.tick_interval;
    let mut children = ChildSupervisor::new();
    for n in 1..=CHILDREN {
        children
            .spawn(|| loop {
                println!("Child{} ({}) running...", n, getpid());
                registry.wait(tick);
            })
            .with_context(|| format!("failed to fork child {}", n))?;
    }

    println!("Parent ({}) process group: {}", getpid(), group_id_of_self());
    thread::sleep(BROADCAST_DELAY);
    println!("Parent sending SIGUSR1 to the entire process group...");
    broadcast_to_group(SignalKind::User1, group)?;

    loop {
        registry.dispatch();
        println!("Parent ({}) running...", getpid());
        registry.wait(tick);
    }
}
