/// A SIGINT handler inherited across fork
///
/// The binding is installed before forking, so parent and child both catch
/// Ctrl-C (the terminal sends it to the whole foreground group) and keep
/// running.
use anyhow::{Context, Result};
use nix::unistd::getpid;
use signal_supervisor::logging::init_tracing;
use signal_supervisor::{ChildSupervisor, Delivery, SignalKind, SignalRegistry, SupervisorConfig};

fn main() -> Result<()> {
    let config = SupervisorConfig::from_env().context("invalid configuration")?;
    init_tracing(&config.log_filter);

    let mut registry = SignalRegistry::new()?.with_poll_interval(config.poll_interval);
    registry.register_with(SignalKind::Interrupt, Delivery::Rearming, |_| {
        println!("Process {} caught SIGINT.", getpid());
    })?;

    let tick = config.tick_interval;
    let mut children = ChildSupervisor::new();
    children
        .spawn(|| loop {
            println!("Child ({}): running...", getpid());
            registry.wait(tick);
        })
        .context("fork failed")?;

    loop {
        println!("Parent ({}): running...", getpid());
        registry.wait(tick);
    }
}
