/// Catching SIGINT without dying
///
/// The handler is installed in rearming mode: the OS drops it after every
/// delivery and the trampoline puts it back before anything else, so every
/// Ctrl-C is caught, not just the first one.
use anyhow::{Context, Result};
use signal_supervisor::logging::init_tracing;
use signal_supervisor::{Delivery, SignalKind, SignalRegistry, SupervisorConfig};
use tracing::info;

fn main() -> Result<()> {
    let config = SupervisorConfig::from_env().context("invalid configuration")?;
    init_tracing(&config.log_filter);

    let mut registry = SignalRegistry::new()?.with_poll_interval(config.poll_interval);
    registry
        .register_with(SignalKind::Interrupt, Delivery::Rearming, |kind| {
            println!("Caught {}! (signal number: {})", kind, kind.as_raw());
        })
        .context("failed to register SIGINT handler")?;
    info!(pid = std::process::id(), "SIGINT handler installed");

    loop {
        println!("Working... Press Ctrl-C to trigger SIGINT");
        registry.wait(config.tick_interval);
    }
}
