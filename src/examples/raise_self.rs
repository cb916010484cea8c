/// Sending SIGUSR1 to ourselves
///
/// `SignalRegistry::raise` delivers the signal to the calling thread and runs
/// the handler before returning, so the handler output always comes first.
use anyhow::{Context, Result};
use signal_supervisor::logging::init_tracing;
use signal_supervisor::{Delivery, SignalKind, SignalRegistry, SupervisorConfig};
use std::thread;
use std::time::Duration;

fn main() -> Result<()> {
    let config = SupervisorConfig::from_env().context("invalid configuration")?;
    init_tracing(&config.log_filter);

    let mut registry = SignalRegistry::new()?;
    registry.register_with(SignalKind::User1, Delivery::Rearming, |kind| {
        println!(
            "{} caught by the same process! (signal {})",
            kind,
            kind.as_raw()
        );
    })?;

    println!("Raising SIGUSR1 in 3 seconds...");
    thread::sleep(Duration::from_secs(3));

    registry.raise(SignalKind::User1)?;

    println!("Back from the signal handler.");
    Ok(())
}
