/// Racing console input against SIGALRM
///
/// The deadline is disarmed as soon as the read returns, so a quick answer
/// can never be cut off later by a stale alarm. A late answer never arrives:
/// the alarm ends the process first.
use anyhow::{Context, Result};
use signal_supervisor::logging::init_tracing;
use signal_supervisor::{Supervisor, SupervisorConfig};
use std::io;
use tracing::debug;

fn main() -> Result<()> {
    let config = SupervisorConfig::from_env().context("invalid configuration")?;
    init_tracing(&config.log_filter);
    let seconds = config.input_deadline_secs;

    let mut supervisor = Supervisor::new(config)?;
    let mut timer = supervisor.timer()?;

    println!("You have {} seconds to enter your name:", seconds);
    match timer.read_line_before_deadline(io::stdin().lock(), seconds)? {
        Some(name) => print!("Hello, {}", name),
        None => debug!("stdin closed before a name was entered"),
    }
    Ok(())
}
