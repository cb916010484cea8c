/// Reaping a child from a SIGCHLD notification
///
/// The child works for three seconds and exits with 53. The parent keeps
/// ticking; when SIGCHLD arrives it drains every terminated child, prints the
/// recovered status and stops once nothing is left to reap.
use anyhow::{Context, Result};
use signal_supervisor::logging::init_tracing;
use signal_supervisor::{Event, ExitOutcome, Supervisor, SupervisorConfig};
use std::ops::ControlFlow;
use std::thread;
use std::time::Duration;
use tracing::warn;

const CHILD_EXIT_CODE: i32 = 53;

fn main() -> Result<()> {
    let config = SupervisorConfig::from_env().context("invalid configuration")?;
    init_tracing(&config.log_filter);

    let mut supervisor = Supervisor::new(config)?;

    let spawned = supervisor.spawn(|| {
        println!("Child: Doing some work for 3 seconds...");
        thread::sleep(Duration::from_secs(3));
        println!("Child: Exiting now with code {}.", CHILD_EXIT_CODE);
        CHILD_EXIT_CODE
    })?;
    if spawned.is_none() {
        warn!("no child to wait for");
        return Ok(());
    }

    println!("Parent: Waiting for child to finish...");
    supervisor.run(|supervisor, event| match event {
        Event::Tick => {
            println!("Parent is running...");
            ControlFlow::Continue(())
        }
        Event::ChildExited(report) => {
            match report.outcome {
                ExitOutcome::Exited(code) => println!(
                    "Child process with PID {} terminated with status {}",
                    report.pid, code
                ),
                ExitOutcome::Signaled(sig) => println!(
                    "Child process with PID {} was killed by {}",
                    report.pid, sig
                ),
            }
            if supervisor.children().unreaped() == 0 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        }
        Event::Signal(_) => ControlFlow::Continue(()),
    })?;

    Ok(())
}
