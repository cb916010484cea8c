//! Process & signal supervision for Unix
//!
//! A single supervising process registers signal handlers, forks children,
//! reaps them, signals its process group and races a SIGALRM deadline
//! against console input. Handlers never run real work in signal context:
//! deliveries are recorded and replayed on the main control flow.

pub mod async_reaper;
pub mod child;
pub mod config;
pub mod errors;
pub mod group;
pub mod logging;
pub mod registry;
pub mod signal;
pub mod supervisor;
pub mod timer;

// Re-export commonly used types
pub use async_reaper::AsyncReaper;
pub use child::{ChildSupervisor, ExitOutcome, ExitReport, ProcessHandle};
pub use config::{SpawnFailurePolicy, SupervisorConfig};
pub use errors::{ErrorContext, SupervisorError, SupervisorResult};
pub use registry::{Delivery, SignalRegistry};
pub use signal::SignalKind;
pub use supervisor::{Event, Supervisor};
pub use timer::TimerGuard;
