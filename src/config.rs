//! Runtime configuration for the supervisor and demo binaries

use crate::errors::{SupervisorError, SupervisorResult};
use std::str::FromStr;
use std::time::Duration;

/// What [`crate::Supervisor::spawn`] does when fork fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnFailurePolicy {
    /// Return the error to the caller
    Propagate,
    /// Log the failure and carry on without the child
    LogAndContinue,
}

impl FromStr for SpawnFailurePolicy {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "propagate" | "error" => Ok(Self::Propagate),
            "log" | "continue" | "log-and-continue" => Ok(Self::LogAndContinue),
            other => Err(SupervisorError::InvalidConfig(format!(
                "unknown spawn failure policy '{}'",
                other
            ))),
        }
    }
}

/// Supervisor settings
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Sleep between checks for recorded deliveries
    pub poll_interval: Duration,
    /// Period of `Event::Tick` in the idle loop
    pub tick_interval: Duration,
    /// Seconds allowed for console input
    pub input_deadline_secs: u32,
    /// Exit code when the input deadline fires
    pub timeout_exit_code: i32,
    pub spawn_failure: SpawnFailurePolicy,
    /// `tracing_subscriber::EnvFilter` directive
    pub log_filter: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            tick_interval: Duration::from_secs(2),
            input_deadline_secs: 5,
            timeout_exit_code: 0,
            spawn_failure: SpawnFailurePolicy::LogAndContinue,
            log_filter: "info".to_string(),
        }
    }
}

impl SupervisorConfig {
    pub const POLL_INTERVAL_VAR: &'static str = "SIGSUP_POLL_INTERVAL_MS";
    pub const TICK_INTERVAL_VAR: &'static str = "SIGSUP_TICK_INTERVAL_MS";
    pub const INPUT_DEADLINE_VAR: &'static str = "SIGSUP_INPUT_DEADLINE_SECS";
    pub const TIMEOUT_EXIT_CODE_VAR: &'static str = "SIGSUP_TIMEOUT_EXIT_CODE";
    pub const SPAWN_FAILURE_VAR: &'static str = "SIGSUP_SPAWN_FAILURE";
    pub const LOG_FILTER_VAR: &'static str = "RUST_LOG";

    /// Read overrides from the process environment
    pub fn from_env() -> SupervisorResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> SupervisorResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64, _>(&lookup, Self::POLL_INTERVAL_VAR)? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, Self::TICK_INTERVAL_VAR)? {
            config.tick_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var(&lookup, Self::INPUT_DEADLINE_VAR)? {
            config.input_deadline_secs = secs;
        }
        if let Some(code) = parse_var(&lookup, Self::TIMEOUT_EXIT_CODE_VAR)? {
            config.timeout_exit_code = code;
        }
        if let Some(policy) = parse_var(&lookup, Self::SPAWN_FAILURE_VAR)? {
            config.spawn_failure = policy;
        }
        if let Some(filter) = lookup(Self::LOG_FILTER_VAR) {
            config.log_filter = filter;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the supervisor cannot work with
    pub fn validate(&self) -> SupervisorResult<()> {
        if self.poll_interval.is_zero() {
            return Err(SupervisorError::InvalidConfig(
                "poll interval must be positive".into(),
            ));
        }
        if self.tick_interval < self.poll_interval {
            return Err(SupervisorError::InvalidConfig(
                "tick interval must not be shorter than the poll interval".into(),
            ));
        }
        if self.input_deadline_secs == 0 {
            return Err(SupervisorError::InvalidConfig(
                "input deadline must be at least one second".into(),
            ));
        }
        if !(0..=255).contains(&self.timeout_exit_code) {
            return Err(SupervisorError::InvalidConfig(format!(
                "exit code {} is outside 0..=255",
                self.timeout_exit_code
            )));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> SupervisorResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|e| {
            SupervisorError::InvalidConfig(format!("{}='{}': {}", key, raw, e))
        }),
    }
}
