//! Integration tests for signal delivery, reaping, groups and deadlines
//!
//! Anything that installs handlers, reaps with `waitpid(-1)`, arms SIGALRM or
//! signals a process group runs inside a forked sandbox, so it cannot touch
//! the test harness or steal children from tests running in parallel. A
//! sandbox reports a failed step through its exit code.

use nix::sys::signal::Signal;
use signal_supervisor::group::{broadcast_to_own_group, group_id_of_self, lead_new_group};
use signal_supervisor::signal::raise_self;
use nix::sys::resource::{setrlimit, Resource};
use nix::unistd::{dup2, geteuid, setuid, Uid};
use signal_supervisor::{
    AsyncReaper, ChildSupervisor, Delivery, Event, ExitReport, SignalKind, SignalRegistry,
    SpawnFailurePolicy, Supervisor, SupervisorConfig, SupervisorError, TimerGuard,
};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT_EXIT_CODE: i32 = 9;
const NOTICE: &str = "deadline expired\n";
/// `nobody`; root is exempt from RLIMIT_NPROC
const UNPRIVILEGED_UID: u32 = 65534;

type Step = Result<(), i32>;

trait OrCode<T> {
    fn or_code(self, code: i32) -> Result<T, i32>;
}

impl<T, E> OrCode<T> for Result<T, E> {
    fn or_code(self, code: i32) -> Result<T, i32> {
        self.map_err(|_| code)
    }
}

macro_rules! ensure {
    ($cond:expr, $code:expr) => {
        if !$cond {
            return Err($code);
        }
    };
}

/// Run `scenario` in a forked child and return how that child ended
fn sandbox<F>(scenario: F) -> ExitReport
where
    F: FnOnce() -> Step,
{
    let mut children = ChildSupervisor::new();
    let handle = children
        .spawn(move || match scenario() {
            Ok(()) => 0,
            Err(code) => code,
        })
        .expect("failed to fork sandbox");
    children.wait(handle).expect("failed to reap sandbox")
}

fn assert_passed(report: ExitReport) {
    assert_eq!(report.code(), Some(0), "sandbox failed: {report}");
}

fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut done: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

fn counting_handler() -> (Arc<AtomicUsize>, impl FnMut(SignalKind) + Send + 'static) {
    let counter = Arc::new(AtomicUsize::new(0));
    let seen = counter.clone();
    (counter, move |_: SignalKind| {
        seen.fetch_add(1, Ordering::SeqCst);
    })
}

// Signal registry

#[test]
fn test_rearming_handler_fires_once_per_delivery() {
    assert_passed(sandbox(|| {
        let (counter, handler) = counting_handler();
        let mut registry = SignalRegistry::new().or_code(2)?;
        registry
            .register_with(SignalKind::User1, Delivery::Rearming, handler)
            .or_code(3)?;

        for _ in 0..5 {
            raise_self(SignalKind::User1).or_code(4)?;
        }
        ensure!(registry.pending(SignalKind::User1) == 5, 5);
        ensure!(registry.dispatch() == 5, 6);
        ensure!(counter.load(Ordering::SeqCst) == 5, 7);
        ensure!(registry.is_active(SignalKind::User1), 8);
        Ok(())
    }));
}

#[test]
fn test_one_shot_handler_reverts_to_default() {
    let report = sandbox(|| {
        let (counter, handler) = counting_handler();
        let mut registry = SignalRegistry::new().or_code(2)?;
        registry
            .register_with(SignalKind::User1, Delivery::OneShot, handler)
            .or_code(3)?;

        ensure!(registry.raise(SignalKind::User1).or_code(4)? == 1, 5);
        ensure!(counter.load(Ordering::SeqCst) == 1, 6);
        ensure!(!registry.is_active(SignalKind::User1), 7);

        // default disposition terminates the sandbox here
        let _ = raise_self(SignalKind::User1);
        Err(8)
    });
    assert_eq!(report.signal(), Some(Signal::SIGUSR1), "{report}");
}

#[test]
fn test_raise_runs_handler_before_returning() {
    assert_passed(sandbox(|| {
        let (counter, handler) = counting_handler();
        let mut registry = SignalRegistry::new().or_code(2)?;
        registry.register(SignalKind::User2, handler).or_code(3)?;

        for expected in 1..=3 {
            let invoked = registry.raise(SignalKind::User2).or_code(4)?;
            ensure!(invoked == 1, 5);
            ensure!(counter.load(Ordering::SeqCst) == expected, 6);
        }
        Ok(())
    }));
}

#[test]
fn test_raise_only_runs_the_raised_handler() {
    assert_passed(sandbox(|| {
        let (user1, user1_handler) = counting_handler();
        let (user2, user2_handler) = counting_handler();
        let mut registry = SignalRegistry::new().or_code(2)?;
        registry.register(SignalKind::User1, user1_handler).or_code(3)?;
        registry.register(SignalKind::User2, user2_handler).or_code(4)?;

        raise_self(SignalKind::User2).or_code(5)?;
        ensure!(registry.raise(SignalKind::User1).or_code(6)? == 1, 7);
        ensure!(user1.load(Ordering::SeqCst) == 1, 8);
        ensure!(user2.load(Ordering::SeqCst) == 0, 9);
        ensure!(registry.pending(SignalKind::User2) == 1, 10);

        ensure!(registry.dispatch() == 1, 11);
        ensure!(user2.load(Ordering::SeqCst) == 1, 12);
        Ok(())
    }));
}

#[test]
fn test_reregistration_replaces_handler() {
    assert_passed(sandbox(|| {
        let (first, first_handler) = counting_handler();
        let (second, second_handler) = counting_handler();
        let mut registry = SignalRegistry::new().or_code(2)?;
        registry.register(SignalKind::Hangup, first_handler).or_code(3)?;
        registry.register(SignalKind::Hangup, second_handler).or_code(4)?;

        registry.raise(SignalKind::Hangup).or_code(5)?;
        ensure!(first.load(Ordering::SeqCst) == 0, 6);
        ensure!(second.load(Ordering::SeqCst) == 1, 7);
        Ok(())
    }));
}

#[test]
fn test_non_overridable_signals_are_rejected() {
    assert_passed(sandbox(|| {
        let mut registry = SignalRegistry::new().or_code(2)?;
        for kind in [SignalKind::Kill, SignalKind::Stop] {
            match registry.register(kind, |_| {}) {
                Err(SupervisorError::NonOverridableSignal { signal }) => ensure!(signal == kind, 3),
                _ => return Err(4),
            }
            ensure!(!registry.is_active(kind), 5);
        }
        ensure!(registry.watch(SignalKind::Kill, Delivery::Persistent).is_err(), 6);
        Ok(())
    }));
}

#[test]
fn test_one_registry_per_process() {
    assert_passed(sandbox(|| {
        let registry = SignalRegistry::new().or_code(2)?;
        ensure!(
            matches!(SignalRegistry::new(), Err(SupervisorError::RegistryInUse)),
            3
        );
        drop(registry);
        SignalRegistry::new().or_code(4)?;
        Ok(())
    }));
}

#[test]
fn test_dropping_registry_restores_default() {
    let report = sandbox(|| {
        let mut registry = SignalRegistry::new().or_code(2)?;
        registry.register(SignalKind::User2, |_| {}).or_code(3)?;
        drop(registry);

        let _ = raise_self(SignalKind::User2);
        Err(4)
    });
    assert_eq!(report.signal(), Some(Signal::SIGUSR2), "{report}");
}

// Child supervisor

#[test]
fn test_sigchld_reap_recovers_exit_code_once() {
    assert_passed(sandbox(|| {
        let mut supervisor = Supervisor::new(SupervisorConfig::default()).or_code(2)?;
        let handle = supervisor.spawn(|| 53).or_code(3)?.ok_or(4)?;
        let pid = handle.pid();

        let mut exits = Vec::new();
        let collected = wait_until(Duration::from_secs(5), || {
            if let Ok(events) = supervisor.poll() {
                exits.extend(events.into_iter().filter_map(|event| match event {
                    Event::ChildExited(report) => Some(report),
                    _ => None,
                }));
            }
            !exits.is_empty()
        });
        ensure!(collected, 5);

        // nothing else shows up for the same child
        thread::sleep(Duration::from_millis(200));
        let extra = supervisor.poll().or_code(6)?;
        ensure!(extra.is_empty(), 7);

        ensure!(exits.len() == 1, 8);
        ensure!(exits[0].pid == pid, 9);
        ensure!(exits[0].code() == Some(53), 10);
        ensure!(supervisor.children().unreaped() == 0, 11);
        ensure!(
            matches!(
                supervisor.children().wait(handle),
                Err(SupervisorError::AlreadyReaped { .. })
            ),
            12
        );
        Ok(())
    }));
}

#[test]
fn test_coalesced_sigchld_drains_every_child() {
    assert_passed(sandbox(|| {
        let mut registry = SignalRegistry::new().or_code(2)?;
        registry
            .watch(SignalKind::Child, Delivery::Persistent)
            .or_code(3)?;
        let mut children = ChildSupervisor::new();

        let mut expected = HashMap::new();
        for code in [7, 11] {
            let handle = children.spawn(move || code).or_code(4)?;
            expected.insert(handle.pid(), code);
        }

        // both exit well inside this window; their notifications may merge
        thread::sleep(Duration::from_millis(300));
        let notifications = registry.take_pending(SignalKind::Child);
        ensure!(notifications >= 1, 5);

        let reports = children.reap_all().or_code(6)?;
        ensure!(reports.len() == 2, 7);
        for report in reports {
            ensure!(expected.remove(&report.pid) == report.code(), 8);
        }
        ensure!(expected.is_empty(), 9);
        ensure!(children.unreaped() == 0, 10);
        Ok(())
    }));
}

#[test]
fn test_spawn_failure_follows_policy() {
    assert_passed(sandbox(|| {
        setrlimit(Resource::RLIMIT_NPROC, 0, 0).or_code(2)?;
        if geteuid().is_root() {
            setuid(Uid::from_raw(UNPRIVILEGED_UID)).or_code(3)?;
        }

        let propagate = SupervisorConfig {
            spawn_failure: SpawnFailurePolicy::Propagate,
            ..SupervisorConfig::default()
        };
        let mut supervisor = Supervisor::new(propagate).or_code(4)?;
        ensure!(
            matches!(supervisor.spawn(|| 0), Err(SupervisorError::SpawnFailure { .. })),
            5
        );
        ensure!(supervisor.children().unreaped() == 0, 6);
        drop(supervisor);

        let lenient = SupervisorConfig {
            spawn_failure: SpawnFailurePolicy::LogAndContinue,
            ..SupervisorConfig::default()
        };
        let mut supervisor = Supervisor::new(lenient).or_code(7)?;
        ensure!(matches!(supervisor.spawn(|| 0), Ok(None)), 8);
        ensure!(supervisor.children().unreaped() == 0, 9);
        Ok(())
    }));
}

#[test]
fn test_wait_any_child_without_children() {
    assert_passed(sandbox(|| {
        let mut children = ChildSupervisor::new();
        ensure!(matches!(children.wait_any_child(false), Ok(None)), 2);
        ensure!(
            matches!(
                children.wait_any_child(true),
                Err(SupervisorError::NoChildren)
            ),
            3
        );
        Ok(())
    }));
}

#[test]
fn test_wait_any_child_non_blocking_while_running() {
    assert_passed(sandbox(|| {
        let mut children = ChildSupervisor::new();
        let handle = children
            .spawn(|| {
                thread::sleep(Duration::from_millis(300));
                4
            })
            .or_code(2)?;

        ensure!(matches!(children.wait_any_child(false), Ok(None)), 3);
        let report = children.wait_any_child(true).or_code(4)?.ok_or(5)?;
        ensure!(report.pid == handle.pid(), 6);
        ensure!(report.code() == Some(4), 7);
        Ok(())
    }));
}

#[test]
fn test_supervisor_run_reports_signals_ticks_and_exits() {
    assert_passed(sandbox(|| {
        let config = SupervisorConfig {
            tick_interval: Duration::from_millis(50),
            ..SupervisorConfig::default()
        };
        let mut supervisor = Supervisor::new(config).or_code(2)?;
        supervisor.watch(SignalKind::User2).or_code(3)?;
        supervisor
            .spawn(|| {
                thread::sleep(Duration::from_millis(200));
                5
            })
            .or_code(4)?;
        raise_self(SignalKind::User2).or_code(5)?;

        let mut ticks = 0;
        let mut signals = 0;
        let mut exit_code = None;
        supervisor
            .run(|_, event| match event {
                Event::Tick => {
                    ticks += 1;
                    ControlFlow::Continue(())
                }
                Event::Signal(SignalKind::User2) => {
                    signals += 1;
                    ControlFlow::Continue(())
                }
                Event::Signal(_) => ControlFlow::Continue(()),
                Event::ChildExited(report) => {
                    exit_code = report.code();
                    ControlFlow::Break(())
                }
            })
            .or_code(6)?;

        ensure!(signals == 1, 7);
        ensure!(ticks >= 2, 8);
        ensure!(exit_code == Some(5), 9);
        Ok(())
    }));
}

#[test]
fn test_async_reaper_drains_children() {
    assert_passed(sandbox(|| {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .or_code(2)?;

        runtime.block_on(async {
            let mut reaper = AsyncReaper::new().or_code(3)?;
            let mut children = ChildSupervisor::new();
            for code in 1..=3 {
                children
                    .spawn(move || {
                        thread::sleep(Duration::from_millis(50 * code as u64));
                        code
                    })
                    .or_code(4)?;
            }

            let mut codes = Vec::new();
            while children.unreaped() > 0 {
                let reports = tokio::time::timeout(
                    Duration::from_secs(5),
                    reaper.next_exits(&mut children),
                )
                .await
                .or_code(5)?
                .or_code(6)?;
                codes.extend(reports.iter().filter_map(|report| report.code()));
            }
            codes.sort_unstable();
            ensure!(codes == vec![1, 2, 3], 7);
            Ok::<(), i32>(())
        })
    }));
}

// Timer guard

fn name_file() -> File {
    let mut file = tempfile::tempfile().expect("failed to create temp file");
    writeln!(file, "Ada").expect("failed to write name");
    file.seek(SeekFrom::Start(0)).expect("failed to rewind");
    file
}

#[test]
fn test_input_before_deadline_disarms_timer() {
    let input = name_file();
    assert_passed(sandbox(move || {
        let mut registry = SignalRegistry::new().or_code(2)?;
        let mut timer = TimerGuard::install(&mut registry, TIMEOUT_EXIT_CODE, NOTICE).or_code(3)?;

        let name = timer
            .read_line_before_deadline(BufReader::new(input), 1)
            .or_code(4)?;
        ensure!(name.as_deref() == Some("Ada\n"), 5);
        ensure!(!timer.is_armed(), 6);

        // well past the first deadline
        thread::sleep(Duration::from_millis(1500));
        Ok(())
    }));
}

#[test]
fn test_deadline_without_input_terminates() {
    let start = Instant::now();
    let report = sandbox(|| {
        let mut registry = SignalRegistry::new().or_code(2)?;
        let mut timer = TimerGuard::install(&mut registry, TIMEOUT_EXIT_CODE, NOTICE).or_code(3)?;

        // the write end stays open, so the read blocks until the alarm
        let (read_end, _write_end) = nix::unistd::pipe().or_code(4)?;
        let _ = timer.read_line_before_deadline(BufReader::new(File::from(read_end)), 1);
        Err(5)
    });

    assert_eq!(report.code(), Some(TIMEOUT_EXIT_CODE), "{report}");
    assert!(start.elapsed() >= Duration::from_millis(900));
}

#[test]
fn test_stale_deadline_fires_when_not_cancelled() {
    let input = name_file();
    let report = sandbox(move || {
        let mut registry = SignalRegistry::new().or_code(2)?;
        let mut timer = TimerGuard::install(&mut registry, TIMEOUT_EXIT_CODE, NOTICE).or_code(3)?;

        timer.arm(1).or_code(6)?;
        let mut line = String::new();
        std::io::BufRead::read_line(&mut BufReader::new(input), &mut line).or_code(4)?;
        // no cancel: the old deadline is still live
        thread::sleep(Duration::from_secs(3));
        Err(5)
    });
    assert_eq!(report.code(), Some(TIMEOUT_EXIT_CODE), "{report}");
}

#[test]
fn test_deadline_notice_goes_to_stdout() {
    let (read_end, write_end) = nix::unistd::pipe().expect("failed to create pipe");
    let report = sandbox(move || {
        dup2(write_end.as_raw_fd(), libc::STDOUT_FILENO).or_code(2)?;
        drop(write_end);
        let mut registry = SignalRegistry::new().or_code(3)?;
        let mut timer = TimerGuard::install(&mut registry, TIMEOUT_EXIT_CODE, NOTICE).or_code(4)?;

        timer.arm(1).or_code(5)?;
        thread::sleep(Duration::from_secs(3));
        Err(6)
    });
    assert_eq!(report.code(), Some(TIMEOUT_EXIT_CODE), "{report}");

    let output = std::io::read_to_string(File::from(read_end)).expect("failed to read stdout");
    assert_eq!(output, NOTICE);
}

#[test]
fn test_arming_requires_the_exit_binding() {
    assert_passed(sandbox(|| {
        let mut registry = SignalRegistry::new().or_code(2)?;
        let mut timer = TimerGuard::install(&mut registry, TIMEOUT_EXIT_CODE, NOTICE).or_code(3)?;

        registry.unregister(SignalKind::Alarm).or_code(4)?;
        ensure!(matches!(timer.arm(1), Err(SupervisorError::DeadlineUnbound)), 5);
        ensure!(!timer.is_armed(), 6);

        let mut timer = TimerGuard::install(&mut registry, TIMEOUT_EXIT_CODE, NOTICE).or_code(7)?;
        ensure!(timer.arm(30).or_code(8)?.is_none(), 9);
        timer.cancel();

        drop(registry);
        ensure!(matches!(timer.arm(1), Err(SupervisorError::DeadlineUnbound)), 10);
        ensure!(timer.arm(0).is_ok(), 11);

        // a wrongly armed alarm would kill the sandbox with SIGALRM here
        thread::sleep(Duration::from_millis(1500));
        Ok(())
    }));
}

#[test]
fn test_arm_zero_cancels() {
    assert_passed(sandbox(|| {
        let mut registry = SignalRegistry::new().or_code(2)?;
        let mut timer = TimerGuard::install(&mut registry, TIMEOUT_EXIT_CODE, NOTICE).or_code(3)?;

        ensure!(timer.arm(1).or_code(8)?.is_none(), 4);
        ensure!(timer.is_armed(), 5);
        ensure!(timer.arm(0).or_code(9)?.is_some(), 6);
        ensure!(!timer.is_armed(), 7);
        thread::sleep(Duration::from_millis(1500));
        Ok(())
    }));
}

#[test]
fn test_rearming_timer_replaces_deadline() {
    let report = sandbox(|| {
        let mut registry = SignalRegistry::new().or_code(2)?;
        let mut timer = TimerGuard::install(&mut registry, TIMEOUT_EXIT_CODE, NOTICE).or_code(3)?;

        timer.arm(30).or_code(7)?;
        let previous = timer.arm(1).or_code(8)?;
        ensure!(matches!(previous, Some(left) if left > 1), 4);
        ensure!(timer.armed_for() == Some(1), 5);

        thread::sleep(Duration::from_secs(3));
        Err(6)
    });
    assert_eq!(report.code(), Some(TIMEOUT_EXIT_CODE), "{report}");
}

#[test]
fn test_eof_returns_none_and_disarms() {
    assert_passed(sandbox(|| {
        let mut registry = SignalRegistry::new().or_code(2)?;
        let mut timer = TimerGuard::install(&mut registry, TIMEOUT_EXIT_CODE, NOTICE).or_code(3)?;

        let line = timer
            .read_line_before_deadline(std::io::empty(), 1)
            .or_code(4)?;
        ensure!(line.is_none(), 5);
        ensure!(!timer.is_armed(), 6);
        thread::sleep(Duration::from_millis(1500));
        Ok(())
    }));
}

// Group broadcaster

#[test]
fn test_group_broadcast_reaches_every_member_once() {
    const MEMBERS: usize = 3;

    assert_passed(sandbox(|| {
        let group = lead_new_group().or_code(2)?;
        ensure!(group_id_of_self() == group, 3);

        let mut registry = SignalRegistry::new().or_code(4)?;
        registry
            .watch(SignalKind::User1, Delivery::Persistent)
            .or_code(5)?;

        let mut children = ChildSupervisor::new();
        let mut handles = Vec::new();
        for _ in 1..MEMBERS {
            let registry = &registry;
            let handle = children
                .spawn(move || {
                    wait_until(Duration::from_secs(5), || {
                        registry.pending(SignalKind::User1) > 0
                    });
                    thread::sleep(Duration::from_millis(200));
                    registry.pending(SignalKind::User1) as i32
                })
                .or_code(6)?;
            handles.push(handle);
        }

        broadcast_to_own_group(SignalKind::User1).or_code(7)?;

        let delivered = wait_until(Duration::from_secs(5), || {
            registry.pending(SignalKind::User1) > 0
        });
        ensure!(delivered, 8);
        thread::sleep(Duration::from_millis(200));
        ensure!(registry.take_pending(SignalKind::User1) == 1, 9);

        for handle in handles {
            let report = children.wait(handle).or_code(10)?;
            ensure!(report.code() == Some(1), 11);
        }
        Ok(())
    }));
}

// Exit code recovery

mod exit_codes {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_any_exit_code_is_recovered(code in 0i32..=255) {
            let mut children = ChildSupervisor::new();
            let handle = children.spawn(move || code).unwrap();
            let pid = handle.pid();

            let report = children.wait(handle).unwrap();
            prop_assert_eq!(report.pid, pid);
            prop_assert_eq!(report.code(), Some(code));
            prop_assert_eq!(children.unreaped(), 0);
        }
    }
}
