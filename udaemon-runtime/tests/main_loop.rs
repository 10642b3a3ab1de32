//! In-process main loop scenarios.
//!
//! The signal self-pipe and the installed handlers are process-wide, so every
//! test holds `LOOP_LOCK` while its loop runs, and none closes inherited
//! descriptors.

use std::cell::{Cell, RefCell};
use std::os::fd::{AsRawFd, IntoRawFd};
use std::rc::Rc;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use nix::poll::PollFlags;
use nix::sys::signal::{raise, Signal as OsSignal};
use udaemon_runtime::{
    BoxError, Dispatch, LoopState, PollEvent, Runtime, RuntimeConfig, Signal, TaskStatus,
};

static LOOP_LOCK: Mutex<()> = Mutex::new(());

const WATCHDOG: Duration = Duration::from_secs(5);

fn serialize() -> MutexGuard<'static, ()> {
    LOOP_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn config<C>(name: &str) -> RuntimeConfig<C> {
    RuntimeConfig::new(name)
        .with_foreground(true)
        .with_close_inherited_fds(false)
}

/// Stop a loop that would otherwise hang; the flag records that it fired.
fn arm_watchdog<C: 'static>(runtime: &Runtime<C>, fired: Rc<Cell<bool>>) {
    runtime
        .schedule_task(
            WATCHDOG,
            |rt: &Runtime<C>, _, fired: &mut Rc<Cell<bool>>| {
                fired.set(true);
                rt.request_termination();
                TaskStatus::Complete
            },
            fired,
        )
        .expect("watchdog slot");
}

fn is_open(fd: i32) -> bool {
    // SAFETY: F_GETFD only inspects the descriptor table.
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

#[test]
fn pipe_readability_reaches_read_end_handler() {
    let _guard = serialize();
    let (read, write) = nix::unistd::pipe().expect("pipe");
    let (read_fd, write_fd) = (read.as_raw_fd(), write.as_raw_fd());
    let seen = Rc::new(RefCell::new(Vec::new()));
    let fired = Rc::new(Cell::new(false));

    let rt: Runtime = Runtime::init(config("pipe-test"));
    arm_watchdog(&rt, Rc::clone(&fired));

    // Writer: send one byte, then stop asking for writability.
    rt.add_event_handler(
        write_fd,
        PollFlags::POLLOUT,
        move |_: &Runtime, event: &mut PollEvent, fd: &mut i32| {
            nix::unistd::write(&write, b"x").expect("write");
            event.events.remove(PollFlags::POLLOUT);
            *fd = event.fd;
            Dispatch::Continue
        },
        -1,
    )
    .expect("writer slot");
    let record = Rc::clone(&seen);
    rt.add_event_handler(
        read_fd,
        PollFlags::POLLIN,
        move |rt: &Runtime, event: &mut PollEvent, _: &mut ()| {
            let mut buf = [0u8; 1];
            nix::unistd::read(event.fd, &mut buf).expect("read");
            record.borrow_mut().push((event.fd, event.is_readable(), buf[0]));
            rt.request_termination();
            Dispatch::Continue
        },
        (),
    )
    .expect("reader slot");

    rt.run_main_loop().expect("loop");

    assert!(!fired.get(), "watchdog fired");
    assert_eq!(*seen.borrow(), vec![(read_fd, true, b'x')]);
    assert_eq!(rt.state(), LoopState::Terminated);
    drop(read);
}

#[test]
fn zero_interval_task_runs_on_first_iteration() {
    let _guard = serialize();
    let idles = Rc::new(Cell::new(0u32));
    let idle_count = Rc::clone(&idles);
    let ran = Rc::new(Cell::new(false));

    let rt: Runtime = Runtime::init(
        config("zero-interval-test").on_idle(move |_| idle_count.set(idle_count.get() + 1)),
    );
    rt.schedule_task(
        Duration::ZERO,
        |rt: &Runtime, interval, ran: &mut Rc<Cell<bool>>| {
            assert_eq!(interval, Duration::ZERO);
            ran.set(true);
            rt.request_termination();
            TaskStatus::Complete
        },
        Rc::clone(&ran),
    )
    .expect("task slot");

    rt.run_main_loop().expect("loop");

    assert!(ran.get());
    assert_eq!(idles.get(), 0, "task ran before the first poll");
    assert_eq!(rt.task_count(), 0);
}

#[test]
fn rescheduled_task_runs_twice_one_second_apart() {
    let _guard = serialize();
    let calls = Rc::new(RefCell::new(Vec::<(Instant, Duration)>::new()));
    let fired = Rc::new(Cell::new(false));

    let rt: Runtime = Runtime::init(config("reschedule-test"));
    arm_watchdog(&rt, Rc::clone(&fired));
    rt.schedule_task(
        Duration::ZERO,
        |rt: &Runtime, interval, calls: &mut Rc<RefCell<Vec<(Instant, Duration)>>>| {
            calls.borrow_mut().push((Instant::now(), interval));
            if calls.borrow().len() == 1 {
                TaskStatus::from_code(1)
            } else {
                rt.request_termination();
                TaskStatus::from_code(0)
            }
        },
        Rc::clone(&calls),
    )
    .expect("task slot");

    rt.run_main_loop().expect("loop");

    let calls = calls.borrow();
    assert!(!fired.get(), "watchdog fired");
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].1, Duration::from_secs(1), "returned value becomes the interval");
    assert!(calls[1].0 - calls[0].0 >= Duration::from_secs(1));
    assert_eq!(rt.task_count(), 1, "only the watchdog is left");
}

#[test]
fn reschedule_counts_from_when_the_task_returned() {
    let _guard = serialize();
    let calls = Rc::new(RefCell::new(Vec::<Instant>::new()));
    let fired = Rc::new(Cell::new(false));

    let rt: Runtime = Runtime::init(config("blocking-neighbour-test"));
    // Lower slot: blocks the first iteration well past the poll timeout.
    rt.schedule_task(
        Duration::ZERO,
        |_: &Runtime, _, _: &mut ()| {
            std::thread::sleep(Duration::from_millis(1500));
            TaskStatus::Complete
        },
        (),
    )
    .expect("blocking slot");
    rt.schedule_task(
        Duration::ZERO,
        |rt: &Runtime, _, calls: &mut Rc<RefCell<Vec<Instant>>>| {
            calls.borrow_mut().push(Instant::now());
            if calls.borrow().len() == 1 {
                TaskStatus::from_code(1)
            } else {
                rt.request_termination();
                TaskStatus::Complete
            }
        },
        Rc::clone(&calls),
    )
    .expect("rescheduled slot");
    arm_watchdog(&rt, Rc::clone(&fired));

    rt.run_main_loop().expect("loop");

    let calls = calls.borrow();
    assert!(!fired.get(), "watchdog fired");
    assert_eq!(calls.len(), 2);
    let gap = calls[1] - calls[0];
    assert!(gap >= Duration::from_secs(1), "re-invoked after {gap:?}");
}

#[test]
fn zero_reschedule_runs_once_per_iteration() {
    let _guard = serialize();
    let calls = Rc::new(Cell::new(0u32));
    let idles = Rc::new(Cell::new(0u32));
    let at_idle = Rc::new(RefCell::new(Vec::new()));

    let (task_calls, idle_count, snapshots) =
        (Rc::clone(&calls), Rc::clone(&idles), Rc::clone(&at_idle));
    let rt: Runtime = Runtime::init(
        config("zero-reschedule-test")
            .with_poll_timeout(Duration::from_millis(10))
            .on_idle(move |rt| {
                idle_count.set(idle_count.get() + 1);
                snapshots.borrow_mut().push(task_calls.get());
                if idle_count.get() == 3 {
                    rt.request_termination();
                }
            }),
    );
    rt.schedule_task(
        Duration::ZERO,
        |_: &Runtime, _, calls: &mut Rc<Cell<u32>>| {
            calls.set(calls.get() + 1);
            TaskStatus::Reschedule(Duration::ZERO)
        },
        Rc::clone(&calls),
    )
    .expect("task slot");

    rt.run_main_loop().expect("loop");

    assert_eq!(idles.get(), 3);
    assert_eq!(*at_idle.borrow(), vec![1, 2, 3], "one run per loop iteration");
}

#[test]
fn idle_hook_runs_on_poll_timeout() {
    let _guard = serialize();
    let idles = Rc::new(Cell::new(0u32));
    let fired = Rc::new(Cell::new(false));

    let idle_count = Rc::clone(&idles);
    let rt: Runtime = Runtime::init(
        config("idle-test")
            .with_poll_timeout(Duration::from_millis(10))
            .on_idle(move |rt| {
                idle_count.set(idle_count.get() + 1);
                if idle_count.get() == 2 {
                    rt.request_termination();
                }
            }),
    );
    arm_watchdog(&rt, Rc::clone(&fired));

    rt.run_main_loop().expect("loop");

    assert!(!fired.get(), "watchdog fired");
    assert_eq!(idles.get(), 2);
}

#[test]
fn aborted_task_frees_its_slot() {
    let _guard = serialize();
    let rt: Runtime = Runtime::init(config("abort-test").with_task_capacity(1));
    rt.schedule_task(
        Duration::ZERO,
        |rt: &Runtime, _, _: &mut ()| {
            rt.request_termination();
            TaskStatus::from_code(-1)
        },
        (),
    )
    .expect("task slot");

    rt.run_main_loop().expect("loop");

    assert_eq!(rt.task_count(), 0);
}

#[test]
fn close_result_closes_descriptor_and_frees_slot() {
    let _guard = serialize();
    let (read, write) = nix::unistd::pipe().expect("pipe");
    let read_fd = read.into_raw_fd();
    nix::unistd::write(&write, b"x").expect("write");

    let rt: Runtime = Runtime::init(config("close-test"));
    let id = rt
        .add_event_handler(
            read_fd,
            PollFlags::POLLIN,
            |rt: &Runtime, _: &mut PollEvent, _: &mut ()| {
                rt.request_termination();
                Dispatch::Close
            },
            (),
        )
        .expect("slot");

    rt.run_main_loop().expect("loop");

    assert!(!is_open(read_fd));
    assert_eq!(rt.handler_count(), 0);
    assert!(rt.remove_event_handler(id).is_err(), "slot was already freed");
}

#[test]
fn reload_and_terminate_signals_are_dispatched() {
    let _guard = serialize();
    let parses = Rc::new(Cell::new(0u32));
    let released = Rc::new(RefCell::new(Vec::new()));
    let signals = Rc::new(RefCell::new(Vec::new()));
    let fired = Rc::new(Cell::new(false));

    let parse_count = Rc::clone(&parses);
    let release_log = Rc::clone(&released);
    let signal_log = Rc::clone(&signals);
    let rt: Runtime<u32> = Runtime::init(
        config("signal-test")
            .with_conf_file("/etc/signal-test.yaml")
            .on_config_parse(move |_, previous| {
                parse_count.set(parse_count.get() + 1);
                Ok(previous.copied().unwrap_or(0) + 1)
            })
            .on_config_cleanup(move |value: &u32| release_log.borrow_mut().push(*value))
            .on_signal(move |rt, signal| {
                signal_log
                    .borrow_mut()
                    .push((signal, rt.app_config().as_deref().copied()));
                if signal == Signal::Reload {
                    raise(OsSignal::SIGTERM).expect("raise SIGTERM");
                }
            })
            .on_initialize(|rt| {
                rt.schedule_task(
                    Duration::ZERO,
                    |_: &Runtime<u32>, _, _: &mut ()| {
                        raise(OsSignal::SIGHUP).expect("raise SIGHUP");
                        TaskStatus::Complete
                    },
                    (),
                )?;
                Ok(())
            }),
    );
    arm_watchdog(&rt, Rc::clone(&fired));

    rt.run_main_loop().expect("loop");

    assert!(!fired.get(), "watchdog fired");
    assert_eq!(parses.get(), 2, "initial load plus reload");
    assert_eq!(
        *signals.borrow(),
        vec![(Signal::Reload, Some(2)), (Signal::Terminate, Some(2))]
    );
    assert_eq!(*released.borrow(), vec![1, 2], "replaced on reload, released at cleanup");
    assert!(rt.app_config().is_none());
}

#[test]
fn failed_reload_keeps_current_configuration() {
    let _guard = serialize();
    let fired = Rc::new(Cell::new(false));
    let observed = Rc::new(Cell::new(None));

    let seen = Rc::clone(&observed);
    let rt: Runtime<String> = Runtime::init(
        config("failed-reload-test")
            .with_conf_file("/etc/failed-reload-test.yaml")
            .on_config_parse(|_, previous| match previous {
                None => Ok(String::from("initial")),
                Some(_) => Err(BoxError::from("malformed")),
            })
            .on_signal(move |rt, signal| {
                if signal == Signal::Reload {
                    seen.set(rt.app_config().map(|c| c.as_str() == "initial"));
                    rt.request_termination();
                }
            })
            .on_initialize(|_| {
                raise(OsSignal::SIGHUP)?;
                Ok(())
            }),
    );
    arm_watchdog(&rt, Rc::clone(&fired));

    rt.run_main_loop().expect("loop");

    assert!(!fired.get(), "watchdog fired");
    assert_eq!(observed.get(), Some(true));
}

#[test]
fn debug_and_interrupt_signals_reach_the_signal_hook() {
    let _guard = serialize();
    let signals = Rc::new(RefCell::new(Vec::new()));
    let fired = Rc::new(Cell::new(false));

    let signal_log = Rc::clone(&signals);
    let rt: Runtime = Runtime::init(
        config("debug-signal-test")
            .on_signal(move |_, signal| {
                signal_log.borrow_mut().push(signal);
                let next = match signal {
                    Signal::DebugOn => Some(OsSignal::SIGUSR2),
                    Signal::DebugOff => Some(OsSignal::SIGINT),
                    _ => None,
                };
                if let Some(next) = next {
                    raise(next).expect("raise");
                }
            })
            .on_initialize(|_| {
                raise(OsSignal::SIGUSR1)?;
                Ok(())
            }),
    );
    arm_watchdog(&rt, Rc::clone(&fired));

    rt.run_main_loop().expect("loop");

    assert!(!fired.get(), "watchdog fired");
    assert_eq!(
        *signals.borrow(),
        vec![Signal::DebugOn, Signal::DebugOff, Signal::Terminate]
    );
}

#[test]
fn config_held_across_reload_is_still_released() {
    let _guard = serialize();
    let released = Rc::new(RefCell::new(Vec::new()));
    let held = Rc::new(RefCell::new(None));
    let fired = Rc::new(Cell::new(false));

    let release_log = Rc::clone(&released);
    let keep = Rc::clone(&held);
    let rt: Runtime<u32> = Runtime::init(
        config("held-config-test")
            .with_conf_file("/etc/held-config-test.yaml")
            .on_config_parse(|_, previous| Ok(previous.copied().unwrap_or(0) + 1))
            .on_config_cleanup(move |value: &u32| release_log.borrow_mut().push(*value))
            .on_signal(|rt, signal| {
                if signal == Signal::Reload {
                    rt.request_termination();
                }
            })
            .on_initialize(move |rt| {
                *keep.borrow_mut() = rt.app_config();
                raise(OsSignal::SIGHUP)?;
                Ok(())
            }),
    );
    arm_watchdog(&rt, Rc::clone(&fired));

    rt.run_main_loop().expect("loop");

    assert!(!fired.get(), "watchdog fired");
    assert_eq!(*released.borrow(), vec![1, 2]);
    assert_eq!(held.borrow().as_deref(), Some(&1));
}

#[test]
fn failed_initialize_skips_steady_state_but_cleans_up() {
    let _guard = serialize();
    let cleaned = Rc::new(Cell::new(false));
    let task_ran = Rc::new(Cell::new(false));

    let cleanup_flag = Rc::clone(&cleaned);
    let rt: Runtime = Runtime::init(
        config("init-failure-test")
            .on_initialize(|_| Err("refusing to start".into()))
            .on_cleanup(move |_| {
                cleanup_flag.set(true);
                Ok(())
            }),
    );
    rt.schedule_task(
        Duration::ZERO,
        |_: &Runtime, _, ran: &mut Rc<Cell<bool>>| {
            ran.set(true);
            TaskStatus::Complete
        },
        Rc::clone(&task_ran),
    )
    .expect("task slot");

    rt.run_main_loop().expect("startup failures are not surfaced");

    assert!(cleaned.get());
    assert!(!task_ran.get());
    assert_eq!(rt.state(), LoopState::Terminated);
}

#[test]
fn pid_file_is_removed_at_cleanup() {
    let _guard = serialize();
    let dir = tempfile::tempdir().expect("tempdir");
    let pid_file = dir.path().join("cleanup-test.pid");
    std::fs::write(&pid_file, "1\n").expect("seed pid file");

    let rt: Runtime = Runtime::init(
        config("pid-cleanup-test")
            .with_pid_file(&pid_file)
            .on_initialize(|rt| {
                rt.request_termination();
                Ok(())
            }),
    );

    rt.run_main_loop().expect("loop");

    assert!(!pid_file.exists());
}

#[test]
fn loop_runs_only_once() {
    let _guard = serialize();
    let rt: Runtime = Runtime::init(config("once-test").on_initialize(|rt| {
        rt.request_termination();
        Ok(())
    }));

    rt.run_main_loop().expect("first run");

    assert!(rt.run_main_loop().is_err());
    assert_eq!(rt.state(), LoopState::Terminated);
    rt.destroy();
}

#[test]
fn version_is_reported() {
    assert_eq!(udaemon_runtime::version(), env!("CARGO_PKG_VERSION"));
}
