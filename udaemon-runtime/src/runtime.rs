//! Runtime state and the poll-driven main loop.
//!
//! A [`Runtime`] is created once per process with [`Runtime::init`], driven
//! by [`Runtime::run_main_loop`] and released with [`Runtime::destroy`].
//! Every method takes `&self`: callbacks receive the runtime and may register
//! or remove handlers and tasks while the loop is dispatching.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::PollFlags;
use udaemon_core::{close_from, Interest, Signal};

use crate::config::RuntimeConfig;
use crate::daemonize::daemonize;
use crate::error::{invalid, RuntimeError};
use crate::logging::{reset_syslog, setup_logging, shutdown_logging, LogLevel};
use crate::registry::{
    Dispatch, HandlerId, HandlerTable, PollEvent, TaskStatus, TaskTable,
};
use crate::signals::{read_signal, SignalBridge};

/// Lifecycle of the main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Initialized,
    Running,
    CleaningUp,
    Terminated,
}

pub struct Runtime<C = ()> {
    config: RuntimeConfig<C>,
    running: Cell<bool>,
    state: Cell<LoopState>,
    app_config: RefCell<Option<Rc<C>>>,
    app_state: RefCell<Option<Rc<dyn Any>>>,
    handlers: RefCell<HandlerTable<C>>,
    tasks: RefCell<TaskTable<C>>,
    signal_bridge: RefCell<Option<SignalBridge>>,
}

impl<C: 'static> Runtime<C> {
    /// Allocate the runtime and its slot tables and set up logging.
    pub fn init(config: RuntimeConfig<C>) -> Self {
        setup_logging(
            &config.program_name,
            config.foreground,
            LogLevel::from_debug(config.debug),
        );
        tracing::debug!(
            program = %config.program_name,
            handlers = config.handler_capacity,
            tasks = config.task_capacity,
            "runtime initialized"
        );

        Self {
            handlers: RefCell::new(HandlerTable::with_capacity(config.handler_capacity)),
            tasks: RefCell::new(TaskTable::with_capacity(config.task_capacity)),
            config,
            running: Cell::new(false),
            state: Cell::new(LoopState::Initialized),
            app_config: RefCell::new(None),
            app_state: RefCell::new(None),
            signal_bridge: RefCell::new(None),
        }
    }

    /// Release the runtime. Consuming `self` makes a second call impossible.
    pub fn destroy(self) {
        tracing::debug!(program = %self.config.program_name, "runtime destroyed");
    }

    pub fn config(&self) -> &RuntimeConfig<C> {
        &self.config
    }

    pub fn state(&self) -> LoopState {
        self.state.get()
    }

    /// The managed application configuration.
    ///
    /// Always `None` without a configured `conf_file`.
    pub fn app_config(&self) -> Option<Rc<C>> {
        self.config.conf_file.as_ref()?;
        self.app_config.borrow().clone()
    }

    /// The stored application state, if present and of type `T`.
    pub fn app_state<T: Any>(&self) -> Option<Rc<T>> {
        let state = self.app_state.borrow().clone()?;
        state.downcast::<T>().ok()
    }

    /// Store `state`, returning the previous value.
    pub fn set_app_state(&self, state: Option<Rc<dyn Any>>) -> Option<Rc<dyn Any>> {
        self.app_state.replace(state)
    }

    /// Bounds check only; the slot may have been freed or reused since.
    pub fn handle_is_plausible(&self, id: HandlerId) -> bool {
        id.is_valid() && id.index() < self.handlers.borrow().capacity()
    }

    /// Number of occupied handler slots, the signal dispatcher included.
    pub fn handler_count(&self) -> usize {
        self.handlers.borrow().occupied()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.borrow().occupied()
    }

    /// Poll `fd` for `interest` and call `callback` with `context` whenever
    /// it is ready.
    ///
    /// The descriptor stays owned by the caller: removing the handler does
    /// not close it, only a [`Dispatch::Close`] result does.
    pub fn add_event_handler<T, F>(
        &self,
        fd: RawFd,
        interest: Interest,
        mut callback: F,
        mut context: T,
    ) -> Result<HandlerId, RuntimeError>
    where
        T: 'static,
        F: FnMut(&Runtime<C>, &mut PollEvent, &mut T) -> Dispatch + 'static,
    {
        let id = self.handlers.borrow_mut().claim(
            fd,
            interest,
            Box::new(move |runtime, event| callback(runtime, event, &mut context)),
        )?;
        tracing::debug!(%id, fd, ?interest, "event handler added");
        Ok(id)
    }

    pub fn remove_event_handler(&self, id: HandlerId) -> Result<(), RuntimeError> {
        let fd = self.handlers.borrow_mut().release(id)?;
        tracing::debug!(%id, fd, "event handler removed");
        Ok(())
    }

    /// Run `callback` with `context` once `interval` has elapsed.
    ///
    /// Each call claims a new slot, even for a task that is already pending.
    pub fn schedule_task<T, F>(
        &self,
        interval: Duration,
        mut callback: F,
        mut context: T,
    ) -> Result<(), RuntimeError>
    where
        T: 'static,
        F: FnMut(&Runtime<C>, Duration, &mut T) -> TaskStatus + 'static,
    {
        let slot = self.tasks.borrow_mut().schedule(
            interval,
            Box::new(move |runtime, interval| callback(runtime, interval, &mut context)),
            Instant::now(),
        )?;
        tracing::debug!(slot, ?interval, "task scheduled");
        Ok(())
    }

    /// Stop the main loop after the current iteration.
    pub fn request_termination(&self) {
        self.running.set(false);
    }

    /// Run the loop until termination, then clean up.
    ///
    /// Startup failures skip the steady state but still clean up. The only
    /// error surfaced after startup is a daemonization failure in the
    /// launcher, whose outcome is the process exit status.
    pub fn run_main_loop(&self) -> Result<(), RuntimeError> {
        let state = self.state.get();
        if state != LoopState::Initialized {
            return Err(invalid(format!("main loop cannot start from {state:?}")));
        }
        self.state.set(LoopState::Running);
        self.running.set(true);

        let result = match self.start_up() {
            Ok(()) => {
                self.steady_state();
                Ok(())
            }
            Err(err @ RuntimeError::Daemonize(_)) => {
                tracing::warn!(error = %err, "daemonization failed");
                Err(err)
            }
            Err(err) => {
                tracing::warn!(error = %err, "startup aborted");
                Ok(())
            }
        };

        self.running.set(false);
        self.state.set(LoopState::CleaningUp);
        self.clean_up();
        self.state.set(LoopState::Terminated);
        result
    }

    fn start_up(&self) -> Result<(), RuntimeError> {
        if self.config.close_inherited_fds {
            reset_syslog();
            if let Err(err) = close_from(libc::STDERR_FILENO) {
                tracing::warn!(error = %err, "cannot close inherited descriptors");
            }
        }

        let bridge = SignalBridge::install()?;
        self.handlers.borrow_mut().install_reserved(
            bridge.read_fd(),
            PollFlags::POLLIN,
            Box::new(|runtime: &Runtime<C>, event: &mut PollEvent| {
                runtime.dispatch_signal(event.fd)
            }),
        );
        *self.signal_bridge.borrow_mut() = Some(bridge);

        if !self.config.foreground {
            tracing::debug!(
                identity = %self.config.identity,
                pid_file = ?self.config.pid_file,
                "daemonizing"
            );
            daemonize(self.config.pid_file.as_deref(), &self.config.identity)
                .map_err(RuntimeError::Daemonize)?;
        }

        if !self.load_app_config() {
            tracing::warn!("continuing without a new application configuration");
        }

        if let Some(initialize) = &self.config.hooks.initialize {
            initialize(self).map_err(|source| RuntimeError::Hook {
                hook: "initialize",
                source,
            })?;
        }
        tracing::info!(program = %self.config.program_name, "main loop running");
        Ok(())
    }

    fn steady_state(&self) {
        let capacity = self.handlers.borrow().capacity();
        let mut pollfds = Vec::with_capacity(capacity);
        let mut generations = Vec::with_capacity(capacity);
        let timeout = poll_timeout_millis(self.config.poll_timeout);

        while self.running.get() {
            self.run_due_tasks(Instant::now());
            if !self.running.get() {
                break;
            }

            self.handlers
                .borrow()
                .fill_poll_set(&mut pollfds, &mut generations);
            // SAFETY: `pollfds` is an initialized array of `pollfds.len()` entries.
            let ready = unsafe {
                libc::poll(
                    pollfds.as_mut_ptr(),
                    pollfds.len() as libc::nfds_t,
                    timeout,
                )
            };

            match ready {
                n if n < 0 => {
                    let err = Errno::last();
                    if err == Errno::EINTR {
                        continue;
                    }
                    tracing::error!(error = %err, "poll failed, stopping main loop");
                    break;
                }
                0 => {
                    if let Some(idle) = &self.config.hooks.idle {
                        idle(self);
                    }
                }
                _ => self.dispatch_ready(&pollfds, &generations),
            }
        }
    }

    /// Run every task due at `now`, in slot order.
    fn run_due_tasks(&self, now: Instant) {
        let capacity = self.tasks.borrow().capacity();
        for slot in 0..capacity {
            let Some((mut callback, interval)) = self.tasks.borrow_mut().take_due(slot, now) else {
                continue;
            };
            let status = callback(self, interval);
            match status {
                TaskStatus::Complete => tracing::debug!(slot, "task completed"),
                TaskStatus::Abort => tracing::debug!(slot, "task aborted"),
                TaskStatus::Reschedule(next) => {
                    tracing::debug!(slot, ?next, "task rescheduled")
                }
            }
            // The next deadline counts from when the callback returned.
            self.tasks
                .borrow_mut()
                .finish(slot, callback, status, Instant::now());
        }
    }

    fn dispatch_ready(&self, pollfds: &[libc::pollfd], generations: &[u64]) {
        for (index, pollfd) in pollfds.iter().enumerate() {
            if pollfd.revents == 0 {
                continue;
            }
            let revents = PollFlags::from_bits_truncate(pollfd.revents);
            let Some(mut in_flight) =
                self.handlers
                    .borrow_mut()
                    .begin_dispatch(index, generations[index], revents)
            else {
                continue;
            };

            let dispatch = (in_flight.callback)(self, &mut in_flight.event);

            let to_close = self
                .handlers
                .borrow_mut()
                .end_dispatch(index, in_flight, dispatch);
            if let Some(fd) = to_close {
                tracing::debug!(slot = index, fd, "handler asked to close its descriptor");
                if let Err(err) = nix::unistd::close(fd) {
                    tracing::debug!(fd, error = %err, "close failed");
                }
            }
        }
    }

    fn dispatch_signal(&self, fd: RawFd) -> Dispatch {
        let Some(signal) = read_signal(fd) else {
            return Dispatch::Continue;
        };

        if signal == Signal::Reload {
            self.load_app_config();
        }

        match &self.config.hooks.signal {
            Some(hook) => hook(self, signal),
            None => tracing::debug!(%signal, "signal received"),
        }

        if signal == Signal::Terminate {
            tracing::debug!("terminating main loop");
            self.request_termination();
        }
        Dispatch::Continue
    }

    /// Parse `conf_file` and install the result. On parse failure the
    /// current configuration stays in place and `false` is returned.
    fn load_app_config(&self) -> bool {
        let (Some(path), Some(parser)) = (&self.config.conf_file, &self.config.hooks.config_parser)
        else {
            return true;
        };

        let current = self.app_config.borrow().clone();
        if current.is_some() {
            tracing::debug!(path = %path.display(), "reloading configuration");
        } else {
            tracing::debug!(path = %path.display(), "loading configuration");
        }

        match parser(path, current.as_deref()) {
            Ok(parsed) => {
                drop(current);
                self.replace_app_config(Some(Rc::new(parsed)));
                true
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "cannot load configuration");
                false
            }
        }
    }

    fn replace_app_config(&self, config: Option<Rc<C>>) {
        let Some(previous) = self.app_config.replace(config) else {
            return;
        };
        if let Some(cleanup) = &self.config.hooks.config_cleanup {
            cleanup(&previous);
        }
        if Rc::strong_count(&previous) > 1 {
            tracing::debug!("released configuration still referenced by the application");
        }
    }

    fn clean_up(&self) {
        tracing::debug!("cleaning up");

        if let Some(path) = &self.config.pid_file {
            match fs::remove_file(path) {
                Ok(()) => tracing::debug!(path = %path.display(), "pid file removed"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::debug!(path = %path.display(), error = %err, "cannot remove pid file")
                }
            }
        }

        if let Some(cleanup) = &self.config.hooks.cleanup {
            if let Err(err) = cleanup(self) {
                tracing::warn!(error = %err, "cleanup hook failed");
            }
        }
        self.replace_app_config(None);

        shutdown_logging();

        self.handlers.borrow_mut().clear_reserved();
        self.signal_bridge.borrow_mut().take();
    }
}

/// Release `runtime`; `None` is a no-op.
pub fn destroy<C: 'static>(runtime: Option<Runtime<C>>) {
    if let Some(runtime) = runtime {
        runtime.destroy();
    }
}

fn poll_timeout_millis(timeout: Duration) -> libc::c_int {
    libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX)
}
