//! Launcher-supplied runtime configuration: limits, paths and hooks.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use udaemon_core::{Identity, Signal};

use crate::error::{BoxError, HookResult};
use crate::paths::{DEFAULT_HANDLER_CAPACITY, DEFAULT_POLL_TIMEOUT, DEFAULT_TASK_CAPACITY};
use crate::runtime::Runtime;

pub type InitializeHook<C> = Box<dyn Fn(&Runtime<C>) -> HookResult>;
pub type SignalHook<C> = Box<dyn Fn(&Runtime<C>, Signal)>;
pub type IdleHook<C> = Box<dyn Fn(&Runtime<C>)>;
pub type CleanupHook<C> = Box<dyn Fn(&Runtime<C>) -> HookResult>;
pub type ConfigParser<C> = Box<dyn Fn(&Path, Option<&C>) -> Result<C, BoxError>>;
pub type ConfigCleanup<C> = Box<dyn Fn(&C)>;

pub(crate) struct Hooks<C> {
    pub(crate) initialize: Option<InitializeHook<C>>,
    pub(crate) signal: Option<SignalHook<C>>,
    pub(crate) idle: Option<IdleHook<C>>,
    pub(crate) cleanup: Option<CleanupHook<C>>,
    pub(crate) config_parser: Option<ConfigParser<C>>,
    pub(crate) config_cleanup: Option<ConfigCleanup<C>>,
}

impl<C> Default for Hooks<C> {
    fn default() -> Self {
        Self {
            initialize: None,
            signal: None,
            idle: None,
            cleanup: None,
            config_parser: None,
            config_cleanup: None,
        }
    }
}

/// Configuration consumed by [`Runtime::init`].
///
/// `C` is the application configuration type produced by the config parser
/// hook. Values are set with the `with_*` methods and hooks with the `on_*`
/// methods; the result is immutable once handed to the runtime.
pub struct RuntimeConfig<C = ()> {
    pub debug: bool,
    /// Stay attached to the terminal instead of daemonizing.
    pub foreground: bool,
    /// Privilege target the daemon drops to.
    pub identity: Identity,
    pub program_name: String,
    pub pid_file: Option<PathBuf>,
    /// Application configuration file; without it the runtime manages no
    /// application configuration.
    pub conf_file: Option<PathBuf>,
    pub handler_capacity: usize,
    pub task_capacity: usize,
    /// Close descriptors above stderr when the main loop starts.
    pub close_inherited_fds: bool,
    pub poll_timeout: Duration,
    pub(crate) hooks: Hooks<C>,
}

impl<C> RuntimeConfig<C> {
    pub fn new(program_name: impl Into<String>) -> Self {
        Self {
            debug: false,
            foreground: false,
            identity: Identity::current(),
            program_name: program_name.into(),
            pid_file: None,
            conf_file: None,
            handler_capacity: DEFAULT_HANDLER_CAPACITY,
            task_capacity: DEFAULT_TASK_CAPACITY,
            close_inherited_fds: true,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            hooks: Hooks::default(),
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_foreground(mut self, foreground: bool) -> Self {
        self.foreground = foreground;
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(path.into());
        self
    }

    pub fn with_conf_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.conf_file = Some(path.into());
        self
    }

    /// Total handler slots; slot 0 is always reserved for signal dispatch.
    pub fn with_handler_capacity(mut self, capacity: usize) -> Self {
        self.handler_capacity = capacity.max(1);
        self
    }

    pub fn with_task_capacity(mut self, capacity: usize) -> Self {
        self.task_capacity = capacity;
        self
    }

    pub fn with_close_inherited_fds(mut self, close: bool) -> Self {
        self.close_inherited_fds = close;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Called once before the steady state; an error aborts startup.
    pub fn on_initialize(mut self, hook: impl Fn(&Runtime<C>) -> HookResult + 'static) -> Self {
        self.hooks.initialize = Some(Box::new(hook));
        self
    }

    pub fn on_signal(mut self, hook: impl Fn(&Runtime<C>, Signal) + 'static) -> Self {
        self.hooks.signal = Some(Box::new(hook));
        self
    }

    /// Called after a poll that timed out. Must return quickly.
    pub fn on_idle(mut self, hook: impl Fn(&Runtime<C>) + 'static) -> Self {
        self.hooks.idle = Some(Box::new(hook));
        self
    }

    pub fn on_cleanup(mut self, hook: impl Fn(&Runtime<C>) -> HookResult + 'static) -> Self {
        self.hooks.cleanup = Some(Box::new(hook));
        self
    }

    /// Parses `conf_file`, receiving the configuration currently installed.
    /// On error the current configuration stays in place.
    pub fn on_config_parse(
        mut self,
        parser: impl Fn(&Path, Option<&C>) -> Result<C, BoxError> + 'static,
    ) -> Self {
        self.hooks.config_parser = Some(Box::new(parser));
        self
    }

    /// Called once for every configuration that is replaced or released at
    /// cleanup, even while the application still holds a handle to it.
    pub fn on_config_cleanup(mut self, cleanup: impl Fn(&C) + 'static) -> Self {
        self.hooks.config_cleanup = Some(Box::new(cleanup));
        self
    }
}

impl<C> fmt::Debug for RuntimeConfig<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("debug", &self.debug)
            .field("foreground", &self.foreground)
            .field("identity", &self.identity)
            .field("program_name", &self.program_name)
            .field("pid_file", &self.pid_file)
            .field("conf_file", &self.conf_file)
            .field("handler_capacity", &self.handler_capacity)
            .field("task_capacity", &self.task_capacity)
            .field("close_inherited_fds", &self.close_inherited_fds)
            .field("poll_timeout", &self.poll_timeout)
            .field("config_parser", &self.hooks.config_parser.is_some())
            .finish_non_exhaustive()
    }
}
