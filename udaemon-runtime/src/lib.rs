//! Minimal daemon runtime: poll loop, task scheduler, signal bridge and
//! daemonizer.

mod config;
pub mod daemonize;
mod error;
pub mod logging;
pub mod paths;
mod protocol;
mod registry;
mod runtime;
mod signals;

pub use config::{
    CleanupHook, ConfigCleanup, ConfigParser, IdleHook, InitializeHook, RuntimeConfig, SignalHook,
};
pub use daemonize::{daemonize, drop_privileges, write_pid_file};
pub use error::{BoxError, HookResult, RuntimeError};
pub use logging::{set_log_level, setup_logging, shutdown_logging, LogLevel};
pub use registry::{Dispatch, HandlerId, PollEvent, TaskStatus};
pub use runtime::{destroy, LoopState, Runtime};

pub use udaemon_core::{DaemonOutcome, Identity, Interest, Signal};

/// Library version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
