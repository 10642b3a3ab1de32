use thiserror::Error;

use nix::errno::Errno;
use udaemon_core::{DaemonOutcome, IdentityError};

/// Boxed error returned by application hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result of an application hook; failures are logged, never propagated.
pub type HookResult = Result<(), BoxError>;

/// Error surface for the runtime state, registries, main loop and daemonizer.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{table} table is full ({capacity} slots)")]
    OutOfCapacity {
        table: &'static str,
        capacity: usize,
    },

    #[error("I/O error at {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context} failed: {source}")]
    Sys {
        context: &'static str,
        #[source]
        source: Errno,
    },

    #[error("daemonization failed: {0}")]
    Daemonize(DaemonOutcome),

    #[error("{hook} hook failed: {source}")]
    Hook {
        hook: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
}

pub(crate) fn io_err(context: impl Into<String>, source: std::io::Error) -> RuntimeError {
    RuntimeError::Io {
        context: context.into(),
        source,
    }
}

pub(crate) fn sys_err(context: &'static str, source: Errno) -> RuntimeError {
    RuntimeError::Sys { context, source }
}

pub(crate) fn invalid(message: impl Into<String>) -> RuntimeError {
    RuntimeError::InvalidArgument(message.into())
}
