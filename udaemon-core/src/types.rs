//! Domain types shared by the runtime and the applications built on it.
//!
//! Both byte-sized protocols of the runtime live here: the logical signal
//! codes written into the self-pipe, and the outcome codes the detached
//! daemon reports back to its launcher.

use std::fmt;

use nix::poll::PollFlags;

/// Readiness interest mask for a polled descriptor.
pub type Interest = PollFlags;

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// Logical signal delivered to the application, decoupled from OS numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Signal {
    /// `SIGTERM` or `SIGINT`: stop the main loop.
    Terminate = 1,
    /// `SIGHUP`: reload the application configuration.
    Reload = 2,
    /// `SIGUSR1`: turn verbose logging on.
    DebugOn = 3,
    /// `SIGUSR2`: turn verbose logging off.
    DebugOff = 4,
}

impl Signal {
    /// The one-byte wire code used on the signal pipe.
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Terminate),
            2 => Some(Self::Reload),
            3 => Some(Self::DebugOn),
            4 => Some(Self::DebugOff),
            _ => None,
        }
    }

    /// Maps an OS signal number onto its logical signal.
    ///
    /// Async-signal-safe: a pure match without allocation.
    pub const fn from_os(signo: libc::c_int) -> Option<Self> {
        match signo {
            libc::SIGTERM | libc::SIGINT => Some(Self::Terminate),
            libc::SIGHUP => Some(Self::Reload),
            libc::SIGUSR1 => Some(Self::DebugOn),
            libc::SIGUSR2 => Some(Self::DebugOff),
            _ => None,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Terminate => "terminate",
            Self::Reload => "reload",
            Self::DebugOn => "debug-on",
            Self::DebugOff => "debug-off",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// DaemonOutcome
// ---------------------------------------------------------------------------

/// Single-byte result of daemonization, doubling as the launcher's exit status.
///
/// Codes are grouped by the process that detects the failure: `1x` in the
/// launcher, `2x` in the detaching children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DaemonOutcome {
    Success = 0,

    PipeCreate = 10,
    Fork = 11,
    PipeRead = 12,

    SetSid = 20,
    Daemonize = 21,
    DevNull = 22,
    PidFile = 23,
    Config = 24,
    Chdir = 25,
    DropPrivileges = 26,
}

impl DaemonOutcome {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        let outcome = match code {
            0 => Self::Success,
            10 => Self::PipeCreate,
            11 => Self::Fork,
            12 => Self::PipeRead,
            20 => Self::SetSid,
            21 => Self::Daemonize,
            22 => Self::DevNull,
            23 => Self::PidFile,
            24 => Self::Config,
            25 => Self::Chdir,
            26 => Self::DropPrivileges,
            _ => return None,
        };
        Some(outcome)
    }

    /// Human-readable name of the failing stage.
    pub const fn stage(self) -> &'static str {
        match self {
            Self::Success => "none",
            Self::PipeCreate => "create synchronization pipe",
            Self::Fork => "fork",
            Self::PipeRead => "read daemon outcome",
            Self::SetSid => "create session",
            Self::Daemonize => "second fork",
            Self::DevNull => "open null device",
            Self::PidFile => "write pid file",
            Self::Config => "load configuration",
            Self::Chdir => "change working directory",
            Self::DropPrivileges => "drop privileges",
        }
    }
}

impl fmt::Display for DaemonOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            f.write_str("success")
        } else {
            write!(f, "{} (code {})", self.stage(), self.code())
        }
    }
}
