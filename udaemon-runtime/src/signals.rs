//! Self-pipe bridge from OS signal delivery into the main loop.
//!
//! The OS handler only encodes the logical signal as one byte and writes it
//! into a non-blocking pipe; the loop polls the read end and dispatches the
//! decoded [`Signal`] synchronously.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal as OsSignal};
use udaemon_core::Signal;

use crate::error::{sys_err, RuntimeError};

/// Write end of the signal pipe, or -1 while no bridge is installed.
static SIGNAL_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

/// Signals routed through the bridge. Alarm and child signals carry no
/// logical code; catching them keeps their default action from firing.
const ROUTED: [OsSignal; 7] = [
    OsSignal::SIGTERM,
    OsSignal::SIGHUP,
    OsSignal::SIGUSR1,
    OsSignal::SIGUSR2,
    OsSignal::SIGALRM,
    OsSignal::SIGCHLD,
    OsSignal::SIGINT,
];

extern "C" fn on_os_signal(signo: libc::c_int) {
    let saved = Errno::last_raw();
    let fd = SIGNAL_PIPE_WRITE.load(Ordering::Relaxed);
    if fd >= 0 {
        if let Some(signal) = Signal::from_os(signo) {
            let byte = signal.code();
            // SAFETY: write(2) is async-signal-safe; `byte` outlives the call.
            // A full pipe drops the byte rather than blocking.
            unsafe {
                libc::write(fd, (&byte as *const u8).cast(), 1);
            }
        }
    }
    Errno::set_raw(saved);
}

/// Installed handlers plus the pipe they write into.
///
/// Dropping the bridge restores the previous dispositions before the pipe
/// closes.
pub(crate) struct SignalBridge {
    read: OwnedFd,
    _write: OwnedFd,
    previous: Vec<(OsSignal, SigAction)>,
}

impl SignalBridge {
    pub(crate) fn install() -> Result<Self, RuntimeError> {
        let (read, write) = nix::unistd::pipe().map_err(|e| sys_err("signal pipe", e))?;
        for fd in [read.as_raw_fd(), write.as_raw_fd()] {
            prepare_pipe_end(fd)?;
        }
        SIGNAL_PIPE_WRITE.store(write.as_raw_fd(), Ordering::SeqCst);

        let mut bridge = Self {
            read,
            _write: write,
            previous: Vec::with_capacity(ROUTED.len() + 1),
        };

        let routed = SigAction::new(
            SigHandler::Handler(on_os_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for signal in ROUTED {
            bridge.replace_action(signal, &routed)?;
        }
        let ignored = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        bridge.replace_action(OsSignal::SIGPIPE, &ignored)?;

        tracing::debug!(fd = bridge.read_fd(), "signal bridge installed");
        Ok(bridge)
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    fn replace_action(&mut self, signal: OsSignal, action: &SigAction) -> Result<(), RuntimeError> {
        // SAFETY: the handler only touches an atomic and calls write(2).
        let old = unsafe { sigaction(signal, action) }.map_err(|e| sys_err("sigaction", e))?;
        self.previous.push((signal, old));
        Ok(())
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        for (signal, action) in self.previous.drain(..).rev() {
            // SAFETY: reinstates a disposition that was in effect before.
            if let Err(err) = unsafe { sigaction(signal, &action) } {
                tracing::debug!(%signal, error = %err, "failed to restore signal disposition");
            }
        }
        SIGNAL_PIPE_WRITE.store(-1, Ordering::SeqCst);
    }
}

fn prepare_pipe_end(fd: RawFd) -> Result<(), RuntimeError> {
    fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(|e| sys_err("fcntl(O_NONBLOCK)", e))?;
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(|e| sys_err("fcntl(FD_CLOEXEC)", e))?;
    Ok(())
}

/// Read one signal code from the pipe.
///
/// `None` when no byte is pending or the byte is not a known code.
pub(crate) fn read_signal(fd: RawFd) -> Option<Signal> {
    let mut byte = 0u8;
    // SAFETY: reads at most one byte into a valid, owned buffer.
    let read = unsafe { libc::read(fd, (&mut byte as *mut u8).cast(), 1) };
    if read != 1 {
        if read < 0 && Errno::last() != Errno::EAGAIN {
            tracing::warn!(fd, error = %Errno::last(), "failed to read signal pipe");
        }
        return None;
    }
    let signal = Signal::from_code(byte);
    if signal.is_none() {
        tracing::warn!(code = byte, "unknown code on signal pipe");
    }
    signal
}
