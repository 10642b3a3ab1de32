//! One-shot outcome channel between the detaching daemon and its launcher.
//!
//! Exactly one byte travels over the pipe: a [`DaemonOutcome`] code. The
//! launcher treats end-of-file without a byte as [`DaemonOutcome::PipeRead`].

use std::os::fd::{AsRawFd, OwnedFd};

use nix::errno::Errno;
use udaemon_core::DaemonOutcome;

/// Write end of the outcome pipe, held by the detaching children.
pub(crate) struct OutcomeReporter {
    write: OwnedFd,
}

impl OutcomeReporter {
    pub(crate) fn new(write: OwnedFd) -> Self {
        Self { write }
    }

    /// Report `outcome` and terminate the calling process with its code.
    pub(crate) fn fail(self, outcome: DaemonOutcome) -> ! {
        tracing::error!(%outcome, "daemonization failed");
        self.send(outcome);
        // SAFETY: _exit skips atexit handlers and stdio flushing that belong
        // to the launcher's copy of the address space.
        unsafe { libc::_exit(i32::from(outcome.code())) }
    }

    /// Report success; the pipe closes when the reporter drops.
    pub(crate) fn succeed(self) {
        self.send(DaemonOutcome::Success);
    }

    fn send(&self, outcome: DaemonOutcome) {
        let byte = [outcome.code()];
        loop {
            match nix::unistd::write(&self.write, &byte) {
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    tracing::debug!(error = %err, "outcome pipe write failed");
                    return;
                }
                Ok(_) => return,
            }
        }
    }
}

/// Block until the daemon reports, retrying interrupted reads.
pub(crate) fn await_outcome(read: OwnedFd) -> DaemonOutcome {
    let mut byte = [0u8; 1];
    loop {
        match nix::unistd::read(read.as_raw_fd(), &mut byte) {
            Ok(1) => {
                return DaemonOutcome::from_code(byte[0]).unwrap_or(DaemonOutcome::PipeRead);
            }
            Ok(_) => return DaemonOutcome::PipeRead,
            Err(Errno::EINTR) => continue,
            Err(err) => {
                tracing::debug!(error = %err, "outcome pipe read failed");
                return DaemonOutcome::PipeRead;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_byte_reaches_reader() {
        let (read, write) = nix::unistd::pipe().expect("pipe");
        OutcomeReporter::new(write).succeed();
        assert_eq!(await_outcome(read), DaemonOutcome::Success);
    }

    #[test]
    fn closed_pipe_without_byte_is_a_read_failure() {
        let (read, write) = nix::unistd::pipe().expect("pipe");
        drop(write);
        assert_eq!(await_outcome(read), DaemonOutcome::PipeRead);
    }

    #[test]
    fn unknown_code_is_a_read_failure() {
        let (read, write) = nix::unistd::pipe().expect("pipe");
        nix::unistd::write(&write, &[0xFF]).expect("write");
        drop(write);
        assert_eq!(await_outcome(read), DaemonOutcome::PipeRead);
    }
}
