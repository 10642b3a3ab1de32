//! Double-fork daemonization with outcome reporting to the launcher.
//!
//! ```text
//! launcher ── fork ──► child ── setsid, fork ──► daemon
//!    │                   └─ _exit(0)                │
//!    └──────────── outcome byte ◄───────────────────┘
//! ```
//!
//! The launcher never returns from [`daemonize`] once the first fork
//! succeeded: it exits with whatever code the daemon reports.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::sys::stat::{umask, Mode};
use nix::unistd::{fork, geteuid, ForkResult};
use udaemon_core::{DaemonOutcome, Identity};

use crate::error::{io_err, sys_err, RuntimeError};
use crate::paths::{NULL_DEVICE, PID_FILE_MODE, ROOT_DIR};
use crate::protocol::{await_outcome, OutcomeReporter};

/// Detach from the terminal and continue as a background daemon.
///
/// Returns `Ok(())` in the daemon. Failures before the first fork are
/// returned to the caller; later failures terminate the failing process and
/// surface as the launcher's exit status.
pub fn daemonize(pid_file: Option<&Path>, identity: &Identity) -> Result<(), DaemonOutcome> {
    let (read, write) = nix::unistd::pipe().map_err(|err| {
        tracing::error!(error = %err, "cannot create synchronization pipe");
        DaemonOutcome::PipeCreate
    })?;

    // SAFETY: the event loop is single-threaded, so the child inherits a
    // consistent address space.
    match unsafe { fork() } {
        Err(err) => {
            tracing::error!(error = %err, "first fork failed");
            Err(DaemonOutcome::Fork)
        }
        Ok(ForkResult::Parent { child }) => {
            drop(write);
            let outcome = await_outcome(read);
            tracing::debug!(%child, %outcome, "daemon reported");
            std::process::exit(i32::from(outcome.code()))
        }
        Ok(ForkResult::Child) => {
            drop(read);
            detach(OutcomeReporter::new(write), pid_file, identity);
            Ok(())
        }
    }
}

fn detach(reporter: OutcomeReporter, pid_file: Option<&Path>, identity: &Identity) {
    if let Err(err) = nix::unistd::setsid() {
        tracing::error!(error = %err, "setsid failed");
        reporter.fail(DaemonOutcome::SetSid);
    }

    // SAFETY: see `daemonize`.
    match unsafe { fork() } {
        Err(err) => {
            tracing::error!(error = %err, "second fork failed");
            reporter.fail(DaemonOutcome::Daemonize);
        }
        // SAFETY: the session leader exits without running any handlers.
        Ok(ForkResult::Parent { .. }) => unsafe { libc::_exit(0) },
        Ok(ForkResult::Child) => {}
    }

    if let Err(err) = redirect_stdio() {
        tracing::error!(error = %err, "cannot redirect standard streams");
        reporter.fail(DaemonOutcome::DevNull);
    }
    let _ = umask(Mode::empty());
    if let Err(err) = nix::unistd::chdir(ROOT_DIR) {
        tracing::error!(dir = ROOT_DIR, error = %err, "cannot change working directory");
        reporter.fail(DaemonOutcome::Chdir);
    }

    if let Some(path) = pid_file {
        if let Err(err) = write_pid_file(path, identity) {
            if pid_file_failure_is_fatal(&err, geteuid().is_root()) {
                tracing::error!(path = %path.display(), error = %err, "cannot write pid file");
                reporter.fail(DaemonOutcome::PidFile);
            }
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "pid file not written, continuing unprivileged"
            );
        }
    }

    if let Err(err) = drop_privileges(identity) {
        tracing::error!(error = %err, "cannot drop privileges");
        reporter.fail(DaemonOutcome::DropPrivileges);
    }

    reporter.succeed();
    tracing::info!(pid = std::process::id(), "daemon started");
}

/// Point stdin, stdout and stderr at the null device.
fn redirect_stdio() -> Result<(), RuntimeError> {
    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .open(NULL_DEVICE)
        .map_err(|e| io_err(NULL_DEVICE, e))?;
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        nix::unistd::dup2(null.as_raw_fd(), target).map_err(|e| sys_err("dup2", e))?;
    }
    Ok(())
}

/// Write the calling process id to `path`.
///
/// A stale file is removed first. The new file is created exclusively,
/// without following symlinks, and handed to `identity` when running as
/// root so the daemon can still remove it after dropping privileges.
pub fn write_pid_file(path: &Path, identity: &Identity) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed stale pid file"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(PID_FILE_MODE)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)?;

    if geteuid().is_root() && !identity.is_root() {
        if let Err(err) =
            nix::unistd::fchown(file.as_raw_fd(), Some(identity.uid), Some(identity.gid))
        {
            tracing::warn!(
                path = %path.display(),
                %identity,
                error = %err,
                "cannot chown pid file"
            );
        }
    }

    writeln!(file, "{}", std::process::id())?;
    tracing::debug!(path = %path.display(), "pid file written");
    Ok(())
}

/// Privileged failures are always fatal. Unprivileged ones are tolerated
/// unless the path itself cannot exist.
pub(crate) fn pid_file_failure_is_fatal(err: &io::Error, privileged: bool) -> bool {
    privileged || matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::ENOTDIR))
}

/// Switch to `identity`: supplementary groups, then gid, then uid.
///
/// A no-op unless the effective user is root.
pub fn drop_privileges(identity: &Identity) -> Result<(), RuntimeError> {
    if !geteuid().is_root() {
        tracing::debug!(euid = %geteuid(), "not privileged, keeping current ids");
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    nix::unistd::setgroups(&[identity.gid]).map_err(|e| sys_err("setgroups", e))?;
    nix::unistd::setgid(identity.gid).map_err(|e| sys_err("setgid", e))?;
    nix::unistd::setuid(identity.uid).map_err(|e| sys_err("setuid", e))?;

    tracing::info!(%identity, "dropped privileges");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn pid_file_holds_pid_and_newline() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("demo.pid");

        write_pid_file(&path, &Identity::current()).expect("write");

        let content = fs::read_to_string(&path).expect("read");
        assert_eq!(content, format!("{}\n", std::process::id()));
    }

    #[test]
    fn stale_pid_file_is_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("demo.pid");
        fs::write(&path, "999999\n").expect("seed");

        write_pid_file(&path, &Identity::current()).expect("write");

        let content = fs::read_to_string(&path).expect("read");
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn pid_file_mode_is_not_wider_than_0644() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("demo.pid");

        write_pid_file(&path, &Identity::current()).expect("write");

        let mode = fs::metadata(&path).expect("metadata").permissions().mode() & 0o777;
        assert_eq!(mode & !PID_FILE_MODE, 0);
    }

    #[test]
    fn stale_symlink_is_removed_not_followed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("target");
        let link = dir.path().join("demo.pid");
        fs::write(&target, "keep").expect("target");
        std::os::unix::fs::symlink(&target, &link).expect("symlink");

        // The stale link is removed, never written through.
        write_pid_file(&link, &Identity::current()).expect("write");
        assert_eq!(fs::read_to_string(&target).expect("read"), "keep");
        assert!(!fs::symlink_metadata(&link).expect("meta").file_type().is_symlink());
    }

    #[test]
    fn missing_parent_directory_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing").join("demo.pid");

        let err = write_pid_file(&path, &Identity::current()).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn fatality_depends_on_privilege_and_errno() {
        let missing = io::Error::from_raw_os_error(libc::ENOENT);
        let denied = io::Error::from_raw_os_error(libc::EACCES);

        assert!(pid_file_failure_is_fatal(&missing, false));
        assert!(!pid_file_failure_is_fatal(&denied, false));
        assert!(pid_file_failure_is_fatal(&denied, true));
    }

    #[test]
    fn unprivileged_drop_is_noop() {
        if geteuid().is_root() {
            return;
        }
        assert!(drop_privileges(&Identity::current()).is_ok());
    }
}
