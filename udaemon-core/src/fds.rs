//! Closing inherited file descriptors, in the manner of BSD `closefrom`.
//!
//! Prefers enumerating the descriptors that are actually open through the
//! per-process descriptor directory; falls back to a linear scan up to the
//! descriptor limit when that view is unavailable. The fallback is
//! O(ceiling) and can be slow when the limit is very large.

use std::fs;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::sys::resource::{getrlimit, Resource};

use crate::error::CloseFromError;

/// Directory listing the calling process's open descriptors.
#[cfg(target_os = "linux")]
pub const FD_DIR: &str = "/proc/self/fd";
#[cfg(not(target_os = "linux"))]
pub const FD_DIR: &str = "/dev/fd";

/// Ceiling used when neither the resource limit nor `sysconf` gives one.
pub const FALLBACK_FD_CEILING: RawFd = 65_536;

/// Close every descriptor strictly greater than `low_fd`.
///
/// Returns the number of descriptors that were closed.
pub fn close_from(low_fd: RawFd) -> Result<usize, CloseFromError> {
    if low_fd < 0 {
        return Err(CloseFromError::InvalidArgument(low_fd));
    }

    let ceiling = descriptor_ceiling();
    let closed = match open_descriptors() {
        Some(fds) => close_listed(&fds, low_fd, ceiling),
        None => {
            tracing::debug!(dir = FD_DIR, ceiling, "descriptor directory unavailable, scanning");
            close_range_linear(low_fd, ceiling)
        }
    };

    tracing::debug!(low_fd, closed, "closed inherited descriptors");
    Ok(closed)
}

/// Highest plausible descriptor number plus one.
pub fn descriptor_ceiling() -> RawFd {
    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, _)) if soft != libc::RLIM_INFINITY => {
            RawFd::try_from(soft).unwrap_or(RawFd::MAX)
        }
        _ => system_open_max(),
    }
}

fn system_open_max() -> RawFd {
    // SAFETY: sysconf has no memory-safety preconditions.
    let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if max > 0 {
        RawFd::try_from(max).unwrap_or(RawFd::MAX)
    } else {
        FALLBACK_FD_CEILING
    }
}

/// Snapshot of open descriptor numbers.
///
/// The directory handle is dropped before returning, so its own descriptor
/// number is no longer open when the caller acts on the list.
fn open_descriptors() -> Option<Vec<RawFd>> {
    let entries = fs::read_dir(FD_DIR).ok()?;
    let mut fds: Vec<RawFd> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .collect();
    fds.sort_unstable();
    Some(fds)
}

/// Descriptors from `fds` inside the open interval `(low_fd, ceiling)`.
fn closable(fds: &[RawFd], low_fd: RawFd, ceiling: RawFd) -> impl Iterator<Item = RawFd> + '_ {
    fds.iter()
        .copied()
        .filter(move |&fd| fd > low_fd && fd < ceiling)
}

fn close_listed(fds: &[RawFd], low_fd: RawFd, ceiling: RawFd) -> usize {
    closable(fds, low_fd, ceiling)
        .filter(|&fd| close_quietly(fd))
        .count()
}

pub(crate) fn close_range_linear(low_fd: RawFd, ceiling: RawFd) -> usize {
    let start = low_fd.saturating_add(1);
    (start..ceiling).filter(|&fd| close_quietly(fd)).count()
}

/// Close `fd`, treating "not open" as nothing to do.
fn close_quietly(fd: RawFd) -> bool {
    match nix::unistd::close(fd) {
        Ok(()) => true,
        Err(Errno::EBADF) => false,
        Err(err) => {
            tracing::debug!(fd, error = %err, "close failed");
            false
        }
    }
}
