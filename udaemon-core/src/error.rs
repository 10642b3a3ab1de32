//! Error types for udaemon-core.

use nix::errno::Errno;
use thiserror::Error;

/// Errors raised while resolving a `user[:group]` privilege target.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// No entry was given and the fallback account does not exist.
    #[error("default account '{account}' does not exist on this system")]
    NobodyMissing { account: &'static str },

    /// The user part resolved neither as a uid nor as a user name.
    #[error("no such user: {0}")]
    NoSuchUser(String),

    /// The group part resolved neither as a gid nor as a group name.
    #[error("no such group: {0}")]
    NoSuchGroup(String),

    /// The account database itself could not be queried.
    #[error("account lookup for '{entry}' failed: {errno}")]
    Lookup { entry: String, errno: Errno },
}

/// Errors raised by [`crate::fds::close_from`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CloseFromError {
    /// The lower bound was negative; nothing was closed.
    #[error("invalid lower descriptor bound {0}")]
    InvalidArgument(i32),
}
