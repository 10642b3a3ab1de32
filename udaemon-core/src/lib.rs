//! udaemon core library: shared domain types, errors and OS utilities.
//!
//! Public API surface:
//! - [`types`]: logical signals, daemonization outcomes, interest masks
//! - [`error`]: [`IdentityError`], [`CloseFromError`]
//! - [`identity`]: `user[:group]` resolution
//! - [`fds`]: closing inherited descriptors

pub mod error;
pub mod fds;
pub mod identity;
pub mod types;

pub use error::{CloseFromError, IdentityError};
pub use fds::close_from;
pub use identity::{parse_identity, Identity, DEFAULT_ACCOUNT};
pub use types::{DaemonOutcome, Interest, Signal};
