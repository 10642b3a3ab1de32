//! Resolution of `user[:group]` privilege targets into concrete ids.
//!
//! Accepted forms: `name`, `name:group`, `uid`, `uid:gid`, or mixed. Each part
//! is tried as a numeric id first and as a name otherwise; numeric ids must
//! still exist in the account database.

use std::fmt;

use nix::unistd::{Gid, Group, Uid, User};

use crate::error::IdentityError;

/// Account used when no privilege target is given.
pub const DEFAULT_ACCOUNT: &str = "nobody";

/// A resolved uid/gid pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: Uid,
    pub gid: Gid,
}

impl Identity {
    pub fn new(uid: Uid, gid: Gid) -> Self {
        Self { uid, gid }
    }

    /// The real ids of the calling process.
    pub fn current() -> Self {
        Self {
            uid: nix::unistd::getuid(),
            gid: nix::unistd::getgid(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.uid.is_root()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

/// Resolve `entry` into a uid/gid pair.
///
/// An absent or empty entry yields [`DEFAULT_ACCOUNT`]. The user's primary
/// group is used unless a group part overrides it.
pub fn parse_identity(entry: Option<&str>) -> Result<Identity, IdentityError> {
    let entry = entry.unwrap_or_default();
    if entry.is_empty() {
        let user = User::from_name(DEFAULT_ACCOUNT)
            .map_err(|errno| lookup_err(DEFAULT_ACCOUNT, errno))?
            .ok_or(IdentityError::NobodyMissing {
                account: DEFAULT_ACCOUNT,
            })?;
        return Ok(Identity::new(user.uid, user.gid));
    }

    let (user_part, group_part) = split_entry(entry);

    let user = resolve_user(user_part)?
        .ok_or_else(|| IdentityError::NoSuchUser(user_part.to_string()))?;
    let mut identity = Identity::new(user.uid, user.gid);

    if let Some(group_part) = group_part {
        let group = resolve_group(group_part)?
            .ok_or_else(|| IdentityError::NoSuchGroup(group_part.to_string()))?;
        identity.gid = group.gid;
    }

    tracing::debug!(entry, identity = %identity, "resolved privilege target");
    Ok(identity)
}

/// Split on the last `:` into user and optional group parts.
fn split_entry(entry: &str) -> (&str, Option<&str>) {
    match entry.rsplit_once(':') {
        Some((user, group)) => (user, Some(group)),
        None => (entry, None),
    }
}

/// Parse `part` as an id only if it consists entirely of decimal digits.
fn numeric_id(part: &str) -> Option<u32> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

fn resolve_user(part: &str) -> Result<Option<User>, IdentityError> {
    let found = match numeric_id(part) {
        Some(uid) => User::from_uid(Uid::from_raw(uid)),
        None => User::from_name(part),
    };
    found.map_err(|errno| lookup_err(part, errno))
}

fn resolve_group(part: &str) -> Result<Option<Group>, IdentityError> {
    let found = match numeric_id(part) {
        Some(gid) => Group::from_gid(Gid::from_raw(gid)),
        None => Group::from_name(part),
    };
    found.map_err(|errno| lookup_err(part, errno))
}

fn lookup_err(entry: &str, errno: nix::errno::Errno) -> IdentityError {
    IdentityError::Lookup {
        entry: entry.to_string(),
        errno,
    }
}
