//! Types for naming the user and group a daemon runs as.

use nix::{
    libc::{gid_t, uid_t},
    unistd::{self, Gid, Uid},
};
use std::{
    convert::Infallible,
    fmt::{self, Display, Formatter},
    io,
    str::FromStr,
};

/// A value representing a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum User {
    Uid(Uid),
    Name(String),
}

impl User {
    /// Returns the real user ID of the calling process.
    pub fn current() -> Self {
        Self::Uid(unistd::getuid())
    }

    /// Gets the user ID, looking the name up in the user database if needed.
    ///
    /// # Examples
    ///
    /// ```
    /// use daemon_context::User;
    ///
    /// let uid = User::from("root").resolve().unwrap();
    /// assert!(uid.is_root());
    /// ```
    pub fn resolve(&self) -> io::Result<Uid> {
        match self {
            Self::Uid(uid) => Ok(*uid),
            Self::Name(name) => unistd::User::from_name(name)
                .map_err(|err| io::Error::other(format!("{self}: {err}")))?
                .map(|user| user.uid)
                .ok_or_else(|| not_found(self)),
        }
    }
}

impl Display for User {
    /// Formats the value into a human-readable string.
    ///
    /// # Examples
    ///
    /// ```
    /// use daemon_context::User;
    ///
    /// let user: User = 0.into();
    /// assert_eq!(user.to_string(), "user with ID (0)");
    ///
    /// let user: User = "root".into();
    /// assert_eq!(user.to_string(), "user 'root'");
    /// ```
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uid(uid) => write!(f, "user with ID ({uid})"),
            Self::Name(name) => write!(f, "user '{name}'"),
        }
    }
}

impl From<&str> for User {
    /// Parses the string into a `User`.
    ///
    /// If the string is a number, a value of [`Self::Uid`] is returned.
    /// Otherwise, a value of [`Self::Name`] is returned.
    fn from(value: &str) -> Self {
        match value.parse::<uid_t>().ok() {
            Some(uid) => Self::Uid(uid.into()),
            None => Self::Name(value.into()),
        }
    }
}

impl FromStr for User {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.into())
    }
}

impl From<Uid> for User {
    fn from(value: Uid) -> Self {
        Self::Uid(value)
    }
}

impl From<uid_t> for User {
    fn from(value: uid_t) -> Self {
        Self::Uid(value.into())
    }
}

/// A value representing a group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Group {
    Gid(Gid),
    Name(String),
}

impl Group {
    /// Returns the real group ID of the calling process.
    pub fn current() -> Self {
        Self::Gid(unistd::getgid())
    }

    /// Gets the group ID, looking the name up in the group database if
    /// needed.
    pub fn resolve(&self) -> io::Result<Gid> {
        match self {
            Self::Gid(gid) => Ok(*gid),
            Self::Name(name) => unistd::Group::from_name(name)
                .map_err(|err| io::Error::other(format!("{self}: {err}")))?
                .map(|group| group.gid)
                .ok_or_else(|| not_found(self)),
        }
    }
}

impl Display for Group {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gid(gid) => write!(f, "group with ID ({gid})"),
            Self::Name(name) => write!(f, "group '{name}'"),
        }
    }
}

impl From<&str> for Group {
    /// Parses the string into a `Group`.
    ///
    /// If the string is a number, a value of [`Self::Gid`] is returned.
    /// Otherwise, a value of [`Self::Name`] is returned.
    fn from(value: &str) -> Self {
        match value.parse::<gid_t>().ok() {
            Some(gid) => Self::Gid(gid.into()),
            None => Self::Name(value.into()),
        }
    }
}

impl FromStr for Group {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.into())
    }
}

impl From<Gid> for Group {
    fn from(value: Gid) -> Self {
        Self::Gid(value)
    }
}

impl From<gid_t> for Group {
    fn from(value: gid_t) -> Self {
        Self::Gid(value.into())
    }
}

fn not_found<T: Display>(value: &T) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{value} does not exist"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_uid() {
        let user: User = "0".into();

        assert_eq!(User::Uid(Uid::from_raw(0)), user);
    }

    #[test]
    fn user_name() {
        let user: User = "root".into();

        assert_eq!(User::Name("root".into()), user);
    }

    #[test]
    fn user_resolve() {
        assert!(User::from("root").resolve().unwrap().is_root());
        assert_eq!(1000, User::from(1000_u32).resolve().unwrap().as_raw());
    }

    #[test]
    fn user_resolve_missing() {
        let err = User::from("no-such-daemon-user").resolve().unwrap_err();

        assert_eq!(io::ErrorKind::NotFound, err.kind());
        assert_eq!("user 'no-such-daemon-user' does not exist", err.to_string());
    }

    #[test]
    fn user_current() {
        assert_eq!(User::Uid(unistd::getuid()), User::current());
    }

    #[test]
    fn group_gid() {
        let group: Group = "0".into();

        assert_eq!(Group::Gid(Gid::from_raw(0)), group);
    }

    #[test]
    fn group_name() {
        let group: Group = "root".parse().unwrap();

        assert_eq!(Group::Name("root".into()), group);
    }

    #[test]
    fn group_resolve() {
        assert_eq!(0, Group::from("root").resolve().unwrap().as_raw());
    }

    #[test]
    fn group_display() {
        assert_eq!("group with ID (0)", Group::from(0_u32).to_string());
        assert_eq!("group 'root'", Group::from("root").to_string());
    }
}
