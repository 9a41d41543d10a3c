use crate::fs::Stream;

use nix::{errno::Errno, sys::signal::Signal};
use std::{
    fmt::{self, Display, Formatter},
    io,
    os::fd::RawFd,
    path::PathBuf,
};

/// Which of the two detachment forks failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkStage {
    First,
    Second,
}

impl Display for ForkStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::First => f.write_str("first"),
            Self::Second => f.write_str("second"),
        }
    }
}

/// An error that aborted [`DaemonContext::open`](crate::DaemonContext::open).
///
/// None of these are recoverable. Steps that ran before the failure are not
/// rolled back, so the process should exit after reporting the error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Changing directory, root, group, user or umask failed.
    #[error("setting up environment failed: {0}")]
    Environment(#[source] io::Error),

    #[error("could not disable core files: {0}")]
    CoreDump(#[source] Errno),

    #[error("{stage} fork failed: {source}")]
    Fork { stage: ForkStage, source: Errno },

    #[error("failed to start a new session: {0}")]
    Setsid(#[source] Errno),

    #[error("failed to set handler for {signal}: {source}")]
    Signal { signal: Signal, source: Errno },

    #[error("failed to read file descriptor limit: {0}")]
    DescriptorLimit(#[source] Errno),

    #[error("failed to close file descriptor {fd}: {source}")]
    Close { fd: RawFd, source: Errno },

    #[error("could not redirect {stream} to {target}: {source}")]
    Redirect {
        stream: Stream,
        target: String,
        source: Errno,
    },
}

/// A failure to take or give up a [`ProcessLockFile`](crate::ProcessLockFile).
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("failed to open lock file '{}': {source}", .path.display())]
    Open { path: PathBuf, source: io::Error },

    /// Another process holds the lock.
    #[error("already running according to '{}'", .path.display())]
    AlreadyRunning { path: PathBuf },

    #[error("failed to lock '{}': {source}", .path.display())]
    Lock { path: PathBuf, source: Errno },

    #[error("failed to write pid to '{}': {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to remove lock file '{}': {source}", .path.display())]
    Remove { path: PathBuf, source: io::Error },
}

impl LockError {
    /// Returns true if the lock is held by another process.
    pub fn is_already_running(&self) -> bool {
        matches!(self, Self::AlreadyRunning { .. })
    }
}
