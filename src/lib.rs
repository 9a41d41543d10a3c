//! Turns the running process into a well-behaved Unix daemon.
//!
//! A [`DaemonContext`] holds the settings for the daemon process: working
//! and root directory, user and group, umask, core dump policy, signal
//! handlers, descriptors to keep and replacements for the standard streams.
//! Opening it performs the steps of PEP 3143 in order. A
//! [`ProcessLockFile`] keeps a second instance from starting.

mod daemon;
mod error;
mod fork;
mod fs;
mod pidfile;
#[cfg(feature = "serde")]
mod serde;
mod signal;
mod sys;
mod user;

pub mod shutdown;

pub use daemon::{Builder, DEFAULT_UMASK, DaemonContext};
pub use error::{Error, ForkStage, LockError};
pub use fork::detach_required;
pub use fs::{FileHandle, MAX_FD_FALLBACK, Stream, StreamTarget};
pub use pidfile::{Acquire, ProcessLockFile};
pub use signal::{
    Handler, SignalAction, SignalMap, default_signal_map, terminate,
};
pub use user::{Group, User};

pub use nix;
pub use nix::sys::{
    signal::{SigHandler, Signal},
    stat::Mode,
};

pub fn context() -> Builder {
    DaemonContext::builder()
}
