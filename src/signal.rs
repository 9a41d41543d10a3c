//! Signal handling for the daemon process.

use nix::{
    libc::c_int,
    sys::signal::{SigHandler, Signal},
    unistd,
};
use std::{collections::BTreeMap, io, process};

/// A handler provided by the daemon context itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handler {
    /// Exit the process in an orderly way. See [`terminate`].
    Terminate,
}

/// What to do when a signal arrives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalAction {
    Ignore,
    /// One of the context's own handlers, resolved when the context opens.
    Named(Handler),
    /// Any other disposition, installed as is.
    Custom(SigHandler),
}

impl From<Handler> for SignalAction {
    fn from(handler: Handler) -> Self {
        Self::Named(handler)
    }
}

impl From<SigHandler> for SignalAction {
    fn from(handler: SigHandler) -> Self {
        Self::Custom(handler)
    }
}

pub type SignalMap = BTreeMap<Signal, SignalAction>;

const DEFAULT_ACTIONS: [(&str, SignalAction); 4] = [
    ("SIGTSTP", SignalAction::Ignore),
    ("SIGTTIN", SignalAction::Ignore),
    ("SIGTTOU", SignalAction::Ignore),
    ("SIGTERM", SignalAction::Named(Handler::Terminate)),
];

/// Returns the default signal map for this platform.
///
/// The job control signals `SIGTSTP`, `SIGTTIN` and `SIGTTOU` are ignored and
/// `SIGTERM` exits through [`Handler::Terminate`]. Signals the platform does
/// not define are left out.
pub fn default_signal_map() -> SignalMap {
    signal_map_with(|name| name.parse().ok())
}

pub(crate) fn signal_map_with<F>(lookup: F) -> SignalMap
where
    F: Fn(&str) -> Option<Signal>,
{
    DEFAULT_ACTIONS
        .into_iter()
        .filter_map(|(name, action)| lookup(name).map(|signal| (signal, action)))
        .collect()
}

impl Handler {
    pub fn sig_handler(self) -> SigHandler {
        match self {
            Self::Terminate => SigHandler::Handler(terminate),
        }
    }
}

impl SignalAction {
    /// Resolves the action into the disposition handed to the kernel.
    pub fn resolve(self) -> SigHandler {
        match self {
            Self::Ignore => SigHandler::SigIgn,
            Self::Named(handler) => handler.sig_handler(),
            Self::Custom(handler) => handler,
        }
    }
}

/// Handler for `SIGTERM`.
///
/// Writes `Terminating on signal N` to stderr and exits with status 1
/// through [`std::process::exit`], which runs the hooks registered with
/// [`crate::shutdown`] so a held lock file is removed. Exiting from a signal
/// handler is not async-signal-safe; this is a best-effort path for daemons
/// that do not install a handler of their own.
pub extern "C" fn terminate(signum: c_int) {
    let mut buffer = [0u8; 48];
    let message = termination_message(signum, &mut buffer);

    let _ = unistd::write(io::stderr(), message);

    process::exit(1);
}

fn termination_message(signum: c_int, buffer: &mut [u8; 48]) -> &[u8] {
    const PREFIX: &[u8] = b"Terminating on signal ";

    buffer[..PREFIX.len()].copy_from_slice(PREFIX);
    let mut len = PREFIX.len();

    let mut digits = [0u8; 12];
    let mut count = 0;
    let mut value = i64::from(signum).unsigned_abs();

    loop {
        digits[count] = b'0' + (value % 10) as u8;
        count += 1;
        value /= 10;

        if value == 0 {
            break;
        }
    }

    if signum < 0 {
        buffer[len] = b'-';
        len += 1;
    }

    for digit in digits[..count].iter().rev() {
        buffer[len] = *digit;
        len += 1;
    }

    buffer[len] = b'\n';
    &buffer[..=len]
}
