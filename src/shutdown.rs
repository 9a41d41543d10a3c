//! Hooks that run when the process exits.
//!
//! A hook registered here runs once, in reverse order of registration, when
//! the process exits normally: returning from `main` or calling
//! [`std::process::exit`]. Hooks do not run if the process is killed, aborts
//! or exits through `_exit`, so they are a fallback for explicit cleanup, not
//! a replacement for it.

use nix::libc;
use std::{
    mem, panic,
    sync::{Mutex, Once, PoisonError, TryLockError},
};
use tracing::warn;

type Hook = Box<dyn FnOnce() + Send>;

static HOOKS: Registry = Registry::new();
static INSTALL: Once = Once::new();

struct Registry(Mutex<Vec<Hook>>);

impl Registry {
    const fn new() -> Self {
        Self(Mutex::new(Vec::new()))
    }

    fn push(&self, hook: Hook) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    fn run(&self) -> usize {
        let hooks = match self.0.try_lock() {
            Ok(mut hooks) => mem::take(&mut *hooks),
            Err(TryLockError::Poisoned(err)) => mem::take(&mut *err.into_inner()),
            Err(TryLockError::WouldBlock) => return 0,
        };

        let count = hooks.len();

        for hook in hooks.into_iter().rev() {
            hook();
        }

        count
    }
}

/// Registers `hook` to run at process exit.
pub fn register<F>(hook: F)
where
    F: FnOnce() + Send + 'static,
{
    INSTALL.call_once(|| {
        // SAFETY: `run_at_exit` does not unwind into the C runtime.
        if unsafe { libc::atexit(run_at_exit) } != 0 {
            warn!("failed to install exit handler; shutdown hooks will not run");
        }
    });

    HOOKS.push(Box::new(hook));
}

/// Runs and removes every registered hook.
///
/// Returns the number of hooks that ran. If the registry is locked, as when
/// a signal handler exits while a hook is being registered, nothing runs.
pub fn run() -> usize {
    HOOKS.run()
}

extern "C" fn run_at_exit() {
    let _ = panic::catch_unwind(run);
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    #[test]
    fn hooks_run_once_in_reverse_order() {
        let registry = Registry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in 0..3 {
            let order = Arc::clone(&order);
            registry.push(Box::new(move || order.lock().unwrap().push(id)));
        }

        assert_eq!(3, registry.run());
        assert_eq!(0, registry.run());
        assert_eq!(vec![2, 1, 0], *order.lock().unwrap());
    }
}
