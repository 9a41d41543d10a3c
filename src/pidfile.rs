use crate::{error::LockError, shutdown};

use nix::{
    errno::Errno,
    fcntl::{Flock, FlockArg},
};
use std::{
    fmt::{self, Debug, Formatter},
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    process::{self, exit},
    sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError},
};
use tracing::{info, warn};

type Handle = Arc<Mutex<Option<Flock<File>>>>;

/// Something a [`DaemonContext`](crate::DaemonContext) acquires as the last
/// step of opening.
pub trait Acquire: Debug {
    /// Takes the lock, or terminates the process if it cannot.
    fn acquire(&mut self);
}

/// An exclusive lock on a file holding the owner's process ID.
///
/// The lock is an advisory `flock(2)` lock, so at most one process holding a
/// `ProcessLockFile` for the same path gets past [`acquire`](Self::acquire).
/// The file contains the decimal process ID followed by a newline.
///
/// The lock is released and the file removed when the value is dropped, when
/// [`release`](Self::release) is called, or, as a fallback, when the process
/// exits. A `ProcessLockFile` is not meant to be shared between threads.
pub struct ProcessLockFile {
    path: PathBuf,
    handle: Handle,
    exit_hook: bool,
}

impl ProcessLockFile {
    /// Creates a lock file for `path` without touching the filesystem.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            handle: Default::default(),
            exit_hook: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if this value currently holds the lock.
    pub fn is_acquired(&self) -> bool {
        lock(&self.handle).is_some()
    }

    /// Takes the lock and writes the current process ID to the file.
    ///
    /// A file locked by another process is left as is.
    pub fn try_acquire(&mut self) -> Result<(), LockError> {
        if self.is_acquired() {
            return Ok(());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|source| LockError::Open {
                path: self.path.clone(),
                source,
            })?;

        let mut file = Flock::lock(file, FlockArg::LockExclusiveNonblock)
            .map_err(|(_, errno)| match errno {
                Errno::EWOULDBLOCK => LockError::AlreadyRunning {
                    path: self.path.clone(),
                },
                source => LockError::Lock {
                    path: self.path.clone(),
                    source,
                },
            })?;

        write_pid(&mut file).map_err(|source| LockError::Write {
            path: self.path.clone(),
            source,
        })?;

        *lock(&self.handle) = Some(file);

        if !self.exit_hook {
            let handle = Arc::clone(&self.handle);
            let path = self.path.clone();

            shutdown::register(move || {
                if let Err(err) = release_at_exit(&path, &handle) {
                    eprintln!("{err}");
                }
            });

            self.exit_hook = true;
        }

        info!(path = %self.path.display(), "acquired lock file");
        Ok(())
    }

    /// Takes the lock, exiting the process with status 1 if it cannot.
    ///
    /// The diagnostic is printed to stderr. When the lock is held by another
    /// process it reads `already running according to '<path>'`.
    pub fn acquire(&mut self) {
        if let Err(err) = self.try_acquire() {
            eprintln!("{err}");
            exit(1);
        }
    }

    /// Removes the file and gives up the lock.
    ///
    /// Does nothing unless this value holds the lock, so a file locked by
    /// another process is never removed. A missing file is not an error.
    pub fn release(&mut self) -> Result<(), LockError> {
        let Some(file) = lock(&self.handle).take() else {
            return Ok(());
        };

        // The file is removed while the lock is still held so that no other
        // process can lock a path that is about to disappear.
        let removed = remove(&self.path);
        drop(file);

        info!(path = %self.path.display(), "released lock file");
        removed
    }
}

impl Acquire for ProcessLockFile {
    fn acquire(&mut self) {
        ProcessLockFile::acquire(self);
    }
}

impl Debug for ProcessLockFile {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessLockFile")
            .field("path", &self.path)
            .field("acquired", &self.is_acquired())
            .finish()
    }
}

impl Drop for ProcessLockFile {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!("{err}");
        }
    }
}

fn lock(handle: &Handle) -> MutexGuard<'_, Option<Flock<File>>> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

fn write_pid(file: &mut File) -> std::io::Result<()> {
    file.set_len(0)?;
    writeln!(file, "{}", process::id())?;
    file.flush()
}

fn remove(path: &Path) -> Result<(), LockError> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(LockError::Remove {
            path: path.to_path_buf(),
            source: err,
        }),
        _ => Ok(()),
    }
}

/// Releases the lock from the exit hook.
///
/// The hook may run from a signal handler that interrupted this thread while
/// it held the handle, so the handle is never waited on: a busy handle is
/// left alone.
fn release_at_exit(path: &Path, handle: &Handle) -> Result<(), LockError> {
    let file = match handle.try_lock() {
        Ok(mut file) => file.take(),
        Err(TryLockError::Poisoned(err)) => err.into_inner().take(),
        Err(TryLockError::WouldBlock) => None,
    };

    match file {
        Some(_file) => remove(path),
        None => Ok(()),
    }
}
