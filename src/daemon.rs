use crate::{
    error::Error,
    fork,
    fs::{self, FileHandle, Stream, StreamTarget},
    pidfile::Acquire,
    signal::{self, SignalAction, SignalMap},
    sys::{Os, System},
    user::{Group, User},
};

use nix::sys::{
    signal::{SigHandler, Signal},
    stat::Mode,
};
use std::{
    collections::BTreeSet,
    ffi::OsString,
    io,
    os::fd::{AsFd, RawFd},
    path::{Path, PathBuf},
};
use tracing::{debug, info};

pub const DEFAULT_UMASK: Mode = Mode::empty();

/// The settings and state of a process that becomes a daemon.
///
/// Build one with [`DaemonContext::builder`], then call
/// [`open`](Self::open) once. Opening changes the directory, root, group,
/// user and umask of the process, disables core dumps, detaches from the
/// controlling terminal, installs signal handlers, closes inherited
/// descriptors, redirects the standard streams and acquires the lock file,
/// in that order. Nothing is undone if a step fails.
///
/// Opening is one-way: [`close`](Self::close) does nothing. The lock file,
/// preserved files and stream handles are owned by the context and are
/// dropped with it. A context is not meant to be shared between threads.
///
/// # Examples
///
/// ```no_run
/// use daemon_context::{DaemonContext, ProcessLockFile};
///
/// let mut context = DaemonContext::builder()
///     .working_directory("/var/lib/spam")
///     .pidfile(ProcessLockFile::new("/run/spam.pid"))
///     .build();
///
/// if let Err(err) = context.open() {
///     eprintln!("{err}");
///     std::process::exit(1);
/// }
///
/// // Run the daemon...
/// ```
#[derive(Debug)]
pub struct DaemonContext {
    chroot_directory: Option<PathBuf>,
    working_directory: PathBuf,
    umask: Mode,
    user: User,
    group: Group,
    prevent_core: bool,
    detach_process: bool,
    files_preserve: Vec<FileHandle>,
    pidfile: Option<Box<dyn Acquire>>,
    stdin: Option<StreamTarget>,
    stdout: Option<StreamTarget>,
    stderr: Option<StreamTarget>,
    signal_map: SignalMap,
    is_open: bool,
}

impl Default for DaemonContext {
    fn default() -> Self {
        Builder::default().build()
    }
}

impl DaemonContext {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn builder() -> Builder {
        Default::default()
    }

    pub fn chroot_directory(&self) -> Option<&Path> {
        self.chroot_directory.as_deref()
    }

    /// Returns the working directory, including the chroot directory prefix
    /// if one is configured.
    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn umask(&self) -> Mode {
        self.umask
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    pub fn prevent_core(&self) -> bool {
        self.prevent_core
    }

    pub fn detach_process(&self) -> bool {
        self.detach_process
    }

    pub fn signal_map(&self) -> &SignalMap {
        &self.signal_map
    }

    /// Returns true once [`open`](Self::open) has succeeded.
    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// Returns the descriptors the bulk close leaves open.
    ///
    /// These are the descriptors of `files_preserve` and of the configured
    /// standard stream handles.
    pub fn files_preserve(&self) -> BTreeSet<RawFd> {
        let streams = [&self.stdin, &self.stdout, &self.stderr];

        self.files_preserve
            .iter()
            .map(FileHandle::fileno)
            .chain(streams.into_iter().flatten().map(StreamTarget::fileno))
            .collect()
    }

    /// Resolves the signal map into the handlers to install.
    pub fn signal_handler_map(&self) -> Vec<(Signal, SigHandler)> {
        self.signal_map
            .iter()
            .map(|(signal, action)| (*signal, action.resolve()))
            .collect()
    }

    /// Turns the calling process into a daemon.
    ///
    /// Does nothing if the context is already open. If detaching is enabled,
    /// the calling process exits and only the daemon process returns. If a
    /// lock file is configured and another process holds it, the daemon
    /// process exits with status 1.
    pub fn open(&mut self) -> Result<(), Error> {
        self.open_with(&mut System)
    }

    pub(crate) fn open_with<O: Os>(&mut self, os: &mut O) -> Result<(), Error> {
        if self.is_open {
            return Ok(());
        }

        self.set_up_environment(os).map_err(Error::Environment)?;

        if self.prevent_core {
            os.disable_core_dumps().map_err(Error::CoreDump)?;
            debug!("disabled core dumps");
        }

        if self.detach_process {
            fork::detach(os)?;
        }

        for (signal, handler) in self.signal_handler_map() {
            os.signal(signal, handler)
                .map_err(|source| Error::Signal { signal, source })?;
        }

        fs::close_filenos(os, &self.files_preserve())?;

        fs::redirect_stream(os, Stream::Stdin, self.stdin.as_ref())?;
        fs::redirect_stream(os, Stream::Stdout, self.stdout.as_ref())?;
        fs::redirect_stream(os, Stream::Stderr, self.stderr.as_ref())?;

        if let Some(pidfile) = self.pidfile.as_mut() {
            pidfile.acquire();
        }

        self.is_open = true;
        info!("daemon context open");

        Ok(())
    }

    /// Does nothing; a daemon cannot be turned back into its former self.
    pub fn close(&mut self) {}

    fn set_up_environment<O: Os>(&self, os: &mut O) -> io::Result<()> {
        // Names are looked up before the root changes.
        let uid = self.user.resolve()?;
        let gid = self.group.resolve()?;

        os.chdir(&self.working_directory)?;

        if let Some(root) = &self.chroot_directory {
            os.chroot(root)?;
        }

        // The group must change while the process still has the privilege
        // to do so.
        os.setgid(gid)?;
        os.setuid(uid)?;

        os.umask(self.umask);

        debug!(
            working_directory = %self.working_directory.display(),
            %uid,
            %gid,
            "set up process environment"
        );

        Ok(())
    }
}

/// Configures a [`DaemonContext`].
///
/// Every option has a default; see each setter.
#[derive(Debug, Default)]
pub struct Builder {
    chroot_directory: Option<PathBuf>,
    working_directory: Option<PathBuf>,
    umask: Option<Mode>,
    user: Option<User>,
    group: Option<Group>,
    prevent_core: Option<bool>,
    detach_process: Option<bool>,
    files_preserve: Vec<FileHandle>,
    pidfile: Option<Box<dyn Acquire>>,
    stdin: Option<StreamTarget>,
    stdout: Option<StreamTarget>,
    stderr: Option<StreamTarget>,
    signal_map: Option<SignalMap>,
}

impl Builder {
    /// Changes the root directory of the process on open. Not changed by
    /// default.
    pub fn chroot_directory<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.chroot_directory = Some(path.as_ref().to_path_buf());
        self
    }

    /// The directory to change to on open. Defaults to `/`.
    ///
    /// With a chroot directory, a working directory outside of it is taken
    /// as relative to it.
    pub fn working_directory<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.working_directory = Some(path.as_ref().to_path_buf());
        self
    }

    /// The file mode creation mask. Defaults to [`DEFAULT_UMASK`].
    pub fn umask(mut self, mode: Mode) -> Self {
        self.umask = Some(mode);
        self
    }

    /// The user to run as. Defaults to the real user of the process.
    pub fn user<U: Into<User>>(mut self, user: U) -> Self {
        self.user = Some(user.into());
        self
    }

    /// The group to run as. Defaults to the real group of the process.
    pub fn group<G: Into<Group>>(mut self, group: G) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Whether to disable core dumps. Defaults to true.
    pub fn prevent_core(mut self, prevent: bool) -> Self {
        self.prevent_core = Some(prevent);
        self
    }

    /// Whether to detach from the controlling terminal. Defaults to the
    /// result of [`detach_required`](crate::detach_required).
    pub fn detach_process(mut self, detach: bool) -> Self {
        self.detach_process = Some(detach);
        self
    }

    /// Adds a file that stays open when inherited descriptors are closed.
    pub fn preserve<F: Into<FileHandle>>(mut self, file: F) -> Self {
        self.files_preserve.push(file.into());
        self
    }

    /// Adds files that stay open when inherited descriptors are closed.
    pub fn files_preserve<I>(mut self, files: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<FileHandle>,
    {
        self.files_preserve.extend(files.into_iter().map(Into::into));
        self
    }

    /// The lock file acquired as the last step of opening.
    pub fn pidfile<A: Acquire + 'static>(mut self, pidfile: A) -> Self {
        self.pidfile = Some(Box::new(pidfile));
        self
    }

    /// The file standard input reads from. Defaults to the null device.
    pub fn stdin<F: AsFd + 'static>(mut self, file: F) -> Self {
        self.stdin = Some(StreamTarget::new(file));
        self
    }

    /// The file standard output writes to. Defaults to the null device.
    pub fn stdout<F: AsFd + 'static>(mut self, file: F) -> Self {
        self.stdout = Some(StreamTarget::new(file));
        self
    }

    /// The file standard error writes to. Defaults to the null device.
    pub fn stderr<F: AsFd + 'static>(mut self, file: F) -> Self {
        self.stderr = Some(StreamTarget::new(file));
        self
    }

    /// Replaces the signal map. Defaults to
    /// [`default_signal_map`](crate::default_signal_map).
    pub fn signal_map(mut self, map: SignalMap) -> Self {
        self.signal_map = Some(map);
        self
    }

    /// Sets the action for one signal, starting from the default map.
    pub fn signal<A>(mut self, signal: Signal, action: A) -> Self
    where
        A: Into<SignalAction>,
    {
        self.signal_map
            .get_or_insert_with(signal::default_signal_map)
            .insert(signal, action.into());
        self
    }

    pub fn build(self) -> DaemonContext {
        let working_directory = self
            .working_directory
            .unwrap_or_else(|| PathBuf::from("/"));

        let working_directory = match &self.chroot_directory {
            Some(root) if !working_directory.starts_with(root) => {
                let mut path = OsString::from(root.as_os_str());
                path.push(working_directory.as_os_str());
                PathBuf::from(path)
            }
            _ => working_directory,
        };

        DaemonContext {
            chroot_directory: self.chroot_directory,
            working_directory,
            umask: self.umask.unwrap_or(DEFAULT_UMASK),
            user: self.user.unwrap_or_else(User::current),
            group: self.group.unwrap_or_else(Group::current),
            prevent_core: self.prevent_core.unwrap_or(true),
            detach_process: self
                .detach_process
                .unwrap_or_else(fork::detach_required),
            files_preserve: self.files_preserve,
            pidfile: self.pidfile,
            stdin: self.stdin,
            stdout: self.stdout,
            stderr: self.stderr,
            signal_map: self
                .signal_map
                .unwrap_or_else(signal::default_signal_map),
            is_open: false,
        }
    }
}
