//! The operating system calls made while opening a daemon context.

use crate::fs::Stream;

use nix::{
    errno::Errno,
    fcntl::{self, OFlag},
    libc::{self, rlim_t},
    sys::{
        resource::{self, Resource},
        signal::{self, SigHandler, Signal},
        socket::{self, sockopt},
        stat::{self, Mode},
    },
    unistd::{self, ForkResult, Gid, Pid, Uid},
};
use std::{
    io,
    os::fd::{BorrowedFd, OwnedFd, RawFd},
    path::Path,
    process,
};

pub const NULL_DEVICE: &str = "/dev/null";

/// Every call that mutates or inspects process-global state.
///
/// `System` forwards to the kernel; tests substitute a recorder.
pub(crate) trait Os {
    fn chdir(&mut self, path: &Path) -> nix::Result<()>;

    fn chroot(&mut self, path: &Path) -> nix::Result<()>;

    fn setgid(&mut self, gid: Gid) -> nix::Result<()>;

    fn setuid(&mut self, uid: Uid) -> nix::Result<()>;

    fn umask(&mut self, mask: Mode);

    fn disable_core_dumps(&mut self) -> nix::Result<()>;

    fn fork(&mut self) -> nix::Result<ForkResult>;

    fn setsid(&mut self) -> nix::Result<()>;

    fn exit(&mut self, code: i32) -> !;

    fn signal(&mut self, signal: Signal, handler: SigHandler) -> nix::Result<()>;

    /// Returns the hard limit on open file descriptors.
    fn descriptor_limit(&mut self) -> nix::Result<rlim_t>;

    fn close(&mut self, fd: RawFd) -> nix::Result<()>;

    fn dup2(
        &mut self,
        source: BorrowedFd<'_>,
        stream: Stream,
    ) -> nix::Result<()>;

    fn open_null(&mut self) -> nix::Result<OwnedFd>;

    fn parent_pid(&mut self) -> Pid;

    /// Queries the socket type of the inherited standard input.
    fn stdin_socket_type(&mut self) -> nix::Result<()>;
}

/// The real process.
#[derive(Debug, Default)]
pub(crate) struct System;

impl Os for System {
    fn chdir(&mut self, path: &Path) -> nix::Result<()> {
        unistd::chdir(path)
    }

    fn chroot(&mut self, path: &Path) -> nix::Result<()> {
        unistd::chroot(path)
    }

    fn setgid(&mut self, gid: Gid) -> nix::Result<()> {
        unistd::setgid(gid)
    }

    fn setuid(&mut self, uid: Uid) -> nix::Result<()> {
        unistd::setuid(uid)
    }

    fn umask(&mut self, mask: Mode) {
        stat::umask(mask);
    }

    fn disable_core_dumps(&mut self) -> nix::Result<()> {
        resource::setrlimit(Resource::RLIMIT_CORE, 0, 0)
    }

    fn fork(&mut self) -> nix::Result<ForkResult> {
        // SAFETY: opening a daemon context is single-threaded; the child only
        // continues with the remaining open steps.
        unsafe { unistd::fork() }
    }

    fn setsid(&mut self) -> nix::Result<()> {
        unistd::setsid().map(drop)
    }

    fn exit(&mut self, code: i32) -> ! {
        process::exit(code)
    }

    fn signal(&mut self, signal: Signal, handler: SigHandler) -> nix::Result<()> {
        // SAFETY: handlers come from `SignalAction`, whose only built-in
        // handler is `signal::terminate`.
        unsafe { signal::signal(signal, handler) }.map(drop)
    }

    fn descriptor_limit(&mut self) -> nix::Result<rlim_t> {
        resource::getrlimit(Resource::RLIMIT_NOFILE).map(|(_, hard)| hard)
    }

    fn close(&mut self, fd: RawFd) -> nix::Result<()> {
        // `unistd::close` needs an owned descriptor, and nothing owns the
        // inherited ones.
        // SAFETY: closing descriptors the caller did not preserve is the
        // purpose of this step.
        Errno::result(unsafe { libc::close(fd) }).map(drop)
    }

    fn dup2(
        &mut self,
        source: BorrowedFd<'_>,
        stream: Stream,
    ) -> nix::Result<()> {
        match stream {
            Stream::Stdin => unistd::dup2_stdin(source),
            Stream::Stdout => unistd::dup2_stdout(source),
            Stream::Stderr => unistd::dup2_stderr(source),
        }
    }

    fn open_null(&mut self) -> nix::Result<OwnedFd> {
        fcntl::open(NULL_DEVICE, OFlag::O_RDWR, Mode::empty())
    }

    fn parent_pid(&mut self) -> Pid {
        unistd::getppid()
    }

    fn stdin_socket_type(&mut self) -> nix::Result<()> {
        socket::getsockopt(&io::stdin(), sockopt::SockType).map(drop)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;

    use std::{collections::VecDeque, os::fd::AsRawFd, path::PathBuf};

    /// A call recorded by [`Recorder`].
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Call {
        Chdir(PathBuf),
        Chroot(PathBuf),
        Setgid(u32),
        Setuid(u32),
        Umask(u32),
        DisableCoreDumps,
        Fork,
        Setsid,
        Exit(i32),
        Signal(Signal, SigHandler),
        DescriptorLimit,
        Close(RawFd),
        Dup2(RawFd, RawFd),
        OpenNull,
    }

    /// Payload of the panic raised in place of exiting.
    pub struct Exited(pub i32);

    /// Records every call and answers from canned values.
    #[derive(Debug)]
    pub struct Recorder {
        pub calls: Vec<Call>,
        pub forks: VecDeque<nix::Result<ForkResult>>,
        pub limit: rlim_t,
        pub open: Vec<RawFd>,
        /// Descriptors of the null devices opened so far.
        pub nulls: Vec<RawFd>,
        pub ppid: i32,
        pub socket: nix::Result<()>,
        pub fail_chroot: Option<Errno>,
        pub fail_core: Option<Errno>,
        pub fail_dup2: Option<Errno>,
        pub fail_close: Option<(RawFd, Errno)>,
    }

    impl Default for Recorder {
        fn default() -> Self {
            Self {
                calls: Vec::new(),
                forks: VecDeque::new(),
                limit: 8,
                open: (0..8).collect(),
                nulls: Vec::new(),
                ppid: 4242,
                socket: Err(Errno::ENOTSOCK),
                fail_chroot: None,
                fail_core: None,
                fail_dup2: None,
                fail_close: None,
            }
        }
    }

    impl Recorder {
        pub fn closed(&self) -> Vec<RawFd> {
            self.calls
                .iter()
                .filter_map(|call| match call {
                    Call::Close(fd) => Some(*fd),
                    _ => None,
                })
                .collect()
        }

        pub fn count(&self, wanted: &Call) -> usize {
            self.calls.iter().filter(|call| *call == wanted).count()
        }
    }

    impl Os for Recorder {
        fn chdir(&mut self, path: &Path) -> nix::Result<()> {
            self.calls.push(Call::Chdir(path.to_path_buf()));
            Ok(())
        }

        fn chroot(&mut self, path: &Path) -> nix::Result<()> {
            self.calls.push(Call::Chroot(path.to_path_buf()));
            self.fail_chroot.map_or(Ok(()), Err)
        }

        fn setgid(&mut self, gid: Gid) -> nix::Result<()> {
            self.calls.push(Call::Setgid(gid.as_raw()));
            Ok(())
        }

        fn setuid(&mut self, uid: Uid) -> nix::Result<()> {
            self.calls.push(Call::Setuid(uid.as_raw()));
            Ok(())
        }

        fn umask(&mut self, mask: Mode) {
            self.calls.push(Call::Umask(mask.bits().into()));
        }

        fn disable_core_dumps(&mut self) -> nix::Result<()> {
            self.calls.push(Call::DisableCoreDumps);
            self.fail_core.map_or(Ok(()), Err)
        }

        fn fork(&mut self) -> nix::Result<ForkResult> {
            self.calls.push(Call::Fork);
            self.forks.pop_front().unwrap_or(Ok(ForkResult::Child))
        }

        fn setsid(&mut self) -> nix::Result<()> {
            self.calls.push(Call::Setsid);
            Ok(())
        }

        fn exit(&mut self, code: i32) -> ! {
            self.calls.push(Call::Exit(code));
            std::panic::panic_any(Exited(code))
        }

        fn signal(
            &mut self,
            signal: Signal,
            handler: SigHandler,
        ) -> nix::Result<()> {
            self.calls.push(Call::Signal(signal, handler));
            Ok(())
        }

        fn descriptor_limit(&mut self) -> nix::Result<rlim_t> {
            self.calls.push(Call::DescriptorLimit);
            Ok(self.limit)
        }

        fn close(&mut self, fd: RawFd) -> nix::Result<()> {
            self.calls.push(Call::Close(fd));

            if let Some((failing, errno)) = self.fail_close
                && failing == fd
            {
                return Err(errno);
            }

            match self.open.iter().position(|open| *open == fd) {
                Some(index) => {
                    self.open.remove(index);
                    Ok(())
                }
                None => Err(Errno::EBADF),
            }
        }

        fn dup2(
            &mut self,
            source: BorrowedFd<'_>,
            stream: Stream,
        ) -> nix::Result<()> {
            self.calls.push(Call::Dup2(source.as_raw_fd(), stream.fileno()));
            self.fail_dup2.map_or(Ok(()), Err)
        }

        fn open_null(&mut self) -> nix::Result<OwnedFd> {
            self.calls.push(Call::OpenNull);
            let null = System.open_null()?;
            self.nulls.push(null.as_raw_fd());
            Ok(null)
        }

        fn parent_pid(&mut self) -> Pid {
            Pid::from_raw(self.ppid)
        }

        fn stdin_socket_type(&mut self) -> nix::Result<()> {
            self.socket
        }
    }
}
