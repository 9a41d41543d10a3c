use crate::{
    error::Error,
    sys::{NULL_DEVICE, Os},
};

use nix::{errno::Errno, libc};
use std::{
    collections::BTreeSet,
    fmt::{self, Debug, Display, Formatter},
    fs::File,
    os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd},
};
use tracing::debug;

/// Descriptor ceiling used when the descriptor limit is unbounded.
pub const MAX_FD_FALLBACK: RawFd = 4096;

/// One of the three standard streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    Stdin,
    Stdout,
    Stderr,
}

impl Stream {
    pub fn fileno(self) -> RawFd {
        match self {
            Self::Stdin => libc::STDIN_FILENO,
            Self::Stdout => libc::STDOUT_FILENO,
            Self::Stderr => libc::STDERR_FILENO,
        }
    }
}

impl Display for Stream {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdin => f.write_str("stdin"),
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// An open file the daemon keeps: either a raw descriptor number or an
/// object that owns one.
///
/// Objects are held for the lifetime of the context, so their descriptors
/// stay valid after the bulk close.
pub enum FileHandle {
    Fd(RawFd),
    Object(Box<dyn AsRawFd>),
}

impl FileHandle {
    pub fn object<T: AsRawFd + 'static>(object: T) -> Self {
        Self::Object(Box::new(object))
    }

    pub fn fileno(&self) -> RawFd {
        match self {
            Self::Fd(fd) => *fd,
            Self::Object(object) => object.as_raw_fd(),
        }
    }
}

impl Debug for FileHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fd(fd) => f.debug_tuple("Fd").field(fd).finish(),
            Self::Object(object) => f
                .debug_tuple("Object")
                .field(&object.as_raw_fd())
                .finish(),
        }
    }
}

impl From<RawFd> for FileHandle {
    fn from(fd: RawFd) -> Self {
        Self::Fd(fd)
    }
}

impl From<File> for FileHandle {
    fn from(file: File) -> Self {
        Self::object(file)
    }
}

impl From<OwnedFd> for FileHandle {
    fn from(fd: OwnedFd) -> Self {
        Self::object(fd)
    }
}

/// A file a standard stream is redirected to.
///
/// The file is owned by the context, so it stays open after the bulk close.
pub struct StreamTarget(Box<dyn AsFd>);

impl StreamTarget {
    pub fn new<T: AsFd + 'static>(file: T) -> Self {
        Self(Box::new(file))
    }

    pub fn fileno(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }
}

impl AsFd for StreamTarget {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Debug for StreamTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StreamTarget").field(&self.fileno()).finish()
    }
}

/// Closes every descriptor below the descriptor limit except `preserve`.
pub(crate) fn close_filenos<O: Os>(
    os: &mut O,
    preserve: &BTreeSet<RawFd>,
) -> Result<(), Error> {
    let limit = os.descriptor_limit().map_err(Error::DescriptorLimit)?;

    let max = if limit == libc::RLIM_INFINITY {
        MAX_FD_FALLBACK
    } else {
        RawFd::try_from(limit).unwrap_or(MAX_FD_FALLBACK)
    };

    debug!(max, preserved = ?preserve, "closing file descriptors");

    for fd in (0..max).filter(|fd| !preserve.contains(fd)) {
        match os.close(fd) {
            Ok(()) | Err(Errno::EBADF) => (),
            Err(source) => return Err(Error::Close { fd, source }),
        }
    }

    Ok(())
}

/// Points `stream` at `target`, or at the null device if there is none.
pub(crate) fn redirect_stream<O: Os>(
    os: &mut O,
    stream: Stream,
    target: Option<&StreamTarget>,
) -> Result<(), Error> {
    match target {
        Some(file) => {
            os.dup2(file.as_fd(), stream)
                .map_err(|source| Error::Redirect {
                    stream,
                    target: format!("descriptor {}", file.fileno()),
                    source,
                })?;
        }
        None => {
            let null_error = |source| Error::Redirect {
                stream,
                target: NULL_DEVICE.to_owned(),
                source,
            };

            let null = os.open_null().map_err(null_error)?;
            os.dup2(null.as_fd(), stream).map_err(null_error)?;
            close_unless(null, stream.fileno());
        }
    }

    debug!(%stream, "redirected");
    Ok(())
}

/// Closes `fd` unless it already is descriptor `target`.
fn close_unless(fd: OwnedFd, target: RawFd) {
    // With every descriptor closed, the null device usually lands on the
    // stream it is meant to replace.
    if fd.as_raw_fd() == target {
        let _ = fd.into_raw_fd();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::{
        System,
        mock::{Call, Recorder},
    };

    use std::os::fd::FromRawFd;

    #[test]
    fn close_filenos_skips_preserved() {
        let mut os = Recorder {
            limit: 12,
            open: (0..12).collect(),
            ..Default::default()
        };

        close_filenos(&mut os, &BTreeSet::from([1, 2, 4, 9])).unwrap();

        assert_eq!(vec![0, 3, 5, 6, 7, 8, 10, 11], os.closed());
    }

    #[test]
    fn close_filenos_unbounded_limit() {
        let mut os = Recorder {
            limit: libc::RLIM_INFINITY,
            ..Default::default()
        };

        close_filenos(&mut os, &BTreeSet::from([1, 2, 4, 9])).unwrap();

        let closed = os.closed();
        assert_eq!(4092, closed.len());
        assert_eq!(Some(&4095), closed.last());
    }

    #[test]
    fn close_filenos_tolerates_unopened() {
        let mut os = Recorder {
            limit: 6,
            open: vec![0, 5],
            ..Default::default()
        };

        close_filenos(&mut os, &BTreeSet::new()).unwrap();

        assert_eq!(6, os.closed().len());
        assert!(os.open.is_empty());
    }

    #[test]
    fn close_filenos_fails_on_other_errors() {
        let mut os = Recorder {
            fail_close: Some((3, Errno::EIO)),
            ..Default::default()
        };

        let err = close_filenos(&mut os, &BTreeSet::new()).unwrap_err();

        assert!(matches!(err, Error::Close { fd: 3, source: Errno::EIO }));
        assert_eq!(vec![0, 1, 2, 3], os.closed());
    }

    #[test]
    fn redirect_to_handle() {
        let mut os = Recorder::default();
        let file = StreamTarget::new(tempfile::tempfile().unwrap());

        redirect_stream(&mut os, Stream::Stdout, Some(&file)).unwrap();

        assert_eq!(vec![Call::Dup2(file.fileno(), 1)], os.calls);
    }

    #[test]
    fn redirect_to_null_device() {
        let mut os = Recorder::default();

        redirect_stream(&mut os, Stream::Stderr, None).unwrap();

        assert_eq!(1, os.nulls.len());
        assert_eq!(
            vec![Call::OpenNull, Call::Dup2(os.nulls[0], 2)],
            os.calls
        );
    }

    #[test]
    fn null_device_kept_on_target() {
        let null = System.open_null().unwrap();
        let fd = null.as_raw_fd();

        close_unless(null, fd);

        // SAFETY: `fd` was leaked above and is reclaimed exactly once.
        let file = unsafe { File::from_raw_fd(fd) };
        assert!(file.metadata().is_ok());
    }

    #[test]
    fn redirect_failure_names_stream_and_target() {
        let mut os = Recorder {
            fail_dup2: Some(Errno::EBADF),
            ..Default::default()
        };
        let file = StreamTarget::new(tempfile::tempfile().unwrap());

        let err =
            redirect_stream(&mut os, Stream::Stdin, Some(&file)).unwrap_err();

        let expected = format!(
            "could not redirect stdin to descriptor {}: EBADF",
            file.fileno()
        );
        assert!(err.to_string().starts_with(&expected));
    }

    #[test]
    fn file_handle_fileno() {
        struct Fake(RawFd);

        impl AsRawFd for Fake {
            fn as_raw_fd(&self) -> RawFd {
                self.0
            }
        }

        assert_eq!(16, FileHandle::object(Fake(16)).fileno());
        assert_eq!(2, FileHandle::from(2).fileno());
    }
}
