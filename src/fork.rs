use crate::{
    error::{Error, ForkStage},
    sys::{Os, System},
};

use nix::{errno::Errno, unistd::ForkResult};
use tracing::debug;

/// Returns true if the calling process needs to detach to become a daemon.
///
/// A process started by init, or by a super-server such as inetd that hands
/// over a socket as standard input, is already detached.
pub fn detach_required() -> bool {
    detach_required_with(&mut System)
}

pub(crate) fn detach_required_with<O: Os>(os: &mut O) -> bool {
    !(parent_is_inet(os) || parent_is_init(os))
}

fn parent_is_init<O: Os>(os: &mut O) -> bool {
    os.parent_pid().as_raw() == 1
}

/// Any answer other than "not a socket", errors included, counts as a
/// socket.
fn parent_is_inet<O: Os>(os: &mut O) -> bool {
    !matches!(os.stdin_socket_type(), Err(Errno::ENOTSOCK))
}

/// Detaches from the controlling terminal by forking twice.
///
/// Both parents exit with status zero; only the grandchild returns. The
/// grandchild is not a session leader, so it can never acquire a controlling
/// terminal again.
pub(crate) fn detach<O: Os>(os: &mut O) -> Result<(), Error> {
    fork(os, ForkStage::First)?;
    os.setsid().map_err(Error::Setsid)?;
    fork(os, ForkStage::Second)?;

    debug!("detached from controlling terminal");
    Ok(())
}

fn fork<O: Os>(os: &mut O, stage: ForkStage) -> Result<(), Error> {
    match os.fork() {
        Ok(ForkResult::Parent { .. }) => os.exit(0),
        Ok(ForkResult::Child) => Ok(()),
        Err(source) => Err(Error::Fork { stage, source }),
    }
}
