use std::os::fd::OwnedFd;

use rustix::fs::{fcntl_getfl, fcntl_setfl, OFlags};

/// Flips `fd` into nonblocking mode. Used on whichever end of a descriptor
/// the zio itself owns and polls; the end exposed to the caller (e.g. a
/// child process's stdin) is left blocking, per the external interface
/// contract.
pub(crate) fn set_nonblocking(fd: &OwnedFd) -> std::io::Result<()> {
    let flags = fcntl_getfl(fd)?;
    fcntl_setfl(fd, flags | OFlags::NONBLOCK)?;
    Ok(())
}

/// Creates an anonymous pipe, returning `(read_end, write_end)`.
pub(crate) fn anonymous_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let (read_end, write_end) = rustix::pipe::pipe()?;
    Ok((read_end, write_end))
}
