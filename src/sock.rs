//! Descriptor plumbing shared by the I/O tasks.
//!
//! Raw Bluetooth socket calls live in [crate::hci]; this module carries
//! the pieces every worker needs: an owning descriptor wrapper, plain
//! read/write, the pipe and control-socket factories handed out by
//! `Open`, and blocking-mode switches for descriptors that cross the
//! engine/client boundary.

use std::{
    io::{Error, Result},
    os::unix::io::{AsRawFd, IntoRawFd, RawFd},
};

/// An owned file descriptor, closed on drop.
#[derive(Debug)]
pub struct OwnedFd {
    fd: RawFd,
    close_on_drop: bool,
}

impl OwnedFd {
    /// Take ownership of a raw descriptor.
    ///
    /// # Safety
    /// The descriptor must be open and not owned elsewhere.
    pub unsafe fn new(fd: RawFd) -> Self {
        Self { fd, close_on_drop: true }
    }
}

impl AsRawFd for OwnedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for OwnedFd {
    fn into_raw_fd(mut self) -> RawFd {
        self.close_on_drop = false;
        self.fd
    }
}

impl Drop for OwnedFd {
    fn drop(&mut self) {
        if self.close_on_drop {
            unsafe { libc::close(self.fd) };
        }
    }
}

/// Read from descriptor into buffer.
pub fn read(fd: &OwnedFd, buf: &mut [u8]) -> Result<usize> {
    match unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len()) } {
        -1 => Err(Error::last_os_error()),
        n => Ok(n as _),
    }
}

/// Write from buffer to descriptor.
pub fn write(fd: &OwnedFd, buf: &[u8]) -> Result<usize> {
    match unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr() as *const _, buf.len()) } {
        -1 => Err(Error::last_os_error()),
        n => Ok(n as _),
    }
}

/// Perform an IOCTL on a mutable value.
pub fn ioctl_mut<T>(fd: &OwnedFd, request: libc::c_ulong, value: &mut T) -> Result<libc::c_int> {
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), request, value as *mut _) };
    if ret == -1 {
        return Err(Error::last_os_error());
    }
    Ok(ret)
}

/// Create a non-blocking unidirectional pipe.
///
/// Returns `(read end, write end)`.
pub fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } == -1 {
        return Err(Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::new(fds[0]), OwnedFd::new(fds[1])) })
}

/// Create a connected pair of non-blocking sequenced-packet sockets.
///
/// Used for the PCM and RFCOMM control channels: datagram semantics with
/// connection lifetime tied to the peer end.
pub fn seqpacket_pair() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    } == -1
    {
        return Err(Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::new(fds[0]), OwnedFd::new(fds[1])) })
}

fn update_flags(fd: &OwnedFd, f: impl FnOnce(libc::c_int) -> libc::c_int) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags == -1 {
        return Err(Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, f(flags)) } == -1 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Set the non-blocking flag on a descriptor.
///
/// Descriptors received over the bus arrive in blocking mode.
pub fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    update_flags(fd, |flags| flags | libc::O_NONBLOCK)
}

/// Clear the non-blocking flag on a descriptor.
///
/// Descriptors handed to clients over the bus are blocking; the engine
/// keeps its own ends non-blocking.
pub fn set_blocking(fd: &OwnedFd) -> Result<()> {
    update_flags(fd, |flags| flags & !libc::O_NONBLOCK)
}
