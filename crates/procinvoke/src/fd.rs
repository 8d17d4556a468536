//! File descriptor helpers and ownership slots
//!
//! Descriptors handed to an invocation live in a [`TransferredFd`] slot. A
//! launch claims the descriptor out of its slot; if the launch fails before
//! the process is confirmed running the [`ClaimedFd`] puts it back, so the
//! caller's descriptor still owns it.

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

use tracing::{error, trace};

use crate::error::{InvocationError, Result};

/// A descriptor whose ownership moves to the invocation at launch
#[derive(Clone)]
pub struct TransferredFd {
    raw: RawFd,
    slot: Arc<Mutex<Option<OwnedFd>>>,
}

impl TransferredFd {
    /// Wrap an owned descriptor
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            raw: fd.as_raw_fd(),
            slot: Arc::new(Mutex::new(Some(fd))),
        }
    }

    /// Whether the descriptor is still held by this slot
    pub fn is_available(&self) -> bool {
        self.slot.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// Take the descriptor back out of the slot
    pub fn into_owned(self) -> Option<OwnedFd> {
        self.slot.lock().ok().and_then(|mut slot| slot.take())
    }

    pub(crate) fn claim(&self) -> Result<ClaimedFd> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| InvocationError::Internal("descriptor slot poisoned".into()))?;
        let fd = slot.take().ok_or_else(|| {
            InvocationError::InvalidConfiguration(format!(
                "descriptor {} was already consumed by a previous launch",
                self.raw
            ))
        })?;
        Ok(ClaimedFd {
            fd: Some(fd),
            slot: Arc::clone(&self.slot),
            revert_blocking: false,
        })
    }
}

impl AsRawFd for TransferredFd {
    fn as_raw_fd(&self) -> RawFd {
        self.raw
    }
}

impl From<OwnedFd> for TransferredFd {
    fn from(fd: OwnedFd) -> Self {
        Self::new(fd)
    }
}

impl fmt::Debug for TransferredFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferredFd")
            .field("fd", &self.raw)
            .field("available", &self.is_available())
            .finish()
    }
}

/// A descriptor claimed by a launch in progress
///
/// Dropping it returns the descriptor to its slot. [`ClaimedFd::commit`]
/// makes the transfer final.
pub(crate) struct ClaimedFd {
    fd: Option<OwnedFd>,
    slot: Arc<Mutex<Option<OwnedFd>>>,
    revert_blocking: bool,
}

impl ClaimedFd {
    pub(crate) fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        use std::os::fd::AsFd;
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    pub(crate) fn raw(&self) -> RawFd {
        self.fd.as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }

    /// Put the descriptor in non-blocking mode, undone if the claim is rolled back
    pub(crate) fn set_nonblocking(&mut self) -> Result<()> {
        let raw = self.raw();
        if set_nonblocking(raw, true)? {
            tracing::warn!(fd = raw, "Setting O_NONBLOCK on caller supplied descriptor");
            self.revert_blocking = true;
        }
        Ok(())
    }

    pub(crate) fn commit(mut self) -> Option<OwnedFd> {
        self.fd.take()
    }
}

impl Drop for ClaimedFd {
    fn drop(&mut self) {
        let Some(fd) = self.fd.take() else {
            return;
        };
        if self.revert_blocking {
            if let Err(e) = set_nonblocking(fd.as_raw_fd(), false) {
                error!(fd = fd.as_raw_fd(), error = %e, "Failed to restore blocking mode");
            }
        }
        trace!(fd = fd.as_raw_fd(), "Returning descriptor to its owner");
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(fd);
        }
    }
}

impl fmt::Debug for ClaimedFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimedFd").field("fd", &self.raw()).finish()
    }
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we hold.
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) })?;
    Ok(())
}

/// Create an anonymous pipe, returned as `(read, write)`
///
/// Both ends are close-on-exec; the caller owns them.
pub fn anonymous_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [-1 as RawFd; 2];
    // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
    cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })
        .map_err(|e| InvocationError::system("creating pipe", e))?;
    // SAFETY: pipe(2) succeeded, both descriptors are fresh and ours.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_cloexec(read.as_raw_fd()).map_err(|e| InvocationError::system("creating pipe", e))?;
    set_cloexec(write.as_raw_fd()).map_err(|e| InvocationError::system("creating pipe", e))?;
    Ok((read, write))
}

/// Create a connected pair of local datagram sockets
pub(crate) fn datagram_socket_pair() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [-1 as RawFd; 2];
    // SAFETY: `fds` has room for the two descriptors socketpair(2) writes.
    cvt(unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr()) })
        .map_err(|e| InvocationError::system("creating socket pair", e))?;
    // SAFETY: socketpair(2) succeeded, both descriptors are fresh and ours.
    let (a, b) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_cloexec(a.as_raw_fd()).map_err(|e| InvocationError::system("creating socket pair", e))?;
    set_cloexec(b.as_raw_fd()).map_err(|e| InvocationError::system("creating socket pair", e))?;
    Ok((a, b))
}

/// Switch `O_NONBLOCK`; returns whether the flag changed
pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> Result<bool> {
    let op = "changing O_NONBLOCK";
    // SAFETY: fcntl on a caller-held descriptor.
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })
        .map_err(|e| InvocationError::system(op, e))?;
    let updated = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if updated == flags {
        return Ok(false);
    }
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, updated) })
        .map_err(|e| InvocationError::system(op, e))?;
    Ok(true)
}

/// Duplicate a descriptor the caller keeps owning
pub(crate) fn dup_borrowed(fd: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: the caller guarantees `fd` stays open for the duration of the call.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    borrowed.try_clone_to_owned()
}

pub(crate) fn open_dev_null() -> Result<OwnedFd> {
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map(OwnedFd::from)
        .map_err(|e| InvocationError::system("opening /dev/null", e))
}

/// Close a descriptor, logging instead of failing
pub(crate) fn close_logged(fd: OwnedFd) {
    let raw = fd.into_raw_fd();
    // SAFETY: `raw` came out of an OwnedFd, nothing else closes it.
    if unsafe { libc::close(raw) } == -1 {
        let err = io::Error::last_os_error();
        error!(fd = raw, error = %err, "Failed to close file descriptor");
    }
}

/// Bytes ready to be read, at least 1
pub(crate) fn available_bytes(fd: RawFd) -> usize {
    let mut count: libc::c_int = 0;
    // SAFETY: FIONREAD writes one int.
    let ret = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut count) };
    if ret == -1 || count < 1 {
        1
    } else {
        count as usize
    }
}
