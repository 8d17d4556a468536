//! Descriptor passing over local datagram sockets
//!
//! The relay protocol is a count header (one datagram holding a native-endian
//! `u32`) followed by one message per descriptor. Each message carries the
//! descriptor as `SCM_RIGHTS` ancillary data and a native-endian `i32` payload
//! naming the descriptor number it must be installed as in the child.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use crate::error::{InvocationError, Result};

const PAYLOAD_LEN: usize = mem::size_of::<i32>();

fn cmsg_space() -> usize {
    // SAFETY: pure arithmetic macro.
    unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as libc::c_uint) as usize }
}

/// Send the number of descriptors that follow
pub fn send_count(socket: BorrowedFd<'_>, count: u32) -> Result<()> {
    let bytes = count.to_ne_bytes();
    // SAFETY: `bytes` is valid for its length for the duration of the call.
    let sent = unsafe {
        libc::send(
            socket.as_raw_fd(),
            bytes.as_ptr().cast(),
            bytes.len(),
            0,
        )
    };
    if sent < 0 {
        return Err(InvocationError::system(
            "sending descriptor count",
            io::Error::last_os_error(),
        ));
    }
    if sent as usize != bytes.len() {
        return Err(InvocationError::Internal(format!(
            "descriptor count header truncated: {sent} of {} bytes sent",
            bytes.len()
        )));
    }
    Ok(())
}

/// Send `fd` so the receiver installs it as descriptor `tagged_as`
pub fn send_descriptor(socket: BorrowedFd<'_>, fd: BorrowedFd<'_>, tagged_as: RawFd) -> Result<()> {
    let mut payload = tagged_as.to_ne_bytes();
    let mut control = vec![0u8; cmsg_space()];

    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };
    // SAFETY: msghdr is plain data; every pointer below outlives the sendmsg call.
    let sent = unsafe {
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = control.len() as _;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(InvocationError::Internal(
                "no room for ancillary header".into(),
            ));
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as libc::c_uint) as _;
        ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd.as_raw_fd());

        libc::sendmsg(socket.as_raw_fd(), &msg, 0)
    };
    if sent < 0 {
        return Err(InvocationError::system(
            "sending descriptor",
            io::Error::last_os_error(),
        ));
    }
    if sent as usize != PAYLOAD_LEN {
        return Err(InvocationError::Internal(format!(
            "descriptor message truncated: {sent} of {PAYLOAD_LEN} bytes sent"
        )));
    }
    Ok(())
}

/// Receive the count header
pub fn receive_count(socket: BorrowedFd<'_>) -> io::Result<u32> {
    let mut bytes = [0u8; 4];
    // SAFETY: `bytes` is writable for its length.
    let received = unsafe {
        libc::recv(
            socket.as_raw_fd(),
            bytes.as_mut_ptr().cast(),
            bytes.len(),
            0,
        )
    };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }
    if received as usize != bytes.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("short count header ({received} bytes)"),
        ));
    }
    Ok(u32::from_ne_bytes(bytes))
}

/// Receive `count` descriptors as `(tag, descriptor)` pairs, in send order
///
/// Received descriptors are close-on-exec.
pub fn receive_descriptors(socket: BorrowedFd<'_>, count: usize) -> io::Result<Vec<(RawFd, OwnedFd)>> {
    let mut received = Vec::with_capacity(count);
    for _ in 0..count {
        received.push(receive_one(socket)?);
    }
    Ok(received)
}

fn receive_one(socket: BorrowedFd<'_>) -> io::Result<(RawFd, OwnedFd)> {
    let mut payload = [0u8; PAYLOAD_LEN];
    let mut control = vec![0u8; cmsg_space()];

    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    let flags = libc::MSG_CMSG_CLOEXEC;
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    let flags = 0;

    // SAFETY: msghdr is plain data; every pointer below outlives the recvmsg call.
    let (len, msg) = unsafe {
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = control.len() as _;
        let len = libc::recvmsg(socket.as_raw_fd(), &mut msg, flags);
        (len, msg)
    };
    if len < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut descriptor = None;
    // SAFETY: `msg` was filled by recvmsg and `control` is still alive.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let raw = ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>());
                descriptor = Some(OwnedFd::from_raw_fd(raw));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "ancillary data truncated",
        ));
    }
    let descriptor = descriptor.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "message carried no descriptor")
    })?;
    if len as usize != PAYLOAD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("short descriptor payload ({len} bytes)"),
        ));
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        // SAFETY: fcntl on the descriptor just received.
        let fd = descriptor.as_raw_fd();
        let current = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if current == -1 || unsafe { libc::fcntl(fd, libc::F_SETFD, current | libc::FD_CLOEXEC) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok((i32::from_ne_bytes(payload), descriptor))
}
