//! Relay protocol
//!
//! When descriptors beyond stdin/stdout/stderr must reach the child, the
//! parent spawns the relay executable instead of the target. The relay's
//! stdin is a datagram socket; the parent sends a count followed by the
//! descriptors (see [`crate::fd_passing`]). The relay installs each
//! descriptor at its tag, stdin last, and then execs the target:
//!
//! ```text
//! procinvoke-relay --use-path|--no-use-path [--path <dirs>] -- <executable> [args...]
//! ```

use std::convert::Infallible;
use std::ffi::{CString, OsString};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tracing::{debug, trace};

use crate::fd_passing::{receive_count, receive_descriptors};
use crate::line::STDIN_FD;
use crate::path_search::{try_candidates, SearchPath};

/// Environment variable holding the relay's log filter
pub const RELAY_LOG_ENV_VAR: &str = "PROCINVOKE_RELAY_LOG";

/// What the relay executes once descriptors are in place
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayArgs {
    pub use_path: bool,
    /// Colon-joined absolute directories; `None` selects the POSIX default
    pub path: Option<OsString>,
    pub executable: OsString,
    pub args: Vec<OsString>,
}

impl RelayArgs {
    /// Arguments passed to the relay executable
    pub fn to_argv(&self) -> Vec<OsString> {
        let mut argv = Vec::with_capacity(self.args.len() + 5);
        argv.push(OsString::from(if self.use_path {
            "--use-path"
        } else {
            "--no-use-path"
        }));
        if let Some(path) = &self.path {
            argv.push("--path".into());
            argv.push(path.clone());
        }
        argv.push("--".into());
        argv.push(self.executable.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    pub fn search_path(&self) -> SearchPath {
        if self.use_path {
            SearchPath::from_relay_argument(self.path.as_deref())
        } else {
            SearchPath {
                directories: Vec::new(),
                is_posix_default: false,
            }
        }
    }
}

fn dup_above(fd: &OwnedFd, floor: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: fcntl on a descriptor we own; the result is a fresh descriptor.
    let high = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, floor) };
    if high == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(high) })
}

/// Receive descriptors on stdin and install them at their tags
///
/// Returns how many were installed.
pub fn install_received_descriptors() -> io::Result<usize> {
    // SAFETY: stdin is the socket the parent handed over; it stays open until
    // the last descriptor was received.
    let socket = unsafe { BorrowedFd::borrow_raw(STDIN_FD) };
    let count = receive_count(socket)? as usize;
    let received = receive_descriptors(socket, count)?;
    trace!(count, "Received descriptors");

    // Park everything above every tag and every received number so that
    // installing one descriptor never clobbers another.
    let floor = received
        .iter()
        .map(|(tag, fd)| (*tag).max(fd.as_raw_fd()))
        .max()
        .unwrap_or(STDIN_FD)
        + 1;
    let mut staged = Vec::with_capacity(received.len());
    for (tag, fd) in received {
        staged.push((tag, dup_above(&fd, floor)?));
    }
    staged.sort_by_key(|(tag, _)| *tag == STDIN_FD);

    for (tag, fd) in &staged {
        // SAFETY: dup2 onto the tag; the target is not one of our staged descriptors.
        if unsafe { libc::dup2(fd.as_raw_fd(), *tag) } == -1 {
            return Err(io::Error::last_os_error());
        }
        debug!(fd = *tag, "Installed descriptor");
    }
    Ok(count)
}

fn c_string(bytes: &[u8]) -> io::Result<CString> {
    CString::new(bytes).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "argument contains NUL"))
}

/// Replace the relay with the target; only returns on failure
pub fn exec(args: &RelayArgs) -> io::Error {
    let candidates = args.search_path().candidates(Path::new(&args.executable));
    let rest: io::Result<Vec<CString>> = args.args.iter().map(|a| c_string(a.as_bytes())).collect();
    let rest = match rest {
        Ok(rest) => rest,
        Err(e) => return e,
    };

    let attempt = |path: &Path| -> io::Result<Infallible> {
        let program = c_string(path.as_os_str().as_bytes())?;
        let mut argv = Vec::with_capacity(rest.len() + 1);
        argv.push(program.clone());
        argv.extend(rest.iter().cloned());
        trace!(path = %path.display(), "Executing");
        nix::unistd::execv(&program, &argv).map_err(io::Error::from)
    };
    match try_candidates(&candidates, attempt) {
        Ok(never) => match never {},
        Err(e) => e,
    }
}
