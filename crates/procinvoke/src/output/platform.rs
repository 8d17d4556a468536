//! Read quirks of the host platform
//!
//! `ReadQuirks::detect` runs once per output fd when it is registered and
//! `ReadQuirks::classify` decides what a failed read means. Which
//! implementation is compiled is fixed per target.

use std::io;
use std::os::fd::RawFd;

/// Outcome of a failed read
#[derive(Debug)]
pub(crate) enum ReadFailure {
    /// Treat as end of stream
    EndOfStream,
    Error(io::Error),
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod imp {
    use super::*;
    use tracing::{debug, warn};

    /// Master side of a pseudo-terminal reports `EIO` once every slave closed
    #[derive(Debug, Clone, Copy, Default)]
    pub(crate) struct ReadQuirks {
        pty_master: bool,
    }

    impl ReadQuirks {
        pub(crate) fn detect(fd: RawFd) -> Self {
            let mut name = [0 as libc::c_char; 128];
            // SAFETY: `name` is writable for its length.
            let ret = unsafe { libc::ptsname_r(fd, name.as_mut_ptr(), name.len()) };
            let pty_master = match ret {
                0 => true,
                libc::ENOTTY | libc::EINVAL => false,
                errno => {
                    warn!(
                        fd,
                        error = %io::Error::from_raw_os_error(errno),
                        "Could not tell whether descriptor is a pty master, assuming it is not"
                    );
                    false
                }
            };
            if pty_master {
                debug!(fd, "Output descriptor is a pty master");
            }
            Self { pty_master }
        }

        pub(crate) fn classify(&self, error: io::Error) -> ReadFailure {
            if self.pty_master && error.raw_os_error() == Some(libc::EIO) {
                ReadFailure::EndOfStream
            } else {
                ReadFailure::Error(error)
            }
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod imp {
    use super::*;

    #[derive(Debug, Clone, Copy, Default)]
    pub(crate) struct ReadQuirks;

    impl ReadQuirks {
        pub(crate) fn detect(_fd: RawFd) -> Self {
            Self
        }

        pub(crate) fn classify(&self, error: io::Error) -> ReadFailure {
            ReadFailure::Error(error)
        }
    }
}

pub(crate) use imp::ReadQuirks;
