//! Standard stream redirect modes

use std::fmt;
use std::io::Cursor;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncRead;

use crate::error::{InvocationError, Result};
use crate::fd::TransferredFd;

/// An existing descriptor used as a redirect target
#[derive(Debug, Clone)]
pub enum SourceFd {
    /// Duplicated for the child, never closed by the invocation
    Borrowed(RawFd),
    /// Moved into the invocation at launch and closed after spawn
    Owned(TransferredFd),
}

impl SourceFd {
    pub fn raw(&self) -> RawFd {
        match self {
            Self::Borrowed(fd) => *fd,
            Self::Owned(fd) => fd.as_raw_fd(),
        }
    }
}

impl From<OwnedFd> for SourceFd {
    fn from(fd: OwnedFd) -> Self {
        Self::Owned(TransferredFd::new(fd))
    }
}

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Bytes fed to the child's stdin through a pipe
#[derive(Clone)]
pub struct StdinSource(SourceKind);

#[derive(Clone)]
enum SourceKind {
    Bytes(Arc<[u8]>),
    Reader(Arc<Mutex<Option<BoxedReader>>>),
}

impl StdinSource {
    /// A buffer; reusable across launches
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Self(SourceKind::Bytes(Arc::from(data.into())))
    }

    /// A reader; consumed by the first launch
    pub fn reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self(SourceKind::Reader(Arc::new(Mutex::new(Some(Box::new(reader))))))
    }

    pub(crate) fn is_empty_buffer(&self) -> bool {
        matches!(&self.0, SourceKind::Bytes(data) if data.is_empty())
    }

    pub(crate) fn open(&self) -> Result<BoxedReader> {
        match &self.0 {
            SourceKind::Bytes(data) => Ok(Box::new(Cursor::new(Arc::clone(data)))),
            SourceKind::Reader(slot) => slot
                .lock()
                .map_err(|_| InvocationError::Internal("stdin source poisoned".into()))?
                .take()
                .ok_or_else(|| {
                    InvocationError::InvalidConfiguration(
                        "stdin reader was already consumed by a previous launch".into(),
                    )
                }),
        }
    }
}

impl fmt::Debug for StdinSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            SourceKind::Bytes(data) => write!(f, "StdinSource::Bytes({} bytes)", data.len()),
            SourceKind::Reader(_) => f.write_str("StdinSource::Reader"),
        }
    }
}

/// Where the child's stdin comes from
#[derive(Debug, Clone)]
pub enum InputRedirect {
    /// The parent's stdin
    Inherit {
        /// Make the child the terminal's foreground process group
        set_foreground_group: bool,
    },
    /// `/dev/null`
    Null,
    /// A pipe fed from memory or a reader
    FromReader(StdinSource),
    /// An existing descriptor
    FromFd {
        fd: SourceFd,
        set_foreground_group: bool,
    },
}

impl Default for InputRedirect {
    fn default() -> Self {
        Self::Inherit {
            set_foreground_group: true,
        }
    }
}

impl InputRedirect {
    pub fn send(data: impl Into<Vec<u8>>) -> Self {
        Self::FromReader(StdinSource::bytes(data))
    }

    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::FromReader(StdinSource::reader(reader))
    }

    pub fn from_fd(fd: RawFd) -> Self {
        Self::FromFd {
            fd: SourceFd::Borrowed(fd),
            set_foreground_group: false,
        }
    }

    pub fn from_owned_fd(fd: OwnedFd) -> Self {
        Self::FromFd {
            fd: fd.into(),
            set_foreground_group: false,
        }
    }

    pub(crate) fn sets_foreground_group(&self) -> bool {
        matches!(
            self,
            Self::Inherit {
                set_foreground_group: true
            } | Self::FromFd {
                set_foreground_group: true,
                ..
            }
        )
    }
}

/// Where the child's stdout or stderr goes
#[derive(Debug, Clone, Default)]
pub enum OutputRedirect {
    /// The parent's stream
    Inherit,
    /// `/dev/null`
    Null,
    /// A pipe read by the invocation and delivered as lines
    #[default]
    Capture,
    /// An existing descriptor
    ToFd(SourceFd),
}

impl OutputRedirect {
    pub fn to_fd(fd: RawFd) -> Self {
        Self::ToFd(SourceFd::Borrowed(fd))
    }

    pub fn to_owned_fd(fd: OwnedFd) -> Self {
        Self::ToFd(fd.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_bytes_source_is_reusable() {
        let source = StdinSource::bytes(b"abc".to_vec());
        for _ in 0..2 {
            let mut out = Vec::new();
            source.open().unwrap().read_to_end(&mut out).await.unwrap();
            assert_eq!(out, b"abc");
        }
    }

    #[tokio::test]
    async fn test_reader_source_is_single_use() {
        let source = StdinSource::reader(&b"xyz"[..]);
        let mut out = Vec::new();
        source.open().unwrap().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"xyz");
        assert!(matches!(
            source.open(),
            Err(InvocationError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_foreground_group_flag() {
        assert!(InputRedirect::default().sets_foreground_group());
        assert!(!InputRedirect::Null.sets_foreground_group());
        assert!(!InputRedirect::from_fd(0).sets_foreground_group());
        assert!(!InputRedirect::send("x").sets_foreground_group());
    }
}
