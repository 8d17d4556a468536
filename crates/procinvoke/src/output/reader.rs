//! Per-descriptor drain task

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::platform::{ReadFailure, ReadQuirks};
use super::Event;
use crate::fd;
use crate::line::RawLine;
use crate::separators::{LineSeparators, LineSplitter};

/// An output descriptor owned by the invocation
#[derive(Debug)]
pub(crate) struct OutputSource {
    pub(crate) fd: OwnedFd,
    /// Identity reported in every line read from `fd`
    pub(crate) logical_fd: RawFd,
    pub(crate) quirks: ReadQuirks,
}

enum Outcome {
    Finished,
    Cancelled,
    Failed(io::Error),
}

fn read_into(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: `buf` is writable for its length.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

pub(crate) struct Drain {
    pub(crate) stream: usize,
    pub(crate) separators: LineSeparators,
    pub(crate) max_read_size: usize,
    pub(crate) token: CancellationToken,
    pub(crate) events: mpsc::Sender<Event>,
}

impl Drain {
    /// Read `source` until end of stream, error or cancellation, then close it
    pub(crate) async fn run(self, source: OutputSource) {
        let OutputSource {
            fd: owned,
            logical_fd,
            quirks,
        } = source;
        let raw = owned.as_raw_fd();

        let async_fd = match AsyncFd::with_interest(owned, Interest::READABLE) {
            Ok(async_fd) => async_fd,
            Err(error) => {
                warn!(fd = raw, error = %error, "Cannot watch output descriptor");
                let _ = self
                    .events
                    .send(Event::Failed {
                        stream: self.stream,
                        error,
                    })
                    .await;
                return;
            }
        };

        let outcome = self.pump(&async_fd, logical_fd, quirks).await;
        match outcome {
            Outcome::Finished => debug!(fd = raw, logical_fd, "Output stream finished"),
            Outcome::Cancelled => debug!(fd = raw, logical_fd, "Output stream cancelled"),
            Outcome::Failed(error) => {
                warn!(fd = raw, logical_fd, error = %error, "Reading output failed");
                let _ = self
                    .events
                    .send(Event::Failed {
                        stream: self.stream,
                        error,
                    })
                    .await;
            }
        }
        fd::close_logged(async_fd.into_inner());
    }

    async fn pump(&self, async_fd: &AsyncFd<OwnedFd>, logical_fd: RawFd, quirks: ReadQuirks) -> Outcome {
        let mut splitter = LineSplitter::new(self.separators.clone());
        let mut buf = Vec::new();
        'read: loop {
            let mut guard = tokio::select! {
                biased;
                _ = self.token.cancelled() => break 'read Outcome::Cancelled,
                ready = async_fd.readable() => match ready {
                    Ok(guard) => guard,
                    Err(error) => break 'read Outcome::Failed(error),
                },
            };

            let want = fd::available_bytes(async_fd.as_raw_fd()).min(self.max_read_size);
            buf.resize(want, 0);
            let at_end = match guard.try_io(|inner| read_into(inner.as_raw_fd(), &mut buf)) {
                // Would block; readiness was cleared.
                Err(_) => continue,
                Ok(Ok(0)) => true,
                Ok(Ok(n)) => {
                    trace!(fd = logical_fd, bytes = n, "Read output");
                    splitter.push(&buf[..n]);
                    false
                }
                Ok(Err(error)) if error.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(error)) => match quirks.classify(error) {
                    ReadFailure::EndOfStream => true,
                    ReadFailure::Error(error) => break 'read Outcome::Failed(error),
                },
            };
            if at_end {
                splitter.finish();
            }

            while let Some((line, eol)) = splitter.next_line() {
                let event = Event::Line {
                    stream: self.stream,
                    line: RawLine {
                        line,
                        eol,
                        fd: logical_fd,
                    },
                };
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => break 'read Outcome::Cancelled,
                    sent = self.events.send(event) => {
                        if sent.is_err() {
                            break 'read Outcome::Cancelled;
                        }
                    }
                }
            }
            if at_end {
                break Outcome::Finished;
            }
        }
    }
}
