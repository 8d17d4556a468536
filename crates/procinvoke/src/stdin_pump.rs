//! Feeds a child's stdin pipe from memory or a reader
//!
//! Reading from the source and writing to the pipe run concurrently. At most
//! `max_cache` bytes are held; when the pipe is full the pump waits for
//! writability instead of reading more.

use std::io;
use std::os::fd::OwnedFd;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tracing::{debug, error, trace};

use crate::config::InvocationConfig;
use crate::error::{InvocationError, Result};
use crate::fd::anonymous_pipe;
use crate::redirect::{BoxedReader, StdinSource};

const READ_CHUNK: usize = 64 * 1024;

/// Write everything `source` produces into `write_end`, then close it
pub(crate) async fn pump(mut source: BoxedReader, write_end: OwnedFd, max_cache: usize) {
    let mut sender = match pipe::Sender::from_owned_fd(write_end) {
        Ok(sender) => sender,
        Err(e) => {
            error!(error = %e, "Cannot drive stdin pipe");
            return;
        }
    };

    let mut cache: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK.min(max_cache)];
    let mut source_done = false;

    loop {
        if source_done && cache.is_empty() {
            break;
        }
        let room = max_cache.saturating_sub(cache.len()).min(chunk.len());
        tokio::select! {
            read = source.read(&mut chunk[..room]), if !source_done && room > 0 => match read {
                Ok(0) => {
                    trace!("Stdin source exhausted");
                    source_done = true;
                }
                Ok(n) => cache.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(error = %e, "Reading stdin source failed");
                    break;
                }
            },
            written = sender.write(&cache), if !cache.is_empty() => match written {
                Ok(n) => {
                    cache.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    debug!("Child closed its stdin");
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(error = %e, "Writing to stdin pipe failed");
                    break;
                }
            },
        }
    }

    if let Err(e) = sender.shutdown().await {
        trace!(error = %e, "Stdin pipe shutdown");
    }
}

/// Read end of a pipe fed from `source`
///
/// Must be called from within a tokio runtime; the pump runs as a task.
pub fn streaming_pipe(source: &StdinSource, config: &InvocationConfig) -> Result<OwnedFd> {
    let handle = tokio::runtime::Handle::try_current().map_err(|_| {
        InvocationError::InvalidConfiguration("streaming_pipe needs a tokio runtime".into())
    })?;
    let reader = source.open()?;
    let (read, write) = anonymous_pipe()?;
    handle.spawn(config.instrument(pump(reader, write, config.stdin_max_cache)));
    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn read_all(fd: OwnedFd) -> Vec<u8> {
        let mut receiver = pipe::Receiver::from_owned_fd(fd).unwrap();
        let mut out = Vec::new();
        receiver.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_large_buffer_passes_through_small_cache() {
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let config = InvocationConfig::default().with_stdin_max_cache(1000);
        let read = streaming_pipe(&StdinSource::bytes(data.clone()), &config).unwrap();
        assert_eq!(read_all(read).await, data);
    }

    #[tokio::test]
    async fn test_reader_source() {
        let read = streaming_pipe(
            &StdinSource::reader(&b"from a reader"[..]),
            &InvocationConfig::default(),
        )
        .unwrap();
        assert_eq!(read_all(read).await, b"from a reader");
    }

    #[tokio::test]
    async fn test_empty_source_closes_immediately() {
        let read = streaming_pipe(&StdinSource::bytes(Vec::new()), &InvocationConfig::default())
            .unwrap();
        assert!(read_all(read).await.is_empty());
    }

    #[test]
    fn test_requires_runtime() {
        let result = streaming_pipe(&StdinSource::bytes(b"x".to_vec()), &InvocationConfig::default());
        assert!(matches!(result, Err(InvocationError::InvalidConfiguration(_))));
    }
}
