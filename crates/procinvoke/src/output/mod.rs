//! Output multiplexer
//!
//! Every output descriptor gets its own drain task. All of them, plus the
//! exit watcher, feed one bounded channel, so lines arrive in the order they
//! were read. The channel closes once the process was reaped and every
//! stream ended or was cancelled.

mod platform;
mod reader;

use std::io;
use std::os::fd::RawFd;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(crate) use platform::ReadQuirks;
pub(crate) use reader::OutputSource;

use crate::child::ExitState;
use crate::config::InvocationConfig;
use crate::error::{InvocationError, Result};
use crate::line::RawLine;
use crate::separators::LineSeparators;
use crate::termination::Termination;

#[derive(Debug)]
pub(crate) enum Event {
    Line { stream: usize, line: RawLine },
    Failed { stream: usize, error: io::Error },
    Exited(ExitState),
}

/// Lets a consumer stop reading one output stream
///
/// Cancelling closes the stream's descriptor without reading further. The
/// process keeps running and the other streams keep draining.
#[derive(Debug, Clone)]
pub struct StreamControl {
    fd: RawFd,
    token: CancellationToken,
}

impl StreamControl {
    /// Logical fd of the stream
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Stop delivering and reading this stream
    pub fn end_of_interest(&self) {
        self.token.cancel();
    }

    /// Whether interest in this stream has ended
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug)]
pub(crate) enum Delivery {
    Line(RawLine, StreamControl),
    Failed(io::Error, StreamControl),
}

/// Consumer side of one invocation's output
#[derive(Debug)]
pub(crate) struct OutputMultiplexer {
    events: mpsc::Receiver<Event>,
    streams: Vec<StreamControl>,
    exit: Option<ExitState>,
}

impl OutputMultiplexer {
    /// Spawn a drain task per source; the returned sender belongs to the exit watcher
    pub(crate) fn start(
        sources: Vec<OutputSource>,
        separators: &LineSeparators,
        config: &InvocationConfig,
    ) -> (Self, mpsc::Sender<Event>) {
        let (tx, events) = mpsc::channel(config.event_queue_capacity);
        let mut streams = Vec::with_capacity(sources.len());
        for (stream, source) in sources.into_iter().enumerate() {
            let control = StreamControl {
                fd: source.logical_fd,
                token: CancellationToken::new(),
            };
            let drain = reader::Drain {
                stream,
                separators: separators.clone(),
                max_read_size: config.max_read_size,
                token: control.token.clone(),
                events: tx.clone(),
            };
            tokio::spawn(config.instrument(drain.run(source)));
            streams.push(control);
        }
        (
            Self {
                events,
                streams,
                exit: None,
            },
            tx,
        )
    }

    /// Next line or stream failure; `None` once everything is done
    ///
    /// Lines from cancelled streams are dropped.
    pub(crate) async fn next(&mut self) -> Option<Delivery> {
        loop {
            match self.events.recv().await? {
                Event::Line { stream, line } => {
                    let control = &self.streams[stream];
                    if !control.is_cancelled() {
                        return Some(Delivery::Line(line, control.clone()));
                    }
                }
                Event::Failed { stream, error } => {
                    let control = &self.streams[stream];
                    if !control.is_cancelled() {
                        return Some(Delivery::Failed(error, control.clone()));
                    }
                }
                Event::Exited(state) => self.exit = Some(state),
            }
        }
    }

    /// Termination, valid once [`OutputMultiplexer::next`] returned `None`
    pub(crate) fn termination(&self) -> Result<Termination> {
        match self.exit {
            Some(ExitState::Exited(termination)) => Ok(termination),
            Some(ExitState::Lost) => Err(InvocationError::Internal(
                "waiting for the process failed".into(),
            )),
            Some(ExitState::Running) | None => Err(InvocationError::Internal(
                "output finished before the process was reaped".into(),
            )),
        }
    }

    /// Cancels every stream when dropped, unless disarmed
    pub(crate) fn cancel_on_drop(&self) -> CancelOnDrop {
        CancelOnDrop {
            tokens: self.streams.iter().map(|s| s.token.clone()).collect(),
        }
    }

    /// Consume the remaining events, discarding lines
    pub(crate) async fn discard_remaining(mut self) {
        while self.next().await.is_some() {}
    }
}

#[derive(Debug)]
pub(crate) struct CancelOnDrop {
    tokens: Vec<CancellationToken>,
}

impl CancelOnDrop {
    pub(crate) fn disarm(mut self) {
        self.tokens.clear();
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        for token in &self.tokens {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::os::fd::OwnedFd;

    use crate::fd::{anonymous_pipe, set_nonblocking};
    use std::os::fd::AsRawFd;

    fn source(read: OwnedFd, logical_fd: RawFd) -> OutputSource {
        set_nonblocking(read.as_raw_fd(), true).unwrap();
        OutputSource {
            quirks: ReadQuirks::detect(read.as_raw_fd()),
            fd: read,
            logical_fd,
        }
    }

    #[tokio::test]
    async fn test_lines_keep_logical_fd_and_order() {
        let (out_r, out_w) = anonymous_pipe().unwrap();
        let (err_r, err_w) = anonymous_pipe().unwrap();
        let (mut mux, exit_tx) = OutputMultiplexer::start(
            vec![source(out_r, 1), source(err_r, 2)],
            &LineSeparators::default(),
            &InvocationConfig::default(),
        );

        File::from(out_w).write_all(b"a\nb\nc").unwrap();
        File::from(err_w).write_all(b"oops\n").unwrap();
        exit_tx
            .send(Event::Exited(ExitState::Exited(Termination::SUCCESS)))
            .await
            .unwrap();
        drop(exit_tx);

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(delivery) = mux.next().await {
            match delivery {
                Delivery::Line(line, control) => {
                    assert_eq!(control.fd(), line.fd);
                    if line.fd == 1 {
                        stdout.push(line);
                    } else {
                        stderr.push(line);
                    }
                }
                Delivery::Failed(e, _) => panic!("unexpected failure: {e}"),
            }
        }
        assert_eq!(
            stdout,
            vec![
                RawLine::new("a", "\n", 1),
                RawLine::new("b", "\n", 1),
                RawLine::new("c", "", 1),
            ]
        );
        assert_eq!(stderr, vec![RawLine::new("oops", "\n", 2)]);
        assert_eq!(mux.termination().unwrap(), Termination::SUCCESS);
    }

    #[tokio::test]
    async fn test_cancelled_stream_stops_delivering() {
        let (out_r, out_w) = anonymous_pipe().unwrap();
        let (mut mux, exit_tx) = OutputMultiplexer::start(
            vec![source(out_r, 1)],
            &LineSeparators::default(),
            &InvocationConfig::default(),
        );
        let mut writer = File::from(out_w);
        writer.write_all(b"first\n").unwrap();

        match mux.next().await {
            Some(Delivery::Line(line, control)) => {
                assert_eq!(line.line, b"first");
                control.end_of_interest();
            }
            other => panic!("unexpected delivery: {other:?}"),
        }
        // Writes after cancellation are never delivered.
        let _ = writer.write_all(b"second\n");
        exit_tx
            .send(Event::Exited(ExitState::Exited(Termination::SUCCESS)))
            .await
            .unwrap();
        drop(exit_tx);
        assert!(mux.next().await.is_none());
        assert!(mux.termination().is_ok());
    }

    #[tokio::test]
    async fn test_missing_exit_is_internal_error() {
        let (mut mux, exit_tx) =
            OutputMultiplexer::start(Vec::new(), &LineSeparators::None, &InvocationConfig::default());
        drop(exit_tx);
        assert!(mux.next().await.is_none());
        assert!(matches!(mux.termination(), Err(InvocationError::Internal(_))));
    }
}
