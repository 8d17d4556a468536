//! Pull-based line stream

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_stream::try_stream;
use futures::Stream;
use tracing::debug;

use crate::error::{InvocationError, Result};
use crate::invocation::ProcessInvocation;
use crate::launch::{launch, Launched};
use crate::line::RawLine;
use crate::output::Delivery;
use crate::termination::check_termination;

/// Lines of one launch, ending after the termination was checked
///
/// The process is launched on the first poll. Dropping the stream ends
/// interest in every output stream; the process keeps running.
pub struct LineStream {
    inner: Pin<Box<dyn Stream<Item = Result<RawLine>> + Send>>,
}

impl ProcessInvocation {
    /// Stream the output of a fresh launch
    pub fn lines(&self) -> LineStream {
        LineStream {
            inner: Box::pin(launch_lines(self.clone())),
        }
    }
}

fn launch_lines(invocation: ProcessInvocation) -> impl Stream<Item = Result<RawLine>> + Send {
    try_stream! {
        let Launched { handle, mut output } = launch(&invocation, None).await?;
        let cancel_guard = output.cancel_on_drop();
        let should_continue = invocation.should_continue.clone();

        let mut failure = None;
        while let Some(delivery) = output.next().await {
            match delivery {
                Delivery::Line(line, control) => {
                    if let Some(predicate) = &should_continue {
                        if !predicate(&line, &handle) {
                            control.end_of_interest();
                        }
                    }
                    yield line;
                }
                Delivery::Failed(error, _) => {
                    failure = Some(error);
                    break;
                }
            }
        }
        cancel_guard.disarm();

        match failure {
            Some(error) => {
                debug!(pid = handle.pid(), "Draining output after read error");
                tokio::spawn(invocation.config.instrument(output.discard_remaining()));
                Err::<(), _>(InvocationError::OutputRead(error))?;
            }
            None => {
                let termination = output.termination()?;
                check_termination(
                    invocation.resolved_expected_terminations().as_deref(),
                    termination,
                )?;
            }
        }
    }
}

impl Stream for LineStream {
    type Item = Result<RawLine>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl fmt::Debug for LineStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineStream").finish_non_exhaustive()
    }
}
