//! Caller-facing invoke operations

use std::io;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::child::ProcessHandle;
use crate::error::{InvocationError, Result};
use crate::invocation::{ContinuationPredicate, ProcessInvocation};
use crate::launch::{launch, Launched, TerminationHandler};
use crate::line::{Line, RawLine};
use crate::output::{Delivery, StreamControl};
use crate::termination::{check_termination, Termination};

/// Output lines together with how the process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collected<T> {
    pub lines: Vec<T>,
    pub termination: Termination,
}

/// Resolves once the process exited and every output stream finished
#[derive(Debug)]
pub struct Completion {
    task: JoinHandle<Result<Termination>>,
}

impl Completion {
    /// Wait for the invocation to finish
    ///
    /// Returns the first output error, or the termination once it was checked
    /// against the expected terminations.
    pub async fn wait(self) -> Result<Termination> {
        self.task
            .await
            .map_err(|e| InvocationError::Internal(format!("output task failed: {e}")))?
    }
}

fn duplicate(error: &io::Error) -> io::Error {
    match error.raw_os_error() {
        Some(code) => io::Error::from_raw_os_error(code),
        None => io::Error::new(error.kind(), error.to_string()),
    }
}

/// Feed every delivery to `deliver` until the invocation is complete
///
/// After the first read error further lines are dropped while the remaining
/// streams keep draining.
async fn drive<F>(
    launched: Launched,
    expected: Option<Vec<Termination>>,
    should_continue: Option<ContinuationPredicate>,
    mut deliver: F,
) -> Result<Termination>
where
    F: FnMut(Result<RawLine>, &StreamControl, &ProcessHandle),
{
    let Launched { handle, mut output } = launched;
    let mut failure: Option<io::Error> = None;

    while let Some(delivery) = output.next().await {
        match delivery {
            Delivery::Line(line, control) => {
                if failure.is_some() {
                    continue;
                }
                let keep = should_continue
                    .as_ref()
                    .map_or(true, |predicate| predicate(&line, &handle));
                deliver(Ok(line), &control, &handle);
                if !keep {
                    debug!(fd = control.fd(), "Continuation handler ended interest in stream");
                    control.end_of_interest();
                }
            }
            Delivery::Failed(error, control) => {
                if failure.is_some() {
                    warn!(fd = control.fd(), error = %error, "Further output error ignored");
                    continue;
                }
                deliver(
                    Err(InvocationError::OutputRead(duplicate(&error))),
                    &control,
                    &handle,
                );
                failure = Some(error);
            }
        }
    }

    let termination = output.termination()?;
    debug!(pid = handle.pid(), termination = %termination, "Invocation complete");
    if let Some(error) = failure {
        return Err(InvocationError::OutputRead(error));
    }
    check_termination(expected.as_deref(), termination)?;
    Ok(termination)
}

impl ProcessInvocation {
    /// Launch the process and hand every line to `handler` on a background task
    pub async fn invoke<F>(&self, handler: F) -> Result<(ProcessHandle, Completion)>
    where
        F: FnMut(Result<RawLine>, &StreamControl, &ProcessHandle) + Send + 'static,
    {
        self.spawn_driver(handler, None).await
    }

    /// Like [`ProcessInvocation::invoke`], calling `on_exit` once the process was reaped
    pub async fn invoke_with_termination_handler<F, T>(
        &self,
        handler: F,
        on_exit: T,
    ) -> Result<(ProcessHandle, Completion)>
    where
        F: FnMut(Result<RawLine>, &StreamControl, &ProcessHandle) + Send + 'static,
        T: FnOnce(&ProcessHandle) + Send + 'static,
    {
        self.spawn_driver(handler, Some(Box::new(on_exit))).await
    }

    async fn spawn_driver<F>(
        &self,
        handler: F,
        on_exit: Option<TerminationHandler>,
    ) -> Result<(ProcessHandle, Completion)>
    where
        F: FnMut(Result<RawLine>, &StreamControl, &ProcessHandle) + Send + 'static,
    {
        let launched = launch(self, on_exit).await?;
        let handle = launched.handle.clone();
        let task = tokio::spawn(self.config.instrument(drive(
            launched,
            self.resolved_expected_terminations(),
            self.should_continue.clone(),
            handler,
        )));
        Ok((handle, Completion { task }))
    }

    /// Launch the process and call `handler` for every line until it finishes
    pub async fn invoke_and_stream<F>(&self, mut handler: F) -> Result<Termination>
    where
        F: FnMut(&RawLine, &StreamControl, &ProcessHandle),
    {
        let launched = launch(self, None).await?;
        drive(
            launched,
            self.resolved_expected_terminations(),
            self.should_continue.clone(),
            |line, control, handle| {
                if let Ok(line) = line {
                    handler(&line, control, handle);
                }
            },
        )
        .await
    }

    /// Every raw line from every stream, in arrival order
    pub async fn invoke_and_collect_raw_output(&self) -> Result<Collected<RawLine>> {
        let mut lines = Vec::new();
        let termination = self
            .invoke_and_stream(|line, _, _| lines.push(line.clone()))
            .await?;
        Ok(Collected { lines, termination })
    }

    /// Every line from every stream as text
    pub async fn invoke_and_collect_all_output(&self) -> Result<Collected<Line>> {
        let raw = self.invoke_and_collect_raw_output().await?;
        let lines = raw
            .lines
            .iter()
            .map(RawLine::to_line)
            .collect::<Result<Vec<_>>>()?;
        Ok(Collected {
            lines,
            termination: raw.termination,
        })
    }

    /// Stdout lines as text, without their delimiters
    pub async fn invoke_and_collect_stdout(&self) -> Result<Collected<String>> {
        let raw = self.invoke_and_collect_raw_output().await?;
        let lines = raw
            .lines
            .into_iter()
            .filter(RawLine::is_stdout)
            .map(|line| String::from_utf8(line.line).map_err(|e| InvocationError::InvalidEncoding(e.into_bytes())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Collected {
            lines,
            termination: raw.termination,
        })
    }
}
