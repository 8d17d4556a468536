//! Handle to a launched process

use std::io;
use std::process::ExitStatus;
use std::sync::{Condvar, Mutex, OnceLock};

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgid, Pid};
use tokio::sync::watch;
use tracing::debug;

use crate::error::{InvocationError, Result};
use crate::termination::Termination;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitState {
    Running,
    Exited(Termination),
    /// Waiting on the process failed; its status is unknown
    Lost,
}

/// State shared between the exit watcher, signal relay and handles
#[derive(Debug)]
pub(crate) struct ProcessState {
    pid: OnceLock<Pid>,
    exit: Mutex<ExitState>,
    exited: Condvar,
    watch: watch::Sender<ExitState>,
}

impl ProcessState {
    pub(crate) fn new() -> Self {
        let (watch, _) = watch::channel(ExitState::Running);
        Self {
            pid: OnceLock::new(),
            exit: Mutex::new(ExitState::Running),
            exited: Condvar::new(),
            watch,
        }
    }

    pub(crate) fn set_pid(&self, pid: Pid) {
        let _ = self.pid.set(pid);
    }

    pub(crate) fn pid(&self) -> Option<Pid> {
        self.pid.get().copied()
    }

    pub(crate) fn exit_state(&self) -> ExitState {
        self.exit.lock().map(|state| *state).unwrap_or(ExitState::Lost)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.pid().is_some() && self.exit_state() == ExitState::Running
    }

    pub(crate) fn finish(&self, state: ExitState) {
        if let Ok(mut exit) = self.exit.lock() {
            *exit = state;
        }
        self.exited.notify_all();
        self.watch.send_replace(state);
    }

    /// Reap with the exit lock held; `None` when `reap` finds the process still running
    ///
    /// Signals are only sent under the same lock, so none can reach the pid
    /// once it may have been recycled.
    pub(crate) fn reap_with<F>(&self, reap: F) -> Option<ExitState>
    where
        F: FnOnce() -> io::Result<Option<ExitStatus>>,
    {
        let mut exit = match self.exit.lock() {
            Ok(exit) => exit,
            Err(poisoned) => poisoned.into_inner(),
        };
        let state = match reap() {
            Ok(Some(status)) => ExitState::Exited(status.into()),
            Ok(None) => return None,
            Err(e) => {
                debug!(error = %e, "Reaping process failed");
                ExitState::Lost
            }
        };
        *exit = state;
        drop(exit);
        self.exited.notify_all();
        self.watch.send_replace(state);
        Some(state)
    }

    /// Run `send` with the exit lock held, only while the process is unreaped
    pub(crate) fn signal_while_running<F>(&self, send: F) -> Option<nix::Result<()>>
    where
        F: FnOnce(Pid) -> nix::Result<()>,
    {
        let pid = self.pid()?;
        let exit = self.exit.lock().ok()?;
        if *exit != ExitState::Running {
            return None;
        }
        let sent = send(pid);
        drop(exit);
        Some(sent)
    }

    /// Block the calling thread until the process is gone
    pub(crate) fn wait_blocking(&self) {
        let Ok(mut exit) = self.exit.lock() else {
            return;
        };
        while *exit == ExitState::Running {
            exit = match self.exited.wait(exit) {
                Ok(exit) => exit,
                Err(_) => return,
            };
        }
    }

    fn subscribe(&self) -> watch::Receiver<ExitState> {
        self.watch.subscribe()
    }
}

/// Handle to a launched process, cheap to clone
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Pid,
    state: std::sync::Arc<ProcessState>,
}

impl ProcessHandle {
    pub(crate) fn new(pid: Pid, state: std::sync::Arc<ProcessState>) -> Self {
        Self { pid, state }
    }

    /// Get process ID
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Check if process is still running
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Termination, once the process has been reaped
    pub fn termination(&self) -> Option<Termination> {
        match self.state.exit_state() {
            ExitState::Exited(termination) => Some(termination),
            _ => None,
        }
    }

    /// Wait for process to exit
    pub async fn wait(&self) -> Result<Termination> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|state| *state != ExitState::Running)
            .await
            .map_err(|_| InvocationError::Internal("exit watcher dropped".into()))?;
        match state {
            ExitState::Exited(termination) => Ok(termination),
            _ => Err(InvocationError::Internal("process status lost".into())),
        }
    }

    /// Send `signal` to the process
    ///
    /// Fails with [`InvocationError::ProcessExited`] once the process was reaped.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        debug!(pid = %self.pid, signal = ?signal, "Signalling process");
        self.send(|pid| kill(pid, signal), "signalling process")
    }

    /// Send `signal` to the process group
    pub fn signal_group(&self, signal: Signal) -> Result<()> {
        debug!(pid = %self.pid, signal = ?signal, "Signalling process group");
        self.send(
            |pid| getpgid(Some(pid)).and_then(|pgid| killpg(pgid, signal)),
            "signalling process group",
        )
    }

    fn send<F>(&self, send: F, operation: &'static str) -> Result<()>
    where
        F: FnOnce(Pid) -> nix::Result<()>,
    {
        match self.state.signal_while_running(send) {
            Some(sent) => sent.map_err(|e| InvocationError::system(operation, e)),
            None => Err(InvocationError::ProcessExited { pid: self.pid() }),
        }
    }

    /// Send `SIGKILL` to the process
    pub fn kill(&self) -> Result<()> {
        self.signal(Signal::SIGKILL)
    }
}
