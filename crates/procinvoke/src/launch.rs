//! Launch orchestration
//!
//! Turns a [`ProcessInvocation`] into a running process in two phases. The
//! preparation phase allocates pipes, claims transferred descriptors,
//! registers the signal relay and spawns the process (through the relay when
//! extra descriptors must be passed). Every resource acquired there is held by
//! a value that undoes it on drop, so any early return rolls back completely.
//! The finalize phase only runs once the process is confirmed running: it
//! closes the child's ends, starts the stdin pump, the output readers and the
//! exit watcher.

use std::env;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, killpg, pthread_sigmask, SigSet, SigmaskHow, Signal};
use nix::unistd::{getpgrp, Pid};
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Dispatch};

use crate::child::{ExitState, ProcessHandle, ProcessState};
use crate::config::InvocationConfig;
use crate::error::{InvocationError, Result};
use crate::fd::{self, anonymous_pipe, datagram_socket_pair, ClaimedFd};
use crate::fd_passing::{send_count, send_descriptor};
use crate::invocation::{ProcessInvocation, SignalPolicy};
use crate::line::{STDERR_FD, STDIN_FD, STDOUT_FD};
use crate::output::{Event, OutputMultiplexer, OutputSource, ReadQuirks};
use crate::path_search::{absolutize, is_searchable, try_candidates, SearchPath};
use crate::redirect::{BoxedReader, InputRedirect, OutputRedirect, SourceFd};
use crate::relay::RelayArgs;
use crate::signals::registry::{Registration, SignalHandler};
use crate::stdin_pump;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Called once the process has been reaped, before completion is reported
pub type TerminationHandler = Box<dyn FnOnce(&ProcessHandle) + Send>;

/// A process confirmed running with its output streams being drained
#[derive(Debug)]
pub(crate) struct Launched {
    pub(crate) handle: ProcessHandle,
    pub(crate) output: OutputMultiplexer,
}

/// A standard stream as wired into the child
#[derive(Debug)]
enum ChildStdio {
    Inherit,
    Null,
    Borrowed(RawFd),
    Owned(OwnedFd),
    Claimed(ClaimedFd),
}

impl ChildStdio {
    fn from_source(fd: &SourceFd) -> Result<Self> {
        match fd {
            SourceFd::Borrowed(raw) => Ok(Self::Borrowed(*raw)),
            SourceFd::Owned(transferred) => Ok(Self::Claimed(transferred.claim()?)),
        }
    }

    /// A fresh duplicate per spawn attempt; the original stays with us
    fn to_stdio(&self) -> io::Result<Stdio> {
        Ok(match self {
            Self::Inherit => Stdio::inherit(),
            Self::Null => Stdio::null(),
            Self::Borrowed(raw) => Stdio::from(fd::dup_borrowed(*raw)?),
            Self::Owned(owned) => Stdio::from(owned.try_clone()?),
            Self::Claimed(claimed) => Stdio::from(fd::dup_borrowed(claimed.raw())?),
        })
    }

    /// Close what the invocation owns, now that the child has its copy
    fn release(self) {
        match self {
            Self::Owned(owned) => fd::close_logged(owned),
            Self::Claimed(claimed) => {
                if let Some(owned) = claimed.commit() {
                    fd::close_logged(owned);
                }
            }
            Self::Inherit | Self::Null | Self::Borrowed(_) => {}
        }
    }

    fn into_sendable(self) -> Result<Sendable> {
        Ok(match self {
            Self::Inherit => Sendable::Borrowed(STDIN_FD),
            Self::Null => Sendable::Owned(fd::open_dev_null()?),
            Self::Borrowed(raw) => Sendable::Borrowed(raw),
            Self::Owned(owned) => Sendable::Owned(owned),
            Self::Claimed(claimed) => Sendable::Claimed(claimed),
        })
    }
}

/// A descriptor on its way to the relay
#[derive(Debug)]
enum Sendable {
    Borrowed(RawFd),
    Owned(OwnedFd),
    Claimed(ClaimedFd),
}

impl Sendable {
    fn borrow(&self) -> Result<BorrowedFd<'_>> {
        match self {
            // SAFETY: borrowed descriptors are kept open by the caller.
            Self::Borrowed(raw) => Ok(unsafe { BorrowedFd::borrow_raw(*raw) }),
            Self::Owned(owned) => Ok(owned.as_fd()),
            Self::Claimed(claimed) => claimed
                .as_fd()
                .ok_or_else(|| InvocationError::Internal("claimed descriptor is empty".into())),
        }
    }

    fn release(self) {
        match self {
            Self::Owned(owned) => fd::close_logged(owned),
            Self::Claimed(claimed) => {
                if let Some(owned) = claimed.commit() {
                    fd::close_logged(owned);
                }
            }
            Self::Borrowed(_) => {}
        }
    }
}

/// An output descriptor waiting for the process to start
#[derive(Debug)]
enum PendingFd {
    Internal(OwnedFd),
    Claimed(ClaimedFd),
}

#[derive(Debug)]
struct PendingSource {
    fd: PendingFd,
    logical_fd: RawFd,
    quirks: ReadQuirks,
}

impl PendingSource {
    fn prepare(&mut self) -> Result<()> {
        let raw = match &self.fd {
            PendingFd::Internal(owned) => owned.as_raw_fd(),
            PendingFd::Claimed(claimed) => claimed.raw(),
        };
        self.quirks = ReadQuirks::detect(raw);
        match &mut self.fd {
            PendingFd::Internal(_) => {
                fd::set_nonblocking(raw, true)?;
            }
            PendingFd::Claimed(claimed) => claimed.set_nonblocking()?,
        }
        Ok(())
    }

    fn commit(self) -> Option<OutputSource> {
        let fd = match self.fd {
            PendingFd::Internal(owned) => owned,
            PendingFd::Claimed(claimed) => claimed.commit()?,
        };
        Some(OutputSource {
            fd,
            logical_fd: self.logical_fd,
            quirks: self.quirks,
        })
    }
}

fn output_stdio(
    redirect: &OutputRedirect,
    logical_fd: RawFd,
    sources: &mut Vec<PendingSource>,
) -> Result<ChildStdio> {
    Ok(match redirect {
        OutputRedirect::Inherit => ChildStdio::Inherit,
        OutputRedirect::Null => ChildStdio::Null,
        OutputRedirect::Capture => {
            let (read, write) = anonymous_pipe()?;
            sources.push(PendingSource {
                fd: PendingFd::Internal(read),
                logical_fd,
                quirks: ReadQuirks::default(),
            });
            ChildStdio::Owned(write)
        }
        OutputRedirect::ToFd(fd) => ChildStdio::from_source(fd)?,
    })
}

#[derive(Debug)]
struct SpawnPlan {
    candidates: Vec<PathBuf>,
    args: Vec<std::ffi::OsString>,
    working_directory: Option<PathBuf>,
    environment: Option<std::collections::HashMap<std::ffi::OsString, std::ffi::OsString>>,
    stdin: ChildStdio,
    stdout: ChildStdio,
    stderr: ChildStdio,
}

impl SpawnPlan {
    fn command(&self, program: &Path) -> io::Result<Command> {
        let mut cmd = Command::new(program);
        cmd.args(&self.args);
        if let Some(dir) = &self.working_directory {
            cmd.current_dir(dir);
        }
        if let Some(environment) = &self.environment {
            cmd.env_clear();
            cmd.envs(environment);
        }
        cmd.stdin(self.stdin.to_stdio()?);
        cmd.stdout(self.stdout.to_stdio()?);
        cmd.stderr(self.stderr.to_stdio()?);
        cmd.process_group(0);
        cmd.kill_on_drop(false);
        Ok(cmd)
    }

    fn spawn(&self) -> io::Result<Child> {
        try_candidates(&self.candidates, |program| {
            debug!(program = %program.display(), "Spawning");
            self.command(program)?.spawn()
        })
    }

    fn release(self) {
        self.stdin.release();
        self.stdout.release();
        self.stderr.release();
    }
}

#[derive(Debug)]
struct RelayPlan {
    parent_end: OwnedFd,
    sends: Vec<(RawFd, Sendable)>,
    location_configured: bool,
    env_var: String,
}

impl RelayPlan {
    fn send_all(&self) -> Result<()> {
        let count = u32::try_from(self.sends.len())
            .map_err(|_| InvocationError::InvalidConfiguration("too many descriptors".into()))?;
        send_count(self.parent_end.as_fd(), count)?;
        for (tag, fd) in &self.sends {
            send_descriptor(self.parent_end.as_fd(), fd.borrow()?, *tag)?;
            debug!(fd = *tag, "Sent descriptor to relay");
        }
        Ok(())
    }

    fn release(self) {
        fd::close_logged(self.parent_end);
        for (_, fd) in self.sends {
            fd.release();
        }
    }
}

/// Where to look for the relay executable
fn relay_candidates(
    invocation: &ProcessInvocation,
    search: &SearchPath,
    cwd: &Path,
) -> Result<(Vec<PathBuf>, bool)> {
    let config = &invocation.config;
    let name = Path::new(&config.relay_executable_name);
    let directory = config
        .relay_directory
        .clone()
        .or_else(|| env::var_os(&config.relay_path_env_var).map(PathBuf::from));

    let mut candidates: Vec<PathBuf> = directory
        .iter()
        .map(|dir| absolutize(&dir.join(name), cwd))
        .collect();
    if invocation.use_path && !search.directories.is_empty() {
        candidates.extend(search.candidates(name).iter().map(|p| absolutize(p, cwd)));
    }
    if candidates.is_empty() {
        return Err(InvocationError::RelayPathNotSet {
            env_var: config.relay_path_env_var.clone(),
        });
    }
    Ok((candidates, directory.is_some()))
}

fn spawn_child(plan: &SpawnPlan, relay: Option<&RelayPlan>, state: &ProcessState) -> Result<Child> {
    let mut child = plan.spawn().map_err(|e| match relay {
        Some(relay) if !relay.location_configured && e.raw_os_error() == Some(libc::ENOENT) => {
            InvocationError::RelayPathNotSet {
                env_var: relay.env_var.clone(),
            }
        }
        _ => InvocationError::system("spawning process", e),
    })?;
    let pid = child
        .id()
        .map(|id| Pid::from_raw(id as i32))
        .ok_or_else(|| InvocationError::Internal("spawned process has no pid".into()))?;
    state.set_pid(pid);

    if let Some(relay) = relay {
        if let Err(e) = relay.send_all() {
            error!(pid = %pid, error = %e, "Passing descriptors failed, killing relay");
            if let Err(kill_err) = child.start_kill() {
                error!(pid = %pid, error = %kill_err, "Failed to kill relay");
            }
            return Err(e);
        }
    }
    Ok(child)
}

fn deliver(pid: Pid, signal: Signal, to_group: bool) -> nix::Result<()> {
    // The child leads its own process group.
    if to_group {
        killpg(pid, signal)
    } else {
        kill(pid, signal)
    }
}

/// Apply the policy for `signal`; returns whether the parent should see it
fn relay_signal<S>(state: &ProcessState, signal: Signal, policy: &SignalPolicy, send: S) -> bool
where
    S: FnOnce(Pid, Signal, bool) -> nix::Result<()>,
{
    if !state.is_running() {
        debug!(signal = ?signal, "No running process, passing signal to parent");
        return true;
    }
    let handling = policy(signal);
    if let Some(for_child) = handling.signal_for_child {
        let sent = state.signal_while_running(|pid| {
            send(pid, for_child, handling.send_to_process_group)?;
            debug!(pid = %pid, signal = ?for_child, "Forwarded signal");
            Ok(())
        });
        match sent {
            None => return true,
            Some(Ok(())) => {}
            Some(Err(e)) => {
                warn!(signal = ?for_child, error = %e, "Forwarding signal failed, parent ignores it");
                return false;
            }
        }
    }
    if handling.allow_on_parent && handling.wait_for_child_death_before_parent {
        state.wait_blocking();
    }
    handling.allow_on_parent
}

fn signal_relay(state: Arc<ProcessState>, policy: SignalPolicy, dispatch: Dispatch) -> SignalHandler {
    Arc::new(move |signal: Signal| {
        tracing::dispatcher::with_default(&dispatch, || relay_signal(&state, signal, &policy, deliver))
    })
}

/// Make `pid`'s group the foreground group of the terminal on stdin
fn take_foreground(pid: Pid) -> bool {
    // SAFETY: tcsetpgrp only reads its arguments.
    if unsafe { libc::tcsetpgrp(STDIN_FD, pid.as_raw()) } == 0 {
        debug!(pid = %pid, "Child is the terminal foreground group");
        return true;
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ENOTTY) {
        error!(pid = %pid, error = %err, "Failed to set terminal foreground group");
    }
    false
}

fn restore_foreground_group() {
    let mut blocked = SigSet::empty();
    blocked.add(Signal::SIGTTOU);
    let mut previous = SigSet::empty();
    if let Err(e) = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&blocked), Some(&mut previous)) {
        error!(error = %e, "Failed to block SIGTTOU");
    }
    // SAFETY: tcsetpgrp only reads its arguments.
    if unsafe { libc::tcsetpgrp(STDIN_FD, getpgrp().as_raw()) } != 0 {
        error!(error = %io::Error::last_os_error(), "Failed to restore terminal foreground group");
    }
    if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None) {
        error!(error = %e, "Failed to restore signal mask");
    }
}

/// Whether `pid` has exited, leaving it unreaped
fn exited_unreaped(pid: Pid) -> io::Result<bool> {
    loop {
        // SAFETY: siginfo_t is plain data filled by waitid.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let ret = unsafe {
            libc::waitid(
                libc::P_PID,
                pid.as_raw() as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
            )
        };
        if ret == 0 {
            // With WNOHANG the record stays zeroed while the process runs.
            return Ok(info.si_signo == libc::SIGCHLD);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

struct ExitWatch {
    child: Child,
    handle: ProcessHandle,
    state: Arc<ProcessState>,
    registration: Registration,
    restore_foreground: bool,
    on_exit: Option<TerminationHandler>,
    events: mpsc::Sender<Event>,
}

impl ExitWatch {
    /// Wait for the exit without reaping, then reap under the exit lock
    async fn reap(&mut self) -> ExitState {
        let pid = Pid::from_raw(self.handle.pid() as i32);
        let mut sigchld = match signal(SignalKind::child()) {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGCHLD, polling");
                None
            }
        };
        loop {
            match exited_unreaped(pid) {
                Ok(false) => {}
                Ok(true) => {
                    let child = &mut self.child;
                    let restore_foreground = self.restore_foreground;
                    let reaped = self.state.reap_with(|| {
                        let status = child.try_wait()?;
                        if status.is_some() && restore_foreground {
                            restore_foreground_group();
                        }
                        Ok(status)
                    });
                    if let Some(exit) = reaped {
                        return exit;
                    }
                }
                Err(e) => {
                    error!(pid = %pid, error = %e, "Waiting for process failed");
                    return self.state.reap_with(|| Err(e)).unwrap_or(ExitState::Lost);
                }
            }
            match &mut sigchld {
                Some(stream) => {
                    if stream.recv().await.is_none() {
                        sigchld = None;
                    }
                }
                None => tokio::time::sleep(EXIT_POLL_INTERVAL).await,
            }
        }
    }

    async fn run(mut self) {
        let exit = self.reap().await;
        debug!(pid = self.handle.pid(), exit = ?exit, "Process exited");
        drop(self.registration);
        if let Some(on_exit) = self.on_exit.take() {
            on_exit(&self.handle);
        }
        let _ = self.events.send(Event::Exited(exit)).await;
    }
}

/// Launch `invocation`; output readers are running when this returns
pub(crate) async fn launch(
    invocation: &ProcessInvocation,
    on_exit: Option<TerminationHandler>,
) -> Result<Launched> {
    invocation.validate()?;
    let config: &InvocationConfig = &invocation.config;
    info!(
        executable = %invocation.executable.display(),
        args = ?invocation.args,
        "Launching process"
    );

    let mut sources = Vec::new();
    let mut stdin_feed: Option<(BoxedReader, OwnedFd)> = None;

    let stdin = match &invocation.stdin {
        InputRedirect::Inherit { .. } => ChildStdio::Inherit,
        InputRedirect::Null => ChildStdio::Null,
        InputRedirect::FromFd { fd, .. } => ChildStdio::from_source(fd)?,
        InputRedirect::FromReader(source) => {
            let (read, write) = anonymous_pipe()?;
            if source.is_empty_buffer() {
                drop(write);
            } else {
                stdin_feed = Some((source.open()?, write));
            }
            ChildStdio::Owned(read)
        }
    };
    let stdout = output_stdio(&invocation.stdout, STDOUT_FD, &mut sources)?;
    let stderr = output_stdio(&invocation.stderr, STDERR_FD, &mut sources)?;
    for extra in &invocation.additional_output_fds {
        sources.push(PendingSource {
            logical_fd: extra.as_raw_fd(),
            fd: PendingFd::Claimed(extra.claim()?),
            quirks: ReadQuirks::default(),
        });
    }
    let mut sends = Vec::with_capacity(invocation.fds_to_send.len() + 1);
    for (child_fd, transferred) in &invocation.fds_to_send {
        sends.push((*child_fd, Sendable::Claimed(transferred.claim()?)));
    }
    for source in &mut sources {
        source.prepare()?;
    }

    let cwd = env::current_dir().map_err(|e| InvocationError::system("reading current directory", e))?;
    let search = SearchPath::resolve(invocation.use_path, &invocation.custom_path);
    let target = if invocation.use_path
        && is_searchable(&invocation.executable)
        && !search.directories.is_empty()
    {
        invocation.executable.clone()
    } else {
        absolutize(&invocation.executable, &cwd)
    };

    let (plan, relay) = if sends.is_empty() {
        let candidates = search
            .candidates(&target)
            .iter()
            .map(|p| absolutize(p, &cwd))
            .collect();
        let plan = SpawnPlan {
            candidates,
            args: invocation.args.clone(),
            working_directory: invocation.working_directory.clone(),
            environment: invocation.environment.clone(),
            stdin,
            stdout,
            stderr,
        };
        (plan, None)
    } else {
        let (candidates, location_configured) = relay_candidates(invocation, &search, &cwd)?;
        let (parent_end, child_end) = datagram_socket_pair()?;
        sends.push((STDIN_FD, stdin.into_sendable()?));
        let path = if invocation.use_path {
            search.relay_argument(&cwd)
        } else {
            None
        };
        // No directory survived: the relay runs the target as given.
        let target = match &path {
            Some(dirs) if dirs.is_empty() => absolutize(&target, &cwd),
            _ => target,
        };
        let relay_args = RelayArgs {
            use_path: invocation.use_path,
            path,
            executable: target.into_os_string(),
            args: invocation.args.clone(),
        };
        debug!(argv = ?relay_args.to_argv(), descriptors = sends.len(), "Launching through relay");
        let plan = SpawnPlan {
            candidates,
            args: relay_args.to_argv(),
            working_directory: invocation.working_directory.clone(),
            environment: invocation.environment.clone(),
            stdin: ChildStdio::Owned(child_end),
            stdout,
            stderr,
        };
        let relay = RelayPlan {
            parent_end,
            sends,
            location_configured,
            env_var: config.relay_path_env_var.clone(),
        };
        (plan, Some(relay))
    };

    let state = Arc::new(ProcessState::new());
    let signals: Vec<Signal> = invocation.signals_to_process.iter().copied().collect();
    let registration = Registration::new(
        &signals,
        signal_relay(
            Arc::clone(&state),
            Arc::clone(&invocation.signal_policy),
            config.dispatcher(),
        ),
    )?;

    let dispatch = config.dispatcher();
    let spawn_state = Arc::clone(&state);
    let (plan, relay, spawned) = tokio::task::spawn_blocking(move || {
        let spawned = tracing::dispatcher::with_default(&dispatch, || {
            spawn_child(&plan, relay.as_ref(), &spawn_state)
        });
        (plan, relay, spawned)
    })
    .await
    .map_err(|e| InvocationError::Internal(format!("spawn task failed: {e}")))?;
    // On error `plan`, `relay`, `sources` and `registration` drop here,
    // which closes our pipes, returns claimed descriptors and unregisters.
    let child = spawned?;

    let pid = state
        .pid()
        .ok_or_else(|| InvocationError::Internal("pid not recorded".into()))?;
    let handle = ProcessHandle::new(pid, Arc::clone(&state));
    info!(pid = %pid, "Process spawned");

    if let Some(relay) = relay {
        relay.release();
    }
    plan.release();

    let restore_foreground = invocation.stdin.sets_foreground_group() && take_foreground(pid);

    if let Some((reader, write)) = stdin_feed {
        tokio::spawn(config.instrument(stdin_pump::pump(reader, write, config.stdin_max_cache)));
    }

    let sources: Vec<OutputSource> = sources.into_iter().filter_map(PendingSource::commit).collect();
    let (output, events) = OutputMultiplexer::start(sources, &invocation.line_separators, config);

    let watch = ExitWatch {
        child,
        handle: handle.clone(),
        state,
        registration,
        restore_foreground,
        on_exit,
        events,
    };
    tokio::spawn(config.instrument(watch.run()));

    Ok(Launched { handle, output })
}
