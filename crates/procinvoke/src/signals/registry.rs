//! Process-wide registry of deferred signal handlers
//!
//! The installed `sigaction` handler only writes the signal number to a
//! self-pipe. A dedicated thread reads the pipe and runs the registered
//! handlers outside signal context, so handlers may lock, log and block.
//!
//! A handler returns whether the signal should continue to the parent. When
//! every handler agrees, the disposition that was in place before the first
//! registration is restored for the duration of a `raise`.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, IntoRawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{debug, error, trace};

use crate::error::{InvocationError, Result};
use crate::fd;

/// Runs on the dispatcher thread; returns whether the parent should see the signal
pub type SignalHandler = Arc<dyn Fn(Signal) -> bool + Send + Sync>;

static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(signum: libc::c_int) {
    let fd = WAKE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let saved = Errno::last_raw();
    let byte = signum as u8;
    // SAFETY: write(2) is async-signal-safe; a full pipe drops the wakeup.
    unsafe {
        libc::write(fd, (&byte as *const u8).cast(), 1);
    }
    Errno::set_raw(saved);
}

/// Identifies one handler registered for one signal
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a dropped token can no longer unregister its handler"]
pub struct RegistrationToken {
    signal: Signal,
    id: u64,
}

impl RegistrationToken {
    pub fn signal(&self) -> Signal {
        self.signal
    }
}

struct Entry {
    previous: SigAction,
    handlers: BTreeMap<u64, SignalHandler>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    entries: HashMap<Signal, Entry>,
    dispatcher_running: bool,
}

/// Registry shared by every invocation in the process
pub struct SignalRegistry {
    state: Mutex<State>,
}

impl std::fmt::Debug for SignalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let signals: Vec<Signal> = self
            .state
            .lock()
            .map(|state| state.entries.keys().copied().collect())
            .unwrap_or_default();
        f.debug_struct("SignalRegistry").field("signals", &signals).finish()
    }
}

impl SignalRegistry {
    pub fn global() -> &'static SignalRegistry {
        static REGISTRY: OnceLock<SignalRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| SignalRegistry {
            state: Mutex::new(State::default()),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| InvocationError::Internal("signal registry poisoned".into()))
    }

    /// Register `handler` for every signal in `signals`, one token per signal
    ///
    /// Either every signal is registered or none is.
    pub fn register(&self, signals: &[Signal], handler: SignalHandler) -> Result<Vec<RegistrationToken>> {
        if signals.is_empty() {
            return Ok(Vec::new());
        }
        let mut state = self.lock()?;
        if !state.dispatcher_running {
            start_dispatcher()?;
            state.dispatcher_running = true;
        }

        let mut tokens = Vec::with_capacity(signals.len());
        for &signal in signals {
            state.next_id += 1;
            let id = state.next_id;
            if let Some(entry) = state.entries.get_mut(&signal) {
                entry.handlers.insert(id, Arc::clone(&handler));
                tokens.push(RegistrationToken { signal, id });
                continue;
            }
            let action = SigAction::new(
                SigHandler::Handler(on_signal),
                SaFlags::SA_RESTART,
                SigSet::empty(),
            );
            // SAFETY: `on_signal` only performs async-signal-safe operations.
            match unsafe { signal::sigaction(signal, &action) } {
                Ok(previous) => {
                    trace!(signal = ?signal, "Installed deferred signal handler");
                    state.entries.insert(
                        signal,
                        Entry {
                            previous,
                            handlers: BTreeMap::from([(id, Arc::clone(&handler))]),
                        },
                    );
                    tokens.push(RegistrationToken { signal, id });
                }
                Err(errno) => {
                    release(&mut state, tokens);
                    return Err(InvocationError::system("installing signal handler", errno));
                }
            }
        }
        Ok(tokens)
    }

    /// Remove handlers; the previous disposition returns with the last one
    pub fn unregister(&self, tokens: Vec<RegistrationToken>) {
        if tokens.is_empty() {
            return;
        }
        match self.state.lock() {
            Ok(mut state) => release(&mut state, tokens),
            Err(_) => error!("Signal registry poisoned, handlers left installed"),
        }
    }

    /// Handlers currently registered for `signal`
    pub fn handler_count(&self, signal: Signal) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.entries.get(&signal).map(|e| e.handlers.len()))
            .unwrap_or(0)
    }

    fn dispatch(&self, signal: Signal) {
        let handlers: Vec<SignalHandler> = match self.state.lock() {
            Ok(state) => state
                .entries
                .get(&signal)
                .map(|entry| entry.handlers.values().cloned().collect())
                .unwrap_or_default(),
            Err(_) => return,
        };
        debug!(signal = ?signal, handlers = handlers.len(), "Dispatching signal");

        let mut allow_on_parent = true;
        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(signal))) {
                Ok(allow) => allow_on_parent &= allow,
                Err(_) => error!(signal = ?signal, "Signal handler panicked"),
            }
        }
        if allow_on_parent {
            self.forward_to_parent(signal);
        }
    }

    fn forward_to_parent(&self, signal: Signal) {
        let Ok(state) = self.state.lock() else {
            return;
        };
        let Some(entry) = state.entries.get(&signal) else {
            drop(state);
            if let Err(e) = signal::raise(signal) {
                error!(signal = ?signal, error = %e, "Failed to re-raise signal");
            }
            return;
        };
        trace!(signal = ?signal, "Forwarding signal to previous disposition");
        // SAFETY: restoring a disposition obtained from sigaction itself.
        let ours = match unsafe { signal::sigaction(signal, &entry.previous) } {
            Ok(ours) => ours,
            Err(e) => {
                error!(signal = ?signal, error = %e, "Failed to restore previous disposition");
                return;
            }
        };
        if let Err(e) = signal::raise(signal) {
            error!(signal = ?signal, error = %e, "Failed to re-raise signal");
        }
        // SAFETY: reinstalling the handler that was in place a moment ago.
        if let Err(e) = unsafe { signal::sigaction(signal, &ours) } {
            error!(signal = ?signal, error = %e, "Failed to reinstall deferred handler");
        }
    }
}

fn release(state: &mut State, tokens: Vec<RegistrationToken>) {
    for token in tokens {
        let Some(entry) = state.entries.get_mut(&token.signal) else {
            continue;
        };
        entry.handlers.remove(&token.id);
        if !entry.handlers.is_empty() {
            continue;
        }
        if let Some(entry) = state.entries.remove(&token.signal) {
            // SAFETY: restoring a disposition obtained from sigaction itself.
            match unsafe { signal::sigaction(token.signal, &entry.previous) } {
                Ok(_) => trace!(signal = ?token.signal, "Restored previous signal disposition"),
                Err(e) => {
                    error!(signal = ?token.signal, error = %e, "Failed to restore signal disposition")
                }
            }
        }
    }
}

fn start_dispatcher() -> Result<()> {
    let (read, write) = fd::anonymous_pipe()?;
    fd::set_nonblocking(write.as_raw_fd(), true)?;
    std::thread::Builder::new()
        .name("procinvoke-signals".into())
        .spawn(move || run_dispatcher(File::from(read)))
        .map_err(|e| InvocationError::system("starting signal dispatcher", e))?;
    WAKE_FD.store(write.into_raw_fd(), Ordering::Relaxed);
    Ok(())
}

fn run_dispatcher(mut wake: File) {
    let mut buf = [0u8; 64];
    loop {
        match wake.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => {
                for &byte in &buf[..n] {
                    if let Ok(signal) = Signal::try_from(i32::from(byte)) {
                        SignalRegistry::global().dispatch(signal);
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "Signal dispatcher stopped");
                return;
            }
        }
    }
}

/// Tokens that unregister themselves when dropped
#[derive(Debug, Default)]
pub struct Registration {
    tokens: Vec<RegistrationToken>,
}

impl Registration {
    pub fn new(signals: &[Signal], handler: SignalHandler) -> Result<Self> {
        let tokens = SignalRegistry::global().register(signals, handler)?;
        Ok(Self { tokens })
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.tokens.iter().map(RegistrationToken::signal).collect()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        SignalRegistry::global().unregister(std::mem::take(&mut self.tokens));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    fn wait_until(flag: &AtomicBool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if flag.load(Ordering::SeqCst) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn current_handler(signal: Signal) -> libc::sighandler_t {
        let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
        unsafe { libc::sigaction(signal as libc::c_int, std::ptr::null(), &mut old) };
        old.sa_sigaction
    }

    #[test]
    fn test_handler_runs_and_unregister_restores_default() {
        let seen = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&seen);
        let registration = Registration::new(
            &[Signal::SIGUSR2],
            Arc::new(move |signal| {
                assert_eq!(signal, Signal::SIGUSR2);
                flag.store(true, Ordering::SeqCst);
                false
            }),
        )
        .unwrap();
        assert_eq!(SignalRegistry::global().handler_count(Signal::SIGUSR2), 1);

        signal::raise(Signal::SIGUSR2).unwrap();
        assert!(wait_until(&seen));

        drop(registration);
        assert_eq!(SignalRegistry::global().handler_count(Signal::SIGUSR2), 0);
        assert_eq!(current_handler(Signal::SIGUSR2), libc::SIG_DFL);
    }

    static PREVIOUS_SAW_SIGNAL: AtomicBool = AtomicBool::new(false);

    extern "C" fn previous_handler(_: libc::c_int) {
        PREVIOUS_SAW_SIGNAL.store(true, Ordering::SeqCst);
    }

    #[test]
    fn test_allowed_signal_reaches_previous_disposition() {
        let previous = SigAction::new(
            SigHandler::Handler(previous_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe { signal::sigaction(Signal::SIGWINCH, &previous) }.unwrap();

        let calls = Arc::new(AtomicI32::new(0));
        let counter = Arc::clone(&calls);
        let handler: SignalHandler = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        let first = Registration::new(&[Signal::SIGWINCH], Arc::clone(&handler)).unwrap();
        let second = Registration::new(&[Signal::SIGWINCH], handler).unwrap();
        assert_eq!(SignalRegistry::global().handler_count(Signal::SIGWINCH), 2);

        signal::raise(Signal::SIGWINCH).unwrap();
        assert!(wait_until(&PREVIOUS_SAW_SIGNAL));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        drop(first);
        assert_ne!(current_handler(Signal::SIGWINCH), previous_handler as libc::sighandler_t);
        drop(second);
        assert_eq!(current_handler(Signal::SIGWINCH), previous_handler as libc::sighandler_t);

        unsafe { signal::sigaction(Signal::SIGWINCH, &SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty())) }.unwrap();
    }

    #[test]
    fn test_failed_registration_registers_nothing() {
        let result = Registration::new(
            &[Signal::SIGALRM, Signal::SIGKILL],
            Arc::new(|_| true),
        );
        assert!(matches!(result, Err(InvocationError::System { .. })));
        assert_eq!(SignalRegistry::global().handler_count(Signal::SIGALRM), 0);
    }
}
