//! Signal forwarding policy

pub mod registry;

use std::collections::HashMap;

pub use nix::sys::signal::Signal;

/// Signals intercepted and relayed by default
pub const DEFAULT_FORWARDED_SIGNALS: &[Signal] = &[
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGHUP,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGWINCH,
];

/// Signals whose default action terminates the process
pub const KILLING_SIGNALS: &[Signal] = &[
    Signal::SIGABRT,
    Signal::SIGALRM,
    Signal::SIGBUS,
    Signal::SIGFPE,
    Signal::SIGHUP,
    Signal::SIGILL,
    Signal::SIGINT,
    Signal::SIGKILL,
    Signal::SIGPIPE,
    Signal::SIGQUIT,
    Signal::SIGSEGV,
    Signal::SIGSYS,
    Signal::SIGTERM,
    Signal::SIGTRAP,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGVTALRM,
    Signal::SIGXCPU,
    Signal::SIGXFSZ,
];

/// What to do with an intercepted signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalHandling {
    /// Signal delivered to the child, `None` to not forward
    pub signal_for_child: Option<Signal>,
    /// Let the signal reach the parent's previous disposition afterwards
    pub allow_on_parent: bool,
    /// Deliver to the child's process group instead of its pid
    pub send_to_process_group: bool,
    /// Block until the child exited before letting the parent see the signal
    pub wait_for_child_death_before_parent: bool,
}

impl SignalHandling {
    /// Forward `signal_for_child` to the group, then to the parent
    pub fn new(signal_for_child: Option<Signal>) -> Self {
        Self {
            signal_for_child,
            allow_on_parent: true,
            send_to_process_group: true,
            wait_for_child_death_before_parent: true,
        }
    }

    /// Forward the same signal; wait for the child only when the signal is lethal
    pub fn default_for(signal: Signal) -> Self {
        Self {
            wait_for_child_death_before_parent: KILLING_SIGNALS.contains(&signal),
            ..Self::new(Some(signal))
        }
    }

    /// Like [`SignalHandling::default_for`], forwarding `map[signal]` when present
    pub fn map_for_child(signal: Signal, map: &HashMap<Signal, Signal>) -> Self {
        let for_child = map.get(&signal).copied().unwrap_or(signal);
        Self {
            signal_for_child: Some(for_child),
            ..Self::default_for(for_child)
        }
    }

    /// Forward to the child only
    pub fn child_only(signal: Signal) -> Self {
        Self {
            allow_on_parent: false,
            wait_for_child_death_before_parent: false,
            ..Self::new(Some(signal))
        }
    }
}
