//! Process termination and the expected-termination policy

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use crate::error::{InvocationError, Result};

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationReason {
    /// Normal exit; the status is the exit code
    Exit,
    /// Killed by a signal it did not handle; the status is the signal number
    UncaughtSignal,
}

/// Exit status paired with its reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Termination {
    pub status: i32,
    pub reason: TerminationReason,
}

impl Termination {
    /// `exit(0)`
    pub const SUCCESS: Self = Self::exit(0);

    pub const fn exit(code: i32) -> Self {
        Self {
            status: code,
            reason: TerminationReason::Exit,
        }
    }

    pub const fn signal(signal: i32) -> Self {
        Self {
            status: signal,
            reason: TerminationReason::UncaughtSignal,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

impl From<ExitStatus> for Termination {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::exit(code),
            (None, Some(signal)) => Self::signal(signal),
            // Stopped/continued states are not reported by wait().
            (None, None) => Self::exit(status.into_raw()),
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            TerminationReason::Exit => write!(f, "exited with status {}", self.status),
            TerminationReason::UncaughtSignal => {
                write!(f, "killed by uncaught signal {}", self.status)
            }
        }
    }
}

/// Which terminations count as success
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExpectedTerminations {
    /// `exit(0)`, plus `SIGPIPE` when a continuation handler may stop reading early
    #[default]
    Default,
    /// Accept every termination
    Any,
    /// Accept exactly these
    Only(Vec<Termination>),
}

impl ExpectedTerminations {
    /// The concrete table, `None` meaning anything is accepted
    pub fn resolve(&self, has_continuation_handler: bool) -> Option<Vec<Termination>> {
        match self {
            Self::Default if has_continuation_handler => {
                Some(vec![Termination::SUCCESS, Termination::signal(libc::SIGPIPE)])
            }
            Self::Default => Some(vec![Termination::SUCCESS]),
            Self::Any => None,
            Self::Only(expected) => Some(expected.clone()),
        }
    }
}

/// Check `actual` against a resolved table
pub fn check_termination(expected: Option<&[Termination]>, actual: Termination) -> Result<()> {
    match expected {
        None => Ok(()),
        Some(expected) if expected.contains(&actual) => Ok(()),
        Some(_) => Err(InvocationError::UnexpectedTermination(actual)),
    }
}
