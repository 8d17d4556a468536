//! Error types for process invocation

use std::io;
use thiserror::Error;

use crate::termination::Termination;

/// Process invocation errors
#[derive(Debug, Error)]
pub enum InvocationError {
    /// Invalid combination of invocation options
    #[error("Invalid invocation configuration: {0}")]
    InvalidConfiguration(String),

    /// Descriptors must be relayed but the relay executable cannot be located
    #[error("Relay executable location unknown: set {env_var} or configure a relay directory")]
    RelayPathNotSet { env_var: String },

    /// A system call failed
    #[error("System call failed while {operation}: {source}")]
    System {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    /// Reading one of the output streams failed
    #[error("Failed to read process output: {0}")]
    OutputRead(#[source] io::Error),

    /// Output bytes are not valid UTF-8
    #[error("Output is not valid UTF-8 ({} bytes)", .0.len())]
    InvalidEncoding(Vec<u8>),

    /// The process terminated in a way the invocation does not accept
    #[error("Unexpected subprocess termination: {0}")]
    UnexpectedTermination(Termination),

    /// The process was already reaped; its pid may belong to someone else now
    #[error("Process {pid} has already exited")]
    ProcessExited { pid: u32 },

    /// Internal invariant violated
    #[error("Internal error: {0}")]
    Internal(String),
}

impl InvocationError {
    pub(crate) fn system(operation: &'static str, source: impl Into<io::Error>) -> Self {
        Self::System {
            operation,
            source: source.into(),
        }
    }

    /// The OS error code carried by system and output errors
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::System { source, .. } | Self::OutputRead(source) => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Result type for invocation operations
pub type Result<T> = std::result::Result<T, InvocationError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::termination::TerminationReason;

    #[test]
    fn test_system_error_keeps_errno() {
        let err = InvocationError::system("creating pipe", nix::errno::Errno::EMFILE);
        assert_eq!(err.raw_os_error(), Some(libc::EMFILE));
        assert!(err.to_string().contains("creating pipe"));
    }

    #[test]
    fn test_termination_mismatch_message() {
        let err = InvocationError::UnexpectedTermination(Termination {
            status: 1,
            reason: TerminationReason::Exit,
        });
        assert_eq!(
            err.to_string(),
            "Unexpected subprocess termination: exited with status 1"
        );
        assert_eq!(err.raw_os_error(), None);
    }
}
