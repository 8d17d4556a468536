//! The invocation descriptor

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::os::fd::{OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::child::ProcessHandle;
use crate::config::InvocationConfig;
use crate::error::{InvocationError, Result};
use crate::fd::TransferredFd;
use crate::line::{RawLine, STDERR_FD, STDIN_FD, STDOUT_FD};
use crate::path_search::CustomPath;
use crate::redirect::{InputRedirect, OutputRedirect};
use crate::separators::LineSeparators;
use crate::signals::{Signal, SignalHandling, DEFAULT_FORWARDED_SIGNALS};
use crate::termination::{ExpectedTerminations, Termination};

/// Maps an intercepted signal to what should happen with it
pub type SignalPolicy = Arc<dyn Fn(Signal) -> SignalHandling + Send + Sync>;

/// Decides after each line whether its stream is still of interest
pub type ContinuationPredicate = Arc<dyn Fn(&RawLine, &ProcessHandle) -> bool + Send + Sync>;

/// Everything needed to launch one process
///
/// A descriptor can be launched several times. Transferred descriptors and
/// reader-backed stdin are consumed by the first successful launch.
#[derive(Clone)]
pub struct ProcessInvocation {
    pub(crate) executable: PathBuf,
    pub(crate) args: Vec<OsString>,
    pub(crate) use_path: bool,
    pub(crate) custom_path: CustomPath,
    pub(crate) working_directory: Option<PathBuf>,
    pub(crate) environment: Option<HashMap<OsString, OsString>>,
    pub(crate) stdin: InputRedirect,
    pub(crate) stdout: OutputRedirect,
    pub(crate) stderr: OutputRedirect,
    pub(crate) signals_to_process: HashSet<Signal>,
    pub(crate) signal_policy: SignalPolicy,
    pub(crate) fds_to_send: BTreeMap<RawFd, TransferredFd>,
    pub(crate) additional_output_fds: Vec<TransferredFd>,
    pub(crate) line_separators: LineSeparators,
    pub(crate) should_continue: Option<ContinuationPredicate>,
    pub(crate) expected_terminations: ExpectedTerminations,
    pub(crate) config: InvocationConfig,
}

impl ProcessInvocation {
    /// Create a descriptor for `executable`
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            use_path: true,
            custom_path: CustomPath::Inherit,
            working_directory: None,
            environment: None,
            stdin: InputRedirect::default(),
            stdout: OutputRedirect::Capture,
            stderr: OutputRedirect::Capture,
            signals_to_process: DEFAULT_FORWARDED_SIGNALS.iter().copied().collect(),
            signal_policy: Arc::new(SignalHandling::default_for),
            fds_to_send: BTreeMap::new(),
            additional_output_fds: Vec::new(),
            line_separators: LineSeparators::default(),
            should_continue: None,
            expected_terminations: ExpectedTerminations::Default,
            config: InvocationConfig::default(),
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    /// Append arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_owned()));
        self
    }

    /// Search `PATH` for a bare executable name
    pub fn use_path(mut self, use_path: bool) -> Self {
        self.use_path = use_path;
        self
    }

    pub fn custom_path(mut self, custom_path: CustomPath) -> Self {
        self.custom_path = custom_path;
        self
    }

    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Replace the child's whole environment
    pub fn environment<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.environment = Some(
            vars.into_iter()
                .map(|(k, v)| (k.as_ref().to_owned(), v.as_ref().to_owned()))
                .collect(),
        );
        self
    }

    pub fn stdin(mut self, redirect: InputRedirect) -> Self {
        self.stdin = redirect;
        self
    }

    pub fn stdout(mut self, redirect: OutputRedirect) -> Self {
        self.stdout = redirect;
        self
    }

    pub fn stderr(mut self, redirect: OutputRedirect) -> Self {
        self.stderr = redirect;
        self
    }

    /// Signals intercepted while the process runs
    pub fn signals_to_process(mut self, signals: impl IntoIterator<Item = Signal>) -> Self {
        self.signals_to_process = signals.into_iter().collect();
        self
    }

    pub fn signal_handling<F>(mut self, policy: F) -> Self
    where
        F: Fn(Signal) -> SignalHandling + Send + Sync + 'static,
    {
        self.signal_policy = Arc::new(policy);
        self
    }

    /// Hand `fd` to the child as descriptor `child_fd`
    ///
    /// Requires the relay executable. `child_fd` must not be 0, 1 or 2.
    pub fn send_fd(mut self, child_fd: RawFd, fd: OwnedFd) -> Self {
        self.fds_to_send.insert(child_fd, TransferredFd::new(fd));
        self
    }

    /// Read `fd` as an extra output stream; its lines carry its raw number
    pub fn additional_output_fd(mut self, fd: OwnedFd) -> Self {
        self.additional_output_fds.push(TransferredFd::new(fd));
        self
    }

    pub fn line_separators(mut self, separators: LineSeparators) -> Self {
        self.line_separators = separators;
        self
    }

    /// Called after every line; returning `false` ends interest in that stream
    pub fn should_continue<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RawLine, &ProcessHandle) -> bool + Send + Sync + 'static,
    {
        self.should_continue = Some(Arc::new(predicate));
        self
    }

    pub fn expected_terminations(mut self, expected: ExpectedTerminations) -> Self {
        self.expected_terminations = expected;
        self
    }

    /// Accept only these terminations
    pub fn expect_terminations(self, expected: impl IntoIterator<Item = Termination>) -> Self {
        self.expected_terminations(ExpectedTerminations::Only(expected.into_iter().collect()))
    }

    /// Accept every termination
    pub fn accept_any_termination(self) -> Self {
        self.expected_terminations(ExpectedTerminations::Any)
    }

    pub fn config(mut self, config: InvocationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    pub fn invocation_config(&self) -> &InvocationConfig {
        &self.config
    }

    /// The expected-termination table in effect, `None` accepting anything
    pub fn resolved_expected_terminations(&self) -> Option<Vec<Termination>> {
        self.expected_terminations
            .resolve(self.should_continue.is_some())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for fd in [STDIN_FD, STDOUT_FD, STDERR_FD] {
            if self.fds_to_send.contains_key(&fd) {
                return Err(InvocationError::InvalidConfiguration(format!(
                    "descriptor {fd} is controlled by the redirect options and cannot be sent"
                )));
            }
        }
        if let Some(fd) = self.fds_to_send.keys().find(|fd| **fd < 0) {
            return Err(InvocationError::InvalidConfiguration(format!(
                "cannot install a descriptor as {fd}"
            )));
        }
        if self.executable.as_os_str().is_empty() {
            return Err(InvocationError::InvalidConfiguration(
                "executable path is empty".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for ProcessInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessInvocation")
            .field("executable", &self.executable)
            .field("args", &self.args)
            .field("use_path", &self.use_path)
            .field("custom_path", &self.custom_path)
            .field("working_directory", &self.working_directory)
            .field("environment", &self.environment.as_ref().map(HashMap::len))
            .field("stdin", &self.stdin)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("signals_to_process", &self.signals_to_process)
            .field("fds_to_send", &self.fds_to_send)
            .field("additional_output_fds", &self.additional_output_fds)
            .field("line_separators", &self.line_separators)
            .field("should_continue", &self.should_continue.is_some())
            .field("expected_terminations", &self.expected_terminations)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::anonymous_pipe;

    #[test]
    fn test_defaults() {
        let invocation = ProcessInvocation::new("ls");
        assert!(invocation.use_path);
        assert!(matches!(invocation.stdout, OutputRedirect::Capture));
        assert!(matches!(
            invocation.stdin,
            InputRedirect::Inherit {
                set_foreground_group: true
            }
        ));
        assert!(invocation.signals_to_process.contains(&Signal::SIGTERM));
        assert_eq!(
            invocation.resolved_expected_terminations(),
            Some(vec![Termination::SUCCESS])
        );
    }

    #[test]
    fn test_standard_fds_cannot_be_sent() {
        for fd in [0, 1, 2] {
            let (read, _write) = anonymous_pipe().unwrap();
            let invocation = ProcessInvocation::new("true").send_fd(fd, read);
            assert!(matches!(
                invocation.validate(),
                Err(InvocationError::InvalidConfiguration(_))
            ));
        }
        let (read, _write) = anonymous_pipe().unwrap();
        assert!(ProcessInvocation::new("true").send_fd(3, read).validate().is_ok());
    }

    #[test]
    fn test_continuation_handler_changes_default_table() {
        let invocation = ProcessInvocation::new("yes").should_continue(|_, _| false);
        assert_eq!(
            invocation.resolved_expected_terminations(),
            Some(vec![Termination::SUCCESS, Termination::signal(libc::SIGPIPE)])
        );
        assert_eq!(
            invocation.accept_any_termination().resolved_expected_terminations(),
            None
        );
    }

    #[test]
    fn test_builder_collects_arguments() {
        let invocation = ProcessInvocation::new("/bin/echo")
            .arg("-n")
            .args(["a", "b"])
            .environment([("K", "V")]);
        assert_eq!(invocation.arguments(), &["-n", "a", "b"]);
        assert_eq!(invocation.environment.unwrap().len(), 1);
    }
}
