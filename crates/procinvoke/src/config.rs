//! Invocation configuration

use std::future::Future;
use std::path::PathBuf;

use tracing::instrument::{WithDispatch, WithSubscriber};
use tracing::Dispatch;

/// Environment variable naming the directory that holds the relay executable
pub const RELAY_PATH_ENV_VAR: &str = "PROCINVOKE_RELAY_PATH";

/// File name of the relay executable
pub const RELAY_EXECUTABLE_NAME: &str = "procinvoke-relay";

/// Default cap on stdin bytes buffered between the source and the pipe
pub const DEFAULT_STDIN_MAX_CACHE: usize = 32 * 1024 * 1024;

/// Runtime settings shared by every stage of an invocation
#[derive(Debug, Clone)]
pub struct InvocationConfig {
    /// Directory containing the relay (takes precedence over the environment)
    pub relay_directory: Option<PathBuf>,
    /// Environment variable consulted when `relay_directory` is unset
    pub relay_path_env_var: String,
    /// Relay executable file name
    pub relay_executable_name: String,
    /// Maximum stdin bytes held in memory while the child is not reading
    pub stdin_max_cache: usize,
    /// Capacity of the event queue between output readers and the consumer
    pub event_queue_capacity: usize,
    /// Upper bound for a single read from an output fd
    pub max_read_size: usize,
    /// Log sink; `None` uses the caller's current dispatcher
    pub dispatch: Option<Dispatch>,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            relay_directory: None,
            relay_path_env_var: RELAY_PATH_ENV_VAR.to_string(),
            relay_executable_name: RELAY_EXECUTABLE_NAME.to_string(),
            stdin_max_cache: DEFAULT_STDIN_MAX_CACHE,
            event_queue_capacity: 256,
            max_read_size: 1024 * 1024,
            dispatch: None,
        }
    }
}

impl InvocationConfig {
    /// Create configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the directory containing the relay executable
    pub fn with_relay_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.relay_directory = Some(dir.into());
        self
    }

    /// Set the environment variable naming the relay directory
    pub fn with_relay_path_env_var(mut self, name: impl Into<String>) -> Self {
        self.relay_path_env_var = name.into();
        self
    }

    /// Set the stdin cache limit
    pub fn with_stdin_max_cache(mut self, bytes: usize) -> Self {
        self.stdin_max_cache = bytes.max(1);
        self
    }

    /// Set the event queue capacity
    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity.max(1);
        self
    }

    /// Set the largest single read
    pub fn with_max_read_size(mut self, bytes: usize) -> Self {
        self.max_read_size = bytes.max(1);
        self
    }

    /// Route this invocation's log events to `dispatch`
    pub fn with_dispatch(mut self, dispatch: impl Into<Dispatch>) -> Self {
        self.dispatch = Some(dispatch.into());
        self
    }

    /// Dispatcher for work that runs outside the caller's context
    pub(crate) fn dispatcher(&self) -> Dispatch {
        match &self.dispatch {
            Some(dispatch) => dispatch.clone(),
            None => tracing::dispatcher::get_default(Dispatch::clone),
        }
    }

    /// Attach the configured sink to a future about to be spawned
    pub(crate) fn instrument<F: Future>(&self, future: F) -> WithDispatch<F> {
        future.with_subscriber(self.dispatcher())
    }
}
