//! # procinvoke
//!
//! **Purpose**: Launch child processes and consume their output line by line
//!
//! Builds on `tokio::process` with explicit control over every descriptor the
//! child sees, signal forwarding while it runs and a check of how it ended.
//!
//! ## Features
//!
//! - **Redirects**: Inherit, `/dev/null`, capture, an existing descriptor or bytes fed to stdin
//! - **PATH Search**: Inherited, POSIX default or explicit directory lists
//! - **Descriptor Passing**: Any fd number in the child through the `procinvoke-relay` helper
//! - **Line Output**: Arrival-ordered lines from stdout, stderr and additional descriptors
//! - **Signal Forwarding**: Per-signal policy deciding what reaches the child and the parent
//! - **Expected Terminations**: Exit codes and signals accepted as success
//! - **Streams**: A pull-based [`LineStream`] per launch
//!
//! ## Usage
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use procinvoke::{InputRedirect, ProcessInvocation};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Collect stdout
//! let collected = ProcessInvocation::new("echo")
//!     .args(["hello", "world"])
//!     .invoke_and_collect_stdout()
//!     .await?;
//! assert_eq!(collected.lines, ["hello world"]);
//!
//! // Stream lines as they arrive
//! let mut lines = ProcessInvocation::new("cat")
//!     .stdin(InputRedirect::send("a\nb\n"))
//!     .lines();
//! while let Some(line) = lines.next().await {
//!     println!("{}", line?.line_or_hex());
//! }
//! # Ok(())
//! # }
//! ```

#[cfg(not(unix))]
compile_error!("procinvoke supports Unix targets only");

pub mod child;
pub mod collect;
pub mod config;
pub mod error;
pub mod fd;
pub mod fd_passing;
pub mod invocation;
mod launch;
pub mod line;
pub mod output;
pub mod path_search;
pub mod redirect;
pub mod relay;
pub mod separators;
pub mod signals;
pub mod stdin_pump;
pub mod stream;
pub mod termination;

pub use child::ProcessHandle;
pub use collect::{Collected, Completion};
pub use config::InvocationConfig;
pub use error::{InvocationError, Result};
pub use fd::{anonymous_pipe, TransferredFd};
pub use invocation::ProcessInvocation;
pub use launch::TerminationHandler;
pub use line::{Line, RawLine, STDERR_FD, STDIN_FD, STDOUT_FD};
pub use output::StreamControl;
pub use path_search::{CustomPath, SearchPath};
pub use redirect::{InputRedirect, OutputRedirect, SourceFd, StdinSource};
pub use separators::LineSeparators;
pub use signals::{Signal, SignalHandling};
pub use stdin_pump::streaming_pipe;
pub use stream::LineStream;
pub use termination::{check_termination, ExpectedTerminations, Termination, TerminationReason};
