use std::ffi::OsString;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use procinvoke::relay::{self, RelayArgs, RELAY_LOG_ENV_VAR};

const EXIT_NOT_FOUND: u8 = 127;
const EXIT_FAILURE: u8 = 126;

#[derive(Parser, Debug)]
#[command(name = "procinvoke-relay")]
#[command(about = "Install descriptors received on stdin, then execute the target")]
struct Cli {
    /// Search the target in the directories of --path
    #[arg(long, overrides_with = "no_use_path")]
    use_path: bool,

    /// Execute the target path as given
    #[arg(long)]
    no_use_path: bool,

    /// Colon-separated search directories; the POSIX default when omitted
    #[arg(long)]
    path: Option<OsString>,

    /// Program to execute
    executable: OsString,

    /// Arguments for the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,
}

impl From<Cli> for RelayArgs {
    fn from(cli: Cli) -> Self {
        RelayArgs {
            use_path: cli.use_path && !cli.no_use_path,
            path: cli.path,
            executable: cli.executable,
            args: cli.args,
        }
    }
}

fn run(args: &RelayArgs) -> anyhow::Result<std::io::Error> {
    relay::install_received_descriptors().context("receiving descriptors")?;
    Ok(relay::exec(args))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_env(RELAY_LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    let args = RelayArgs::from(cli);

    match run(&args) {
        Ok(exec_error) => {
            error!(
                executable = ?args.executable,
                error = %exec_error,
                "Cannot execute target"
            );
            if exec_error.raw_os_error() == Some(libc::ENOENT) {
                ExitCode::from(EXIT_NOT_FOUND)
            } else {
                ExitCode::from(EXIT_FAILURE)
            }
        }
        Err(e) => {
            error!(error = ?e, "Relay failed");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}
