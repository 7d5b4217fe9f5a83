use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "deskrelay")]
#[command(
    about = "Stdin/stdout JSON adapters bridging agent tool calls to mail, calendar, and notes backends",
    long_about = None
)]
#[command(version)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Mail adapter: one request envelope on stdin, dispatched against the
    /// command-line mail client.
    Mail(AdapterArgs),

    /// Calendar adapter: one request envelope on stdin, dispatched against
    /// the OS calendar automation layer.
    Calendar(AdapterArgs),

    /// Notes adapter: one request envelope on stdin, dispatched against the
    /// notes publishing HTTP API.
    Notes(AdapterArgs),
}

#[derive(Args)]
pub(crate) struct AdapterArgs {
    /// Directory for config, idempotency, rate-limit, and debug files.
    #[arg(long)]
    pub(crate) state_dir: Option<PathBuf>,

    /// Override the backend call timeout for this invocation.
    #[arg(long)]
    pub(crate) timeout_ms: Option<u64>,

    /// Dump request and response JSON under <state-dir>/debug/.
    #[arg(long)]
    pub(crate) debug_dump: bool,
}
