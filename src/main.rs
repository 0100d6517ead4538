//! Entry point for the `procmon` binary.
//!
//! The binary is intentionally thin: it configures tracing, resolves the
//! short-flag CLI into a single action, and hands control to either the
//! supervisor daemon or one of the short-lived control commands. Control
//! commands exit 0 on success or with the errno of whatever went wrong.

mod cli;
mod commands;
mod config;
mod control;
mod daemon;
mod errors;
mod lockfile;
mod monitor;
mod process;
mod scheduler;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Invocation};
use crate::config::Paths;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.resolve() {
        Invocation::Usage => cli::print_usage(),
        Invocation::Daemon { config, role } => {
            if let Err(err) = daemon::run(config, role, cli.verbose).await {
                tracing::error!("process monitor failed: {err:#}");
                std::process::exit(1);
            }
        }
        command => {
            if let Err(err) = commands::run(command, &Paths::load()).await {
                eprintln!("{err}");
                std::process::exit(err.exit_code());
            }
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}
