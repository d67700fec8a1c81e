//! # strata — container action runner
//!
//! Runs a command, a run-script, or a shell inside a container image with
//! binds, overlays, and a dropped privilege set, and exits with the
//! contained process's exit code.

#![cfg_attr(test, allow(clippy::expect_used, clippy::panic))]

mod commands;
mod output;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::commands::Cli;

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);
    std::process::exit(commands::execute(cli));
}

/// Logs go to stderr so the contained process owns stdout.
fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
