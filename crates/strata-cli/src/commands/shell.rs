//! `strata shell` — Start an interactive shell inside an image.

use clap::Args;
use strata_common::config::EngineConfig;
use strata_common::types::ActionKind;

use super::options::ActionTarget;

/// Arguments for the `shell` command.
#[derive(Args, Debug)]
pub struct ShellArgs {
    /// Image, options, and shell arguments.
    #[command(flatten)]
    pub target: ActionTarget,
}

/// Executes the `shell` command with `--shell` or the configured default.
///
/// # Errors
///
/// Returns an error if the request is malformed.
pub fn execute(args: ShellArgs, config: EngineConfig) -> anyhow::Result<i32> {
    super::dispatch(ActionKind::Shell, args.target, config)
}
