//! `strata exec` — Execute a command inside an image.

use clap::Args;
use strata_common::config::EngineConfig;
use strata_common::types::ActionKind;

use super::options::ActionTarget;

/// Arguments for the `exec` command.
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Image, options, and the command to execute.
    #[command(flatten)]
    pub target: ActionTarget,
}

/// Executes the `exec` command.
///
/// An empty command is refused by the engine with exit code 1 before
/// anything is mounted.
///
/// # Errors
///
/// Returns an error if the request is malformed.
pub fn execute(args: ExecArgs, config: EngineConfig) -> anyhow::Result<i32> {
    super::dispatch(ActionKind::Exec, args.target, config)
}
