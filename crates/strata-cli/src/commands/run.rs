//! `strata run` — Run the image or app run-script.

use clap::Args;
use strata_common::config::EngineConfig;
use strata_common::types::ActionKind;

use super::options::ActionTarget;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Image, options, and run-script arguments.
    #[command(flatten)]
    pub target: ActionTarget,
}

/// Executes the `run` command.
///
/// Runs `/scif/apps/<app>/scif/runscript` with `--app`, otherwise the
/// image run-script, falling back to a shell when the image has none.
///
/// # Errors
///
/// Returns an error if the request is malformed.
pub fn execute(args: RunArgs, config: EngineConfig) -> anyhow::Result<i32> {
    super::dispatch(ActionKind::Run, args.target, config)
}
