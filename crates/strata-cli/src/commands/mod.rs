//! CLI command definitions and dispatch.

pub mod exec;
pub mod options;
pub mod run;
pub mod shell;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use strata_common::config::EngineConfig;
use strata_common::constants::ENGINE_FAILURE_EXIT_CODE;
use strata_common::types::{ActionKind, ExecutionRequest, ImageRef};
use strata_runtime::dispatcher::Dispatcher;
use strata_runtime::launcher::StdioMode;
use strata_runtime::signal::Interrupt;

use self::options::ActionTarget;
use crate::output;

/// strata — run commands inside container images.
#[derive(Parser, Debug)]
#[command(name = "strata", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Engine configuration file (JSON).
    #[arg(long, global = true, env = "STRATA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log debug output to stderr.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the image run-script, or the app run-script with --app.
    Run(run::RunArgs),
    /// Execute a command inside the image.
    Exec(exec::ExecArgs),
    /// Start an interactive shell inside the image.
    Shell(shell::ShellArgs),
}

/// Dispatches the parsed CLI command and returns the process exit code.
pub fn execute(cli: Cli) -> i32 {
    let result = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Command::Run(args) => run::execute(args, config),
        Command::Exec(args) => exec::execute(args, config),
        Command::Shell(args) => shell::execute(args, config),
    });
    result.unwrap_or_else(|e| {
        output::report_error(&e);
        ENGINE_FAILURE_EXIT_CODE
    })
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    EngineConfig::load(path)
        .with_context(|| format!("cannot load configuration {}", path.display()))
}

/// Runs one action and returns the exit code to report.
///
/// Engine errors are reported here with their class; only front-end
/// failures are returned.
///
/// # Errors
///
/// Returns an error if a flag value is malformed or the signal handlers
/// cannot be installed.
fn dispatch(action: ActionKind, target: ActionTarget, config: EngineConfig) -> anyhow::Result<i32> {
    let options = target.options.into_option_set()?;
    let request = match ImageRef::parse(&target.image)
        .and_then(|image| ExecutionRequest::new(action, image, target.command, options))
    {
        Ok(request) => request,
        Err(e) => {
            output::report_engine_error(&e);
            return Ok(ENGINE_FAILURE_EXIT_CODE);
        }
    };
    tracing::debug!(
        action = %request.action,
        image = %request.image.display(),
        args = request.command.len(),
        "request built"
    );

    let interrupt = Interrupt::new();
    let _signals = interrupt.install()?;
    let dispatcher = Dispatcher::for_host(config, interrupt)?;
    let outcome = dispatcher.dispatch(&request, StdioMode::Inherit);
    if let Some(error) = &outcome.error {
        output::report_engine_error(error);
    }
    Ok(outcome.exit_code())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn exec_collects_trailing_command() {
        let cli = Cli::try_parse_from([
            "strata", "exec", "--bind", "/tmp:/mnt", "/images/busybox", "ls", "-la",
        ])
        .expect("parse");
        let Command::Exec(args) = cli.command else {
            panic!("expected exec");
        };
        assert_eq!(args.target.image, "/images/busybox");
        assert_eq!(args.target.command, vec!["ls", "-la"]);
        assert_eq!(args.target.options.bind, vec!["/tmp:/mnt"]);
    }

    #[test]
    fn exec_accepts_empty_command() {
        let cli = Cli::try_parse_from(["strata", "exec", "/images/busybox"]).expect("parse");
        let Command::Exec(args) = cli.command else {
            panic!("expected exec");
        };
        assert!(args.target.command.is_empty());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["strata", "run", "-v", "--app", "foo", "/images/apps"])
            .expect("parse");
        assert!(cli.verbose);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.target.options.app.as_deref(), Some("foo"));
    }

    #[test]
    fn missing_config_file_is_an_error() {
        assert!(load_config(Some(Path::new("/nonexistent/strata.json"))).is_err());
        assert!(load_config(None).is_ok());
    }
}
