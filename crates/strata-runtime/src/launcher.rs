//! Process launch.
//!
//! The contained command is forked from the privileged engine. Between
//! fork and exec the child enters the assembled root and applies its
//! credential transition; in a new PID namespace it then splits off an
//! init that stays PID 1. A failure in any step is reported on a
//! dedicated pipe so it is never mistaken for a missing command. The
//! engine then waits, forwarding signals, and decodes the exit status.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use strata_common::config::EngineConfig;
use strata_common::constants::DEFAULT_PATH;
use strata_common::error::{EngineError, Result};
use strata_common::types::{ActionKind, ExecutionRequest, ExitResult};
use strata_core::filesystem::root::host_path;
use strata_core::namespace::pid;

use crate::coordinator::Ready;
use crate::plan::LaunchContext;
use crate::signal::Interrupt;

/// Child failed while entering the root.
const STAGE_ROOT: u8 = 1;
/// Child failed while applying its credential transition.
const STAGE_PRIVILEGE: u8 = 2;
/// Child failed while starting the PID namespace init.
const STAGE_INIT: u8 = 3;

/// Host variables kept by `--cleanenv`.
const CLEAN_ENV_KEEP: &[&str] = &["TERM", "LANG"];

/// How the contained process's standard streams are wired.
pub enum StdioMode {
    /// Share the engine's streams.
    Inherit,
    /// Pump each stream through the given reader and writers.
    Piped(PipedStdio),
}

/// Stream endpoints for [`StdioMode::Piped`].
pub struct PipedStdio {
    /// Source for the process's stdin; `None` gives it an empty stdin.
    pub stdin: Option<Box<dyn Read + Send>>,
    /// Sink for the process's stdout.
    pub stdout: Box<dyn Write + Send>,
    /// Sink for the process's stderr.
    pub stderr: Box<dyn Write + Send>,
}

/// Rejects commands that can never be launched.
///
/// # Errors
///
/// Returns [`EngineError::EmptyCommand`] for `exec` without a command.
pub fn validate_command(action: ActionKind, command: &[String]) -> Result<()> {
    if action == ActionKind::Exec && command.is_empty() {
        return Err(EngineError::EmptyCommand);
    }
    Ok(())
}

/// Determines the argument vector for `action` inside the root at `root`.
///
/// `run` executes the app run-script with `--app`, else the image
/// run-script, else falls back to `shell`. A run-script without execute
/// permission is interpreted by `shell`.
///
/// # Errors
///
/// Returns [`EngineError::EmptyCommand`] or
/// [`EngineError::RunScriptMissing`] for an app without a run-script.
pub fn resolve_command(
    action: ActionKind,
    args: &[String],
    context: &LaunchContext,
    root: &Path,
    shell: &Path,
) -> Result<Vec<String>> {
    let shell = path_arg(shell);
    match action {
        ActionKind::Exec => {
            validate_command(action, args)?;
            Ok(args.to_vec())
        }
        ActionKind::Shell => Ok(std::iter::once(shell).chain(args.iter().cloned()).collect()),
        ActionKind::Run => {
            let script = match &context.app {
                Some(app) => {
                    if !host_path(root, &app.run_script).is_file() {
                        return Err(EngineError::RunScriptMissing {
                            path: app.run_script.clone(),
                        });
                    }
                    app.run_script.clone()
                }
                None => {
                    let script = context.metadata.run_script();
                    if !host_path(root, &script).is_file() {
                        tracing::debug!("image has no run-script, starting a shell");
                        return Ok(std::iter::once(shell).chain(args.iter().cloned()).collect());
                    }
                    script
                }
            };
            let mut argv = if is_executable(&host_path(root, &script)) {
                vec![path_arg(&script)]
            } else {
                vec![shell, path_arg(&script)]
            };
            argv.extend(args.iter().cloned());
            Ok(argv)
        }
    }
}

/// Picks the working directory of the contained process: the requested
/// one, then `/tmp` when it is staged in the work directory, then the
/// image default, then `/`.
///
/// So `--contain --workdir DIR` without `--pwd` starts the process in
/// `/tmp`, which is backed by `DIR/tmp` on the host. `--pwd` still wins
/// over that.
///
/// # Errors
///
/// Returns [`EngineError::PwdNotFound`] if the requested directory does
/// not exist in the root.
pub fn resolve_cwd(
    target_pwd: Option<&Path>,
    context: &LaunchContext,
    root: &Path,
) -> Result<PathBuf> {
    if let Some(pwd) = target_pwd {
        if host_path(root, pwd).is_dir() {
            return Ok(pwd.to_path_buf());
        }
        return Err(EngineError::PwdNotFound {
            path: pwd.to_path_buf(),
        });
    }
    if context.workdir_tmp {
        return Ok(PathBuf::from("/tmp"));
    }
    if let Some(pwd) = &context.metadata.default_pwd {
        if host_path(root, pwd).is_dir() {
            return Ok(pwd.clone());
        }
        tracing::debug!(pwd = %pwd.display(), "image working directory missing, using /");
    }
    Ok(PathBuf::from("/"))
}

/// Builds the environment of the contained process from `host`.
#[must_use]
pub fn build_environment(
    host: impl IntoIterator<Item = (String, String)>,
    clean: bool,
    context: &LaunchContext,
) -> Vec<(String, String)> {
    let mut env: BTreeMap<String, String> = host
        .into_iter()
        .filter(|(key, _)| !clean || CLEAN_ENV_KEEP.contains(&key.as_str()))
        .collect();
    let _ = env.insert("HOME".into(), path_arg(&context.home));
    let _ = env
        .entry("PATH".into())
        .or_insert_with(|| DEFAULT_PATH.into());

    if let Some(app) = &context.app {
        env.extend(app.environment());
        prepend(&mut env, "PATH", &app.bin_dir());
        prepend(&mut env, "LD_LIBRARY_PATH", &app.lib_dir());
    }
    env.into_iter().collect()
}

fn prepend(env: &mut BTreeMap<String, String>, key: &str, dir: &Path) {
    let dir = path_arg(dir);
    let value = match env.get(key) {
        Some(existing) if !existing.is_empty() => format!("{dir}:{existing}"),
        _ => dir,
    };
    let _ = env.insert(key.to_string(), value);
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.permissions().mode() & 0o111 != 0)
}

/// Runs an already configured command to completion.
///
/// Streams are wired according to `stdio`; signals recorded by
/// `interrupt` are forwarded while the process runs.
///
/// # Errors
///
/// Returns [`EngineError::CommandNotFound`] if the program does not exist
/// and [`EngineError::SpawnFailed`] for any other start failure.
pub fn run_process(command: Command, stdio: StdioMode, interrupt: &Interrupt) -> Result<ExitResult> {
    let program = path_arg(Path::new(command.get_program()));
    run_with(command, stdio, interrupt, |e| spawn_error(&program, &e))
}

fn run_with(
    mut command: Command,
    stdio: StdioMode,
    interrupt: &Interrupt,
    on_spawn_error: impl FnOnce(io::Error) -> EngineError,
) -> Result<ExitResult> {
    let program = path_arg(Path::new(command.get_program()));
    match &stdio {
        StdioMode::Inherit => {
            let _ = command
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        }
        StdioMode::Piped(piped) => {
            let stdin = if piped.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            };
            let _ = command
                .stdin(stdin)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }
    }

    let spawned = command.spawn();
    // Releases everything the command holds, including descriptors owned
    // by its pre-exec hook.
    drop(command);
    let mut child = spawned.map_err(on_spawn_error)?;
    interrupt.attach_child(child.id());
    tracing::debug!(pid = child.id(), program = %program, "process started");

    let pumps = match stdio {
        StdioMode::Inherit => Vec::new(),
        StdioMode::Piped(piped) => start_pumps(&mut child, piped),
    };
    let status = child.wait();
    interrupt.detach_child();
    let status = status.map_err(|e| EngineError::SpawnFailed {
        command: program.clone(),
        reason: format!("wait failed: {e}"),
    })?;
    for pump in pumps {
        match pump.join() {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "output stream copy failed"),
            Err(_) => tracing::warn!("output stream pump panicked"),
        }
    }

    let result = decode_status(status);
    tracing::debug!(
        code = result.code,
        signal = ?result.signal,
        program = %program,
        "process exited"
    );
    Ok(result)
}

/// Starts one copy thread per stream. Returns the output pumps; the stdin
/// pump is detached since its source may never reach end-of-file.
fn start_pumps(child: &mut Child, piped: PipedStdio) -> Vec<JoinHandle<io::Result<u64>>> {
    let PipedStdio {
        stdin,
        mut stdout,
        mut stderr,
    } = piped;
    if let (Some(mut source), Some(mut sink)) = (stdin, child.stdin.take()) {
        let _ = std::thread::spawn(move || {
            let copied = io::copy(&mut source, &mut sink);
            drop(sink);
            copied
        });
    }
    let mut pumps = Vec::with_capacity(2);
    if let Some(mut out) = child.stdout.take() {
        pumps.push(std::thread::spawn(move || {
            let copied = io::copy(&mut out, &mut stdout)?;
            stdout.flush()?;
            Ok(copied)
        }));
    }
    if let Some(mut err) = child.stderr.take() {
        pumps.push(std::thread::spawn(move || {
            let copied = io::copy(&mut err, &mut stderr)?;
            stderr.flush()?;
            Ok(copied)
        }));
    }
    pumps
}

/// Converts a wait status into an [`ExitResult`].
#[must_use]
pub fn decode_status(status: ExitStatus) -> ExitResult {
    if let Some(code) = status.code() {
        ExitResult::exited(code)
    } else if let Some(signal) = status.signal() {
        ExitResult::signaled(signal)
    } else {
        ExitResult::engine_failure()
    }
}

fn spawn_error(program: &str, e: &io::Error) -> EngineError {
    if e.kind() == io::ErrorKind::NotFound {
        EngineError::CommandNotFound {
            command: program.to_string(),
        }
    } else {
        EngineError::SpawnFailed {
            command: program.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Writes a stage byte to the report pipe. Async-signal-safe.
fn report_stage(fd: RawFd, stage: u8) {
    // SAFETY: writes one byte from a live stack buffer to an open fd.
    let _ = unsafe { libc::write(fd, (&raw const stage).cast(), 1) };
}

/// Reads the stage byte written by a failed child, if any.
fn read_stage(mut report: File) -> Option<u8> {
    let mut buf = [0u8; 1];
    match report.read(&mut buf) {
        Ok(1) => Some(buf[0]),
        _ => None,
    }
}

/// Launches contained processes from a [`Ready`] environment.
#[derive(Debug, Clone)]
pub struct Launcher {
    config: EngineConfig,
    interrupt: Interrupt,
}

impl Launcher {
    /// Creates a launcher.
    #[must_use]
    pub const fn new(config: EngineConfig, interrupt: Interrupt) -> Self {
        Self { config, interrupt }
    }

    /// Runs `request`'s command in `ready` and tears the environment down
    /// once the process has exited.
    ///
    /// # Errors
    ///
    /// Returns an execution error if the command cannot be resolved or
    /// started, or [`EngineError::PrivilegeDrop`] if the credential
    /// transition failed in the child.
    pub fn launch(
        &self,
        ready: Ready,
        request: &ExecutionRequest,
        stdio: StdioMode,
    ) -> Result<ExitResult> {
        let options = &request.options;
        let shell = options
            .shell
            .clone()
            .unwrap_or_else(|| self.config.default_shell.clone());
        let context = ready.context();
        let argv = resolve_command(request.action, &request.command, context, ready.root(), &shell)?;
        let cwd = resolve_cwd(options.target_pwd.as_deref(), context, ready.root())?;
        let env = build_environment(std::env::vars(), options.clean_env, context);

        let (program, args) = argv.split_first().ok_or(EngineError::EmptyCommand)?;
        let (report_read, report_write) = pipe2(OFlag::O_CLOEXEC).map_err(|e| {
            EngineError::SpawnFailed {
                command: program.clone(),
                reason: format!("report pipe: {e}"),
            }
        })?;

        let entry = ready.root_entry(cwd.clone());
        let with_init = entry.mount_proc;
        let transition = ready.privilege().transition().clone();
        let mut command = Command::new(program);
        let _ = command.args(args).env_clear().envs(env);
        // SAFETY: the hook runs in the forked child and only performs
        // system calls on data prepared in the parent. The engine's only
        // other threads are created after this fork.
        unsafe {
            let _ = command.pre_exec(move || {
                let fd = report_write.as_raw_fd();
                entry.enter().inspect_err(|_| report_stage(fd, STAGE_ROOT))?;
                transition
                    .apply()
                    .inspect_err(|_| report_stage(fd, STAGE_PRIVILEGE))?;
                if with_init {
                    pid::fork_init().inspect_err(|_| report_stage(fd, STAGE_INIT))?;
                }
                Ok(())
            });
        }

        tracing::info!(
            command = %program,
            cwd = %cwd.display(),
            uid = ready.privilege().effective_uid(),
            phase = %ready.privilege().phase(),
            "launching contained process"
        );
        let root = ready.root().to_path_buf();
        let report = File::from(report_read);
        let result = run_with(command, stdio, &self.interrupt, |e| match read_stage(report) {
            Some(STAGE_PRIVILEGE) => EngineError::PrivilegeDrop {
                reason: e.to_string(),
            },
            Some(STAGE_INIT) => EngineError::NamespaceCreation {
                namespace: "pid",
                reason: format!("starting init: {e}"),
            },
            Some(STAGE_ROOT) => EngineError::MountFailed {
                target: root,
                reason: format!("entering root: {e}"),
            },
            _ => spawn_error(program, &e),
        });
        ready.teardown();
        result
    }
}
