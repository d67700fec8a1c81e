//! PID namespace isolation.
//!
//! Provides the contained process with its own process ID space. The first
//! process of that space is a minimal init, because PID 1 ignores every
//! signal it has no handler for and the command would otherwise be
//! impossible to interrupt.

use std::sync::atomic::{AtomicI32, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{
    SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, sigaction, sigprocmask,
};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use strata_common::constants::SIGNAL_EXIT_OFFSET;
use strata_common::error::{EngineError, Result};

use crate::privilege::SetupPrivilege;

/// Signals the init relays to the command.
const RELAYED: [Signal; 6] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGQUIT,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

/// Pid of the command, as seen by the init.
static COMMAND_PID: AtomicI32 = AtomicI32::new(0);

/// Creates a new PID namespace for the children of the calling process.
///
/// After a successful call, the next `fork(2)` child will see itself as
/// PID 1 inside the new namespace. The caller itself stays in its
/// original PID namespace.
///
/// # Errors
///
/// Returns an error if the `unshare(CLONE_NEWPID)` syscall fails.
pub fn create_pid_namespace(_privilege: &SetupPrivilege) -> Result<()> {
    use nix::sched::{CloneFlags, unshare};

    unshare(CloneFlags::CLONE_NEWPID).map_err(|e| EngineError::NamespaceCreation {
        namespace: "pid",
        reason: e.to_string(),
    })?;
    tracing::debug!("PID namespace created");
    Ok(())
}

/// Splits the calling process into an init and the command.
///
/// Meant for the `pre_exec` hook of the first process of a new PID
/// namespace. Returns in the forked child, which goes on to exec the
/// command. The calling process stays behind as init: it relays signals
/// to the command, reaps orphans, and exits with the command's exit code,
/// or 128+N if signal N killed it. In that process this never returns.
///
/// # Errors
///
/// Returns an error if the signal mask cannot be changed or `fork(2)`
/// fails.
pub fn fork_init() -> std::io::Result<()> {
    let mut relayed = SigSet::empty();
    for signal in RELAYED {
        relayed.add(signal);
    }
    let mut previous = SigSet::empty();
    // Blocked across the fork so nothing arrives before the init's
    // handlers exist; pending signals are delivered once it unblocks.
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&relayed), Some(&mut previous))?;
    // SAFETY: the caller runs between fork and exec with a single thread.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
            for signal in RELAYED {
                // SAFETY: restoring the default disposition installs no code.
                let _ = unsafe { sigaction(signal, &default) }?;
            }
            sigprocmask(SigmaskHow::SIG_SETMASK, Some(&previous), None)?;
            Ok(())
        }
        Ok(ForkResult::Parent { child }) => run_init(child, &relayed),
        Err(e) => {
            let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&previous), None);
            Err(e.into())
        }
    }
}

extern "C" fn relay(signal: libc::c_int) {
    let pid = COMMAND_PID.load(Ordering::SeqCst);
    if pid > 0 {
        // SAFETY: kill(2) is async-signal-safe.
        let _ = unsafe { libc::kill(pid, signal) };
    }
}

fn run_init(command: Pid, relayed: &SigSet) -> ! {
    COMMAND_PID.store(command.as_raw(), Ordering::SeqCst);
    let action = SigAction::new(
        SigHandler::Handler(relay),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in RELAYED {
        // SAFETY: `relay` only loads an atomic and calls kill(2).
        let _ = unsafe { sigaction(signal, &action) };
    }
    let _ = sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(relayed), None);
    // The command holds the descriptors it needs; the init keeping the
    // spawner's exec-status pipe open would stall the engine.
    close_inherited_fds();

    let code = loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(WaitStatus::Exited(pid, code)) if pid == command => break code,
            Ok(WaitStatus::Signaled(pid, signal, _)) if pid == command => {
                break SIGNAL_EXIT_OFFSET + signal as i32;
            }
            Ok(_) | Err(Errno::EINTR) => {}
            Err(_) => break 1,
        }
    };
    // SAFETY: `_exit` terminates the process immediately; nix 0.31 no longer wraps it.
    unsafe { libc::_exit(code) }
}

/// Closes every descriptor above stderr. Async-signal-safe.
fn close_inherited_fds() {
    const FIRST_FD: libc::c_uint = 3;
    // SAFETY: close_range(2) and close(2) take plain integers.
    unsafe {
        if libc::syscall(libc::SYS_close_range, FIRST_FD, libc::c_uint::MAX, 0_u32) == 0 {
            return;
        }
        for fd in 3..1024 {
            let _ = libc::close(fd);
        }
    }
}
