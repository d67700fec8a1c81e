//! User namespace isolation.
//!
//! Lets an unprivileged caller perform mounts inside a namespace it owns,
//! while the contained process keeps the caller's identity.

use std::fs;
use std::path::Path;

use strata_common::error::{EngineError, Result};

/// Directory listing one entry per thread of the calling process.
const TASK_DIR: &str = "/proc/self/task";

/// Creates a new user namespace for the calling process.
///
/// The calling process gains full capabilities within the new namespace,
/// regardless of its privileges in the parent namespace. The kernel only
/// allows this from a single-threaded process, so the thread count is
/// checked first to report that instead of a bare `EINVAL`.
///
/// # Errors
///
/// Returns an error if the calling process has more than one thread or the
/// `unshare(CLONE_NEWUSER)` syscall fails.
pub fn create_user_namespace() -> Result<()> {
    use nix::sched::{CloneFlags, unshare};

    if let Some(threads) = thread_count() {
        single_threaded(threads)?;
    }
    unshare(CloneFlags::CLONE_NEWUSER).map_err(|e| EngineError::NamespaceCreation {
        namespace: "user",
        reason: e.to_string(),
    })?;
    tracing::debug!("user namespace created");
    Ok(())
}

/// Number of threads in the calling process, if `/proc` is readable.
fn thread_count() -> Option<usize> {
    fs::read_dir(TASK_DIR).ok().map(Iterator::count)
}

/// Rejects a multithreaded caller, which `unshare(CLONE_NEWUSER)` refuses.
fn single_threaded(threads: usize) -> Result<()> {
    if threads > 1 {
        return Err(EngineError::NamespaceCreation {
            namespace: "user",
            reason: format!(
                "the calling process has {threads} threads; a user namespace can only \
                 be created by a single-threaded process"
            ),
        });
    }
    Ok(())
}

/// Formats a single-entry identity map line.
#[must_use]
pub fn id_map_line(inside: u32, outside: u32) -> String {
    format!("{inside} {outside} 1")
}

/// Maps `uid`/`gid` to themselves inside the current user namespace.
///
/// Denies `setgroups` first, which unprivileged callers must do before
/// writing a gid map.
///
/// # Errors
///
/// Returns an error if writing to `/proc/self/setgroups`,
/// `/proc/self/uid_map`, or `/proc/self/gid_map` fails.
pub fn write_id_maps(uid: u32, gid: u32) -> Result<()> {
    let setgroups_path = Path::new("/proc/self/setgroups");
    if setgroups_path.exists() {
        fs::write(setgroups_path, "deny").map_err(|e| EngineError::io(setgroups_path, e))?;
    }

    let uid_map_path = Path::new("/proc/self/uid_map");
    fs::write(uid_map_path, id_map_line(uid, uid))
        .map_err(|e| EngineError::io(uid_map_path, e))?;

    let gid_map_path = Path::new("/proc/self/gid_map");
    fs::write(gid_map_path, id_map_line(gid, gid))
        .map_err(|e| EngineError::io(gid_map_path, e))?;

    tracing::debug!(uid, gid, "wrote identity maps");
    Ok(())
}
