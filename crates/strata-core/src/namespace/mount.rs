//! Mount namespace isolation.
//!
//! Gives the invocation its own mount table so nothing it mounts is
//! visible on the host, and nothing it unmounts affects the host.

use strata_common::error::{EngineError, Result};

use crate::privilege::SetupPrivilege;

/// Creates a new mount namespace for the calling process and makes every
/// mount in it private.
///
/// # Errors
///
/// Returns an error if `unshare(CLONE_NEWNS)` or the propagation change
/// fails.
pub fn create_mount_namespace(_privilege: &SetupPrivilege) -> Result<()> {
    use nix::mount::{MsFlags, mount};
    use nix::sched::{CloneFlags, unshare};

    unshare(CloneFlags::CLONE_NEWNS).map_err(|e| EngineError::NamespaceCreation {
        namespace: "mount",
        reason: e.to_string(),
    })?;
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| EngineError::NamespaceCreation {
        namespace: "mount",
        reason: format!("cannot make / private: {e}"),
    })?;
    tracing::debug!("mount namespace created");
    Ok(())
}
