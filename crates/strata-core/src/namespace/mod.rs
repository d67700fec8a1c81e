//! Linux namespace management for container isolation.
//!
//! Provides safe wrappers around `unshare(2)` for the namespaces an
//! invocation may create, and the identity maps of a user namespace.

pub mod mount;
pub mod pid;
pub mod user;

use strata_common::error::Result;

use crate::privilege::{Identity, SetupPrivilege};

/// Which namespaces to create for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// Isolate the user namespace.
    pub user: bool,
    /// Isolate the PID namespace.
    pub pid: bool,
}

/// Creates the user namespace, if configured, and maps `identity` to
/// itself inside it.
///
/// This is the only namespace an unprivileged caller can create; it must
/// come before [`SetupPrivilege::capture`].
///
/// # Errors
///
/// Returns an error if `unshare(2)` or writing the identity maps fails.
pub fn enter_user_namespace(config: &NamespaceConfig, identity: &Identity) -> Result<()> {
    if !config.user {
        return Ok(());
    }
    user::create_user_namespace()?;
    user::write_id_maps(identity.uid, identity.gid)
}

/// Creates the private mount namespace and, if configured, the PID
/// namespace that the next child will be born into.
///
/// # Errors
///
/// Returns an error if any namespace creation syscall fails.
pub fn create_namespaces(privilege: &SetupPrivilege, config: &NamespaceConfig) -> Result<()> {
    tracing::info!(config = ?config, "creating namespaces");
    mount::create_mount_namespace(privilege)?;
    if config.pid {
        pid::create_pid_namespace(privilege)?;
    }
    Ok(())
}
