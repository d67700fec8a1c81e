//! Entering the assembled container root.
//!
//! Runs in the forked child, before the privilege drop: the child is
//! single-threaded and still holds the capabilities needed for `chroot(2)`
//! and for mounting `/proc` in a new PID namespace.

use std::path::{Path, PathBuf};

use nix::mount::{MsFlags, mount};
use nix::unistd::{chdir, chroot};

/// Where and how the child enters the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootEntry {
    /// Host path of the assembled root.
    pub root: PathBuf,
    /// Working directory inside the container.
    pub cwd: PathBuf,
    /// Mount a fresh `/proc` after entering (new PID namespace).
    pub mount_proc: bool,
}

impl RootEntry {
    /// Changes the root of the calling process and its working directory.
    ///
    /// # Errors
    ///
    /// Returns the failing syscall's error.
    pub fn enter(&self) -> std::io::Result<()> {
        chroot(self.root.as_path())?;
        chdir("/")?;
        if self.mount_proc {
            mount(
                Some("proc"),
                "/proc",
                Some("proc"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                None::<&str>,
            )?;
        }
        chdir(self.cwd.as_path())?;
        Ok(())
    }
}

/// Maps a container path to its location under the assembled root on the
/// host.
#[must_use]
pub fn host_path(root: &Path, container_path: &Path) -> PathBuf {
    container_path
        .strip_prefix("/")
        .map_or_else(|_| root.join(container_path), |rel| root.join(rel))
}
