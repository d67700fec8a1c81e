//! Mount utilities for container filesystem setup.
//!
//! [`MountTable`] records every mount and loop device an invocation
//! creates and releases them in reverse order on every exit path.

use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sys::statvfs::{FsFlags, statvfs};
use strata_common::error::{EngineError, Result};
use strata_common::types::OverlayBacking;

use super::loopdev::LoopDevice;
use super::overlayfs::{self, OverlayConfig};
use crate::privilege::SetupPrivilege;

/// Options for a bind mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindOptions {
    /// Remount read-only.
    pub read_only: bool,
    /// Remount with `nosuid`.
    pub nosuid: bool,
}

/// Every mount and loop device created by one invocation.
#[derive(Debug, Default)]
pub struct MountTable {
    mounted: Vec<PathBuf>,
    loops: Vec<LoopDevice>,
}

impl MountTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mounts currently recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mounted.len()
    }

    /// Returns whether nothing is mounted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mounted.is_empty()
    }

    /// Mount targets in the order they were applied.
    #[must_use]
    pub fn targets(&self) -> &[PathBuf] {
        &self.mounted
    }

    /// Creates a recursive bind mount from `source` to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MountFailed`] if the `mount(2)` syscall fails.
    pub fn bind(
        &mut self,
        _privilege: &SetupPrivilege,
        source: &Path,
        target: &Path,
        options: BindOptions,
    ) -> Result<()> {
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| mount_failed(target, format!("bind from {}: {e}", source.display())))?;
        self.mounted.push(target.to_path_buf());

        if options.read_only || options.nosuid {
            let inherited = statvfs(target)
                .map_err(|e| mount_failed(target, format!("statvfs: {e}")))?
                .flags();
            let flags = remount_flags(inherited, options);
            mount(None::<&str>, target, None::<&str>, flags, None::<&str>)
                .map_err(|e| mount_failed(target, format!("remount bind: {e}")))?;
        }
        tracing::debug!(
            source = %source.display(),
            target = %target.display(),
            read_only = options.read_only,
            "bind mount created"
        );
        Ok(())
    }

    /// Mounts an in-memory filesystem at `target`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MountFailed`] if the `mount(2)` syscall fails.
    pub fn tmpfs(&mut self, _privilege: &SetupPrivilege, target: &Path, data: &str) -> Result<()> {
        mount(
            Some("tmpfs"),
            target,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some(data),
        )
        .map_err(|e| mount_failed(target, format!("tmpfs: {e}")))?;
        self.mounted.push(target.to_path_buf());
        tracing::debug!(target = %target.display(), data, "tmpfs mounted");
        Ok(())
    }

    /// Mounts a fresh `proc` filesystem at `target`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MountFailed`] if the `mount(2)` syscall fails.
    pub fn proc(&mut self, _privilege: &SetupPrivilege, target: &Path) -> Result<()> {
        mount(
            Some("proc"),
            target,
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            None::<&str>,
        )
        .map_err(|e| mount_failed(target, format!("proc: {e}")))?;
        self.mounted.push(target.to_path_buf());
        tracing::debug!(target = %target.display(), "proc mounted");
        Ok(())
    }

    /// Loop-attaches `image` and mounts its filesystem at `target`.
    ///
    /// A filesystem that does not match `backing` surfaces as
    /// [`EngineError::OverlayMountFailed`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::LoopAttach`] or
    /// [`EngineError::OverlayMountFailed`].
    pub fn image(
        &mut self,
        privilege: &SetupPrivilege,
        image: &Path,
        backing: OverlayBacking,
        target: &Path,
        read_only: bool,
    ) -> Result<()> {
        let Some(fstype) = backing.fstype() else {
            return Err(EngineError::UnsupportedOverlayBacking {
                path: image.to_path_buf(),
            });
        };
        let device = LoopDevice::attach(privilege, image, read_only)?;
        let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
        if read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        let result = mount(
            Some(device.path()),
            target,
            Some(fstype),
            flags,
            None::<&str>,
        );
        // Recorded before checking so the device is detached on failure.
        self.loops.push(device);
        result.map_err(|e| EngineError::OverlayMountFailed {
            path: image.to_path_buf(),
            reason: format!("mount as {fstype}: {e}"),
        })?;
        self.mounted.push(target.to_path_buf());
        tracing::info!(
            image = %image.display(),
            target = %target.display(),
            fstype,
            read_only,
            "image mounted"
        );
        Ok(())
    }

    /// Mounts an `OverlayFS` described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::OverlayMountFailed`] if the mount fails.
    pub fn overlay(&mut self, privilege: &SetupPrivilege, config: &OverlayConfig) -> Result<()> {
        overlayfs::mount_overlay(privilege, config)?;
        self.mounted.push(config.merged_dir.clone());
        Ok(())
    }

    /// Remounts an existing mount read-only.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MountFailed`] if the remount fails.
    pub fn remount_readonly(&self, _privilege: &SetupPrivilege, target: &Path) -> Result<()> {
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| mount_failed(target, format!("read-only remount: {e}")))?;
        tracing::debug!(target = %target.display(), "remounted read-only");
        Ok(())
    }

    /// Unmounts everything in reverse order, then detaches loop devices.
    ///
    /// Failures are logged, not returned, so teardown always runs to the
    /// end.
    pub fn unwind(&mut self) {
        if self.mounted.is_empty() && self.loops.is_empty() {
            return;
        }
        tracing::debug!(
            mounts = self.mounted.len(),
            loops = self.loops.len(),
            "unwinding mounts"
        );
        while let Some(target) = self.mounted.pop() {
            if let Err(e) = umount2(&target, MntFlags::MNT_DETACH) {
                tracing::warn!(target = %target.display(), error = %e, "unmount failed");
            }
        }
        while let Some(mut device) = self.loops.pop() {
            device.detach();
        }
    }
}

impl Drop for MountTable {
    fn drop(&mut self) {
        self.unwind();
    }
}

/// Creates the mount point for `target` matching the type of `source`:
/// an empty file for file sources, a directory otherwise.
///
/// # Errors
///
/// Returns an error if the mount point cannot be created.
pub fn prepare_mount_point(source_is_file: bool, target: &Path) -> Result<()> {
    if target.exists() {
        return Ok(());
    }
    if source_is_file {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
        }
        let _ = std::fs::File::create(target).map_err(|e| EngineError::io(target, e))?;
    } else {
        std::fs::create_dir_all(target).map_err(|e| EngineError::io(target, e))?;
    }
    Ok(())
}

/// Flags for the remount of a fresh bind whose mount currently carries
/// `inherited`.
///
/// A bind remount replaces every per-mount flag, so the source's
/// `nodev`/`noexec`/`nosuid`/`ro` and atime flags are carried over. Inside
/// a user namespace the kernel refuses to clear them.
#[must_use]
pub fn remount_flags(inherited: FsFlags, options: BindOptions) -> MsFlags {
    let mut flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT;
    let carried = [
        (FsFlags::ST_RDONLY, MsFlags::MS_RDONLY),
        (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
        (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
        (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
        (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
        (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
        (FsFlags::ST_RELATIME, MsFlags::MS_RELATIME),
    ];
    for (fs, ms) in carried {
        if inherited.contains(fs) {
            flags |= ms;
        }
    }
    if options.read_only {
        flags |= MsFlags::MS_RDONLY;
    }
    if options.nosuid {
        flags |= MsFlags::MS_NOSUID;
    }
    flags
}

fn mount_failed(target: &Path, reason: String) -> EngineError {
    EngineError::MountFailed {
        target: target.to_path_buf(),
        reason,
    }
}
