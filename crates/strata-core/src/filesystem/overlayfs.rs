//! `OverlayFS` management for layered container filesystems.
//!
//! Stacks read-only lower layers under one writable upper layer, giving
//! copy-on-write semantics over an immutable image root.

use std::path::{Path, PathBuf};

use strata_common::error::{EngineError, Result};

use crate::privilege::SetupPrivilege;

/// Configuration for an `OverlayFS` mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayConfig {
    /// Read-only lower layers, bottom to top.
    pub lower_dirs: Vec<PathBuf>,
    /// Writable upper layer directory.
    pub upper_dir: PathBuf,
    /// Work directory required by `OverlayFS`, on the upper filesystem.
    pub work_dir: PathBuf,
    /// Final merged mount point.
    pub merged_dir: PathBuf,
    /// Use `user.*` xattrs, required inside a user namespace.
    pub userxattr: bool,
}

impl OverlayConfig {
    /// Builds the `mount(2)` data string.
    ///
    /// `lowerdir` lists the topmost layer first, which is the reverse of
    /// [`OverlayConfig::lower_dirs`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::OverlayMountFailed`] if there is no lower
    /// layer or a path contains a separator character.
    pub fn mount_data(&self) -> Result<String> {
        if self.lower_dirs.is_empty() {
            return Err(EngineError::OverlayMountFailed {
                path: self.merged_dir.clone(),
                reason: "no lower layer".into(),
            });
        }
        for path in self
            .lower_dirs
            .iter()
            .chain([&self.upper_dir, &self.work_dir])
        {
            check_separator_free(path)?;
        }
        let lowers = self
            .lower_dirs
            .iter()
            .rev()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        let mut data = format!(
            "lowerdir={},upperdir={},workdir={}",
            lowers,
            self.upper_dir.display(),
            self.work_dir.display()
        );
        if self.userxattr {
            data.push_str(",userxattr");
        }
        Ok(data)
    }
}

fn check_separator_free(path: &Path) -> Result<()> {
    let text = path.display().to_string();
    if text.contains(':') || text.contains(',') {
        return Err(EngineError::OverlayMountFailed {
            path: path.to_path_buf(),
            reason: "overlay layer paths cannot contain ':' or ','".into(),
        });
    }
    Ok(())
}

/// Mounts an `OverlayFS` with the given configuration.
///
/// Creates the upper, work, and merged directories if they do not exist,
/// then issues the `mount(2)` syscall with overlay-specific options.
///
/// # Errors
///
/// Returns an error if directory creation fails or if the mount syscall fails.
pub fn mount_overlay(_privilege: &SetupPrivilege, config: &OverlayConfig) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    for dir in [&config.upper_dir, &config.work_dir, &config.merged_dir] {
        std::fs::create_dir_all(dir).map_err(|e| EngineError::io(dir, e))?;
    }
    let opts = config.mount_data()?;

    mount(
        Some("overlay"),
        &config.merged_dir,
        Some("overlay"),
        MsFlags::empty(),
        Some(opts.as_str()),
    )
    .map_err(|e| EngineError::OverlayMountFailed {
        path: config.merged_dir.clone(),
        reason: e.to_string(),
    })?;

    tracing::info!(
        merged = %config.merged_dir.display(),
        layers = config.lower_dirs.len(),
        "overlayfs mounted"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(lowers: &[&str]) -> OverlayConfig {
        OverlayConfig {
            lower_dirs: lowers.iter().map(PathBuf::from).collect(),
            upper_dir: PathBuf::from("/s/upper"),
            work_dir: PathBuf::from("/s/work"),
            merged_dir: PathBuf::from("/s/root"),
            userxattr: false,
        }
    }

    #[test]
    fn lowerdir_lists_topmost_first() {
        let data = config(&["/image", "/layer1", "/layer2"])
            .mount_data()
            .expect("data");
        assert_eq!(
            data,
            "lowerdir=/layer2:/layer1:/image,upperdir=/s/upper,workdir=/s/work"
        );
    }

    #[test]
    fn userxattr_is_appended() {
        let mut cfg = config(&["/image"]);
        cfg.userxattr = true;
        assert!(cfg.mount_data().expect("data").ends_with(",userxattr"));
    }

    #[test]
    fn empty_lower_is_rejected() {
        assert!(config(&[]).mount_data().is_err());
    }

    #[test]
    fn separator_in_path_is_rejected() {
        assert!(config(&["/ima:ge"]).mount_data().is_err());
    }
}
