//! Overlay stack resolution.
//!
//! Classifies each `--overlay` argument by its backing storage and, once
//! image layers are mounted, composes the final `OverlayFS` stack over the
//! image root.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use strata_common::error::{EngineError, Result};
use strata_common::types::{OverlayBacking, OverlaySpec};
use strata_core::filesystem::overlayfs::OverlayConfig;

use crate::plan::{MountKind, MountOp, MountSource};

const SQUASHFS_MAGIC: &[u8; 4] = b"hsqs";
const EXT_MAGIC_OFFSET: u64 = 1080;
const EXT_MAGIC: [u8; 2] = [0x53, 0xEF];

const SQUASHFS_EXTENSIONS: &[&str] = &["sqfs", "squashfs", "sqsh", "simg"];
const EXT3_EXTENSIONS: &[&str] = &["img", "ext3"];

/// Sub-directories of a writable layer.
const UPPER_DIR: &str = "upper";
const WORK_DIR: &str = "work";

/// Determines what kind of storage backs an overlay path.
///
/// Directories are used as-is. Files are identified by their filesystem
/// magic first and by extension second.
///
/// # Errors
///
/// Returns [`EngineError::InvalidOverlay`] if the path does not exist and
/// [`EngineError::UnsupportedOverlayBacking`] for an unrecognized file.
pub fn detect_backing(path: &Path) -> Result<OverlayBacking> {
    let metadata = std::fs::metadata(path).map_err(|e| EngineError::InvalidOverlay {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if metadata.is_dir() {
        return Ok(OverlayBacking::Directory);
    }
    if !metadata.is_file() {
        return Err(EngineError::UnsupportedOverlayBacking {
            path: path.to_path_buf(),
        });
    }

    let mut file = File::open(path).map_err(|e| EngineError::io(path, e))?;
    if has_magic(&mut file, 0, SQUASHFS_MAGIC) {
        return Ok(OverlayBacking::SquashfsImage);
    }
    if has_magic(&mut file, EXT_MAGIC_OFFSET, &EXT_MAGIC) {
        return Ok(OverlayBacking::Ext3Image);
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if SQUASHFS_EXTENSIONS.contains(&extension.as_str()) {
        Ok(OverlayBacking::SquashfsImage)
    } else if EXT3_EXTENSIONS.contains(&extension.as_str()) {
        Ok(OverlayBacking::Ext3Image)
    } else {
        Err(EngineError::UnsupportedOverlayBacking {
            path: path.to_path_buf(),
        })
    }
}

fn has_magic(file: &mut File, offset: u64, magic: &[u8]) -> bool {
    let mut buf = vec![0u8; magic.len()];
    file.seek(SeekFrom::Start(offset)).is_ok() && file.read_exact(&mut buf).is_ok() && buf == magic
}

/// Turns overlay specifications into layer mount operations, preserving
/// their order (lowest priority first).
///
/// Squashfs layers are always read-only, with or without `:ro`.
///
/// # Errors
///
/// Returns the first backing detection error.
pub fn resolve(specs: &[OverlaySpec]) -> Result<Vec<MountOp>> {
    specs
        .iter()
        .map(|spec| {
            let backing = detect_backing(&spec.path)?;
            let read_only = spec.read_only || backing == OverlayBacking::SquashfsImage;
            if read_only && !spec.read_only {
                tracing::debug!(
                    path = %spec.path.display(),
                    "squashfs overlay is read-only"
                );
            }
            Ok(MountOp {
                kind: MountKind::OverlayLayer,
                source: MountSource::Layer {
                    path: spec.path.clone(),
                    backing,
                },
                target: PathBuf::from("/"),
                read_only,
            })
        })
        .collect()
}

/// An overlay layer available as a host directory: either the overlay
/// directory itself or the mount point of its image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDir {
    /// Host directory holding the layer.
    pub dir: PathBuf,
    /// Storage the layer came from.
    pub backing: OverlayBacking,
    /// Whether the layer must not receive writes.
    pub read_only: bool,
}

impl LayerDir {
    /// Directory whose contents the layer contributes as a lower layer.
    ///
    /// A layer previously used as a writable overlay keeps its files in
    /// `upper/`; any other layer contributes its root.
    #[must_use]
    pub fn content_dir(&self) -> PathBuf {
        let upper = self.dir.join(UPPER_DIR);
        if self.backing != OverlayBacking::SquashfsImage && upper.is_dir() {
            upper
        } else {
            self.dir.clone()
        }
    }
}

/// Final root filesystem stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayStack {
    /// Mount configuration for the merged root.
    pub config: OverlayConfig,
    /// No writable overlay was requested: the root is remounted read-only
    /// once every mount point exists.
    pub read_only_root: bool,
}

/// Composes the root stack from the image root and the layers in request
/// order.
///
/// `OverlayFS` accepts a single upper directory, so the last writable
/// layer becomes the upper layer and every other layer is stacked read-only
/// in request order above the image root. Without a writable layer the
/// `scratch` directory provides a session-scoped upper layer.
#[must_use]
pub fn compose(
    image_root: &Path,
    layers: &[LayerDir],
    scratch: &Path,
    merged: &Path,
    userxattr: bool,
) -> OverlayStack {
    let writable = layers.iter().rposition(|layer| !layer.read_only);
    let mut lower_dirs = vec![image_root.to_path_buf()];
    lower_dirs.extend(
        layers
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != writable)
            .map(|(_, layer)| layer.content_dir()),
    );
    let upper_base = writable.map_or(scratch, |i| layers[i].dir.as_path());
    if let Some(i) = writable {
        tracing::debug!(upper = %layers[i].dir.display(), "writable overlay selected");
    }
    OverlayStack {
        config: OverlayConfig {
            lower_dirs,
            upper_dir: upper_base.join(UPPER_DIR),
            work_dir: upper_base.join(WORK_DIR),
            merged_dir: merged.to_path_buf(),
            userxattr,
        },
        read_only_root: writable.is_none(),
    }
}
