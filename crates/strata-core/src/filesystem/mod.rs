//! Filesystem management for container isolation.
//!
//! Provides the mount table of one invocation, `OverlayFS` stacking,
//! loop-attached images, and entering the assembled root.

pub mod loopdev;
pub mod mount;
pub mod overlayfs;
pub mod root;
