//! Global configuration model for the strata engine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Root configuration for the engine.
///
/// Every field has a default so a partial file is valid.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Parent directory for per-invocation session directories.
    pub session_dir: PathBuf,
    /// Shell used by `shell` and by `run` when the image has no run-script.
    pub default_shell: PathBuf,
    /// Provide `/proc` inside the container.
    pub mount_proc: bool,
    /// Provide `/sys` inside the container.
    pub mount_sys: bool,
    /// Provide `/dev` inside the container.
    pub mount_dev: bool,
    /// Bind host `/tmp` and `/var/tmp` when not contained.
    pub bind_tmp: bool,
    /// Set `no_new_privs` on the contained process when dropping privileges.
    pub no_new_privs: bool,
    /// Image metadata directory, relative to the image root.
    pub image_metadata_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_dir: crate::constants::session_dir().clone(),
            default_shell: PathBuf::from(crate::constants::DEFAULT_SHELL),
            mount_proc: true,
            mount_sys: true,
            mount_dev: true,
            bind_tmp: true,
            no_new_privs: true,
            image_metadata_dir: PathBuf::from(crate::constants::IMAGE_METADATA_DIR),
        }
    }
}

impl EngineConfig {
    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a path
    /// field has the wrong form.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Checks the path fields for the shape the engine relies on.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] describing the first bad field.
    pub fn validate(&self) -> Result<()> {
        if !self.default_shell.is_absolute() {
            return Err(EngineError::Config {
                message: format!(
                    "default_shell must be absolute: {}",
                    self.default_shell.display()
                ),
            });
        }
        if self.image_metadata_dir.is_absolute() {
            return Err(EngineError::Config {
                message: format!(
                    "image_metadata_dir must be relative to the image root: {}",
                    self.image_metadata_dir.display()
                ),
            });
        }
        Ok(())
    }
}
