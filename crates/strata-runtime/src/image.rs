//! Image metadata read from the image root.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use strata_common::constants::{IMAGE_LABELS, IMAGE_RUNSCRIPT, WORKDIR_LABEL};
use strata_core::filesystem::root::host_path;

/// Metadata an image carries alongside its root filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageMetadata {
    /// Metadata directory as a container path.
    pub dir: PathBuf,
    /// Default working directory declared by the image labels.
    pub default_pwd: Option<PathBuf>,
}

impl ImageMetadata {
    /// Reads the metadata of the image rooted at `image_root`.
    ///
    /// Missing or unreadable labels leave the defaults in place.
    #[must_use]
    pub fn load(image_root: &Path, metadata_dir: &Path) -> Self {
        let dir = Path::new("/").join(metadata_dir);
        let labels_path = host_path(image_root, &dir.join(IMAGE_LABELS));
        let default_pwd = match std::fs::read_to_string(&labels_path) {
            Ok(content) => parse_workdir(&content),
            Err(_) => None,
        };
        Self { dir, default_pwd }
    }

    /// Container path of the image run-script.
    #[must_use]
    pub fn run_script(&self) -> PathBuf {
        self.dir.join(IMAGE_RUNSCRIPT)
    }
}

fn parse_workdir(content: &str) -> Option<PathBuf> {
    let labels: HashMap<String, serde_json::Value> = match serde_json::from_str(content) {
        Ok(labels) => labels,
        Err(e) => {
            tracing::warn!(error = %e, "ignoring malformed image labels");
            return None;
        }
    };
    labels
        .get(WORKDIR_LABEL)
        .and_then(serde_json::Value::as_str)
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_with_labels(labels: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        let meta = dir.path().join(".singularity.d");
        std::fs::create_dir_all(&meta).expect("mkdir");
        std::fs::write(meta.join("labels.json"), labels).expect("write");
        dir
    }

    #[test]
    fn workdir_label_becomes_default_pwd() {
        let image = image_with_labels(r#"{"org.opencontainers.image.workdir": "/opt/app"}"#);
        let meta = ImageMetadata::load(image.path(), Path::new(".singularity.d"));
        assert_eq!(meta.default_pwd, Some(PathBuf::from("/opt/app")));
        assert_eq!(
            meta.run_script(),
            PathBuf::from("/.singularity.d/runscript")
        );
    }

    #[test]
    fn malformed_or_relative_labels_are_ignored() {
        let image = image_with_labels("not json");
        let meta = ImageMetadata::load(image.path(), Path::new(".singularity.d"));
        assert_eq!(meta.default_pwd, None);

        let image = image_with_labels(r#"{"org.opencontainers.image.workdir": "relative"}"#);
        let meta = ImageMetadata::load(image.path(), Path::new(".singularity.d"));
        assert_eq!(meta.default_pwd, None);
    }

    #[test]
    fn image_without_metadata_has_defaults() {
        let image = tempfile::tempdir().expect("tempdir");
        let meta = ImageMetadata::load(image.path(), Path::new(".singularity.d"));
        assert_eq!(meta.default_pwd, None);
    }
}
