//! SCIF app resolution.
//!
//! Apps live at `/scif/apps/<name>` with data under `/scif/data/<name>`.
//! The image layout is trusted; only the app root's existence is checked.

use std::path::{Path, PathBuf};

use strata_common::constants::{SCIF_APPS_DIR, SCIF_DATA_DIR, SCIF_RUNSCRIPT};
use strata_common::error::{EngineError, Result};
use strata_common::types::ActionKind;
use strata_core::filesystem::root::host_path;

/// A named app inside an image. Paths are container paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDescriptor {
    /// App name.
    pub name: String,
    /// App root, `/scif/apps/<name>`.
    pub root: PathBuf,
    /// App data directory, `/scif/data/<name>`.
    pub data: PathBuf,
    /// Run-script used by `run --app`.
    pub run_script: PathBuf,
    /// Whether the app root exists in the image.
    pub exists: bool,
}

impl AppDescriptor {
    /// Executables of the app, prefixed to `PATH`.
    #[must_use]
    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    /// Libraries of the app, prefixed to `LD_LIBRARY_PATH`.
    #[must_use]
    pub fn lib_dir(&self) -> PathBuf {
        self.root.join("lib")
    }

    /// `SCIF_*` variables describing this app to the contained process.
    #[must_use]
    pub fn environment(&self) -> Vec<(String, String)> {
        let path = |p: &Path| p.display().to_string();
        vec![
            ("SCIF_APPS".into(), SCIF_APPS_DIR.into()),
            ("SCIF_DATA".into(), SCIF_DATA_DIR.into()),
            ("SCIF_APPNAME".into(), self.name.clone()),
            ("SCIF_APPROOT".into(), path(&self.root)),
            ("SCIF_APPBIN".into(), path(&self.bin_dir())),
            ("SCIF_APPLIB".into(), path(&self.lib_dir())),
            ("SCIF_APPMETA".into(), path(&self.root.join("scif"))),
            ("SCIF_APPRUN".into(), path(&self.run_script)),
            ("SCIF_APPDATA".into(), path(&self.data)),
            ("SCIF_APPINPUT".into(), path(&self.data.join("input"))),
            ("SCIF_APPOUTPUT".into(), path(&self.data.join("output"))),
        ]
    }
}

/// Looks up `name` in the image rooted at `image_root`.
///
/// The returned descriptor always describes where the app would live;
/// `exists` tells whether it does.
#[must_use]
pub fn describe(name: &str, image_root: &Path) -> AppDescriptor {
    let root = Path::new(SCIF_APPS_DIR).join(name);
    let exists = host_path(image_root, &root).is_dir();
    AppDescriptor {
        name: name.to_string(),
        run_script: root.join(SCIF_RUNSCRIPT),
        data: Path::new(SCIF_DATA_DIR).join(name),
        root,
        exists,
    }
}

/// Resolves the app an action runs in.
///
/// `action` does not change where the app lives; it is logged so that a
/// missing app is attributed to the command that asked for it.
///
/// # Errors
///
/// Returns [`EngineError::AppNotFound`] if the image has no such app.
pub fn resolve(name: &str, image_root: &Path, action: ActionKind) -> Result<AppDescriptor> {
    let app = describe(name, image_root);
    if !app.exists {
        tracing::debug!(app = name, action = %action, "app root missing from image");
        return Err(EngineError::AppNotFound {
            name: name.to_string(),
        });
    }
    tracing::debug!(app = name, root = %app.root.display(), "app resolved");
    Ok(app)
}
