//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Default parent directory for per-invocation session directories when
/// running with root access.
pub const SYSTEM_SESSION_DIR: &str = "/var/lib/strata/sessions";

/// Returns the session directory, preferring the system path and falling
/// back to a per-user runtime directory when it cannot be created.
fn resolve_session_dir() -> PathBuf {
    let system = PathBuf::from(SYSTEM_SESSION_DIR);
    if std::fs::create_dir_all(&system).is_ok() {
        return system;
    }
    if let Ok(runtime) = std::env::var("XDG_RUNTIME_DIR") {
        let user_dir = PathBuf::from(runtime).join(APP_NAME);
        if std::fs::create_dir_all(&user_dir).is_ok() {
            return user_dir;
        }
    }
    std::env::temp_dir().join(APP_NAME)
}

static SESSION_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved session parent directory for this process.
pub fn session_dir() -> &'static PathBuf {
    SESSION_DIR.get_or_init(resolve_session_dir)
}

/// Directory holding every SCIF app inside an image.
pub const SCIF_APPS_DIR: &str = "/scif/apps";

/// Directory holding every SCIF app's data inside an image.
pub const SCIF_DATA_DIR: &str = "/scif/data";

/// Path of an app's run-script relative to its app root.
pub const SCIF_RUNSCRIPT: &str = "scif/runscript";

/// Image metadata directory, relative to the image root.
pub const IMAGE_METADATA_DIR: &str = ".singularity.d";

/// Image run-script file name inside the metadata directory.
pub const IMAGE_RUNSCRIPT: &str = "runscript";

/// Image label file name inside the metadata directory.
pub const IMAGE_LABELS: &str = "labels.json";

/// Label carrying the image-declared default working directory.
pub const WORKDIR_LABEL: &str = "org.opencontainers.image.workdir";

/// Shell used when none is configured.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// `PATH` given to the contained process when the caller has none.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Exit code reported for every engine-level failure.
pub const ENGINE_FAILURE_EXIT_CODE: i32 = 1;

/// Offset added to a signal number to form the exit code of a
/// signal-terminated process.
pub const SIGNAL_EXIT_OFFSET: i32 = 128;

/// Application name used in paths and log output.
pub const APP_NAME: &str = "strata";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "strata";
