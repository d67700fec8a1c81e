//! Engine error taxonomy.
//!
//! Every failure the engine can report is a variant of [`EngineError`].
//! Variants are grouped into an [`ErrorClass`] which decides how far an
//! invocation got before failing and what had to be unwound.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Coarse classification of engine failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Detected before any privileged action; no side effects.
    Configuration,
    /// Namespace creation or privilege drop failed; always fatal.
    Privilege,
    /// A mount or loop attach failed; applied mounts are unwound.
    Mount,
    /// The command or run-script could not be started.
    Execution,
    /// Host I/O outside of the categories above.
    System,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Privilege => write!(f, "privilege"),
            Self::Mount => write!(f, "mount"),
            Self::Execution => write!(f, "execution"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A bind source does not exist on the host.
    #[error("bind source not found: {}", path.display())]
    InvalidBind {
        /// Host path that was requested as a bind source.
        path: PathBuf,
    },

    /// The requested home source does not exist on the host.
    #[error("home directory source not found: {}", path.display())]
    InvalidHome {
        /// Host path that was requested as home source.
        path: PathBuf,
    },

    /// An overlay path is missing or cannot be inspected.
    #[error("invalid overlay {}: {reason}", path.display())]
    InvalidOverlay {
        /// Overlay path as given.
        path: PathBuf,
        /// Why the overlay was rejected.
        reason: String,
    },

    /// The overlay is neither a directory, an ext3 image nor a squashfs image.
    #[error("unsupported overlay backing: {}", path.display())]
    UnsupportedOverlayBacking {
        /// Overlay path as given.
        path: PathBuf,
    },

    /// The requested SCIF app does not exist in the image.
    #[error("app not found: no app named '{name}' in this image")]
    AppNotFound {
        /// Requested app name.
        name: String,
    },

    /// The requested working directory does not exist.
    #[error("workdir not found: {}", path.display())]
    WorkdirNotFound {
        /// Host path of the missing workdir.
        path: PathBuf,
    },

    /// A security module name is not recognized.
    #[error("unknown security module: {name}")]
    UnknownSecurityModule {
        /// Module specification as given.
        name: String,
    },

    /// A capability name is not recognized.
    #[error("unknown capability: {name}")]
    InvalidCapability {
        /// Capability name as given.
        name: String,
    },

    /// An option value is syntactically invalid.
    #[error("invalid {option} value '{value}': {reason}")]
    InvalidOption {
        /// Option name without dashes.
        option: &'static str,
        /// Offending value.
        value: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The image reference cannot be executed directly.
    #[error("unsupported image reference {reference}: pull the image to a local root filesystem first")]
    UnsupportedImage {
        /// Image reference as given.
        reference: String,
    },

    /// The local image root filesystem does not exist.
    #[error("image not found: {}", path.display())]
    ImageNotFound {
        /// Local image path.
        path: PathBuf,
    },

    /// A configuration file or value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// The operation cannot be performed inside a user namespace.
    #[error("operation not supported in a user namespace: {operation}")]
    UserNamespaceUnsupportedOperation {
        /// Description of the rejected operation.
        operation: String,
    },

    /// Creating a namespace failed.
    #[error("{namespace} namespace creation failed: {reason}")]
    NamespaceCreation {
        /// Namespace kind (`mount`, `user`, `pid`).
        namespace: &'static str,
        /// Underlying failure.
        reason: String,
    },

    /// Dropping privileges before exec failed.
    #[error("privilege drop failed: {reason}")]
    PrivilegeDrop {
        /// Underlying failure.
        reason: String,
    },

    /// The caller lacks the privilege required for the request.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// Mounting an overlay layer or the overlay root failed.
    #[error("overlay mount failed for {}: {reason}", path.display())]
    OverlayMountFailed {
        /// Overlay path or mount point.
        path: PathBuf,
        /// Underlying failure.
        reason: String,
    },

    /// Attaching an image file to a loop device failed.
    #[error("loop attach failed for {}: {reason}", path.display())]
    LoopAttach {
        /// Image file path.
        path: PathBuf,
        /// Underlying failure.
        reason: String,
    },

    /// A bind, proc, or tmpfs mount failed.
    #[error("mount failed at {}: {reason}", target.display())]
    MountFailed {
        /// Mount target on the host.
        target: PathBuf,
        /// Underlying failure.
        reason: String,
    },

    /// `exec` was requested without a command.
    #[error("no command given: exec requires a command to run")]
    EmptyCommand,

    /// The command could not be found inside the container.
    #[error("command not found in container: {command}")]
    CommandNotFound {
        /// Command as given.
        command: String,
    },

    /// The command exists but could not be started.
    #[error("failed to start {command}: {reason}")]
    SpawnFailed {
        /// Command as given.
        command: String,
        /// Underlying failure.
        reason: String,
    },

    /// An app was selected for `run` but ships no run-script.
    #[error("run-script missing: {}", path.display())]
    RunScriptMissing {
        /// Container path of the expected run-script.
        path: PathBuf,
    },

    /// The requested working directory does not exist inside the container.
    #[error("target working directory not found in container: {}", path.display())]
    PwdNotFound {
        /// Container path requested with `--pwd`.
        path: PathBuf,
    },

    /// The invocation was interrupted before the command started.
    #[error("interrupted before the command started")]
    Interrupted,

    /// An I/O operation failed.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl EngineError {
    /// Returns the class this error belongs to.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidBind { .. }
            | Self::InvalidHome { .. }
            | Self::InvalidOverlay { .. }
            | Self::UnsupportedOverlayBacking { .. }
            | Self::AppNotFound { .. }
            | Self::WorkdirNotFound { .. }
            | Self::UnknownSecurityModule { .. }
            | Self::InvalidCapability { .. }
            | Self::InvalidOption { .. }
            | Self::UnsupportedImage { .. }
            | Self::ImageNotFound { .. }
            | Self::Config { .. }
            | Self::UserNamespaceUnsupportedOperation { .. }
            | Self::Serialization { .. } => ErrorClass::Configuration,
            Self::NamespaceCreation { .. }
            | Self::PrivilegeDrop { .. }
            | Self::PermissionDenied { .. } => ErrorClass::Privilege,
            Self::OverlayMountFailed { .. } | Self::LoopAttach { .. } | Self::MountFailed { .. } => {
                ErrorClass::Mount
            }
            Self::EmptyCommand
            | Self::CommandNotFound { .. }
            | Self::SpawnFailed { .. }
            | Self::RunScriptMissing { .. }
            | Self::PwdNotFound { .. }
            | Self::Interrupted => ErrorClass::Execution,
            Self::Io { .. } => ErrorClass::System,
        }
    }

    /// Builds an [`EngineError::Io`] for `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, EngineError>;
