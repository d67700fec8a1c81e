//! Request and option types describing one engine invocation.
//!
//! Values here are parsed from command-line text and validated eagerly, so
//! the engine never sees a half-checked option set.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Action requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    /// Execute the image (or app) run-script.
    Run,
    /// Execute an explicit command.
    Exec,
    /// Start an interactive shell.
    Shell,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run => write!(f, "run"),
            Self::Exec => write!(f, "exec"),
            Self::Shell => write!(f, "shell"),
        }
    }
}

impl FromStr for ActionKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "run" => Ok(Self::Run),
            "exec" => Ok(Self::Exec),
            "shell" => Ok(Self::Shell),
            other => Err(invalid("action", other, "expected run, exec or shell")),
        }
    }
}

/// Remote schemes recognized upstream of the engine.
const REMOTE_SCHEMES: &[&str] = &["docker", "library", "shub", "oras", "http", "https"];

/// Reference to the image an action runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    /// Local root filesystem directory.
    Local(PathBuf),
    /// Registry or library reference that must be pulled before use.
    Remote {
        /// URI scheme without `://`.
        scheme: String,
        /// Remainder of the reference.
        reference: String,
    },
}

impl ImageRef {
    /// Parses an image reference.
    ///
    /// `file://` URIs and plain paths are local; known registry schemes are
    /// remote.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnsupportedImage`] for an unknown scheme.
    pub fn parse(input: &str) -> Result<Self> {
        let Some((scheme, rest)) = input.split_once("://") else {
            return Ok(Self::Local(PathBuf::from(input)));
        };
        if scheme == "file" {
            return Ok(Self::Local(PathBuf::from(rest)));
        }
        if REMOTE_SCHEMES.contains(&scheme) {
            return Ok(Self::Remote {
                scheme: scheme.to_string(),
                reference: rest.to_string(),
            });
        }
        Err(EngineError::UnsupportedImage {
            reference: input.to_string(),
        })
    }

    /// Returns the local root filesystem path.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnsupportedImage`] for remote references and
    /// [`EngineError::ImageNotFound`] when the path is not a directory.
    pub fn into_local_root(self) -> Result<PathBuf> {
        match self {
            Self::Local(path) => {
                if path.is_dir() {
                    Ok(path)
                } else {
                    Err(EngineError::ImageNotFound { path })
                }
            }
            remote @ Self::Remote { .. } => Err(EngineError::UnsupportedImage {
                reference: remote.to_string(),
            }),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Remote { scheme, reference } => write!(f, "{scheme}://{reference}"),
        }
    }
}

/// A host path exposed inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindSpec {
    /// Host path.
    pub source: PathBuf,
    /// Container path; equals `source` when omitted.
    pub destination: PathBuf,
    /// Mount read-only.
    pub read_only: bool,
}

impl BindSpec {
    /// Parses a comma-separated list of `src[:dst[:ro|rw]]` entries.
    ///
    /// # Errors
    ///
    /// Returns an error if any entry is malformed.
    pub fn parse_list(input: &str) -> Result<Vec<Self>> {
        input
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for BindSpec {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        let source = match parts.next() {
            Some(src) if !src.is_empty() => PathBuf::from(src),
            _ => return Err(invalid("bind", s, "missing source path")),
        };
        let destination = match parts.next() {
            Some(dst) if !dst.is_empty() => PathBuf::from(dst),
            _ => source.clone(),
        };
        let read_only = match parts.next() {
            None | Some("rw") => false,
            Some("ro") => true,
            Some(other) => {
                return Err(invalid("bind", s, &format!("unknown bind option '{other}'")));
            }
        };
        if parts.next().is_some() {
            return Err(invalid("bind", s, "too many ':' separated fields"));
        }
        if !destination.is_absolute() {
            return Err(invalid("bind", s, "destination must be an absolute path"));
        }
        Ok(Self {
            source,
            destination,
            read_only,
        })
    }
}

/// Kind of storage backing an overlay layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OverlayBacking {
    /// Host directory.
    Directory,
    /// ext3 filesystem image, loop-attached.
    Ext3Image,
    /// squashfs image, loop-attached, always read-only.
    SquashfsImage,
}

impl OverlayBacking {
    /// Returns whether the backing needs a loop device.
    #[must_use]
    pub const fn is_image(self) -> bool {
        matches!(self, Self::Ext3Image | Self::SquashfsImage)
    }

    /// Filesystem type passed to `mount(2)` for image backings.
    #[must_use]
    pub const fn fstype(self) -> Option<&'static str> {
        match self {
            Self::Directory => None,
            Self::Ext3Image => Some("ext3"),
            Self::SquashfsImage => Some("squashfs"),
        }
    }
}

impl fmt::Display for OverlayBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory => write!(f, "directory"),
            Self::Ext3Image => write!(f, "ext3-image"),
            Self::SquashfsImage => write!(f, "squashfs-image"),
        }
    }
}

/// Overlay requested with `--overlay path[:ro]`.
///
/// The backing type is resolved once, from the file itself, when the
/// mount plan is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlaySpec {
    /// Directory or image file.
    pub path: PathBuf,
    /// Explicit `:ro` suffix.
    pub read_only: bool,
}

impl FromStr for OverlaySpec {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let (path, read_only) = if let Some(p) = s.strip_suffix(":ro") {
            (p, true)
        } else if let Some(p) = s.strip_suffix(":rw") {
            (p, false)
        } else {
            (s, false)
        };
        if path.is_empty() {
            return Err(invalid("overlay", s, "missing overlay path"));
        }
        Ok(Self {
            path: PathBuf::from(path),
            read_only,
        })
    }
}

/// Home directory requested with `--home src[:dst]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeSpec {
    /// Host directory.
    pub source: PathBuf,
    /// Container path; the invoking user's home path when omitted.
    pub destination: Option<PathBuf>,
}

impl FromStr for HomeSpec {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let (source, destination) = match s.split_once(':') {
            Some((src, dst)) => (src, Some(PathBuf::from(dst))),
            None => (s, None),
        };
        if source.is_empty() {
            return Err(invalid("home", s, "missing source path"));
        }
        if destination.as_deref().is_some_and(|d| !d.is_absolute()) {
            return Err(invalid("home", s, "destination must be an absolute path"));
        }
        Ok(Self {
            source: PathBuf::from(source),
            destination,
        })
    }
}

/// Environment-hardening module applied right before the privilege drop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityModule {
    /// `apparmor:<profile>`: confine the command under an `AppArmor` profile.
    AppArmor(String),
    /// `selinux:<context>`: run the command in an `SELinux` context.
    SeLinux(String),
    /// `uid:<n>`: run as this uid instead of the caller's (root only).
    Uid(u32),
    /// `gid:<n>`: run with this gid instead of the caller's (root only).
    Gid(u32),
}

impl FromStr for SecurityModule {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let unknown = || EngineError::UnknownSecurityModule {
            name: s.to_string(),
        };
        let (name, value) = s.split_once(':').ok_or_else(unknown)?;
        if value.is_empty() {
            return Err(invalid("security", s, "missing module argument"));
        }
        match name {
            "apparmor" => Ok(Self::AppArmor(value.to_string())),
            "selinux" => Ok(Self::SeLinux(value.to_string())),
            "uid" => value
                .parse()
                .map(Self::Uid)
                .map_err(|_| invalid("security", s, "uid must be a number")),
            "gid" => value
                .parse()
                .map(Self::Gid)
                .map_err(|_| invalid("security", s, "gid must be a number")),
            _ => Err(unknown()),
        }
    }
}

impl fmt::Display for SecurityModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AppArmor(profile) => write!(f, "apparmor:{profile}"),
            Self::SeLinux(context) => write!(f, "selinux:{context}"),
            Self::Uid(uid) => write!(f, "uid:{uid}"),
            Self::Gid(gid) => write!(f, "gid:{gid}"),
        }
    }
}

/// Parses a comma-separated capability list such as `CAP_NET_RAW,chown`.
///
/// Names are case-insensitive and the `CAP_` prefix is optional.
///
/// # Errors
///
/// Returns [`EngineError::InvalidCapability`] for the first unknown name.
pub fn parse_capabilities(list: &str) -> Result<Vec<caps::Capability>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|name| {
            let upper = name.to_ascii_uppercase();
            let full = if upper.starts_with("CAP_") {
                upper
            } else {
                format!("CAP_{upper}")
            };
            caps::Capability::from_str(&full).map_err(|_| EngineError::InvalidCapability {
                name: name.to_string(),
            })
        })
        .collect()
}

/// Every option recognized by the engine, with its default.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionSet {
    /// User bind mounts, in the order given.
    pub binds: Vec<BindSpec>,
    /// Overlays, lowest priority first.
    pub overlays: Vec<OverlaySpec>,
    /// Security modules, applied in order.
    pub security_modules: Vec<SecurityModule>,
    /// Comma-separated capabilities removed from the retained set.
    pub capability_drop: Option<String>,
    /// Retain elevated capabilities in the contained process.
    pub keep_privileges: bool,
    /// Do not share host home or temporary directories.
    pub contain_only: bool,
    /// Provide no home directory at all.
    pub no_home: bool,
    /// Explicit home directory.
    pub home: Option<HomeSpec>,
    /// Host directory backing `/tmp` and `/var/tmp` when contained.
    pub workdir: Option<PathBuf>,
    /// Working directory of the contained process.
    pub target_pwd: Option<PathBuf>,
    /// SCIF app to run in.
    pub app: Option<String>,
    /// Create a user namespace.
    pub use_user_namespace: bool,
    /// Create a PID namespace.
    pub pid_namespace: bool,
    /// Shell for `shell`; the configured default when absent.
    pub shell: Option<PathBuf>,
    /// Start the command with an empty environment.
    pub clean_env: bool,
}

impl OptionSet {
    /// Validates every option that can be checked without touching the
    /// host filesystem.
    ///
    /// # Errors
    ///
    /// Returns the first configuration error found.
    pub fn validate(&self) -> Result<()> {
        if let Some(pwd) = &self.target_pwd {
            if !pwd.is_absolute() {
                return Err(invalid(
                    "pwd",
                    &pwd.display().to_string(),
                    "must be an absolute path",
                ));
            }
        }
        if let Some(shell) = &self.shell {
            if !shell.is_absolute() {
                return Err(invalid(
                    "shell",
                    &shell.display().to_string(),
                    "must be an absolute path",
                ));
            }
        }
        if let Some(app) = &self.app {
            validate_app_name(app)?;
        }
        let _ = self.dropped_capabilities()?;
        if self.contain_only && self.home.is_some() && !self.no_home {
            tracing::warn!("--contain overrides --home: no host home will be bound");
        }
        Ok(())
    }

    /// Returns the parsed `capability_drop` list.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidCapability`] for an unknown name.
    pub fn dropped_capabilities(&self) -> Result<Vec<caps::Capability>> {
        self.capability_drop
            .as_deref()
            .map_or_else(|| Ok(Vec::new()), parse_capabilities)
    }
}

/// App names are single path components.
fn validate_app_name(name: &str) -> Result<()> {
    let single_component = Path::new(name).components().count() == 1;
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || !single_component {
        return Err(invalid("app", name, "must be a plain app name"));
    }
    Ok(())
}

/// Immutable description of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    /// Action kind.
    pub action: ActionKind,
    /// Local root filesystem of the image.
    pub image: PathBuf,
    /// Command and arguments.
    pub command: Vec<String>,
    /// Validated options.
    pub options: OptionSet,
}

impl ExecutionRequest {
    /// Builds a request, resolving the image to a local root filesystem
    /// and validating the options.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a remote or missing image or an
    /// invalid option.
    pub fn new(
        action: ActionKind,
        image: ImageRef,
        command: Vec<String>,
        options: OptionSet,
    ) -> Result<Self> {
        let image = image.into_local_root()?;
        options.validate()?;
        Ok(Self {
            action,
            image,
            command,
            options,
        })
    }
}

/// Final result of a contained process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitResult {
    /// Exit code reported to the caller.
    pub code: i32,
    /// Signal that terminated the process, if any.
    pub signal: Option<i32>,
}

impl ExitResult {
    /// Result of a process that exited normally.
    #[must_use]
    pub const fn exited(code: i32) -> Self {
        Self { code, signal: None }
    }

    /// Result of a process killed by `signal`.
    #[must_use]
    pub const fn signaled(signal: i32) -> Self {
        Self {
            code: crate::constants::SIGNAL_EXIT_OFFSET + signal,
            signal: Some(signal),
        }
    }

    /// Result reported when the engine itself failed.
    #[must_use]
    pub const fn engine_failure() -> Self {
        Self::exited(crate::constants::ENGINE_FAILURE_EXIT_CODE)
    }

    /// Returns whether the process exited with code 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.code == 0 && self.signal.is_none()
    }
}

fn invalid(option: &'static str, value: &str, reason: &str) -> EngineError {
    EngineError::InvalidOption {
        option,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
