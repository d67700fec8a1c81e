//! Mount plan construction.
//!
//! [`PlanBuilder::build`] turns an [`ExecutionRequest`] into an ordered
//! [`MountPlan`] without touching any mount: every host path the plan
//! refers to is checked here, so a bad option fails before the privileged
//! phase starts.

use std::fmt;
use std::path::{Path, PathBuf};

use strata_common::config::EngineConfig;
use strata_common::error::{EngineError, Result};
use strata_common::types::{ExecutionRequest, OptionSet, OverlayBacking};
use strata_core::privilege::Identity;

use crate::app::{self, AppDescriptor};
use crate::image::ImageMetadata;
use crate::overlay;

/// Role of a mount operation in the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MountKind {
    /// Image root filesystem; always first.
    Root,
    /// Overlay layer stacked over the root.
    OverlayLayer,
    /// `/proc`, `/sys`, `/dev` and shared temporary directories.
    System,
    /// User bind mount.
    Bind,
    /// Home directory.
    Home,
    /// Temporary directories staged in the work directory.
    Workdir,
    /// SCIF app tree.
    ScifApp,
}

impl fmt::Display for MountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => write!(f, "root"),
            Self::OverlayLayer => write!(f, "overlay-layer"),
            Self::System => write!(f, "system"),
            Self::Bind => write!(f, "bind"),
            Self::Home => write!(f, "home"),
            Self::Workdir => write!(f, "workdir"),
            Self::ScifApp => write!(f, "scif-app"),
        }
    }
}

/// Where the content of a mount comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    /// Image root filesystem directory.
    Image(PathBuf),
    /// Overlay directory or image file.
    Layer {
        /// Host path of the overlay.
        path: PathBuf,
        /// Detected backing storage.
        backing: OverlayBacking,
    },
    /// Existing host path, bind-mounted.
    Host(PathBuf),
    /// Host directory created for this invocation and owned by the
    /// invoking user.
    Staging(PathBuf),
    /// In-memory filesystem.
    Tmpfs,
    /// Fresh `proc` filesystem.
    Proc,
    /// Path inside the assembled root, bind-mounted onto itself.
    Container(PathBuf),
}

/// One step of a mount plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOp {
    /// Role of the mount.
    pub kind: MountKind,
    /// Content of the mount.
    pub source: MountSource,
    /// Container path; `/` for the root and overlay layers.
    pub target: PathBuf,
    /// Mount read-only.
    pub read_only: bool,
}

/// What the launcher needs to know about the planned environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchContext {
    /// `HOME` of the contained process.
    pub home: PathBuf,
    /// App the action runs in.
    pub app: Option<AppDescriptor>,
    /// Image metadata.
    pub metadata: ImageMetadata,
    /// `/tmp` is staged in the work directory.
    pub workdir_tmp: bool,
}

/// Ordered mount operations for one invocation.
///
/// The first operation is always the root; overlay layers follow in
/// request order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPlan {
    ops: Vec<MountOp>,
    context: LaunchContext,
}

impl MountPlan {
    /// Every operation, in application order.
    #[must_use]
    pub fn ops(&self) -> &[MountOp] {
        &self.ops
    }

    /// Host path of the image root.
    #[must_use]
    pub fn image_root(&self) -> &Path {
        match self.ops.first().map(|op| &op.source) {
            Some(MountSource::Image(path)) => path.as_path(),
            _ => Path::new("/"),
        }
    }

    /// Returns whether any operation has `kind`.
    #[must_use]
    pub fn has_kind(&self, kind: MountKind) -> bool {
        self.ops.iter().any(|op| op.kind == kind)
    }

    /// Operations of `kind`, in order.
    pub fn of_kind(&self, kind: MountKind) -> impl Iterator<Item = &MountOp> {
        self.ops.iter().filter(move |op| op.kind == kind)
    }

    /// Launch context derived from the request.
    #[must_use]
    pub const fn context(&self) -> &LaunchContext {
        &self.context
    }

    /// Splits the plan into its operations and launch context.
    #[must_use]
    pub fn into_parts(self) -> (Vec<MountOp>, LaunchContext) {
        (self.ops, self.context)
    }
}

/// Builds mount plans for one invoking identity.
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    config: EngineConfig,
    identity: Identity,
}

impl PlanBuilder {
    /// Creates a builder.
    #[must_use]
    pub const fn new(config: EngineConfig, identity: Identity) -> Self {
        Self { config, identity }
    }

    /// Identity the plans are built for.
    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Builds the mount plan for `request`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error ([`EngineError::InvalidBind`],
    /// [`EngineError::InvalidOverlay`], [`EngineError::AppNotFound`],
    /// [`EngineError::WorkdirNotFound`], ...) without side effects.
    pub fn build(&self, request: &ExecutionRequest) -> Result<MountPlan> {
        let options = &request.options;
        let image_root = request.image.as_path();

        let mut ops = vec![MountOp {
            kind: MountKind::Root,
            source: MountSource::Image(image_root.to_path_buf()),
            target: PathBuf::from("/"),
            read_only: true,
        }];

        let layers = overlay::resolve(&options.overlays)?;
        if options.use_user_namespace {
            if let Some(op) = layers.iter().find(|op| {
                matches!(op.source, MountSource::Layer { backing, .. } if backing.is_image())
            }) {
                return Err(EngineError::UserNamespaceUnsupportedOperation {
                    operation: format!("image overlay {}", describe_source(&op.source)),
                });
            }
        }
        let writable_root = layers.iter().any(|op| !op.read_only);
        ops.extend(layers);

        let workdir = options
            .workdir
            .as_deref()
            .map(validate_workdir)
            .transpose()?;
        if workdir.is_some() && !options.contain_only {
            tracing::debug!("--workdir has no effect without --contain");
        }

        self.system_ops(options, &mut ops);
        let workdir_tmp = self.tmp_ops(options, workdir, &mut ops);
        let home = self.home_ops(options, workdir, &mut ops)?;

        let app = match &options.app {
            Some(name) => {
                let app = app::resolve(name, image_root, request.action)?;
                ops.push(MountOp {
                    kind: MountKind::ScifApp,
                    source: MountSource::Container(app.root.clone()),
                    target: app.root.clone(),
                    read_only: !writable_root,
                });
                Some(app)
            }
            None => None,
        };

        for bind in &options.binds {
            if !bind.source.exists() {
                return Err(EngineError::InvalidBind {
                    path: bind.source.clone(),
                });
            }
            ops.push(MountOp {
                kind: MountKind::Bind,
                source: MountSource::Host(bind.source.clone()),
                target: bind.destination.clone(),
                read_only: bind.read_only,
            });
        }

        let metadata = ImageMetadata::load(image_root, &self.config.image_metadata_dir);
        tracing::debug!(
            ops = ops.len(),
            overlays = options.overlays.len(),
            binds = options.binds.len(),
            "mount plan built"
        );
        Ok(MountPlan {
            ops,
            context: LaunchContext {
                home,
                app,
                metadata,
                workdir_tmp,
            },
        })
    }

    fn system_ops(&self, options: &OptionSet, ops: &mut Vec<MountOp>) {
        // With a PID namespace the child mounts its own /proc.
        if self.config.mount_proc && !options.pid_namespace {
            // A user namespace cannot mount procfs for a PID namespace it
            // does not own; the host view is bound instead.
            let source = if options.use_user_namespace {
                MountSource::Host(PathBuf::from("/proc"))
            } else {
                MountSource::Proc
            };
            ops.push(system_op(source, "/proc"));
        }
        if self.config.mount_sys && Path::new("/sys").is_dir() {
            ops.push(system_op(MountSource::Host(PathBuf::from("/sys")), "/sys"));
        }
        if self.config.mount_dev && Path::new("/dev").is_dir() {
            ops.push(system_op(MountSource::Host(PathBuf::from("/dev")), "/dev"));
        }
    }

    fn tmp_ops(&self, options: &OptionSet, workdir: Option<&Path>, ops: &mut Vec<MountOp>) -> bool {
        if options.contain_only {
            match workdir {
                Some(dir) => {
                    for (staged, target) in [("tmp", "/tmp"), ("var_tmp", "/var/tmp")] {
                        ops.push(MountOp {
                            kind: MountKind::Workdir,
                            source: MountSource::Staging(dir.join(staged)),
                            target: PathBuf::from(target),
                            read_only: false,
                        });
                    }
                    return true;
                }
                None => {
                    ops.push(system_op(MountSource::Tmpfs, "/tmp"));
                    ops.push(system_op(MountSource::Tmpfs, "/var/tmp"));
                }
            }
        } else if self.config.bind_tmp {
            for tmp in ["/tmp", "/var/tmp"] {
                if Path::new(tmp).is_dir() {
                    ops.push(system_op(MountSource::Host(PathBuf::from(tmp)), tmp));
                }
            }
        }
        false
    }

    fn home_ops(
        &self,
        options: &OptionSet,
        workdir: Option<&Path>,
        ops: &mut Vec<MountOp>,
    ) -> Result<PathBuf> {
        let default_home = self.identity.home.clone();
        if options.no_home {
            return Ok(default_home);
        }

        let (source, target) = if options.contain_only {
            let source = workdir.map_or(MountSource::Tmpfs, |dir| {
                MountSource::Staging(dir.join("home"))
            });
            (source, default_home)
        } else if let Some(spec) = &options.home {
            if !spec.source.is_dir() {
                return Err(EngineError::InvalidHome {
                    path: spec.source.clone(),
                });
            }
            let target = spec.destination.clone().unwrap_or(default_home);
            (MountSource::Host(spec.source.clone()), target)
        } else {
            if !default_home.is_dir() {
                tracing::warn!(
                    home = %default_home.display(),
                    "home directory missing on host, not binding it"
                );
                return Ok(default_home);
            }
            (MountSource::Host(default_home.clone()), default_home)
        };

        if target == Path::new("/") {
            tracing::debug!("home is the filesystem root, not mounting it");
            return Ok(target);
        }
        ops.push(MountOp {
            kind: MountKind::Home,
            source,
            target: target.clone(),
            read_only: false,
        });
        Ok(target)
    }
}

fn system_op(source: MountSource, target: &str) -> MountOp {
    MountOp {
        kind: MountKind::System,
        source,
        target: PathBuf::from(target),
        read_only: false,
    }
}

fn validate_workdir(path: &Path) -> Result<&Path> {
    if path.is_dir() {
        Ok(path)
    } else {
        Err(EngineError::WorkdirNotFound {
            path: path.to_path_buf(),
        })
    }
}

fn describe_source(source: &MountSource) -> String {
    match source {
        MountSource::Image(p)
        | MountSource::Layer { path: p, .. }
        | MountSource::Host(p)
        | MountSource::Staging(p)
        | MountSource::Container(p) => p.display().to_string(),
        MountSource::Tmpfs => "tmpfs".into(),
        MountSource::Proc => "proc".into(),
    }
}

impl fmt::Display for MountSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&describe_source(self))
    }
}

#[cfg(test)]
mod tests {
    use strata_common::types::{ActionKind, BindSpec, HomeSpec, OverlaySpec};

    use super::*;

    struct Fixture {
        image: tempfile::TempDir,
        home: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let image = tempfile::tempdir().expect("image");
            std::fs::create_dir_all(image.path().join("scif/apps/foo")).expect("mkdir");
            Self {
                image,
                home: tempfile::tempdir().expect("home"),
            }
        }

        fn builder(&self) -> PlanBuilder {
            PlanBuilder::new(
                EngineConfig::default(),
                Identity {
                    uid: 1000,
                    gid: 1000,
                    name: "user".into(),
                    home: self.home.path().to_path_buf(),
                },
            )
        }

        fn request(&self, options: OptionSet) -> ExecutionRequest {
            ExecutionRequest {
                action: ActionKind::Exec,
                image: self.image.path().to_path_buf(),
                command: vec!["true".into()],
                options,
            }
        }

        fn build(&self, options: OptionSet) -> Result<MountPlan> {
            self.builder().build(&self.request(options))
        }
    }

    #[test]
    fn root_is_always_first() {
        let fx = Fixture::new();
        let plan = fx.build(OptionSet::default()).expect("plan");
        assert_eq!(plan.ops()[0].kind, MountKind::Root);
        assert_eq!(plan.image_root(), fx.image.path());
    }

    #[test]
    fn default_home_binds_invoking_users_home() {
        let fx = Fixture::new();
        let plan = fx.build(OptionSet::default()).expect("plan");
        let home: Vec<_> = plan.of_kind(MountKind::Home).collect();
        assert_eq!(home.len(), 1);
        assert_eq!(home[0].source, MountSource::Host(fx.home.path().to_path_buf()));
        assert_eq!(plan.context().home, fx.home.path());
    }

    #[test]
    fn no_home_has_no_home_op() {
        let fx = Fixture::new();
        for contain_only in [false, true] {
            let plan = fx
                .build(OptionSet {
                    no_home: true,
                    contain_only,
                    ..OptionSet::default()
                })
                .expect("plan");
            assert!(!plan.has_kind(MountKind::Home));
        }
    }

    #[test]
    fn contain_uses_private_home_and_tmp() {
        let fx = Fixture::new();
        let other = tempfile::tempdir().expect("other home");
        let plan = fx
            .build(OptionSet {
                contain_only: true,
                home: Some(HomeSpec {
                    source: other.path().to_path_buf(),
                    destination: None,
                }),
                ..OptionSet::default()
            })
            .expect("plan");
        let home: Vec<_> = plan.of_kind(MountKind::Home).collect();
        assert_eq!(home[0].source, MountSource::Tmpfs);
        assert!(
            plan.ops()
                .iter()
                .all(|op| op.source != MountSource::Host(PathBuf::from("/tmp")))
        );
    }

    #[test]
    fn contain_with_workdir_stages_tmp() {
        let fx = Fixture::new();
        let workdir = tempfile::tempdir().expect("workdir");
        let plan = fx
            .build(OptionSet {
                contain_only: true,
                workdir: Some(workdir.path().to_path_buf()),
                ..OptionSet::default()
            })
            .expect("plan");
        let staged: Vec<_> = plan.of_kind(MountKind::Workdir).collect();
        assert_eq!(staged.len(), 2);
        assert_eq!(
            staged[0].source,
            MountSource::Staging(workdir.path().join("tmp"))
        );
        assert!(plan.context().workdir_tmp);
    }

    #[test]
    fn explicit_home_binds_source_to_destination() {
        let fx = Fixture::new();
        let source = tempfile::tempdir().expect("source");
        let plan = fx
            .build(OptionSet {
                home: Some(HomeSpec {
                    source: source.path().to_path_buf(),
                    destination: Some(PathBuf::from("/home")),
                }),
                ..OptionSet::default()
            })
            .expect("plan");
        let home: Vec<_> = plan.of_kind(MountKind::Home).collect();
        assert_eq!(home[0].target, PathBuf::from("/home"));
        assert_eq!(plan.context().home, PathBuf::from("/home"));
    }

    #[test]
    fn missing_home_source_is_invalid() {
        let fx = Fixture::new();
        let result = fx.build(OptionSet {
            home: Some(HomeSpec {
                source: PathBuf::from("/nonexistent/home"),
                destination: None,
            }),
            ..OptionSet::default()
        });
        assert!(matches!(result, Err(EngineError::InvalidHome { .. })));
    }

    #[test]
    fn missing_bind_source_fails_the_whole_plan() {
        let fx = Fixture::new();
        let result = fx.build(OptionSet {
            binds: vec![BindSpec {
                source: PathBuf::from("/nonexistent/bind"),
                destination: PathBuf::from("/mnt"),
                read_only: false,
            }],
            ..OptionSet::default()
        });
        assert!(matches!(result, Err(EngineError::InvalidBind { .. })));
    }

    #[test]
    fn binds_come_last_in_request_order() {
        let fx = Fixture::new();
        let a = tempfile::tempdir().expect("a");
        let b = tempfile::tempdir().expect("b");
        let plan = fx
            .build(OptionSet {
                binds: vec![
                    BindSpec {
                        source: a.path().to_path_buf(),
                        destination: PathBuf::from("/a"),
                        read_only: true,
                    },
                    BindSpec {
                        source: b.path().to_path_buf(),
                        destination: PathBuf::from("/b"),
                        read_only: false,
                    },
                ],
                ..OptionSet::default()
            })
            .expect("plan");
        let n = plan.ops().len();
        assert_eq!(plan.ops()[n - 2].target, PathBuf::from("/a"));
        assert!(plan.ops()[n - 2].read_only);
        assert_eq!(plan.ops()[n - 1].target, PathBuf::from("/b"));
    }

    #[test]
    fn overlays_follow_root_in_request_order() {
        let fx = Fixture::new();
        let low = tempfile::tempdir().expect("low");
        let high = tempfile::tempdir().expect("high");
        let plan = fx
            .build(OptionSet {
                overlays: vec![
                    OverlaySpec {
                        path: low.path().to_path_buf(),
                        read_only: true,
                    },
                    OverlaySpec {
                        path: high.path().to_path_buf(),
                        read_only: false,
                    },
                ],
                ..OptionSet::default()
            })
            .expect("plan");
        assert_eq!(plan.ops()[1].kind, MountKind::OverlayLayer);
        assert_eq!(plan.ops()[2].kind, MountKind::OverlayLayer);
        assert!(matches!(
            &plan.ops()[1].source,
            MountSource::Layer { path, .. } if path == low.path()
        ));
        assert!(matches!(
            &plan.ops()[2].source,
            MountSource::Layer { path, .. } if path == high.path()
        ));
    }

    #[test]
    fn image_overlay_in_user_namespace_is_rejected() {
        let fx = Fixture::new();
        let dir = tempfile::tempdir().expect("dir");
        let image = dir.path().join("layer.sqfs");
        std::fs::write(&image, b"hsqs").expect("write");
        let result = fx.build(OptionSet {
            use_user_namespace: true,
            overlays: vec![OverlaySpec {
                path: image,
                read_only: true,
            }],
            ..OptionSet::default()
        });
        assert!(matches!(
            result,
            Err(EngineError::UserNamespaceUnsupportedOperation { .. })
        ));
    }

    #[test]
    fn app_is_resolved_into_the_plan() {
        let fx = Fixture::new();
        let plan = fx
            .build(OptionSet {
                app: Some("foo".into()),
                ..OptionSet::default()
            })
            .expect("plan");
        let app: Vec<_> = plan.of_kind(MountKind::ScifApp).collect();
        assert_eq!(app[0].target, PathBuf::from("/scif/apps/foo"));
        assert!(app[0].read_only);
        assert_eq!(
            plan.context().app.as_ref().map(|a| a.name.as_str()),
            Some("foo")
        );
    }

    #[test]
    fn missing_app_fails_the_plan() {
        let fx = Fixture::new();
        let result = fx.build(OptionSet {
            app: Some("fakeapp".into()),
            ..OptionSet::default()
        });
        assert!(matches!(result, Err(EngineError::AppNotFound { .. })));
    }

    #[test]
    fn missing_workdir_is_rejected() {
        let fx = Fixture::new();
        let result = fx.build(OptionSet {
            contain_only: true,
            workdir: Some(PathBuf::from("/nonexistent/workdir")),
            ..OptionSet::default()
        });
        assert!(matches!(result, Err(EngineError::WorkdirNotFound { .. })));
    }

    #[test]
    fn pid_namespace_leaves_proc_to_the_child() {
        let fx = Fixture::new();
        let plan = fx
            .build(OptionSet {
                pid_namespace: true,
                ..OptionSet::default()
            })
            .expect("plan");
        assert!(plan.ops().iter().all(|op| op.target != Path::new("/proc")));
    }
}
