//! Namespace and privilege coordination.
//!
//! [`Coordinator::apply`] performs every privileged step of an invocation:
//! namespaces, the per-invocation session directory, the overlay root and
//! the remaining mounts. [`Coordinator::drop_privileges`] then ends the
//! setup phase. Mounts live in a [`MountTable`] owned by the environment,
//! so they are unwound on every exit path, including failures half-way
//! through [`Coordinator::apply`].

use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use caps::Capability;
use nix::unistd::{Gid, Uid, chown};
use strata_common::config::EngineConfig;
use strata_common::error::{EngineError, Result};
use strata_common::types::OptionSet;
use strata_core::filesystem::mount::{BindOptions, MountTable, prepare_mount_point};
use strata_core::filesystem::root::{RootEntry, host_path};
use strata_core::namespace::{self, NamespaceConfig};
use strata_core::privilege::{
    Credentials, DroppedPrivilege, Identity, PrivilegePhase, SetupPrivilege,
};
use strata_core::security::PreparedSecurity;
use uuid::Uuid;

use crate::overlay::{self, LayerDir};
use crate::plan::{LaunchContext, MountKind, MountOp, MountPlan, MountSource};
use crate::signal::Interrupt;

/// Per-invocation directory holding the session tmpfs.
///
/// Everything below it lives on that tmpfs, so once the mount table is
/// unwound the directory is empty and is removed without recursion.
#[derive(Debug)]
struct SessionDir {
    path: PathBuf,
}

impl SessionDir {
    fn create(parent: &Path) -> Result<Self> {
        std::fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
        let path = parent.join(format!("session-{}", Uuid::new_v4()));
        DirBuilder::new()
            .mode(0o700)
            .create(&path)
            .map_err(|e| EngineError::io(&path, e))?;
        tracing::debug!(session = %path.display(), "session directory created");
        Ok(Self { path })
    }
}

impl Drop for SessionDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir(&self.path) {
            tracing::warn!(session = %self.path.display(), error = %e, "session directory left behind");
        }
    }
}

/// Environment assembled during the privileged setup phase.
#[derive(Debug)]
pub struct PreparedEnvironment {
    // Declared before `session` so mounts are released first.
    mounts: MountTable,
    session: SessionDir,
    root: PathBuf,
    privilege: SetupPrivilege,
    security: PreparedSecurity,
    target: Credentials,
    keep_privileges: bool,
    excluded: Vec<Capability>,
    pid_namespace: bool,
    context: LaunchContext,
}

impl PreparedEnvironment {
    /// Host path of the assembled root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of active mounts.
    #[must_use]
    pub fn mount_count(&self) -> usize {
        self.mounts.len()
    }

    /// Always [`PrivilegePhase::PrivilegedSetup`].
    #[must_use]
    pub const fn phase(&self) -> PrivilegePhase {
        self.privilege.phase()
    }
}

/// Environment whose setup phase has ended, ready for launch.
///
/// Dropping it unmounts everything.
#[derive(Debug)]
pub struct Ready {
    mounts: MountTable,
    session: SessionDir,
    root: PathBuf,
    privilege: DroppedPrivilege,
    pid_namespace: bool,
    context: LaunchContext,
}

impl Ready {
    /// Host path of the assembled root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Credentials the contained process will run with.
    #[must_use]
    pub const fn privilege(&self) -> &DroppedPrivilege {
        &self.privilege
    }

    /// Launch context carried over from the plan.
    #[must_use]
    pub const fn context(&self) -> &LaunchContext {
        &self.context
    }

    /// How the child enters the root with working directory `cwd`.
    #[must_use]
    pub fn root_entry(&self, cwd: PathBuf) -> RootEntry {
        RootEntry {
            root: self.root.clone(),
            cwd,
            mount_proc: self.pid_namespace,
        }
    }

    /// Unmounts everything now instead of on drop.
    pub fn teardown(mut self) {
        self.mounts.unwind();
        tracing::debug!(session = %self.session.path.display(), "environment torn down");
    }
}

/// Performs the privileged setup of one invocation.
#[derive(Debug, Clone)]
pub struct Coordinator {
    config: EngineConfig,
    identity: Identity,
    interrupt: Interrupt,
}

impl Coordinator {
    /// Creates a coordinator acting for `identity`.
    #[must_use]
    pub const fn new(config: EngineConfig, identity: Identity, interrupt: Interrupt) -> Self {
        Self {
            config,
            identity,
            interrupt,
        }
    }

    /// Creates the namespaces and applies `plan`.
    ///
    /// Requests the caller is not entitled to are refused before any
    /// namespace exists. On failure every mount applied so far is undone.
    ///
    /// # Errors
    ///
    /// Returns a privilege, mount, or configuration error, or
    /// [`EngineError::Interrupted`] if a signal arrived during setup.
    pub fn apply(&self, plan: MountPlan, options: &OptionSet) -> Result<PreparedEnvironment> {
        let excluded = options.dropped_capabilities()?;
        if options.keep_privileges && !self.identity.is_root() {
            return Err(EngineError::PermissionDenied {
                message: "--keep-privs is only available to root".into(),
            });
        }
        let (security, overrides) = PreparedSecurity::prepare(&options.security_modules)?;
        if (overrides.uid.is_some() || overrides.gid.is_some()) && !self.identity.is_root() {
            return Err(EngineError::PermissionDenied {
                message: "uid and gid security modules are only available to root".into(),
            });
        }
        let target = Credentials {
            uid: overrides.uid.unwrap_or(self.identity.uid),
            gid: overrides.gid.unwrap_or(self.identity.gid),
        };
        self.interrupt.check()?;

        let namespaces = NamespaceConfig {
            user: options.use_user_namespace,
            pid: options.pid_namespace,
        };
        namespace::enter_user_namespace(&namespaces, &self.identity)?;
        let privilege = SetupPrivilege::capture(namespaces.user)?;
        namespace::create_namespaces(&privilege, &namespaces)?;

        let session = SessionDir::create(&self.config.session_dir)?;
        let mut mounts = MountTable::new();
        mounts.tmpfs(&privilege, &session.path, "mode=0700")?;

        let (ops, context) = plan.into_parts();
        let root = session.path.join("root");
        let read_only_root = self.assemble_root(&privilege, &mut mounts, &ops, &session.path, &root)?;

        for op in ops
            .iter()
            .filter(|op| !matches!(op.kind, MountKind::Root | MountKind::OverlayLayer))
        {
            self.interrupt.check()?;
            self.apply_op(&privilege, &mut mounts, &root, op, target)?;
        }
        if options.pid_namespace {
            prepare_mount_point(false, &host_path(&root, Path::new("/proc")))?;
        }
        if read_only_root {
            mounts.remount_readonly(&privilege, &root)?;
        }
        self.interrupt.check()?;

        tracing::info!(
            root = %root.display(),
            mounts = mounts.len(),
            read_only_root,
            "environment prepared"
        );
        Ok(PreparedEnvironment {
            mounts,
            session,
            root,
            privilege,
            security,
            target,
            keep_privileges: options.keep_privileges,
            excluded,
            pid_namespace: options.pid_namespace,
            context,
        })
    }

    /// Ends the setup phase.
    ///
    /// Without `keep_privileges` the contained process runs as the
    /// invoking user with no capabilities, so a capability drop list has
    /// nothing left to remove. With it, the held capabilities minus the
    /// drop list are kept.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Interrupted`] if a signal arrived; the
    /// environment is torn down.
    pub fn drop_privileges(&self, env: PreparedEnvironment) -> Result<Ready> {
        self.interrupt.check()?;
        let PreparedEnvironment {
            mounts,
            session,
            root,
            privilege,
            security,
            target,
            keep_privileges,
            excluded,
            pid_namespace,
            context,
        } = env;

        let privilege = if keep_privileges {
            privilege.retain(&excluded, security)
        } else {
            if !excluded.is_empty() {
                tracing::debug!(
                    excluded = excluded.len(),
                    "every capability is dropped, drop list already satisfied"
                );
            }
            privilege.drop_to(target, security, self.config.no_new_privs)
        };
        Ok(Ready {
            mounts,
            session,
            root,
            privilege,
            pid_namespace,
            context,
        })
    }

    /// Mounts image layers and the overlay root. Returns whether the root
    /// must be remounted read-only once all mount points exist.
    fn assemble_root(
        &self,
        privilege: &SetupPrivilege,
        mounts: &mut MountTable,
        ops: &[MountOp],
        session: &Path,
        root: &Path,
    ) -> Result<bool> {
        let image_root = ops
            .iter()
            .find_map(|op| match &op.source {
                MountSource::Image(path) if op.kind == MountKind::Root => Some(path.clone()),
                _ => None,
            })
            .ok_or_else(|| EngineError::Config {
                message: "mount plan has no root".into(),
            })?;

        let mut layers = Vec::new();
        for (index, op) in ops
            .iter()
            .filter(|op| op.kind == MountKind::OverlayLayer)
            .enumerate()
        {
            self.interrupt.check()?;
            let MountSource::Layer { path, backing } = &op.source else {
                continue;
            };
            let dir = if backing.is_image() {
                let mount_point = session.join("layers").join(index.to_string());
                std::fs::create_dir_all(&mount_point)
                    .map_err(|e| EngineError::io(&mount_point, e))?;
                mounts.image(privilege, path, *backing, &mount_point, op.read_only)?;
                mount_point
            } else {
                path.clone()
            };
            tracing::debug!(
                layer = index,
                path = %path.display(),
                backing = %backing,
                read_only = op.read_only,
                "overlay layer ready"
            );
            layers.push(LayerDir {
                dir,
                backing: *backing,
                read_only: op.read_only,
            });
        }

        let stack = overlay::compose(
            &image_root,
            &layers,
            &session.join("scratch"),
            root,
            privilege.in_user_namespace(),
        );
        mounts.overlay(privilege, &stack.config)?;
        Ok(stack.read_only_root)
    }

    fn apply_op(
        &self,
        privilege: &SetupPrivilege,
        mounts: &mut MountTable,
        root: &Path,
        op: &MountOp,
        owner: Credentials,
    ) -> Result<()> {
        let target = host_path(root, &op.target);
        let nosuid = matches!(op.kind, MountKind::Bind | MountKind::Home | MountKind::Workdir);
        let options = BindOptions {
            read_only: op.read_only,
            nosuid,
        };
        match &op.source {
            MountSource::Host(source) => {
                // Re-checked: the host may have changed since planning.
                if !source.exists() {
                    return Err(match op.kind {
                        MountKind::Home => EngineError::InvalidHome {
                            path: source.clone(),
                        },
                        _ => EngineError::InvalidBind {
                            path: source.clone(),
                        },
                    });
                }
                prepare_mount_point(source.is_file(), &target)?;
                mounts.bind(privilege, source, &target, options)
            }
            MountSource::Staging(dir) => {
                self.stage(privilege, dir, owner)?;
                prepare_mount_point(false, &target)?;
                mounts.bind(privilege, dir, &target, options)
            }
            MountSource::Tmpfs => {
                prepare_mount_point(false, &target)?;
                let data = if op.kind == MountKind::Home {
                    format!("mode=0700,uid={},gid={}", owner.uid, owner.gid)
                } else {
                    "mode=1777".to_string()
                };
                mounts.tmpfs(privilege, &target, &data)
            }
            MountSource::Proc => {
                prepare_mount_point(false, &target)?;
                mounts.proc(privilege, &target)
            }
            MountSource::Container(path) => {
                let source = host_path(root, path);
                mounts.bind(privilege, &source, &source, options)
            }
            MountSource::Image(_) | MountSource::Layer { .. } => Ok(()),
        }
    }

    /// Creates a staging directory owned by the user the process runs as.
    fn stage(&self, privilege: &SetupPrivilege, dir: &Path, owner: Credentials) -> Result<()> {
        if dir.is_dir() {
            return Ok(());
        }
        std::fs::create_dir_all(dir).map_err(|e| EngineError::io(dir, e))?;
        if !privilege.in_user_namespace() {
            chown(
                dir,
                Some(Uid::from_raw(owner.uid)),
                Some(Gid::from_raw(owner.gid)),
            )
            .map_err(|e| EngineError::io(dir, e.into()))?;
        }
        tracing::debug!(dir = %dir.display(), uid = owner.uid, "staging directory created");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use strata_common::types::{ActionKind, ExecutionRequest};

    use super::*;
    use crate::plan::PlanBuilder;

    fn unprivileged() -> Identity {
        Identity {
            uid: 1000,
            gid: 1000,
            name: "user".into(),
            home: PathBuf::from("/"),
        }
    }

    fn plan_for(identity: &Identity, options: &OptionSet) -> (tempfile::TempDir, MountPlan) {
        let image = tempfile::tempdir().expect("image");
        let request = ExecutionRequest {
            action: ActionKind::Exec,
            image: image.path().to_path_buf(),
            command: vec!["true".into()],
            options: options.clone(),
        };
        let plan = PlanBuilder::new(EngineConfig::default(), identity.clone())
            .build(&request)
            .expect("plan");
        (image, plan)
    }

    #[test]
    fn keep_privileges_requires_root() {
        let identity = unprivileged();
        let options = OptionSet {
            keep_privileges: true,
            ..OptionSet::default()
        };
        let (_image, plan) = plan_for(&identity, &options);
        let coordinator = Coordinator::new(EngineConfig::default(), identity, Interrupt::new());
        assert!(matches!(
            coordinator.apply(plan, &options),
            Err(EngineError::PermissionDenied { .. })
        ));
    }

    #[test]
    fn uid_override_requires_root() {
        let identity = unprivileged();
        let options = OptionSet {
            security_modules: vec![strata_common::types::SecurityModule::Uid(0)],
            ..OptionSet::default()
        };
        let (_image, plan) = plan_for(&identity, &options);
        let coordinator = Coordinator::new(EngineConfig::default(), identity, Interrupt::new());
        assert!(matches!(
            coordinator.apply(plan, &options),
            Err(EngineError::PermissionDenied { .. })
        ));
    }

    #[test]
    fn pending_interrupt_aborts_before_namespaces() {
        let identity = unprivileged();
        let options = OptionSet::default();
        let (_image, plan) = plan_for(&identity, &options);
        let interrupt = Interrupt::new();
        interrupt.notify(libc::SIGINT);
        let coordinator = Coordinator::new(EngineConfig::default(), identity, interrupt);
        assert!(matches!(
            coordinator.apply(plan, &options),
            Err(EngineError::Interrupted)
        ));
    }

    #[test]
    fn session_dir_is_removed_on_drop() {
        let parent = tempfile::tempdir().expect("parent");
        let session = SessionDir::create(parent.path()).expect("session");
        let path = session.path.clone();
        assert!(path.is_dir());
        drop(session);
        assert!(!path.exists());
    }
}
