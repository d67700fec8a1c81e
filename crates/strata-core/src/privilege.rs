//! Privilege state of one invocation.
//!
//! Privilege moves strictly one way: [`SetupPrivilege`] (mounts may be
//! performed) is consumed by [`SetupPrivilege::drop_to`] or
//! [`SetupPrivilege::retain`], producing a [`DroppedPrivilege`] that
//! describes the credentials of the contained process. There is no way
//! back to the setup phase.

use std::fmt;
use std::path::PathBuf;

use caps::{CapSet, Capability, CapsHashSet};
use nix::unistd::{Gid, Uid, User};
use strata_common::error::{EngineError, Result};

use crate::security::PreparedSecurity;

/// Phase of the privilege state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrivilegePhase {
    /// Mounts and namespace setup may be performed.
    PrivilegedSetup,
    /// Credentials reduced to the invoking identity.
    Dropped,
    /// Elevated capabilities explicitly retained by request.
    Retained,
}

impl fmt::Display for PrivilegePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrivilegedSetup => write!(f, "privileged-setup"),
            Self::Dropped => write!(f, "dropped"),
            Self::Retained => write!(f, "retained"),
        }
    }
}

/// The user on whose behalf the engine runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Real user id.
    pub uid: u32,
    /// Real group id.
    pub gid: u32,
    /// Login name, or the uid when there is no passwd entry.
    pub name: String,
    /// Home directory from the passwd database or `$HOME`.
    pub home: PathBuf,
}

impl Identity {
    /// Returns the identity of the real user of this process.
    ///
    /// # Errors
    ///
    /// Returns an error if the passwd lookup fails.
    pub fn invoking() -> Result<Self> {
        let uid = Uid::current();
        let gid = Gid::current();
        let user = User::from_uid(uid).map_err(|e| EngineError::Config {
            message: format!("passwd lookup for uid {uid} failed: {e}"),
        })?;
        let (name, home) = match user {
            Some(user) => (user.name, user.dir),
            None => (
                uid.to_string(),
                std::env::var_os("HOME").map_or_else(|| PathBuf::from("/"), PathBuf::from),
            ),
        };
        Ok(Self {
            uid: uid.as_raw(),
            gid: gid.as_raw(),
            name,
            home,
        })
    }

    /// Returns whether this identity is the host superuser.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Proof that the engine is in its privileged setup phase.
///
/// Obtained once per invocation with [`SetupPrivilege::capture`].
#[derive(Debug)]
pub struct SetupPrivilege {
    effective_uid: u32,
    granted: CapsHashSet,
    user_namespace: bool,
}

impl SetupPrivilege {
    /// Captures the current privilege of this thread.
    ///
    /// Call this after a user namespace, if any, has been created.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PermissionDenied`] if the thread cannot
    /// perform mounts.
    pub fn capture(user_namespace: bool) -> Result<Self> {
        let granted =
            caps::read(None, CapSet::Effective).map_err(|e| EngineError::PermissionDenied {
                message: format!("cannot read capabilities: {e}"),
            })?;
        if !granted.contains(&Capability::CAP_SYS_ADMIN) {
            return Err(EngineError::PermissionDenied {
                message: "mount setup requires root privileges or a user namespace (-u)".into(),
            });
        }
        let effective_uid = Uid::effective().as_raw();
        tracing::debug!(
            effective_uid,
            granted = granted.len(),
            user_namespace,
            "privileged setup phase entered"
        );
        Ok(Self {
            effective_uid,
            granted,
            user_namespace,
        })
    }

    /// Current phase; always [`PrivilegePhase::PrivilegedSetup`].
    #[must_use]
    pub const fn phase(&self) -> PrivilegePhase {
        PrivilegePhase::PrivilegedSetup
    }

    /// Effective uid during setup.
    #[must_use]
    pub const fn effective_uid(&self) -> u32 {
        self.effective_uid
    }

    /// Capabilities held during setup.
    #[must_use]
    pub const fn granted_capabilities(&self) -> &CapsHashSet {
        &self.granted
    }

    /// Whether setup runs inside a user namespace.
    #[must_use]
    pub const fn in_user_namespace(&self) -> bool {
        self.user_namespace
    }

    /// Ends the setup phase: the contained process runs as `target` with
    /// no capabilities.
    #[must_use]
    pub fn drop_to(
        self,
        target: Credentials,
        security: PreparedSecurity,
        no_new_privs: bool,
    ) -> DroppedPrivilege {
        tracing::info!(
            uid = target.uid,
            gid = target.gid,
            "dropping privileges before exec"
        );
        DroppedPrivilege {
            phase: PrivilegePhase::Dropped,
            transition: CredentialTransition {
                uid: target.uid,
                gid: target.gid,
                groups: (!self.user_namespace).then(|| vec![target.gid]),
                bounding_drop: crate::capability::bounding_complement(&CapsHashSet::new()),
                retain: CapsHashSet::new(),
                no_new_privs,
                security,
            },
        }
    }

    /// Ends the setup phase keeping the current identity and every held
    /// capability except `excluded`.
    #[must_use]
    pub fn retain(self, excluded: &[Capability], security: PreparedSecurity) -> DroppedPrivilege {
        let retain = crate::capability::retained_set(&self.granted, excluded);
        tracing::info!(
            retained = retain.len(),
            excluded = excluded.len(),
            "retaining privileges by request"
        );
        DroppedPrivilege {
            phase: PrivilegePhase::Retained,
            transition: CredentialTransition {
                uid: self.effective_uid,
                gid: Gid::effective().as_raw(),
                groups: None,
                bounding_drop: crate::capability::bounding_complement(&retain),
                retain,
                no_new_privs: false,
                security,
            },
        }
    }
}

/// Uid and gid the contained process runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    /// Target uid.
    pub uid: u32,
    /// Target gid.
    pub gid: u32,
}

/// State after the setup phase ended.
#[derive(Debug)]
pub struct DroppedPrivilege {
    phase: PrivilegePhase,
    transition: CredentialTransition,
}

impl DroppedPrivilege {
    /// [`PrivilegePhase::Dropped`] or [`PrivilegePhase::Retained`].
    #[must_use]
    pub const fn phase(&self) -> PrivilegePhase {
        self.phase
    }

    /// Uid the contained process runs as.
    #[must_use]
    pub const fn effective_uid(&self) -> u32 {
        self.transition.uid
    }

    /// Capabilities the contained process keeps.
    #[must_use]
    pub const fn granted_capabilities(&self) -> &CapsHashSet {
        &self.transition.retain
    }

    /// The credential change applied in the child before exec.
    #[must_use]
    pub const fn transition(&self) -> &CredentialTransition {
        &self.transition
    }
}

/// Precomputed credential change applied between fork and exec.
///
/// Everything is computed in the parent so the child only issues
/// system calls.
#[derive(Debug, Clone)]
pub struct CredentialTransition {
    uid: u32,
    gid: u32,
    groups: Option<Vec<u32>>,
    bounding_drop: Vec<Capability>,
    retain: CapsHashSet,
    no_new_privs: bool,
    security: PreparedSecurity,
}

impl CredentialTransition {
    /// Applies the transition to the calling (single-threaded, forked)
    /// process and verifies the result.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails or the resulting credentials do
    /// not match; the caller must not exec in that case.
    pub fn apply(&self) -> std::io::Result<()> {
        self.security.apply()?;

        for cap in &self.bounding_drop {
            caps::drop(None, CapSet::Bounding, *cap).map_err(caps_error)?;
        }
        if self.no_new_privs {
            nix::sys::prctl::set_no_new_privs()?;
        }

        if let Some(groups) = &self.groups {
            let groups: Vec<Gid> = groups.iter().map(|g| Gid::from_raw(*g)).collect();
            nix::unistd::setgroups(&groups)?;
        }
        let gid = Gid::from_raw(self.gid);
        let uid = Uid::from_raw(self.uid);
        nix::unistd::setresgid(gid, gid, gid)?;
        nix::unistd::setresuid(uid, uid, uid)?;

        caps::set(None, CapSet::Effective, &self.retain).map_err(caps_error)?;
        caps::set(None, CapSet::Inheritable, &self.retain).map_err(caps_error)?;
        caps::set(None, CapSet::Permitted, &self.retain).map_err(caps_error)?;
        caps::clear(None, CapSet::Ambient).map_err(caps_error)?;

        self.verify()
    }

    fn verify(&self) -> std::io::Result<()> {
        let uid = Uid::from_raw(self.uid);
        if Uid::current() != uid || Uid::effective() != uid {
            return Err(std::io::Error::from_raw_os_error(libc::EPERM));
        }
        let effective = caps::read(None, CapSet::Effective).map_err(caps_error)?;
        let permitted = caps::read(None, CapSet::Permitted).map_err(caps_error)?;
        if effective != self.retain || permitted != self.retain {
            return Err(std::io::Error::from_raw_os_error(libc::EPERM));
        }
        Ok(())
    }
}

fn caps_error(e: caps::errors::CapsError) -> std::io::Error {
    std::io::Error::other(e.to_string())
}
