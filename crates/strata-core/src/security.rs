//! Security modules applied immediately before the privilege drop.
//!
//! Each module is turned into a precomputed write to a process attribute
//! file so that the forked child only performs `open(2)`/`write(2)`.

use std::io::Write;
use std::path::{Path, PathBuf};

use strata_common::error::{EngineError, Result};
use strata_common::types::SecurityModule;

const APPARMOR_EXEC_ATTR: &str = "/proc/self/attr/apparmor/exec";
const LEGACY_EXEC_ATTR: &str = "/proc/self/attr/exec";
const APPARMOR_ENABLED: &str = "/sys/module/apparmor/parameters/enabled";
const SELINUX_FS: &str = "/sys/fs/selinux/enforce";

/// Identity overrides requested through `uid:`/`gid:` modules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentityOverride {
    /// Uid to run as.
    pub uid: Option<u32>,
    /// Gid to run as.
    pub gid: Option<u32>,
}

/// Ordered attribute writes performed in the child before exec.
#[derive(Debug, Clone, Default)]
pub struct PreparedSecurity {
    writes: Vec<(PathBuf, Vec<u8>)>,
}

impl PreparedSecurity {
    /// Resolves `modules` against the host, in order.
    ///
    /// Returns the prepared writes and any identity override.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if a module's LSM is not enabled on
    /// this host.
    pub fn prepare(modules: &[SecurityModule]) -> Result<(Self, IdentityOverride)> {
        let mut prepared = Self::default();
        let mut identity = IdentityOverride::default();
        for module in modules {
            match module {
                SecurityModule::AppArmor(profile) => {
                    if !apparmor_enabled() {
                        return Err(EngineError::Config {
                            message: "AppArmor is not enabled on this host".into(),
                        });
                    }
                    let attr = if Path::new(APPARMOR_EXEC_ATTR).exists() {
                        APPARMOR_EXEC_ATTR
                    } else {
                        LEGACY_EXEC_ATTR
                    };
                    prepared
                        .writes
                        .push((PathBuf::from(attr), format!("exec {profile}").into_bytes()));
                }
                SecurityModule::SeLinux(context) => {
                    if !Path::new(SELINUX_FS).exists() {
                        return Err(EngineError::Config {
                            message: "SELinux is not enabled on this host".into(),
                        });
                    }
                    prepared
                        .writes
                        .push((PathBuf::from(LEGACY_EXEC_ATTR), context.clone().into_bytes()));
                }
                SecurityModule::Uid(uid) => identity.uid = Some(*uid),
                SecurityModule::Gid(gid) => identity.gid = Some(*gid),
            }
            tracing::debug!(module = %module, "security module prepared");
        }
        Ok((prepared, identity))
    }

    /// Returns whether no attribute writes are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Performs the writes on the calling process.
    ///
    /// # Errors
    ///
    /// Returns the first write failure.
    pub fn apply(&self) -> std::io::Result<()> {
        for (path, data) in &self.writes {
            std::fs::OpenOptions::new()
                .write(true)
                .open(path)?
                .write_all(data)?;
        }
        Ok(())
    }
}

fn apparmor_enabled() -> bool {
    std::fs::read_to_string(APPARMOR_ENABLED).is_ok_and(|v| v.trim_start().starts_with('Y'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_and_gid_modules_become_identity_override() {
        let (prepared, identity) =
            PreparedSecurity::prepare(&[SecurityModule::Uid(1000), SecurityModule::Gid(100)])
                .expect("prepare");
        assert!(prepared.is_empty());
        assert_eq!(identity.uid, Some(1000));
        assert_eq!(identity.gid, Some(100));
    }

    #[test]
    fn empty_module_list_prepares_nothing() {
        let (prepared, identity) = PreparedSecurity::prepare(&[]).expect("prepare");
        assert!(prepared.is_empty());
        assert_eq!(identity, IdentityOverride::default());
        prepared.apply().expect("no-op apply");
    }

    #[test]
    fn selinux_on_host_without_selinux_is_rejected() {
        if Path::new(SELINUX_FS).exists() {
            return;
        }
        assert!(matches!(
            PreparedSecurity::prepare(&[SecurityModule::SeLinux("unconfined_t".into())]),
            Err(EngineError::Config { .. })
        ));
    }
}
