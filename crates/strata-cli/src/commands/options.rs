//! Options shared by every action.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use strata_common::types::{BindSpec, HomeSpec, OptionSet, OverlaySpec, SecurityModule};

/// Image, command, and options of an action.
#[derive(Args, Debug)]
pub struct ActionTarget {
    /// Engine options.
    #[command(flatten)]
    pub options: ActionOptions,

    /// Image root filesystem (path or file:// URI).
    pub image: String,

    /// Command and arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Flags accepted by `run`, `exec`, and `shell`.
#[allow(clippy::struct_excessive_bools)]
#[derive(Args, Debug, Default)]
pub struct ActionOptions {
    /// Bind a host path: src[:dst[:ro|rw]]; comma-separated lists accepted.
    #[arg(short = 'B', long)]
    pub bind: Vec<String>,

    /// Overlay a directory or ext3/squashfs image: path[:ro].
    #[arg(short, long)]
    pub overlay: Vec<String>,

    /// Security module: apparmor:<profile>, selinux:<context>, uid:<n>, gid:<n>.
    #[arg(long)]
    pub security: Vec<String>,

    /// Keep elevated capabilities in the contained process (root only).
    #[arg(long)]
    pub keep_privs: bool,

    /// Capabilities to drop, comma-separated.
    #[arg(long)]
    pub drop_caps: Option<String>,

    /// Use private home and temporary directories.
    #[arg(short, long)]
    pub contain: bool,

    /// Do not provide a home directory.
    #[arg(long)]
    pub no_home: bool,

    /// Home directory: src[:dst].
    #[arg(short = 'H', long)]
    pub home: Option<String>,

    /// Host directory backing /tmp and /var/tmp with --contain.
    #[arg(short = 'W', long)]
    pub workdir: Option<PathBuf>,

    /// Working directory inside the container.
    #[arg(long)]
    pub pwd: Option<PathBuf>,

    /// SCIF app to run in.
    #[arg(long)]
    pub app: Option<String>,

    /// Run in a new user namespace.
    #[arg(short = 'u', long)]
    pub userns: bool,

    /// Run in a new PID namespace.
    #[arg(short, long)]
    pub pid: bool,

    /// Shell started by `shell`.
    #[arg(short, long)]
    pub shell: Option<PathBuf>,

    /// Start from an empty environment.
    #[arg(short = 'e', long)]
    pub cleanenv: bool,
}

impl ActionOptions {
    /// Converts the flags into an option set.
    ///
    /// Cross-field checks happen when the request is built.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first malformed flag value.
    pub fn into_option_set(self) -> anyhow::Result<OptionSet> {
        let mut binds = Vec::new();
        for list in &self.bind {
            binds.extend(BindSpec::parse_list(list).with_context(|| format!("--bind {list}"))?);
        }
        let overlays = self
            .overlay
            .iter()
            .map(|o| o.parse::<OverlaySpec>().with_context(|| format!("--overlay {o}")))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let security_modules = self
            .security
            .iter()
            .map(|s| s.parse::<SecurityModule>().with_context(|| format!("--security {s}")))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let home = self
            .home
            .as_deref()
            .map(|h| h.parse::<HomeSpec>().with_context(|| format!("--home {h}")))
            .transpose()?;

        Ok(OptionSet {
            binds,
            overlays,
            security_modules,
            capability_drop: self.drop_caps,
            keep_privileges: self.keep_privs,
            contain_only: self.contain,
            no_home: self.no_home,
            home,
            workdir: self.workdir,
            target_pwd: self.pwd,
            app: self.app,
            use_user_namespace: self.userns,
            pid_namespace: self.pid,
            shell: self.shell,
            clean_env: self.cleanenv,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_lists_are_flattened_in_order() {
        let options = ActionOptions {
            bind: vec!["/a:/x,/b".into(), "/c:/z:ro".into()],
            ..ActionOptions::default()
        }
        .into_option_set()
        .expect("options");
        let destinations: Vec<_> = options.binds.iter().map(|b| b.destination.clone()).collect();
        assert_eq!(
            destinations,
            vec![PathBuf::from("/x"), PathBuf::from("/b"), PathBuf::from("/z")]
        );
        assert!(options.binds[2].read_only);
    }

    #[test]
    fn unknown_security_module_is_rejected() {
        let result = ActionOptions {
            security: vec!["tomoyo:default".into()],
            ..ActionOptions::default()
        }
        .into_option_set();
        assert!(result.is_err());
    }

    #[test]
    fn invalid_capability_fails_validation() {
        let options = ActionOptions {
            drop_caps: Some("CAP_TELEPORT".into()),
            ..ActionOptions::default()
        }
        .into_option_set()
        .expect("options");
        assert!(options.validate().is_err());
    }

    #[test]
    fn malformed_bind_names_the_flag() {
        let err = ActionOptions {
            bind: vec!["/a:/b:rx".into()],
            ..ActionOptions::default()
        }
        .into_option_set()
        .expect_err("bad mode");
        assert!(err.to_string().contains("--bind"));
    }

    #[test]
    fn flags_map_onto_option_set() {
        let options = ActionOptions {
            overlay: vec!["squashfs.simg:ro".into()],
            contain: true,
            no_home: true,
            userns: true,
            app: Some("foo".into()),
            ..ActionOptions::default()
        }
        .into_option_set()
        .expect("options");
        assert!(options.overlays[0].read_only);
        assert!(options.contain_only && options.no_home && options.use_user_namespace);
        assert_eq!(options.app.as_deref(), Some("foo"));
    }
}
