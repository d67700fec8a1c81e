//! Linux backend: kernel namespaces, mounts, and a fork/exec launcher.

use strata_common::config::EngineConfig;
use strata_common::error::Result;
use strata_common::types::{ExecutionRequest, ExitResult, OptionSet};
use strata_core::privilege::{Identity, PrivilegePhase};

use super::IsolationBackend;
use crate::coordinator::{Coordinator, PreparedEnvironment, Ready};
use crate::launcher::{Launcher, StdioMode};
use crate::plan::MountPlan;
use crate::signal::Interrupt;

/// Isolation through Linux namespaces on the local host.
#[derive(Debug, Clone)]
pub struct LinuxBackend {
    coordinator: Coordinator,
    launcher: Launcher,
}

impl LinuxBackend {
    /// Creates a backend acting for `identity`.
    #[must_use]
    pub fn new(config: EngineConfig, identity: Identity, interrupt: Interrupt) -> Self {
        Self {
            coordinator: Coordinator::new(config.clone(), identity, interrupt.clone()),
            launcher: Launcher::new(config, interrupt),
        }
    }
}

impl IsolationBackend for LinuxBackend {
    type Prepared = PreparedEnvironment;
    type Ready = Ready;

    fn apply(&self, plan: MountPlan, options: &OptionSet) -> Result<PreparedEnvironment> {
        self.coordinator.apply(plan, options)
    }

    fn drop_privileges(&self, prepared: PreparedEnvironment) -> Result<Ready> {
        self.coordinator.drop_privileges(prepared)
    }

    fn privilege_phase(&self, ready: &Ready) -> PrivilegePhase {
        ready.privilege().phase()
    }

    fn launch(
        &self,
        ready: Ready,
        request: &ExecutionRequest,
        stdio: StdioMode,
    ) -> Result<ExitResult> {
        self.launcher.launch(ready, request, stdio)
    }
}
