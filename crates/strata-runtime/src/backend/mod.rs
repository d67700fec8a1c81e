//! Isolation backend abstraction.
//!
//! The dispatcher drives a backend through three phases. Each phase
//! consumes the previous phase's value, so a process can only be launched
//! from an environment whose privileged setup has ended.

pub mod linux;

use strata_common::error::Result;
use strata_common::types::{ExecutionRequest, ExitResult, OptionSet};
use strata_core::privilege::PrivilegePhase;

use crate::launcher::StdioMode;
use crate::plan::MountPlan;

/// Platform mechanism that isolates and runs one request.
pub trait IsolationBackend {
    /// Environment after privileged setup.
    type Prepared;
    /// Environment after the setup phase ended.
    type Ready;

    /// Creates namespaces and applies the mount plan.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails; nothing applied survives it.
    fn apply(&self, plan: MountPlan, options: &OptionSet) -> Result<Self::Prepared>;

    /// Ends the privileged setup phase.
    ///
    /// # Errors
    ///
    /// Returns an error if the drop cannot be prepared.
    fn drop_privileges(&self, prepared: Self::Prepared) -> Result<Self::Ready>;

    /// Phase the contained process will run in.
    fn privilege_phase(&self, ready: &Self::Ready) -> PrivilegePhase;

    /// Runs the request's command and waits for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be started.
    fn launch(
        &self,
        ready: Self::Ready,
        request: &ExecutionRequest,
        stdio: StdioMode,
    ) -> Result<ExitResult>;
}
