//! Action dispatch.
//!
//! One [`Dispatcher::dispatch`] call drives a request through
//! `Init → PlanBuilt → Prepared → Launched → Done`. Every failure goes
//! straight to `Done` with the engine failure exit code; the contained
//! process's own exit code is passed through untouched.

use std::fmt;

use strata_common::config::EngineConfig;
use strata_common::error::{EngineError, Result};
use strata_common::types::{ExecutionRequest, ExitResult};
use strata_core::privilege::{Identity, PrivilegePhase};
use uuid::Uuid;

use crate::backend::IsolationBackend;
use crate::backend::linux::LinuxBackend;
use crate::launcher::{self, StdioMode};
use crate::plan::PlanBuilder;
use crate::signal::Interrupt;

/// State of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionState {
    /// Request received.
    Init,
    /// Mount plan built.
    PlanBuilt,
    /// Mounts applied in the privileged phase.
    Prepared,
    /// Privileges dropped and the process started.
    Launched,
    /// Finished, successfully or not.
    Done,
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::PlanBuilt => write!(f, "plan-built"),
            Self::Prepared => write!(f, "prepared"),
            Self::Launched => write!(f, "launched"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// Result of one dispatch.
#[derive(Debug)]
pub struct Outcome {
    /// Exit result reported to the caller.
    pub exit: ExitResult,
    /// Engine failure, if the engine rather than the process failed.
    pub error: Option<EngineError>,
    /// States visited, in order.
    pub states: Vec<ActionState>,
}

impl Outcome {
    /// Exit code for the calling process.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.exit.code
    }

    /// Whether a state was visited.
    #[must_use]
    pub fn visited(&self, state: ActionState) -> bool {
        self.states.contains(&state)
    }
}

/// Top-level driver of one invocation.
#[derive(Debug)]
pub struct Dispatcher<B> {
    planner: PlanBuilder,
    backend: B,
}

impl Dispatcher<LinuxBackend> {
    /// Creates a dispatcher for the invoking user on this host.
    ///
    /// # Errors
    ///
    /// Returns an error if the invoking identity cannot be determined.
    pub fn for_host(config: EngineConfig, interrupt: Interrupt) -> Result<Self> {
        let identity = Identity::invoking()?;
        tracing::debug!(uid = identity.uid, user = %identity.name, "invoking identity");
        Ok(Self::new(
            PlanBuilder::new(config.clone(), identity.clone()),
            LinuxBackend::new(config, identity, interrupt),
        ))
    }
}

impl<B: IsolationBackend> Dispatcher<B> {
    /// Creates a dispatcher over `backend`.
    #[must_use]
    pub const fn new(planner: PlanBuilder, backend: B) -> Self {
        Self { planner, backend }
    }

    /// The backend in use.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Runs `request` to completion.
    pub fn dispatch(&self, request: &ExecutionRequest, stdio: StdioMode) -> Outcome {
        let span = tracing::info_span!(
            "invocation",
            id = %Uuid::new_v4(),
            action = %request.action
        );
        let _entered = span.enter();

        let mut states = vec![ActionState::Init];
        let result = self.drive(request, stdio, &mut states);
        transition(&mut states, ActionState::Done);
        match result {
            Ok(exit) => {
                tracing::info!(code = exit.code, signal = ?exit.signal, "action finished");
                Outcome {
                    exit,
                    error: None,
                    states,
                }
            }
            Err(error) => {
                tracing::debug!(error = %error, class = %error.class(), "action failed");
                Outcome {
                    exit: ExitResult::engine_failure(),
                    error: Some(error),
                    states,
                }
            }
        }
    }

    fn drive(
        &self,
        request: &ExecutionRequest,
        stdio: StdioMode,
        states: &mut Vec<ActionState>,
    ) -> Result<ExitResult> {
        let plan = self.planner.build(request)?;
        transition(states, ActionState::PlanBuilt);
        launcher::validate_command(request.action, &request.command)?;

        let prepared = self.backend.apply(plan, &request.options)?;
        transition(states, ActionState::Prepared);

        let ready = self.backend.drop_privileges(prepared)?;
        let phase = self.backend.privilege_phase(&ready);
        match phase {
            PrivilegePhase::Dropped => {}
            PrivilegePhase::Retained if request.options.keep_privileges => {
                tracing::info!("privileges retained by request");
            }
            PrivilegePhase::Retained | PrivilegePhase::PrivilegedSetup => {
                return Err(EngineError::PrivilegeDrop {
                    reason: format!("refusing to launch in phase {phase}"),
                });
            }
        }
        transition(states, ActionState::Launched);
        self.backend.launch(ready, request, stdio)
    }
}

fn transition(states: &mut Vec<ActionState>, next: ActionState) {
    tracing::debug!(state = %next, "dispatcher state");
    states.push(next);
}
