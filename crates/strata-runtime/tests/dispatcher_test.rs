//! Dispatcher state machine tests.
//!
//! A recording backend stands in for the kernel so every path of the
//! dispatcher can be exercised without root:
//! 1. Exit codes pass through untouched
//! 2. Configuration errors stop before any privileged step
//! 3. The privilege drop always precedes launch
//! 4. Command resolution for `run`, `exec`, and `shell`

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::cell::RefCell;
use std::path::{Path, PathBuf};

use strata_common::config::EngineConfig;
use strata_common::error::{EngineError, Result};
use strata_common::types::{
    ActionKind, BindSpec, ExecutionRequest, ExitResult, OptionSet, OverlaySpec,
};
use strata_core::privilege::{Identity, PrivilegePhase};
use strata_runtime::backend::IsolationBackend;
use strata_runtime::dispatcher::{ActionState, Dispatcher};
use strata_runtime::launcher::{self, StdioMode};
use strata_runtime::plan::{LaunchContext, MountKind, MountPlan, PlanBuilder};

struct Recording {
    calls: RefCell<Vec<&'static str>>,
    argv: RefCell<Vec<String>>,
    overlays: RefCell<usize>,
    fail_apply: bool,
    phase: PrivilegePhase,
    exit: ExitResult,
}

impl Recording {
    fn exiting(code: i32) -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            argv: RefCell::new(Vec::new()),
            overlays: RefCell::new(0),
            fail_apply: false,
            phase: PrivilegePhase::Dropped,
            exit: ExitResult::exited(code),
        }
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.borrow().clone()
    }
}

impl IsolationBackend for Recording {
    type Prepared = (PathBuf, LaunchContext);
    type Ready = (PathBuf, LaunchContext);

    fn apply(&self, plan: MountPlan, _options: &OptionSet) -> Result<Self::Prepared> {
        self.calls.borrow_mut().push("apply");
        *self.overlays.borrow_mut() = plan.of_kind(MountKind::OverlayLayer).count();
        if self.fail_apply {
            return Err(EngineError::OverlayMountFailed {
                path: PathBuf::from("/broken.img"),
                reason: "wrong filesystem".into(),
            });
        }
        let root = plan.image_root().to_path_buf();
        let (_, context) = plan.into_parts();
        Ok((root, context))
    }

    fn drop_privileges(&self, prepared: Self::Prepared) -> Result<Self::Ready> {
        self.calls.borrow_mut().push("drop");
        Ok(prepared)
    }

    fn privilege_phase(&self, _ready: &Self::Ready) -> PrivilegePhase {
        self.phase
    }

    fn launch(
        &self,
        ready: Self::Ready,
        request: &ExecutionRequest,
        _stdio: StdioMode,
    ) -> Result<ExitResult> {
        self.calls.borrow_mut().push("launch");
        let (root, context) = ready;
        let argv = launcher::resolve_command(
            request.action,
            &request.command,
            &context,
            &root,
            Path::new("/bin/sh"),
        )?;
        *self.argv.borrow_mut() = argv;
        Ok(self.exit)
    }
}

struct Fixture {
    image: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        let image = tempfile::tempdir().expect("image");
        let app = image.path().join("scif/apps/foo/scif");
        std::fs::create_dir_all(&app).expect("mkdir app");
        std::fs::write(app.join("runscript"), "#!/bin/sh\necho FOO\n").expect("runscript");
        std::fs::create_dir_all(image.path().join("scif/apps/noscript")).expect("mkdir");
        Self { image }
    }

    fn dispatcher(&self, backend: Recording) -> Dispatcher<Recording> {
        let identity = Identity {
            uid: 1000,
            gid: 1000,
            name: "user".into(),
            home: PathBuf::from("/"),
        };
        Dispatcher::new(PlanBuilder::new(EngineConfig::default(), identity), backend)
    }

    fn request(&self, action: ActionKind, command: &[&str], options: OptionSet) -> ExecutionRequest {
        ExecutionRequest {
            action,
            image: self.image.path().to_path_buf(),
            command: command.iter().map(ToString::to_string).collect(),
            options,
        }
    }
}

// ── Exit codes ───────────────────────────────────────────────────────

#[test]
fn pipeline_exit_codes_pass_through() {
    let fx = Fixture::new();
    for code in [0, 1, 42] {
        let dispatcher = fx.dispatcher(Recording::exiting(code));
        let outcome = dispatcher.dispatch(
            &fx.request(ActionKind::Exec, &["true"], OptionSet::default()),
            StdioMode::Inherit,
        );
        assert_eq!(outcome.exit_code(), code);
        assert!(outcome.error.is_none());
        assert_eq!(
            outcome.states,
            vec![
                ActionState::Init,
                ActionState::PlanBuilt,
                ActionState::Prepared,
                ActionState::Launched,
                ActionState::Done
            ]
        );
    }
}

#[test]
fn pipeline_drop_precedes_launch() {
    let fx = Fixture::new();
    let dispatcher = fx.dispatcher(Recording::exiting(0));
    let _ = dispatcher.dispatch(
        &fx.request(ActionKind::Shell, &[], OptionSet::default()),
        StdioMode::Inherit,
    );
    assert_eq!(dispatcher.backend().calls(), vec!["apply", "drop", "launch"]);
}

// ── Configuration failures ───────────────────────────────────────────

#[test]
fn pipeline_empty_exec_starts_nothing() {
    let fx = Fixture::new();
    let dispatcher = fx.dispatcher(Recording::exiting(0));
    let outcome = dispatcher.dispatch(
        &fx.request(ActionKind::Exec, &[], OptionSet::default()),
        StdioMode::Inherit,
    );
    assert_eq!(outcome.exit_code(), 1);
    assert!(matches!(outcome.error, Some(EngineError::EmptyCommand)));
    assert!(dispatcher.backend().calls().is_empty());
    assert!(!outcome.visited(ActionState::Launched));
}

#[test]
fn pipeline_missing_app_fails_before_setup() {
    let fx = Fixture::new();
    for action in [ActionKind::Run, ActionKind::Exec] {
        let dispatcher = fx.dispatcher(Recording::exiting(0));
        let options = OptionSet {
            app: Some("fakeapp".into()),
            ..OptionSet::default()
        };
        let outcome = dispatcher.dispatch(&fx.request(action, &["true"], options), StdioMode::Inherit);
        assert_eq!(outcome.exit_code(), 1);
        assert!(matches!(outcome.error, Some(EngineError::AppNotFound { .. })));
        assert_eq!(outcome.states, vec![ActionState::Init, ActionState::Done]);
        assert!(dispatcher.backend().calls().is_empty());
    }
}

#[test]
fn pipeline_missing_bind_source_applies_nothing() {
    let fx = Fixture::new();
    let dispatcher = fx.dispatcher(Recording::exiting(0));
    let options = OptionSet {
        binds: vec![BindSpec {
            source: PathBuf::from("/nonexistent/source"),
            destination: PathBuf::from("/mnt"),
            read_only: false,
        }],
        ..OptionSet::default()
    };
    let outcome = dispatcher.dispatch(
        &fx.request(ActionKind::Exec, &["true"], options),
        StdioMode::Inherit,
    );
    assert!(matches!(outcome.error, Some(EngineError::InvalidBind { .. })));
    assert!(dispatcher.backend().calls().is_empty());
}

#[test]
fn pipeline_setup_failure_never_launches() {
    let fx = Fixture::new();
    let mut backend = Recording::exiting(0);
    backend.fail_apply = true;
    let dispatcher = fx.dispatcher(backend);
    let outcome = dispatcher.dispatch(
        &fx.request(ActionKind::Exec, &["true"], OptionSet::default()),
        StdioMode::Inherit,
    );
    assert_eq!(outcome.exit_code(), 1);
    assert!(matches!(
        outcome.error,
        Some(EngineError::OverlayMountFailed { .. })
    ));
    assert_eq!(dispatcher.backend().calls(), vec!["apply"]);
    assert_eq!(
        outcome.states,
        vec![ActionState::Init, ActionState::PlanBuilt, ActionState::Done]
    );
}

// ── Privilege invariant ──────────────────────────────────────────────

#[test]
fn pipeline_retained_privileges_need_explicit_request() {
    let fx = Fixture::new();
    let mut backend = Recording::exiting(0);
    backend.phase = PrivilegePhase::Retained;
    let dispatcher = fx.dispatcher(backend);
    let outcome = dispatcher.dispatch(
        &fx.request(ActionKind::Exec, &["true"], OptionSet::default()),
        StdioMode::Inherit,
    );
    assert!(matches!(outcome.error, Some(EngineError::PrivilegeDrop { .. })));
    assert_eq!(dispatcher.backend().calls(), vec!["apply", "drop"]);
}

#[test]
fn pipeline_keep_privileges_launches_retained() {
    let fx = Fixture::new();
    let mut backend = Recording::exiting(0);
    backend.phase = PrivilegePhase::Retained;
    let dispatcher = fx.dispatcher(backend);
    let options = OptionSet {
        keep_privileges: true,
        ..OptionSet::default()
    };
    let outcome = dispatcher.dispatch(
        &fx.request(ActionKind::Exec, &["true"], options),
        StdioMode::Inherit,
    );
    assert!(outcome.error.is_none());
    assert_eq!(dispatcher.backend().calls(), vec!["apply", "drop", "launch"]);
}

// ── Command resolution ───────────────────────────────────────────────

#[test]
fn pipeline_run_app_uses_app_runscript() {
    let fx = Fixture::new();
    let dispatcher = fx.dispatcher(Recording::exiting(0));
    let options = OptionSet {
        app: Some("foo".into()),
        ..OptionSet::default()
    };
    let outcome = dispatcher.dispatch(&fx.request(ActionKind::Run, &[], options), StdioMode::Inherit);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(
        *dispatcher.backend().argv.borrow(),
        vec!["/bin/sh", "/scif/apps/foo/scif/runscript"]
    );
}

#[test]
fn pipeline_run_app_without_runscript_is_an_execution_error() {
    let fx = Fixture::new();
    let dispatcher = fx.dispatcher(Recording::exiting(0));
    let options = OptionSet {
        app: Some("noscript".into()),
        ..OptionSet::default()
    };
    let outcome = dispatcher.dispatch(&fx.request(ActionKind::Run, &[], options), StdioMode::Inherit);
    assert_eq!(outcome.exit_code(), 1);
    assert!(matches!(
        outcome.error,
        Some(EngineError::RunScriptMissing { .. })
    ));
}

#[test]
fn pipeline_run_without_runscript_starts_shell() {
    let fx = Fixture::new();
    let dispatcher = fx.dispatcher(Recording::exiting(0));
    let _ = dispatcher.dispatch(
        &fx.request(ActionKind::Run, &[], OptionSet::default()),
        StdioMode::Inherit,
    );
    assert_eq!(*dispatcher.backend().argv.borrow(), vec!["/bin/sh"]);
}

#[test]
fn pipeline_overlays_reach_the_backend_in_order() {
    let fx = Fixture::new();
    let low = tempfile::tempdir().expect("low");
    let high = tempfile::tempdir().expect("high");
    let dispatcher = fx.dispatcher(Recording::exiting(0));
    let options = OptionSet {
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
    };
    let outcome = dispatcher.dispatch(
        &fx.request(ActionKind::Exec, &["touch", "/x"], options),
        StdioMode::Inherit,
    );
    assert!(outcome.error.is_none());
    assert_eq!(*dispatcher.backend().overlays.borrow(), 2);
}
