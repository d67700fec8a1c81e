//! Action execution engine for the strata runtime.
//!
//! Control flow for one invocation:
//! [`dispatcher::Dispatcher`] → [`plan::PlanBuilder`] (consulting
//! [`overlay`] and [`app`]) → [`coordinator::Coordinator`] →
//! [`launcher::Launcher`] → exit code.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod app;
pub mod backend;
pub mod coordinator;
pub mod dispatcher;
pub mod image;
pub mod launcher;
pub mod overlay;
pub mod plan;
pub mod signal;
