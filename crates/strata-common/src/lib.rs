//! # strata-common
//!
//! Shared request types, the engine error taxonomy, configuration models,
//! and constants used across the strata workspace.
//!
//! This crate is the leaf of the dependency graph: it depends on no other
//! internal crate and performs no privileged operations.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;
