//! # strata-core
//!
//! Low-level Linux isolation primitives for the strata engine.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: mount, user, and PID isolation.
//! - **Filesystem**: bind, proc, and tmpfs mounts, `OverlayFS` stacking,
//!   loop-attached images, and entering the assembled root.
//! - **Capabilities**: bounding-set reduction and capability set control.
//! - **Privilege**: the one-way transition from privileged setup to the
//!   credentials the contained process runs with.
//!
//! Every mount-performing call takes a [`privilege::SetupPrivilege`]
//! reference, which only exists during the privileged setup phase.
//! All unsafe system calls are encapsulated in safe wrappers with
//! `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod capability;
pub mod filesystem;
pub mod namespace;
pub mod privilege;
pub mod security;
