//! # ci-cost-core
//!
//! Core types, errors, and logging for ci-cost.
//!
//! This crate provides:
//! - [`CoreError`] - Configuration, file, schema and record validation errors
//! - [`logging`] - Tracing setup
//! - [`types`] - Typed records: [`ExecutionGraph`], [`Task`], [`Run`], [`Push`],
//!   [`ArtifactInfo`] and [`CostRow`]

pub mod error;
pub mod logging;
pub mod types;

pub use error::{CoreError, Result};
pub use logging::{LogGuard, init_logging};
pub use types::{
    ArtifactDeclaration, ArtifactInfo, CostRow, ExecutionGraph, Origin, Push, Run, RunState, Task,
    short_project,
};
