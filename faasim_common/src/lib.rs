//! faasim Common Library
//!
//! Shared building blocks for the faasim workspace: the enumerated
//! configuration surface, workload definitions (task DAGs, workflow files,
//! invocation traces, synthetic generators), and the opaque Harvest-VM
//! model providers (survival curve, per-second core schedules).
//!
//! # Module Structure
//!
//! - [`config`] - TOML configuration loading, CLI overrides, validation
//! - [`error`] - Error types shared across the workspace
//! - [`workload`] - DAG type, workflow/bundle/trace loaders and generators
//! - [`harvestvm`] - Survival model and cores-table providers

pub mod config;
pub mod error;
pub mod harvestvm;
pub mod workload;
