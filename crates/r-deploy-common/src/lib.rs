//! ---
//! deploy_section: "01-core-functionality"
//! deploy_subsection: "module"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "Shared primitives and utilities for the deployment engine."
//! deploy_version: "v0.0.0-prealpha"
//! deploy_owner: "tbd"
//! ---
//! Shared primitives for the R-Deploy workspace.
//! This crate exposes configuration loading, tracing initialisation, and
//! the time helpers consumed by the orchestration crates.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    DeployConfig, JournalConfig, LoggingConfig, MetricsConfig, SnapshotConfig, SnapshotFormat,
};
pub use logging::{init_tracing, LogFormat};
