//! ---
//! deploy_section: "02-update-orchestration"
//! deploy_subsection: "module"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "Primary orchestration and lifecycle management."
//! deploy_version: "v0.0.0-prealpha"
//! deploy_owner: "tbd"
//! ---
//! Approval-gated update registry, FIFO deployment queue, snapshot store and
//! the deployment coordinator that applies queued updates as one
//! all-or-nothing batch with automatic rollback.

pub mod approval;
pub mod component;
pub mod coordinator;
pub mod descriptor;
pub mod error;
pub mod events;
pub mod journal;
pub mod queue;
pub mod registry;
pub mod snapshot;

pub use approval::ApprovalGate;
pub use component::{ComponentState, ComponentUpdater, ComponentUpdaterRegistry, MemoryComponent};
pub use coordinator::{
    CoordinatorBuilder, DeploymentCoordinator, DeploymentOutcome, DeploymentReport,
    DeploymentStatus, UpdateRunResult,
};
pub use descriptor::{
    Approval, ApprovalRole, Risk, RiskLevel, UpdateDescriptor, UpdateSpec, UpdateStatus,
    UpdateType,
};
pub use error::{ComponentError, ComponentOperation, DeployError};
pub use events::{DeploymentEvent, DeploymentPhase};
pub use journal::DeploymentJournal;
pub use queue::DeploymentQueue;
pub use registry::UpdateRegistry;
pub use snapshot::{config_hash, Snapshot, SnapshotStore};

pub use r_deploy_testharness::{
    CheckOutcome, SuiteHarness, TestCaseResult, TestHarness, TestReport, TestStatus,
};
