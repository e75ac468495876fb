//! ---
//! deploy_section: "02-update-orchestration"
//! deploy_subsection: "module"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "Error taxonomy for update orchestration."
//! deploy_version: "v0.0.0-prealpha"
//! deploy_owner: "tbd"
//! ---
use std::any::Any;
use std::fmt;
use std::time::Duration;

use strum::{AsRefStr, Display};
use thiserror::Error;

use crate::descriptor::{ApprovalRole, UpdateStatus};

/// Operation invoked on an external component updater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ComponentOperation {
    DescribeState,
    Apply,
    RestoreState,
}

/// Failure of a single call into a component updater.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComponentError {
    #[error("component '{component}' is not registered ({operation})")]
    NotRegistered {
        component: String,
        operation: ComponentOperation,
    },
    #[error("{operation} on component '{component}' timed out after {timeout:?}")]
    TimedOut {
        component: String,
        operation: ComponentOperation,
        timeout: Duration,
    },
    #[error("{operation} on component '{component}' failed: {cause}")]
    Failed {
        component: String,
        operation: ComponentOperation,
        cause: String,
    },
}

impl ComponentError {
    pub fn component(&self) -> &str {
        match self {
            ComponentError::NotRegistered { component, .. }
            | ComponentError::TimedOut { component, .. }
            | ComponentError::Failed { component, .. } => component,
        }
    }

    pub fn operation(&self) -> ComponentOperation {
        match self {
            ComponentError::NotRegistered { operation, .. }
            | ComponentError::TimedOut { operation, .. }
            | ComponentError::Failed { operation, .. } => *operation,
        }
    }
}

struct RoleList<'a>(&'a [ApprovalRole]);

impl fmt::Display for RoleList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(|role| role.as_ref()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

struct NameList<'a>(&'a [String]);

impl fmt::Display for NameList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// Errors surfaced by the orchestration core.
///
/// `PartialRollback` and `RollbackFailed` mean the system is in neither the
/// pre- nor the post-update state; they are never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeployError {
    #[error("invalid update spec: {0}")]
    Validation(String),

    #[error(
        "update {update_id} lacks approvals; required roles {}, missing {}",
        RoleList(required),
        RoleList(missing)
    )]
    Approval {
        update_id: String,
        required: Vec<ApprovalRole>,
        missing: Vec<ApprovalRole>,
    },

    #[error("update {update_id} is already {status}")]
    AlreadyQueued {
        update_id: String,
        status: UpdateStatus,
    },

    #[error("update {update_id} ended {status}; resubmit it as a new update")]
    UpdateFinalized {
        update_id: String,
        status: UpdateStatus,
    },

    #[error("update {update_id} not found")]
    NotFound { update_id: String },

    #[error("deployment run {active_run} is already in progress")]
    ConcurrentDeployment { active_run: String },

    #[error("run {run_id}: snapshot capture failed: {cause}")]
    SnapshotCapture {
        run_id: String,
        cause: ComponentError,
    },

    #[error("no snapshot recorded under label '{label}'")]
    SnapshotNotFound { label: String },

    #[error("run {run_id}: update {update_id} depends on {dependency} which is {state}")]
    DependencyUnsatisfied {
        run_id: String,
        update_id: String,
        dependency: String,
        state: String,
    },

    #[error("run {run_id}: applying update {update_id} failed: {cause}")]
    ComponentApply {
        run_id: String,
        update_id: String,
        cause: ComponentError,
    },

    #[error("run {run_id}: verification failed for checks {}", NameList(failed_checks))]
    VerificationFailed {
        run_id: String,
        failed_checks: Vec<String>,
    },

    #[error(
        "partial rollback of snapshot {snapshot_id} ('{label}'): restored {}, not restored {}",
        NameList(restored),
        NameList(not_restored)
    )]
    PartialRollback {
        label: String,
        snapshot_id: String,
        restored: Vec<String>,
        not_restored: Vec<String>,
        causes: Vec<ComponentError>,
    },

    #[error("run {run_id}: rollback after '{trigger}' failed: {source}")]
    RollbackFailed {
        run_id: String,
        trigger: Box<DeployError>,
        #[source]
        source: Box<DeployError>,
    },

    #[error("run {run_id} aborted: {reason}")]
    RunAborted { run_id: String, reason: String },
}

impl DeployError {
    /// Errors after which the system state is unknown and an operator must step in.
    pub fn requires_operator(&self) -> bool {
        matches!(
            self,
            DeployError::PartialRollback { .. }
                | DeployError::RollbackFailed { .. }
                | DeployError::RunAborted { .. }
        )
    }

    /// Short machine-readable tag used in logs and the journal.
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::Validation(_) => "validation",
            DeployError::Approval { .. } => "approval",
            DeployError::AlreadyQueued { .. } => "already_queued",
            DeployError::UpdateFinalized { .. } => "update_finalized",
            DeployError::NotFound { .. } => "not_found",
            DeployError::ConcurrentDeployment { .. } => "concurrent_deployment",
            DeployError::SnapshotCapture { .. } => "snapshot_capture",
            DeployError::SnapshotNotFound { .. } => "snapshot_not_found",
            DeployError::DependencyUnsatisfied { .. } => "dependency_unsatisfied",
            DeployError::ComponentApply { .. } => "component_apply",
            DeployError::VerificationFailed { .. } => "verification_failed",
            DeployError::PartialRollback { .. } => "partial_rollback",
            DeployError::RollbackFailed { .. } => "rollback_failed",
            DeployError::RunAborted { .. } => "run_aborted",
        }
    }
}

/// Text of a caught panic payload; collaborators usually panic with a string.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&'static str>()
            .map(|message| (*message).to_owned())
            .unwrap_or_else(|| "non-string panic payload".to_owned()),
    }
}
