//! ---
//! deploy_section: "02-update-orchestration"
//! deploy_subsection: "module"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "Deployment run phases broadcast to observers."
//! deploy_version: "v0.0.0-prealpha"
//! deploy_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Position of a deployment run in its state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum DeploymentPhase {
    Idle,
    SnapshotCaptured {
        snapshot_id: String,
    },
    Applying {
        index: usize,
        total: usize,
        update_id: String,
    },
    Verifying,
    Committed,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl DeploymentPhase {
    pub fn name(&self) -> &'static str {
        match self {
            DeploymentPhase::Idle => "idle",
            DeploymentPhase::SnapshotCaptured { .. } => "snapshot_captured",
            DeploymentPhase::Applying { .. } => "applying",
            DeploymentPhase::Verifying => "verifying",
            DeploymentPhase::Committed => "committed",
            DeploymentPhase::RollingBack => "rolling_back",
            DeploymentPhase::RolledBack => "rolled_back",
            DeploymentPhase::RollbackFailed => "rollback_failed",
        }
    }

    /// Outcome phases; `Idle` follows once the single-flight slot is released.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentPhase::Committed
                | DeploymentPhase::RolledBack
                | DeploymentPhase::RollbackFailed
        )
    }
}

/// Phase transition observed during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentEvent {
    pub run_id: String,
    pub phase: DeploymentPhase,
    pub at: DateTime<Utc>,
}

impl DeploymentEvent {
    pub fn new(run_id: impl Into<String>, phase: DeploymentPhase) -> Self {
        Self {
            run_id: run_id.into(),
            phase,
            at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_serialize_with_tag() {
        let phase = DeploymentPhase::Applying {
            index: 1,
            total: 3,
            update_id: "u2".into(),
        };
        let value = serde_json::to_value(&phase).unwrap();
        assert_eq!(value["phase"], "applying");
        assert_eq!(value["index"], 1);
        assert_eq!(phase.name(), "applying");
        assert!(!phase.is_terminal());
        assert!(DeploymentPhase::RollbackFailed.is_terminal());
        assert!(!DeploymentPhase::Idle.is_terminal());
    }
}
