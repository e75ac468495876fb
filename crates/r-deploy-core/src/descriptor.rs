//! ---
//! deploy_section: "02-update-orchestration"
//! deploy_subsection: "module"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "Update descriptors, approvals, and lifecycle status."
//! deploy_version: "v0.0.0-prealpha"
//! deploy_owner: "tbd"
//! ---
use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::error::DeployError;

/// Area of the system an update targets.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UpdateType {
    Core,
    Contract,
    Api,
    Ui,
    Consensus,
    Security,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// High and critical updates need security sign-off.
    pub fn is_elevated(&self) -> bool {
        matches!(self, RiskLevel::High | RiskLevel::Critical)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Risk {
    pub level: RiskLevel,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub mitigations: Vec<String>,
}

impl Risk {
    pub fn new(level: RiskLevel) -> Self {
        Self {
            level,
            description: String::new(),
            mitigations: Vec::new(),
        }
    }
}

/// Roles that may sign off an update. Declaration order is the order in
/// which required roles are reported.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ApprovalRole {
    Developer,
    Security,
    Superadmin,
    Devops,
}

/// One append-only approval record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub role: ApprovalRole,
    pub approver: String,
    pub approved: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UpdateStatus {
    Created,
    Queued,
    Deploying,
    Deployed,
    RolledBack,
    RollbackFailed,
}

impl UpdateStatus {
    /// Statuses that block a second enqueue of the same update.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            UpdateStatus::Queued | UpdateStatus::Deploying | UpdateStatus::Deployed
        )
    }

    /// Rollback terminals; such updates are resubmitted as new updates.
    pub fn is_rollback_terminal(&self) -> bool {
        matches!(self, UpdateStatus::RolledBack | UpdateStatus::RollbackFailed)
    }
}

/// Caller-supplied input to `UpdateRegistry::create_update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSpec {
    #[serde(rename = "type")]
    pub update_type: UpdateType,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub components: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub risk: Risk,
    #[serde(default = "rollback_supported_default")]
    pub rollback_supported: bool,
    pub author: String,
}

fn rollback_supported_default() -> bool {
    true
}

impl UpdateSpec {
    /// Minimal spec with the required fields; everything else defaulted.
    pub fn new(
        update_type: UpdateType,
        title: impl Into<String>,
        components: impl IntoIterator<Item = impl Into<String>>,
        risk_level: RiskLevel,
    ) -> Self {
        Self {
            update_type,
            title: title.into(),
            description: String::new(),
            components: components.into_iter().map(Into::into).collect(),
            dependencies: Vec::new(),
            risk: Risk::new(risk_level),
            rollback_supported: rollback_supported_default(),
            author: String::new(),
        }
    }

    pub fn with_dependencies(
        mut self,
        dependencies: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_rollback_supported(mut self, supported: bool) -> Self {
        self.rollback_supported = supported;
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Structural validation; dependency existence is checked by the registry.
    pub fn validate(&self) -> Result<(), DeployError> {
        if self.title.trim().is_empty() {
            return Err(DeployError::Validation("title must not be empty".into()));
        }
        if self.components.is_empty() {
            return Err(DeployError::Validation(
                "at least one component is required".into(),
            ));
        }
        let mut seen = HashSet::new();
        for component in &self.components {
            if component.trim().is_empty() {
                return Err(DeployError::Validation(
                    "component names must not be empty".into(),
                ));
            }
            if !seen.insert(component.as_str()) {
                return Err(DeployError::Validation(format!(
                    "component '{component}' listed more than once"
                )));
            }
        }
        if self.dependencies.iter().any(|dep| dep.trim().is_empty()) {
            return Err(DeployError::Validation(
                "dependency ids must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Registry record for one update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDescriptor {
    pub id: String,
    pub version: Version,
    #[serde(rename = "type")]
    pub update_type: UpdateType,
    pub title: String,
    pub description: String,
    pub components: Vec<String>,
    pub dependencies: BTreeSet<String>,
    pub risk: Risk,
    pub rollback_supported: bool,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub approvals: Vec<Approval>,
    pub status: UpdateStatus,
}

impl UpdateDescriptor {
    pub(crate) fn from_spec(id: String, version: Version, spec: UpdateSpec) -> Self {
        Self {
            id,
            version,
            update_type: spec.update_type,
            title: spec.title.trim().to_owned(),
            description: spec.description,
            components: spec.components,
            dependencies: spec.dependencies.into_iter().collect(),
            risk: spec.risk,
            rollback_supported: spec.rollback_supported,
            author: spec.author,
            created_at: Utc::now(),
            approvals: Vec::new(),
            status: UpdateStatus::Created,
        }
    }

    /// Most recent approval entry recorded for `role`.
    pub fn latest_approval(&self, role: ApprovalRole) -> Option<&Approval> {
        self.approvals.iter().rev().find(|entry| entry.role == role)
    }
}
