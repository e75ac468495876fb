//! ---
//! deploy_section: "02-update-orchestration"
//! deploy_subsection: "module"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "Authoritative store of update descriptors and the active version."
//! deploy_version: "v0.0.0-prealpha"
//! deploy_owner: "tbd"
//! ---
use std::sync::Arc;

use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::RwLock;
use r_deploy_versioning::{PatchBump, VersionPolicy};
use semver::Version;
use tracing::{debug, info};
use uuid::Uuid;

use crate::approval::ApprovalGate;
use crate::descriptor::{Approval, ApprovalRole, UpdateDescriptor, UpdateSpec, UpdateStatus};
use crate::error::DeployError;
use crate::journal::DeploymentJournal;

#[derive(Debug)]
struct RegistryState {
    updates: IndexMap<String, UpdateDescriptor>,
    active_version: Version,
}

/// Update descriptors in creation order plus the active system version.
///
/// Every mutation holds the write lock only around the metadata change;
/// journal records are appended after the lock is released.
#[derive(Debug)]
pub struct UpdateRegistry {
    state: RwLock<RegistryState>,
    policy: Arc<dyn VersionPolicy>,
    journal: Option<Arc<DeploymentJournal>>,
}

impl UpdateRegistry {
    pub fn new(initial_version: Version) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                updates: IndexMap::new(),
                active_version: initial_version,
            }),
            policy: Arc::new(PatchBump),
            journal: None,
        }
    }

    /// Replace the default patch-bump version policy.
    pub fn with_policy(mut self, policy: Arc<dyn VersionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_journal(mut self, journal: Arc<DeploymentJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Validate `spec` and store a new descriptor in `Created` status.
    ///
    /// Dependencies must name updates already known to the registry. Nothing
    /// is stored when validation fails.
    pub fn create_update(&self, spec: UpdateSpec) -> Result<String, DeployError> {
        spec.validate()?;
        let descriptor = {
            let mut state = self.state.write();
            if let Some(unknown) = spec
                .dependencies
                .iter()
                .find(|dep| !state.updates.contains_key(dep.as_str()))
            {
                return Err(DeployError::Validation(format!(
                    "dependency '{unknown}' is not a known update"
                )));
            }
            let version = self.policy.next_version(
                &state.active_version,
                spec.update_type.as_ref(),
                spec.risk.level.as_ref(),
            );
            let id = Uuid::new_v4().to_string();
            let descriptor = UpdateDescriptor::from_spec(id.clone(), version, spec);
            state.updates.insert(id, descriptor.clone());
            descriptor
        };

        info!(
            update = %descriptor.id,
            version = %descriptor.version,
            update_type = %descriptor.update_type,
            risk = %descriptor.risk.level,
            "update created"
        );
        if let Some(journal) = &self.journal {
            journal.update_created(&descriptor);
        }
        Ok(descriptor.id)
    }

    pub fn get_update(&self, update_id: &str) -> Result<UpdateDescriptor, DeployError> {
        self.state
            .read()
            .updates
            .get(update_id)
            .cloned()
            .ok_or_else(|| not_found(update_id))
    }

    /// All descriptors in creation order.
    pub fn list_updates(&self) -> Vec<UpdateDescriptor> {
        self.state.read().updates.values().cloned().collect()
    }

    pub fn updates_with_status(&self, status: UpdateStatus) -> Vec<UpdateDescriptor> {
        self.state
            .read()
            .updates
            .values()
            .filter(|descriptor| descriptor.status == status)
            .cloned()
            .collect()
    }

    /// Append an approval entry. Entries are never removed; a later entry for
    /// the same role supersedes earlier ones.
    pub fn record_approval(
        &self,
        update_id: &str,
        role: ApprovalRole,
        approver: impl Into<String>,
        approved: bool,
    ) -> Result<(), DeployError> {
        let approval = Approval {
            role,
            approver: approver.into(),
            approved,
            timestamp: Utc::now(),
        };
        {
            let mut state = self.state.write();
            let descriptor = state
                .updates
                .get_mut(update_id)
                .ok_or_else(|| not_found(update_id))?;
            descriptor.approvals.push(approval.clone());
        }

        debug!(
            update = update_id,
            role = %role,
            approver = %approval.approver,
            approved,
            "approval recorded"
        );
        if let Some(journal) = &self.journal {
            journal.approval_recorded(update_id, &approval);
        }
        Ok(())
    }

    pub fn active_version(&self) -> Version {
        self.state.read().active_version.clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().updates.is_empty()
    }

    pub(crate) fn status_of(&self, update_id: &str) -> Option<UpdateStatus> {
        self.state
            .read()
            .updates
            .get(update_id)
            .map(|descriptor| descriptor.status)
    }

    /// Check status and approvals, then move the update to `Queued`, all
    /// under one write lock so concurrent enqueues cannot both succeed.
    pub(crate) fn mark_queued(
        &self,
        update_id: &str,
        gate: &ApprovalGate,
    ) -> Result<(), DeployError> {
        {
            let mut state = self.state.write();
            let descriptor = state
                .updates
                .get_mut(update_id)
                .ok_or_else(|| not_found(update_id))?;
            if descriptor.status.is_in_flight() {
                return Err(DeployError::AlreadyQueued {
                    update_id: update_id.to_owned(),
                    status: descriptor.status,
                });
            }
            if descriptor.status.is_rollback_terminal() {
                return Err(DeployError::UpdateFinalized {
                    update_id: update_id.to_owned(),
                    status: descriptor.status,
                });
            }
            let missing = gate.missing_roles(descriptor);
            if !missing.is_empty() {
                return Err(DeployError::Approval {
                    update_id: update_id.to_owned(),
                    required: gate.required_approvals(descriptor).into_iter().collect(),
                    missing,
                });
            }
            descriptor.status = UpdateStatus::Queued;
        }

        if let Some(journal) = &self.journal {
            journal.status_changed(None, update_id, UpdateStatus::Queued);
        }
        Ok(())
    }

    pub(crate) fn set_status(&self, update_ids: &[String], status: UpdateStatus, run_id: &str) {
        {
            let mut state = self.state.write();
            for id in update_ids {
                if let Some(descriptor) = state.updates.get_mut(id) {
                    descriptor.status = status;
                }
            }
        }
        if let Some(journal) = &self.journal {
            for id in update_ids {
                journal.status_changed(Some(run_id), id, status);
            }
        }
    }

    /// Mark the whole batch `Deployed` and advance the active version to the
    /// version of the last update, in one critical section.
    ///
    /// The active version never moves backwards: an update created before a
    /// later one was deployed leaves it unchanged.
    pub(crate) fn commit_batch(&self, update_ids: &[String], run_id: &str) -> Version {
        let active = {
            let mut state = self.state.write();
            let mut last_version = None;
            for id in update_ids {
                if let Some(descriptor) = state.updates.get_mut(id) {
                    descriptor.status = UpdateStatus::Deployed;
                    last_version = Some(descriptor.version.clone());
                }
            }
            if let Some(version) = last_version {
                if version > state.active_version {
                    state.active_version = version;
                }
            }
            state.active_version.clone()
        };
        if let Some(journal) = &self.journal {
            for id in update_ids {
                journal.status_changed(Some(run_id), id, UpdateStatus::Deployed);
            }
        }
        active
    }
}

fn not_found(update_id: &str) -> DeployError {
    DeployError::NotFound {
        update_id: update_id.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{RiskLevel, UpdateType};

    fn registry() -> UpdateRegistry {
        UpdateRegistry::new(Version::new(1, 0, 0))
    }

    fn spec(title: &str) -> UpdateSpec {
        UpdateSpec::new(UpdateType::Api, title, ["gateway"], RiskLevel::Low)
    }

    #[test]
    fn create_assigns_patch_bump_and_created_status() {
        let registry = registry();
        let id = registry.create_update(spec("limits")).unwrap();
        let descriptor = registry.get_update(&id).unwrap();
        assert_eq!(descriptor.version, Version::new(1, 0, 1));
        assert_eq!(descriptor.status, UpdateStatus::Created);
        assert!(descriptor.approvals.is_empty());
    }

    #[test]
    fn invalid_spec_stores_nothing() {
        let registry = registry();
        let err = registry
            .create_update(UpdateSpec::new(
                UpdateType::Ui,
                "",
                ["web"],
                RiskLevel::Low,
            ))
            .unwrap_err();
        assert!(matches!(err, DeployError::Validation(_)));

        let err = registry
            .create_update(spec("needs parent").with_dependencies(["missing"]))
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
        assert!(registry.is_empty());
    }

    #[test]
    fn dependencies_must_reference_known_updates() {
        let registry = registry();
        let parent = registry.create_update(spec("parent")).unwrap();
        let child = registry
            .create_update(spec("child").with_dependencies([parent.clone()]))
            .unwrap();
        let descriptor = registry.get_update(&child).unwrap();
        assert!(descriptor.dependencies.contains(&parent));
    }

    #[test]
    fn approvals_append_and_unknown_ids_fail() {
        let registry = registry();
        let id = registry.create_update(spec("limits")).unwrap();
        registry
            .record_approval(&id, ApprovalRole::Developer, "alice", false)
            .unwrap();
        registry
            .record_approval(&id, ApprovalRole::Developer, "alice", true)
            .unwrap();
        let descriptor = registry.get_update(&id).unwrap();
        assert_eq!(descriptor.approvals.len(), 2);
        assert!(descriptor.latest_approval(ApprovalRole::Developer).unwrap().approved);

        let err = registry
            .record_approval("nope", ApprovalRole::Developer, "alice", true)
            .unwrap_err();
        assert!(matches!(err, DeployError::NotFound { .. }));
    }

    #[test]
    fn mark_queued_checks_status_then_approvals() {
        let registry = registry();
        let gate = ApprovalGate::new();
        let id = registry.create_update(spec("limits")).unwrap();

        let err = registry.mark_queued(&id, &gate).unwrap_err();
        assert!(matches!(err, DeployError::Approval { .. }));
        assert_eq!(registry.status_of(&id), Some(UpdateStatus::Created));

        registry
            .record_approval(&id, ApprovalRole::Developer, "alice", true)
            .unwrap();
        registry.mark_queued(&id, &gate).unwrap();
        let err = registry.mark_queued(&id, &gate).unwrap_err();
        assert!(matches!(
            err,
            DeployError::AlreadyQueued {
                status: UpdateStatus::Queued,
                ..
            }
        ));

        registry.set_status(&[id.clone()], UpdateStatus::RolledBack, "r1");
        let err = registry.mark_queued(&id, &gate).unwrap_err();
        assert!(matches!(err, DeployError::UpdateFinalized { .. }));
    }

    #[test]
    fn commit_batch_advances_to_last_version() {
        let registry = registry();
        let first = registry.create_update(spec("first")).unwrap();
        registry.commit_batch(&[first.clone()], "r1");
        let second = registry.create_update(spec("second")).unwrap();
        let third = registry.create_update(spec("third")).unwrap();

        let active = registry.commit_batch(&[second, third.clone()], "r2");
        assert_eq!(active, Version::new(1, 0, 2));
        assert_eq!(registry.active_version(), Version::new(1, 0, 2));
        assert_eq!(registry.updates_with_status(UpdateStatus::Deployed).len(), 3);
        assert_eq!(registry.get_update(&third).unwrap().version, Version::new(1, 0, 2));
    }

    #[test]
    fn commit_batch_never_lowers_active_version() {
        let registry = registry();
        let stale = registry.create_update(spec("stale")).unwrap();
        let first = registry.create_update(spec("first")).unwrap();
        registry.commit_batch(&[first], "r1");
        let second = registry.create_update(spec("second")).unwrap();
        registry.commit_batch(&[second], "r2");
        assert_eq!(registry.active_version(), Version::new(1, 0, 2));

        let active = registry.commit_batch(&[stale.clone()], "r3");
        assert_eq!(registry.get_update(&stale).unwrap().version, Version::new(1, 0, 1));
        assert_eq!(active, Version::new(1, 0, 2));
        assert_eq!(
            registry.get_update(&stale).unwrap().status,
            UpdateStatus::Deployed
        );
    }
}
