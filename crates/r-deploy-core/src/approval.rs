//! ---
//! deploy_section: "02-update-orchestration"
//! deploy_subsection: "module"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "Approval rules deciding which roles must sign off an update."
//! deploy_version: "v0.0.0-prealpha"
//! deploy_owner: "tbd"
//! ---
use std::collections::BTreeSet;

use crate::descriptor::{ApprovalRole, UpdateDescriptor, UpdateType};

/// Pure approval rules.
///
/// * every update needs a developer sign-off;
/// * high or critical risk adds security and superadmin;
/// * core and consensus updates add devops.
///
/// Only the latest entry per role counts, so a later rejection revokes an
/// earlier approval.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApprovalGate;

impl ApprovalGate {
    pub fn new() -> Self {
        Self
    }

    /// Roles that must hold an approving latest entry.
    pub fn required_approvals(&self, descriptor: &UpdateDescriptor) -> BTreeSet<ApprovalRole> {
        let mut roles = BTreeSet::from([ApprovalRole::Developer]);
        if descriptor.risk.level.is_elevated() {
            roles.insert(ApprovalRole::Security);
            roles.insert(ApprovalRole::Superadmin);
        }
        if matches!(
            descriptor.update_type,
            UpdateType::Core | UpdateType::Consensus
        ) {
            roles.insert(ApprovalRole::Devops);
        }
        roles
    }

    /// Required roles whose latest entry is absent or a rejection.
    pub fn missing_roles(&self, descriptor: &UpdateDescriptor) -> Vec<ApprovalRole> {
        self.required_approvals(descriptor)
            .into_iter()
            .filter(|role| {
                !descriptor
                    .latest_approval(*role)
                    .map(|entry| entry.approved)
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn is_satisfied(&self, descriptor: &UpdateDescriptor) -> bool {
        self.missing_roles(descriptor).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use semver::Version;

    use super::*;
    use crate::descriptor::{Approval, RiskLevel, UpdateSpec};

    fn descriptor(update_type: UpdateType, risk: RiskLevel) -> UpdateDescriptor {
        UpdateDescriptor::from_spec(
            "u1".into(),
            Version::new(1, 0, 1),
            UpdateSpec::new(update_type, "change", ["svc"], risk),
        )
    }

    fn approve(descriptor: &mut UpdateDescriptor, role: ApprovalRole, approved: bool) {
        descriptor.approvals.push(Approval {
            role,
            approver: format!("{role}-lead"),
            approved,
            timestamp: Utc::now(),
        });
    }

    #[test]
    fn low_risk_ui_needs_only_developer() {
        let gate = ApprovalGate::new();
        let d = descriptor(UpdateType::Ui, RiskLevel::Low);
        assert_eq!(
            gate.required_approvals(&d),
            BTreeSet::from([ApprovalRole::Developer])
        );
    }

    #[test]
    fn critical_consensus_needs_every_role() {
        let gate = ApprovalGate::new();
        let d = descriptor(UpdateType::Consensus, RiskLevel::Critical);
        let required: Vec<_> = gate.required_approvals(&d).into_iter().collect();
        assert_eq!(
            required,
            vec![
                ApprovalRole::Developer,
                ApprovalRole::Security,
                ApprovalRole::Superadmin,
                ApprovalRole::Devops,
            ]
        );
    }

    #[test]
    fn latest_entry_wins() {
        let gate = ApprovalGate::new();
        let mut d = descriptor(UpdateType::Api, RiskLevel::Medium);
        approve(&mut d, ApprovalRole::Developer, true);
        assert!(gate.is_satisfied(&d));

        approve(&mut d, ApprovalRole::Developer, false);
        assert_eq!(gate.missing_roles(&d), vec![ApprovalRole::Developer]);

        approve(&mut d, ApprovalRole::Developer, true);
        assert!(gate.is_satisfied(&d));
    }

    #[test]
    fn unrequired_roles_do_not_matter() {
        let gate = ApprovalGate::new();
        let mut d = descriptor(UpdateType::Contract, RiskLevel::Low);
        approve(&mut d, ApprovalRole::Developer, true);
        approve(&mut d, ApprovalRole::Security, false);
        assert!(gate.is_satisfied(&d));
    }

    #[test]
    fn satisfied_iff_every_required_role_approved() {
        let gate = ApprovalGate::new();
        let all = [
            ApprovalRole::Developer,
            ApprovalRole::Security,
            ApprovalRole::Superadmin,
            ApprovalRole::Devops,
        ];
        for update_type in [UpdateType::Core, UpdateType::Ui] {
            for risk in [RiskLevel::Low, RiskLevel::High] {
                for mask in 0u8..16 {
                    let mut d = descriptor(update_type, risk);
                    for (bit, role) in all.iter().enumerate() {
                        approve(&mut d, *role, mask & (1 << bit) != 0);
                    }
                    let required = gate.required_approvals(&d);
                    let expected = all
                        .iter()
                        .enumerate()
                        .filter(|(_, role)| required.contains(role))
                        .all(|(bit, _)| mask & (1 << bit) != 0);
                    assert_eq!(gate.is_satisfied(&d), expected, "{update_type} {risk} {mask:04b}");
                }
            }
        }
    }
}
