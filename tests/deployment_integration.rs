//! ---
//! deploy_section: "15-testing-qa-runbook"
//! deploy_subsection: "integration-tests"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "End-to-end approval, deployment, and rollback scenarios."
//! deploy_version: "v0.0.0-prealpha"
//! deploy_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use r_deploy_core::{
    ApprovalRole, CheckOutcome, ComponentUpdaterRegistry, DeployError, DeploymentCoordinator,
    DeploymentOutcome, DeploymentPhase, MemoryComponent, RiskLevel, SuiteHarness, UpdateSpec,
    UpdateStatus, UpdateType,
};
use semver::Version;

const ALL_ROLES: [ApprovalRole; 4] = [
    ApprovalRole::Developer,
    ApprovalRole::Security,
    ApprovalRole::Superadmin,
    ApprovalRole::Devops,
];

fn system(suite: SuiteHarness) -> (DeploymentCoordinator, Arc<MemoryComponent>) {
    r_deploy_logging::init();
    let components = Arc::new(ComponentUpdaterRegistry::new(Duration::from_secs(2)));
    let x = Arc::new(MemoryComponent::new("X", "1.0.0"));
    components.register("X", x.clone());
    let coordinator = DeploymentCoordinator::builder(components, Arc::new(suite))
        .suite_timeout(Duration::from_secs(5))
        .build();
    (coordinator, x)
}

fn high_risk_core_update(coordinator: &DeploymentCoordinator) -> String {
    coordinator
        .create_update(
            UpdateSpec::new(UpdateType::Core, "engine hot path", ["X"], RiskLevel::High)
                .with_author("platform")
                .with_description("rework the settlement loop"),
        )
        .unwrap()
}

fn approve_all(coordinator: &DeploymentCoordinator, update_id: &str) {
    for role in ALL_ROLES {
        coordinator
            .record_approval(update_id, role, format!("{role}-approver"), true)
            .unwrap();
    }
}

fn suite(passed: bool) -> SuiteHarness {
    SuiteHarness::new()
        .check("ledger-balance", || async { Ok(CheckOutcome::passed("balanced")) })
        .check("api-latency", move || async move {
            if passed {
                Ok(CheckOutcome::warning("p99 close to budget"))
            } else {
                Ok(CheckOutcome::failed("p99 over budget"))
            }
        })
}

#[test]
fn scenario_a_enqueue_without_approvals_lists_every_role() {
    let (coordinator, _) = system(suite(true));
    let id = high_risk_core_update(&coordinator);

    let err = coordinator.enqueue(&id).unwrap_err();
    match &err {
        DeployError::Approval {
            update_id,
            required,
            missing,
        } => {
            assert_eq!(update_id, &id);
            assert_eq!(required, &ALL_ROLES.to_vec());
            assert_eq!(missing, &ALL_ROLES.to_vec());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err
        .to_string()
        .contains("[developer, security, superadmin, devops]"));
    assert_eq!(coordinator.get_status().queue_depth, 0);
    assert_eq!(
        coordinator.get_update(&id).unwrap().status,
        UpdateStatus::Created
    );
}

#[tokio::test]
async fn scenario_b_approved_update_deploys_and_advances_version() {
    let (coordinator, x) = system(suite(true));
    let id = high_risk_core_update(&coordinator);
    approve_all(&coordinator, &id);
    coordinator.enqueue(&id).unwrap();
    assert_eq!(coordinator.get_status().queue_depth, 1);

    let report = coordinator.deploy_queued().await.unwrap();
    assert_eq!(report.outcome, DeploymentOutcome::Deployed);
    assert!(report.is_success());
    assert_eq!(report.ran_update_ids, vec![id.clone()]);
    assert!(report.failure_detail().is_none());
    assert!(report.finished_at >= report.started_at);
    assert!(report.duration() < Duration::from_secs(5));
    let tests = report.test_results.as_ref().unwrap();
    assert!(tests.passed);
    assert_eq!(tests.results.len(), 2);

    let status = coordinator.get_status();
    assert_eq!(status.active_version, Version::new(1, 0, 1));
    assert_eq!(status.queue_depth, 0);
    assert!(!status.run_in_progress);
    assert_eq!(status.snapshot_count, 1);
    assert!(status.last_run_at.is_some());
    assert_eq!(x.version(), "1.0.1");
    assert_eq!(
        coordinator.get_update(&id).unwrap().status,
        UpdateStatus::Deployed
    );
    assert!(matches!(
        coordinator.enqueue(&id),
        Err(DeployError::AlreadyQueued { .. })
    ));
}

#[tokio::test]
async fn scenario_c_apply_failure_restores_once_and_keeps_version() {
    let (coordinator, x) = system(suite(true));
    let mut events = coordinator.subscribe();
    let id = high_risk_core_update(&coordinator);
    approve_all(&coordinator, &id);
    coordinator.enqueue(&id).unwrap();
    x.fail_apply(true);

    let report = coordinator.deploy_queued().await.unwrap();
    assert_eq!(report.outcome, DeploymentOutcome::RolledBack);
    assert!(report.test_results.is_none());
    assert!(report
        .failure_detail()
        .unwrap()
        .contains("rejected update"));
    assert_eq!(x.restore_calls(), 1);
    assert_eq!(x.version(), "1.0.0");
    assert_eq!(
        coordinator.get_status().active_version,
        Version::new(1, 0, 0)
    );
    assert_eq!(
        coordinator.get_update(&id).unwrap().status,
        UpdateStatus::RolledBack
    );

    let mut phases = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.run_id, report.run_id);
        phases.push(event.phase);
    }
    assert_eq!(
        phases
            .iter()
            .filter(|phase| **phase == DeploymentPhase::RollingBack)
            .count(),
        1
    );
    assert_eq!(
        &phases[phases.len() - 2..],
        &[DeploymentPhase::RolledBack, DeploymentPhase::Idle]
    );
}

#[tokio::test]
async fn scenario_d_failed_verification_rolls_back_like_apply_failure() {
    let (coordinator, x) = system(suite(false));
    let id = high_risk_core_update(&coordinator);
    approve_all(&coordinator, &id);
    coordinator.enqueue(&id).unwrap();

    let report = coordinator.deploy_queued().await.unwrap();
    assert_eq!(report.outcome, DeploymentOutcome::RolledBack);
    assert_eq!(x.apply_calls(), 1);
    assert_eq!(x.restore_calls(), 1);
    assert_eq!(x.version(), "1.0.0");
    assert!(x.applied().is_empty());

    let tests = report.test_results.as_ref().unwrap();
    assert!(!tests.passed);
    match &report.failure {
        Some(DeployError::VerificationFailed { failed_checks, .. }) => {
            assert_eq!(failed_checks, &vec!["api-latency".to_owned()]);
        }
        other => panic!("unexpected failure: {other:?}"),
    }
    assert_eq!(
        coordinator.get_status().active_version,
        Version::new(1, 0, 0)
    );
    assert!(matches!(
        coordinator.enqueue(&id),
        Err(DeployError::UpdateFinalized { .. })
    ));
}

#[tokio::test]
async fn resubmitted_update_deploys_after_rollback() {
    let (coordinator, x) = system(suite(true));
    let first = high_risk_core_update(&coordinator);
    approve_all(&coordinator, &first);
    coordinator.enqueue(&first).unwrap();
    x.fail_apply(true);
    let report = coordinator.deploy_queued().await.unwrap();
    assert_eq!(report.outcome, DeploymentOutcome::RolledBack);

    x.fail_apply(false);
    let second = high_risk_core_update(&coordinator);
    approve_all(&coordinator, &second);
    coordinator.enqueue(&second).unwrap();
    let report = coordinator.deploy_queued().await.unwrap();
    assert_eq!(report.outcome, DeploymentOutcome::Deployed);
    assert_eq!(report.active_version, Version::new(1, 0, 1));
    assert_eq!(coordinator.snapshots().count(), 2);
}
