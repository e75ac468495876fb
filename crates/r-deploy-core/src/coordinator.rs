//! ---
//! deploy_section: "02-update-orchestration"
//! deploy_subsection: "module"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "Deployment state machine: snapshot, apply, verify, commit or roll back."
//! deploy_version: "v0.0.0-prealpha"
//! deploy_owner: "tbd"
//! ---
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use r_deploy_common::time::{duration_to_millis, elapsed_between, utc_now};
use r_deploy_common::DeployConfig;
use r_deploy_logging::{
    deploy_debug, deploy_info, deploy_warn, log_system_event, LogContext, SystemEventOutcome,
};
use r_deploy_metrics::{new_registry, DeploymentMetrics, SharedRegistry};
use r_deploy_persistence::SnapshotArchive;
use r_deploy_testharness::{TestHarness, TestReport, TestStatus};
use r_deploy_versioning::VersionPolicy;
use semver::Version;
use serde::Serialize;
use strum::{AsRefStr, Display};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::approval::ApprovalGate;
use crate::component::ComponentUpdaterRegistry;
use crate::descriptor::{ApprovalRole, UpdateDescriptor, UpdateSpec, UpdateStatus};
use crate::error::{panic_message, ComponentError, DeployError};
use crate::events::{DeploymentEvent, DeploymentPhase};
use crate::journal::DeploymentJournal;
use crate::queue::DeploymentQueue;
use crate::registry::UpdateRegistry;
use crate::snapshot::SnapshotStore;

/// Terminal result of one `deploy_queued` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeploymentOutcome {
    Deployed,
    RolledBack,
    RollbackFailed,
    /// The queue was empty; nothing ran.
    Noop,
}

/// Per-update view of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateRunResult {
    pub update_id: String,
    pub version: Version,
    pub applied_components: Vec<String>,
    pub failed_component: Option<String>,
    pub status: UpdateStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentReport {
    pub run_id: String,
    pub ran_update_ids: Vec<String>,
    pub outcome: DeploymentOutcome,
    /// Present only when the verification suite ran.
    pub test_results: Option<TestReport>,
    /// Error that triggered the rollback, or the rollback failure itself.
    pub failure: Option<DeployError>,
    pub updates: Vec<UpdateRunResult>,
    pub snapshot_id: Option<String>,
    pub active_version: Version,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DeploymentReport {
    pub fn failure_detail(&self) -> Option<String> {
        self.failure.as_ref().map(ToString::to_string)
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.outcome,
            DeploymentOutcome::Deployed | DeploymentOutcome::Noop
        )
    }

    /// Wall-clock span of the run.
    pub fn duration(&self) -> Duration {
        elapsed_between(self.started_at, self.finished_at)
    }
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentStatus {
    pub active_version: Version,
    pub queue_depth: usize,
    pub run_in_progress: bool,
    pub active_run: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub snapshot_count: usize,
}

fn default_suite_timeout() -> Duration {
    Duration::from_secs(300)
}

/// Assembles a coordinator and the registry, queue and snapshot store it owns.
pub struct CoordinatorBuilder {
    components: Arc<ComponentUpdaterRegistry>,
    harness: Arc<dyn TestHarness>,
    initial_version: Version,
    suite_timeout: Duration,
    event_buffer: usize,
    policy: Option<Arc<dyn VersionPolicy>>,
    journal: Option<Arc<DeploymentJournal>>,
    archive: Option<SnapshotArchive>,
    metrics: Option<Arc<DeploymentMetrics>>,
}

impl CoordinatorBuilder {
    pub fn new(components: Arc<ComponentUpdaterRegistry>, harness: Arc<dyn TestHarness>) -> Self {
        Self {
            components,
            harness,
            initial_version: Version::new(1, 0, 0),
            suite_timeout: default_suite_timeout(),
            event_buffer: 64,
            policy: None,
            journal: None,
            archive: None,
            metrics: None,
        }
    }

    pub fn initial_version(mut self, version: Version) -> Self {
        self.initial_version = version;
        self
    }

    pub fn suite_timeout(mut self, timeout: Duration) -> Self {
        self.suite_timeout = timeout;
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    pub fn version_policy(mut self, policy: Arc<dyn VersionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn journal(mut self, journal: Arc<DeploymentJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn archive(mut self, archive: SnapshotArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn metrics(mut self, metrics: Arc<DeploymentMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> DeploymentCoordinator {
        let mut registry = UpdateRegistry::new(self.initial_version);
        if let Some(policy) = self.policy {
            registry = registry.with_policy(policy);
        }
        if let Some(journal) = &self.journal {
            registry = registry.with_journal(journal.clone());
        }
        let registry = Arc::new(registry);

        let mut queue = DeploymentQueue::new(registry.clone(), ApprovalGate::new());
        let mut snapshots = SnapshotStore::new(self.components.clone());
        if let Some(metrics) = &self.metrics {
            queue = queue.with_metrics(metrics.clone());
            snapshots = snapshots.with_metrics(metrics.clone());
        }
        if let Some(archive) = self.archive {
            snapshots = snapshots.with_archive(archive);
        }

        let (events, _) = broadcast::channel(self.event_buffer);
        DeploymentCoordinator {
            inner: Arc::new(CoordinatorInner {
                registry,
                queue: Arc::new(queue),
                components: self.components,
                snapshots: Arc::new(snapshots),
                harness: self.harness,
                suite_timeout: self.suite_timeout,
                events,
                journal: self.journal,
                metrics: self.metrics,
                active_run: Mutex::new(None),
                last_run_at: Mutex::new(None),
            }),
        }
    }
}

impl std::fmt::Debug for CoordinatorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorBuilder")
            .field("initial_version", &self.initial_version)
            .field("suite_timeout", &self.suite_timeout)
            .field("event_buffer", &self.event_buffer)
            .finish_non_exhaustive()
    }
}

/// Drives deployment runs over the updates waiting in the queue.
///
/// At most one run executes at a time per coordinator. Once a run has
/// started it always reaches `Committed` or a rollback terminal, even when
/// the caller stops awaiting it.
#[derive(Clone)]
pub struct DeploymentCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    registry: Arc<UpdateRegistry>,
    queue: Arc<DeploymentQueue>,
    components: Arc<ComponentUpdaterRegistry>,
    snapshots: Arc<SnapshotStore>,
    harness: Arc<dyn TestHarness>,
    suite_timeout: Duration,
    events: broadcast::Sender<DeploymentEvent>,
    journal: Option<Arc<DeploymentJournal>>,
    metrics: Option<Arc<DeploymentMetrics>>,
    active_run: Mutex<Option<String>>,
    last_run_at: Mutex<Option<DateTime<Utc>>>,
}

/// Holds the single-flight slot; released on drop.
struct RunGuard {
    inner: Arc<CoordinatorInner>,
    run_id: String,
}

impl RunGuard {
    fn acquire(inner: &Arc<CoordinatorInner>, run_id: &str) -> Result<Self, DeployError> {
        let mut active = inner.active_run.lock();
        if let Some(active_run) = active.as_ref() {
            return Err(DeployError::ConcurrentDeployment {
                active_run: active_run.clone(),
            });
        }
        *active = Some(run_id.to_owned());
        Ok(Self {
            inner: inner.clone(),
            run_id: run_id.to_owned(),
        })
    }
}

impl Drop for RunGuard {
    // Runs on unwind too, so observers always see the slot released.
    fn drop(&mut self) {
        self.inner.active_run.lock().take();
        self.inner.transition(&self.run_id, DeploymentPhase::Idle);
    }
}

impl DeploymentCoordinator {
    pub fn builder(
        components: Arc<ComponentUpdaterRegistry>,
        harness: Arc<dyn TestHarness>,
    ) -> CoordinatorBuilder {
        CoordinatorBuilder::new(components, harness)
    }

    /// Build a coordinator from configuration. Components are registered
    /// afterwards through [`DeploymentCoordinator::components`].
    pub fn from_config(
        config: &DeployConfig,
        harness: Arc<dyn TestHarness>,
        metrics_registry: Option<SharedRegistry>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let components = Arc::new(ComponentUpdaterRegistry::new(config.component_timeout));
        let mut builder = CoordinatorBuilder::new(components, harness)
            .initial_version(config.initial_version()?)
            .suite_timeout(config.suite_timeout)
            .event_buffer(config.event_buffer);

        if let Some(journal) = DeploymentJournal::from_config(&config.journal).with_context(|| {
            format!("failed to open journal {}", config.journal.path.display())
        })? {
            builder = builder.journal(Arc::new(journal));
        }
        if config.snapshot.archive {
            let archive = SnapshotArchive::open(
                config.snapshot.directory.clone(),
                config.snapshot.format.extension(),
            )
            .with_context(|| {
                format!(
                    "failed to open snapshot archive {}",
                    config.snapshot.directory.display()
                )
            })?;
            builder = builder.archive(archive);
        }
        if config.metrics.enabled {
            let registry = metrics_registry.unwrap_or_else(new_registry);
            builder = builder.metrics(Arc::new(DeploymentMetrics::new(registry)?));
        }

        let coordinator = builder.build();
        let reloaded = coordinator.inner.snapshots.load_archived();
        if reloaded > 0 {
            deploy_info!("reloaded {reloaded} archived snapshots");
        }
        Ok(coordinator)
    }

    pub fn registry(&self) -> &Arc<UpdateRegistry> {
        &self.inner.registry
    }

    pub fn queue(&self) -> &Arc<DeploymentQueue> {
        &self.inner.queue
    }

    pub fn components(&self) -> &Arc<ComponentUpdaterRegistry> {
        &self.inner.components
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.inner.snapshots
    }

    pub fn journal(&self) -> Option<&Arc<DeploymentJournal>> {
        self.inner.journal.as_ref()
    }

    pub fn metrics(&self) -> Option<&Arc<DeploymentMetrics>> {
        self.inner.metrics.as_ref()
    }

    /// Receive every phase transition of subsequent runs, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.inner.events.subscribe()
    }

    pub fn create_update(&self, spec: UpdateSpec) -> Result<String, DeployError> {
        self.inner.registry.create_update(spec)
    }

    pub fn get_update(&self, update_id: &str) -> Result<UpdateDescriptor, DeployError> {
        self.inner.registry.get_update(update_id)
    }

    pub fn list_updates(&self) -> Vec<UpdateDescriptor> {
        self.inner.registry.list_updates()
    }

    pub fn record_approval(
        &self,
        update_id: &str,
        role: ApprovalRole,
        approver: impl Into<String>,
        approved: bool,
    ) -> Result<(), DeployError> {
        self.inner
            .registry
            .record_approval(update_id, role, approver, approved)
    }

    pub fn enqueue(&self, update_id: &str) -> Result<(), DeployError> {
        self.inner.queue.enqueue(update_id)
    }

    pub fn get_status(&self) -> DeploymentStatus {
        let active_run = self.inner.active_run.lock().clone();
        DeploymentStatus {
            active_version: self.inner.registry.active_version(),
            queue_depth: self.inner.queue.depth(),
            run_in_progress: active_run.is_some(),
            active_run,
            last_run_at: *self.inner.last_run_at.lock(),
            snapshot_count: self.inner.snapshots.count(),
        }
    }

    /// Drain the queue and deploy it as one all-or-nothing batch.
    ///
    /// Returns `ConcurrentDeployment` without touching the queue when a run
    /// is already in progress. Every other outcome, including rollbacks, is
    /// described by the returned report.
    pub async fn deploy_queued(&self) -> Result<DeploymentReport, DeployError> {
        let run_id = Uuid::new_v4().to_string();
        let guard = RunGuard::acquire(&self.inner, &run_id)?;

        let inner = self.inner.clone();
        let task_run_id = run_id.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            inner.run(&task_run_id).await
        });

        handle.await.map_err(|err| {
            log_system_event(
                Some(&LogContext::new().with_run(&run_id)),
                "deployment.run",
                &format!("deployment task aborted: {err}"),
                SystemEventOutcome::Fault,
            );
            DeployError::RunAborted {
                run_id: run_id.clone(),
                reason: err.to_string(),
            }
        })
    }
}

impl std::fmt::Debug for DeploymentCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentCoordinator")
            .field("registry", &self.inner.registry)
            .field("queue", &self.inner.queue)
            .field("components", &self.inner.components)
            .field("suite_timeout", &self.inner.suite_timeout)
            .finish_non_exhaustive()
    }
}

impl CoordinatorInner {
    async fn run(&self, run_id: &str) -> DeploymentReport {
        let started_at = utc_now();
        let clock = Instant::now();
        let batch = self.queue.dequeue_all(run_id);
        if batch.is_empty() {
            deploy_debug!(
                context = LogContext::new().with_run(run_id),
                "queue empty; nothing to deploy"
            );
            let report = DeploymentReport {
                run_id: run_id.to_owned(),
                ran_update_ids: Vec::new(),
                outcome: DeploymentOutcome::Noop,
                test_results: None,
                failure: None,
                updates: Vec::new(),
                snapshot_id: None,
                active_version: self.registry.active_version(),
                started_at,
                finished_at: utc_now(),
            };
            return self.finish(report, clock.elapsed());
        }

        let descriptors: Vec<UpdateDescriptor> = batch
            .iter()
            .filter_map(|id| self.registry.get_update(id).ok())
            .collect();
        let mut updates: Vec<UpdateRunResult> = descriptors
            .iter()
            .map(|descriptor| UpdateRunResult {
                update_id: descriptor.id.clone(),
                version: descriptor.version.clone(),
                applied_components: Vec::new(),
                failed_component: None,
                status: UpdateStatus::Deploying,
            })
            .collect();
        deploy_info!(
            context = LogContext::new().with_run(run_id),
            "deployment run started with {} updates",
            batch.len()
        );

        let label = format!("pre-update-{run_id}");
        let version_before = self.registry.active_version();
        let snapshot = match self.snapshots.capture(&label, &version_before).await {
            Ok(snapshot) => snapshot,
            Err(cause) => {
                self.record_component_failure(&cause);
                let failure = DeployError::SnapshotCapture {
                    run_id: run_id.to_owned(),
                    cause,
                };
                deploy_warn!(
                    context = LogContext::new().with_run(run_id).with_phase("idle"),
                    "{failure}; nothing was applied"
                );
                self.registry
                    .set_status(&batch, UpdateStatus::RolledBack, run_id);
                self.transition(run_id, DeploymentPhase::RolledBack);
                set_statuses(&mut updates, UpdateStatus::RolledBack);
                let report = DeploymentReport {
                    run_id: run_id.to_owned(),
                    ran_update_ids: batch,
                    outcome: DeploymentOutcome::RolledBack,
                    test_results: None,
                    failure: Some(failure),
                    updates,
                    snapshot_id: None,
                    active_version: self.registry.active_version(),
                    started_at,
                    finished_at: utc_now(),
                };
                return self.finish(report, clock.elapsed());
            }
        };
        self.transition(
            run_id,
            DeploymentPhase::SnapshotCaptured {
                snapshot_id: snapshot.id.clone(),
            },
        );

        let mut failure = self
            .apply_batch(run_id, &batch, &descriptors, &mut updates)
            .await;

        let mut test_results = None;
        if failure.is_none() {
            self.transition(run_id, DeploymentPhase::Verifying);
            let report = self.verify(run_id).await;
            if !report.passed {
                failure = Some(DeployError::VerificationFailed {
                    run_id: run_id.to_owned(),
                    failed_checks: report
                        .results
                        .iter()
                        .filter(|result| result.status == TestStatus::Failed)
                        .map(|result| result.name.clone())
                        .collect(),
                });
            }
            test_results = Some(report);
        }

        let (outcome, failure, active_version) = match failure {
            None => {
                let active = self.registry.commit_batch(&batch, run_id);
                set_statuses(&mut updates, UpdateStatus::Deployed);
                self.transition(run_id, DeploymentPhase::Committed);
                (DeploymentOutcome::Deployed, None, active)
            }
            Some(trigger) => {
                let (outcome, failure) = self
                    .roll_back(run_id, &label, &batch, &descriptors, trigger)
                    .await;
                let status = match outcome {
                    DeploymentOutcome::RollbackFailed => UpdateStatus::RollbackFailed,
                    _ => UpdateStatus::RolledBack,
                };
                set_statuses(&mut updates, status);
                (outcome, Some(failure), self.registry.active_version())
            }
        };

        let report = DeploymentReport {
            run_id: run_id.to_owned(),
            ran_update_ids: batch,
            outcome,
            test_results,
            failure,
            updates,
            snapshot_id: Some(snapshot.id.clone()),
            active_version,
            started_at,
            finished_at: utc_now(),
        };
        self.finish(report, clock.elapsed())
    }

    /// Apply updates in FIFO order, stopping at the first failure anywhere
    /// in the batch.
    async fn apply_batch(
        &self,
        run_id: &str,
        batch: &[String],
        descriptors: &[UpdateDescriptor],
        updates: &mut [UpdateRunResult],
    ) -> Option<DeployError> {
        let total = descriptors.len();
        for (index, descriptor) in descriptors.iter().enumerate() {
            self.transition(
                run_id,
                DeploymentPhase::Applying {
                    index: index + 1,
                    total,
                    update_id: descriptor.id.clone(),
                },
            );
            if let Err(err) = self.check_dependencies(run_id, descriptor, &batch[..index]) {
                deploy_warn!(
                    context = LogContext::new().with_run(run_id).with_update(&descriptor.id),
                    "{err}"
                );
                return Some(err);
            }
            for component in &descriptor.components {
                match self.components.apply(component, descriptor).await {
                    Ok(()) => updates[index].applied_components.push(component.clone()),
                    Err(cause) => {
                        self.record_component_failure(&cause);
                        updates[index].failed_component = Some(component.clone());
                        let err = DeployError::ComponentApply {
                            run_id: run_id.to_owned(),
                            update_id: descriptor.id.clone(),
                            cause,
                        };
                        deploy_warn!(
                            context = LogContext::new()
                                .with_run(run_id)
                                .with_update(&descriptor.id)
                                .with_component(component)
                                .with_phase("applying"),
                            "{err}"
                        );
                        return Some(err);
                    }
                }
            }
        }
        None
    }

    /// A dependency is satisfied when it is already deployed or runs earlier
    /// in the same batch.
    fn check_dependencies(
        &self,
        run_id: &str,
        descriptor: &UpdateDescriptor,
        earlier: &[String],
    ) -> Result<(), DeployError> {
        for dependency in &descriptor.dependencies {
            if earlier.contains(dependency) {
                continue;
            }
            let status = self.registry.status_of(dependency);
            if status != Some(UpdateStatus::Deployed) {
                return Err(DeployError::DependencyUnsatisfied {
                    run_id: run_id.to_owned(),
                    update_id: descriptor.id.clone(),
                    dependency: dependency.clone(),
                    state: status
                        .map(|status| status.to_string())
                        .unwrap_or_else(|| "unknown".to_owned()),
                });
            }
        }
        Ok(())
    }

    /// Run the suite under its deadline. Harness errors and timeouts become
    /// a failing report so they take the rollback path.
    async fn verify(&self, run_id: &str) -> TestReport {
        let clock = Instant::now();
        let suite = AssertUnwindSafe(self.harness.run_suite()).catch_unwind();
        let report = match tokio::time::timeout(self.suite_timeout, suite).await {
            Ok(Ok(Ok(report))) => report,
            Ok(Ok(Err(err))) => {
                TestReport::aborted("test_suite", clock.elapsed(), format!("{err:#}"))
            }
            Ok(Err(payload)) => TestReport::aborted(
                "test_suite",
                clock.elapsed(),
                format!("panicked: {}", panic_message(payload)),
            ),
            Err(_) => TestReport::aborted(
                "test_suite",
                clock.elapsed(),
                format!("suite did not finish within {:?}", self.suite_timeout),
            ),
        };
        deploy_info!(
            context = LogContext::new().with_run(run_id).with_phase("verifying"),
            "verification {}: {} passed, {} failed, {} warnings",
            if report.passed { "passed" } else { "failed" },
            report.count(TestStatus::Passed),
            report.count(TestStatus::Failed),
            report.count(TestStatus::Warning)
        );
        report
    }

    async fn roll_back(
        &self,
        run_id: &str,
        label: &str,
        batch: &[String],
        descriptors: &[UpdateDescriptor],
        trigger: DeployError,
    ) -> (DeploymentOutcome, DeployError) {
        self.transition(run_id, DeploymentPhase::RollingBack);
        for descriptor in descriptors.iter().filter(|d| !d.rollback_supported) {
            deploy_warn!(
                context = LogContext::new().with_run(run_id).with_update(&descriptor.id),
                "update does not declare rollback support; restoring snapshot anyway"
            );
        }

        match self.snapshots.restore(label).await {
            Ok(_) => {
                self.registry
                    .set_status(batch, UpdateStatus::RolledBack, run_id);
                self.transition(run_id, DeploymentPhase::RolledBack);
                (DeploymentOutcome::RolledBack, trigger)
            }
            Err(source) => {
                self.registry
                    .set_status(batch, UpdateStatus::RollbackFailed, run_id);
                self.transition(run_id, DeploymentPhase::RollbackFailed);
                let failure = DeployError::RollbackFailed {
                    run_id: run_id.to_owned(),
                    trigger: Box::new(trigger),
                    source: Box::new(source),
                };
                (DeploymentOutcome::RollbackFailed, failure)
            }
        }
    }

    fn transition(&self, run_id: &str, phase: DeploymentPhase) {
        let ctx = LogContext::new().with_run(run_id).with_phase(phase.name());
        if phase.is_terminal() {
            deploy_info!(context = ctx, "deployment run reached {}", phase.name());
        } else {
            deploy_debug!(context = ctx, "deployment phase changed");
        }
        if let Some(journal) = &self.journal {
            journal.run_transition(run_id, &phase);
        }
        // No subscribers is not an error.
        let _ = self.events.send(DeploymentEvent::new(run_id, phase));
    }

    fn record_component_failure(&self, err: &ComponentError) {
        if let Some(metrics) = &self.metrics {
            metrics.record_component_failure(err.component(), err.operation().as_ref());
        }
    }

    fn finish(&self, report: DeploymentReport, elapsed: Duration) -> DeploymentReport {
        *self.last_run_at.lock() = Some(report.finished_at);
        if let Some(metrics) = &self.metrics {
            metrics.record_run(report.outcome.as_ref(), elapsed);
        }
        if let Some(journal) = &self.journal {
            journal.run_finished(&report.run_id, report.outcome.as_ref(), report.failure.as_ref());
        }

        let ctx = LogContext::new().with_run(&report.run_id);
        let message = match &report.failure {
            Some(failure) => format!(
                "run {} over {} updates in {}ms: {failure}",
                report.outcome,
                report.ran_update_ids.len(),
                duration_to_millis(elapsed)
            ),
            None => format!(
                "run {} over {} updates in {}ms; active version {}",
                report.outcome,
                report.ran_update_ids.len(),
                duration_to_millis(elapsed),
                report.active_version
            ),
        };
        let outcome = match report.outcome {
            DeploymentOutcome::Deployed | DeploymentOutcome::Noop => SystemEventOutcome::Success,
            DeploymentOutcome::RolledBack => SystemEventOutcome::Degraded,
            DeploymentOutcome::RollbackFailed => SystemEventOutcome::Fault,
        };
        log_system_event(Some(&ctx), "deployment.run", &message, outcome);
        report
    }
}

fn set_statuses(updates: &mut [UpdateRunResult], status: UpdateStatus) {
    for update in updates {
        update.status = status;
    }
}

#[cfg(test)]
mod tests {
    use r_deploy_testharness::{CheckOutcome, SuiteHarness};

    use super::*;
    use crate::component::MemoryComponent;
    use crate::descriptor::{RiskLevel, UpdateType};

    fn coordinator(harness: SuiteHarness) -> (DeploymentCoordinator, Arc<MemoryComponent>) {
        let components = Arc::new(ComponentUpdaterRegistry::new(Duration::from_secs(1)));
        let gateway = Arc::new(MemoryComponent::new("gateway", "1.0.0"));
        components.register("gateway", gateway.clone());
        let coordinator = DeploymentCoordinator::builder(components, Arc::new(harness)).build();
        (coordinator, gateway)
    }

    fn queue_update(coordinator: &DeploymentCoordinator, title: &str) -> String {
        let id = coordinator
            .create_update(UpdateSpec::new(
                UpdateType::Api,
                title,
                ["gateway"],
                RiskLevel::Low,
            ))
            .unwrap();
        coordinator
            .record_approval(&id, ApprovalRole::Developer, "dev", true)
            .unwrap();
        coordinator.enqueue(&id).unwrap();
        id
    }

    #[tokio::test]
    async fn empty_queue_is_a_noop() {
        let (coordinator, gateway) = coordinator(SuiteHarness::new());
        let report = coordinator.deploy_queued().await.unwrap();
        assert_eq!(report.outcome, DeploymentOutcome::Noop);
        assert!(report.ran_update_ids.is_empty());
        assert_eq!(coordinator.snapshots().count(), 0);
        assert_eq!(gateway.apply_calls(), 0);
        assert!(coordinator.get_status().last_run_at.is_some());
    }

    #[tokio::test]
    async fn passing_run_commits_and_emits_phases_in_order() {
        let harness = SuiteHarness::new().check("smoke", || async { Ok(CheckOutcome::passed("ok")) });
        let (coordinator, gateway) = coordinator(harness);
        let mut events = coordinator.subscribe();
        let id = queue_update(&coordinator, "limits");

        let report = coordinator.deploy_queued().await.unwrap();
        assert_eq!(report.outcome, DeploymentOutcome::Deployed);
        assert_eq!(report.ran_update_ids, vec![id.clone()]);
        assert_eq!(report.active_version, Version::new(1, 0, 1));
        assert_eq!(report.updates[0].status, UpdateStatus::Deployed);
        assert!(report.test_results.as_ref().unwrap().passed);
        assert_eq!(gateway.version(), "1.0.1");

        let mut phases = Vec::new();
        while let Ok(event) = events.try_recv() {
            phases.push(event.phase.name());
        }
        assert_eq!(
            phases,
            vec!["snapshot_captured", "applying", "verifying", "committed", "idle"]
        );

        let status = coordinator.get_status();
        assert!(!status.run_in_progress);
        assert_eq!(status.snapshot_count, 1);
        assert_eq!(status.queue_depth, 0);
    }

    #[tokio::test]
    async fn harness_error_counts_as_failed_verification() {
        let harness = SuiteHarness::new().check("ledger", || async {
            Err::<CheckOutcome, _>(anyhow::anyhow!("ledger unreachable"))
        });
        let (coordinator, gateway) = coordinator(harness);
        queue_update(&coordinator, "limits");

        let report = coordinator.deploy_queued().await.unwrap();
        assert_eq!(report.outcome, DeploymentOutcome::RolledBack);
        assert!(matches!(
            report.failure,
            Some(DeployError::VerificationFailed { ref failed_checks, .. }) if failed_checks == &vec!["ledger".to_owned()]
        ));
        assert_eq!(gateway.version(), "1.0.0");
        assert_eq!(gateway.restore_calls(), 1);
    }

    #[tokio::test]
    async fn unsatisfied_dependency_rolls_back_the_batch() {
        let harness = SuiteHarness::new();
        let (coordinator, gateway) = coordinator(harness);
        let parent = coordinator
            .create_update(UpdateSpec::new(UpdateType::Api, "parent", ["gateway"], RiskLevel::Low))
            .unwrap();
        let child = coordinator
            .create_update(
                UpdateSpec::new(UpdateType::Api, "child", ["gateway"], RiskLevel::Low)
                    .with_dependencies([parent.clone()]),
            )
            .unwrap();
        coordinator
            .record_approval(&child, ApprovalRole::Developer, "dev", true)
            .unwrap();
        coordinator.enqueue(&child).unwrap();

        let report = coordinator.deploy_queued().await.unwrap();
        assert_eq!(report.outcome, DeploymentOutcome::RolledBack);
        match report.failure {
            Some(DeployError::DependencyUnsatisfied { dependency, state, .. }) => {
                assert_eq!(dependency, parent);
                assert_eq!(state, "created");
            }
            other => panic!("unexpected failure: {other:?}"),
        }
        assert_eq!(gateway.apply_calls(), 0);
        assert_eq!(
            coordinator.get_update(&child).unwrap().status,
            UpdateStatus::RolledBack
        );
    }

    #[tokio::test]
    async fn dependency_earlier_in_batch_is_satisfied() {
        let (coordinator, _) = coordinator(SuiteHarness::new());
        let parent = queue_update(&coordinator, "parent");
        let child = coordinator
            .create_update(
                UpdateSpec::new(UpdateType::Api, "child", ["gateway"], RiskLevel::Low)
                    .with_dependencies([parent.clone()]),
            )
            .unwrap();
        coordinator
            .record_approval(&child, ApprovalRole::Developer, "dev", true)
            .unwrap();
        coordinator.enqueue(&child).unwrap();

        let report = coordinator.deploy_queued().await.unwrap();
        assert_eq!(report.outcome, DeploymentOutcome::Deployed);
        assert_eq!(report.ran_update_ids, vec![parent, child]);
    }
}
