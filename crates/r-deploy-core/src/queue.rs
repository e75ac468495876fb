//! ---
//! deploy_section: "02-update-orchestration"
//! deploy_subsection: "module"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "FIFO of approved updates awaiting deployment."
//! deploy_version: "v0.0.0-prealpha"
//! deploy_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use r_deploy_metrics::DeploymentMetrics;
use tracing::info;

use crate::approval::ApprovalGate;
use crate::descriptor::UpdateStatus;
use crate::error::DeployError;
use crate::registry::UpdateRegistry;

/// Approved update ids in enqueue order.
///
/// Lock order is always queue, then registry.
#[derive(Debug)]
pub struct DeploymentQueue {
    registry: Arc<UpdateRegistry>,
    gate: ApprovalGate,
    pending: Mutex<VecDeque<String>>,
    metrics: Option<Arc<DeploymentMetrics>>,
}

impl DeploymentQueue {
    pub fn new(registry: Arc<UpdateRegistry>, gate: ApprovalGate) -> Self {
        Self {
            registry,
            gate,
            pending: Mutex::new(VecDeque::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<DeploymentMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Queue an update whose approvals are satisfied.
    ///
    /// Fails without side effects when the update is unknown, already in
    /// flight, finalized by a rollback, or missing approvals.
    pub fn enqueue(&self, update_id: &str) -> Result<(), DeployError> {
        let depth = {
            let mut pending = self.pending.lock();
            self.registry.mark_queued(update_id, &self.gate)?;
            pending.push_back(update_id.to_owned());
            // Gauge writes stay ordered with queue mutations.
            self.report_depth(pending.len());
            pending.len()
        };
        info!(update = update_id, queue_depth = depth, "update queued");
        Ok(())
    }

    /// Atomically drain every queued id in FIFO order and mark each one
    /// `Deploying` before the queue lock is released.
    pub fn dequeue_all(&self, run_id: &str) -> Vec<String> {
        let drained: Vec<String> = {
            let mut pending = self.pending.lock();
            let drained: Vec<String> = pending.drain(..).collect();
            if !drained.is_empty() {
                self.registry
                    .set_status(&drained, UpdateStatus::Deploying, run_id);
            }
            self.report_depth(pending.len());
            drained
        };
        drained
    }

    pub fn depth(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn contains(&self, update_id: &str) -> bool {
        self.pending.lock().iter().any(|id| id == update_id)
    }

    /// Copy of the queued ids in FIFO order.
    pub fn snapshot(&self) -> Vec<String> {
        self.pending.lock().iter().cloned().collect()
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    fn report_depth(&self, depth: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_queue_depth(depth);
        }
    }
}
