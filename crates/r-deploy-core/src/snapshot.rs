//! ---
//! deploy_section: "02-update-orchestration"
//! deploy_subsection: "module"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "Immutable system snapshots captured before each run and restored on rollback."
//! deploy_version: "v0.0.0-prealpha"
//! deploy_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use indexmap::IndexMap;
use parking_lot::RwLock;
use r_deploy_metrics::DeploymentMetrics;
use r_deploy_persistence::{load_envelope, value_digest, SnapshotArchive};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::component::{ComponentState, ComponentUpdaterRegistry};
use crate::error::{ComponentError, DeployError};

/// Immutable capture of every registered component's reported state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub label: String,
    pub version_at_capture: Version,
    pub created_at: DateTime<Utc>,
    /// Sorted by component name; this is also the capture order.
    pub component_states: Vec<ComponentState>,
    pub config_hash: String,
    pub rollback_payload: Value,
}

impl Snapshot {
    pub fn state_of(&self, component: &str) -> Option<&ComponentState> {
        self.component_states
            .iter()
            .find(|state| state.name == component)
    }
}

/// Digest over the name-sorted states. Equal logical states always hash the
/// same regardless of registration or reporting order.
pub fn config_hash(states: &[ComponentState]) -> String {
    let mut sorted: Vec<&ComponentState> = states.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    let normalized = Value::Array(
        sorted
            .into_iter()
            .map(|state| {
                json!({
                    "name": state.name,
                    "version": state.version,
                    "hash": state.hash,
                    "dependencies": state.dependencies,
                    "config_state": state.config_state,
                })
            })
            .collect(),
    );
    value_digest(&normalized)
}

#[derive(Debug, Default)]
struct SnapshotIndex {
    by_id: IndexMap<String, Arc<Snapshot>>,
    labels: HashMap<String, Vec<String>>,
}

impl SnapshotIndex {
    fn insert(&mut self, snapshot: Arc<Snapshot>) {
        self.labels
            .entry(snapshot.label.clone())
            .or_default()
            .push(snapshot.id.clone());
        self.by_id.insert(snapshot.id.clone(), snapshot);
    }

    fn latest(&self, label: &str) -> Option<Arc<Snapshot>> {
        self.labels
            .get(label)
            .and_then(|ids| ids.last())
            .and_then(|id| self.by_id.get(id))
            .cloned()
    }
}

/// Captures and restores snapshots through the component updater registry.
///
/// A label may be captured several times; it resolves to the most recent
/// snapshot. Snapshots are kept until [`SnapshotStore::remove`] is called.
#[derive(Debug)]
pub struct SnapshotStore {
    components: Arc<ComponentUpdaterRegistry>,
    index: RwLock<SnapshotIndex>,
    archive: Option<SnapshotArchive>,
    metrics: Option<Arc<DeploymentMetrics>>,
}

impl SnapshotStore {
    pub fn new(components: Arc<ComponentUpdaterRegistry>) -> Self {
        Self {
            components,
            index: RwLock::new(SnapshotIndex::default()),
            archive: None,
            metrics: None,
        }
    }

    /// Mirror captured snapshots into `archive`.
    pub fn with_archive(mut self, archive: SnapshotArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<DeploymentMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Ask every registered component to describe itself and store the
    /// result under a fresh id tagged with `label`.
    pub async fn capture(
        &self,
        label: &str,
        version_at_capture: &Version,
    ) -> Result<Arc<Snapshot>, ComponentError> {
        let mut names = self.components.names();
        names.sort();
        let component_states = try_join_all(
            names
                .iter()
                .map(|name| self.components.describe_state(name)),
        )
        .await?;

        let snapshot = Arc::new(Snapshot {
            id: Uuid::new_v4().to_string(),
            label: label.to_owned(),
            version_at_capture: version_at_capture.clone(),
            created_at: Utc::now(),
            config_hash: config_hash(&component_states),
            rollback_payload: json!({
                "version_at_capture": version_at_capture.to_string(),
                "components": names,
            }),
            component_states,
        });

        self.index.write().insert(snapshot.clone());
        if let Some(metrics) = &self.metrics {
            metrics.inc_snapshot();
        }
        if let Some(archive) = &self.archive {
            match archive.save(&snapshot.label, &snapshot.id, snapshot.as_ref()) {
                Ok(path) => debug!(snapshot = %snapshot.id, path = %path.display(), "snapshot archived"),
                Err(err) => warn!(snapshot = %snapshot.id, error = %err, "failed to archive snapshot"),
            }
        }
        info!(
            snapshot = %snapshot.id,
            label,
            components = snapshot.component_states.len(),
            config_hash = %snapshot.config_hash,
            "snapshot captured"
        );
        Ok(snapshot)
    }

    /// Restore the most recent snapshot for `label`, walking components in
    /// reverse capture order.
    ///
    /// A failing component does not stop the walk; when any restore fails
    /// the call returns `PartialRollback` naming both sides.
    pub async fn restore(&self, label: &str) -> Result<Arc<Snapshot>, DeployError> {
        let snapshot = self
            .latest(label)
            .ok_or_else(|| DeployError::SnapshotNotFound {
                label: label.to_owned(),
            })?;

        let mut restored = Vec::new();
        let mut not_restored = Vec::new();
        let mut causes = Vec::new();
        for state in snapshot.component_states.iter().rev() {
            match self.components.restore_state(state, &snapshot).await {
                Ok(()) => restored.push(state.name.clone()),
                Err(err) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_component_failure(err.component(), err.operation().as_ref());
                    }
                    not_restored.push(state.name.clone());
                    causes.push(err);
                }
            }
        }

        if !causes.is_empty() {
            error!(
                snapshot = %snapshot.id,
                label,
                restored = ?restored,
                not_restored = ?not_restored,
                "partial rollback"
            );
            return Err(DeployError::PartialRollback {
                label: label.to_owned(),
                snapshot_id: snapshot.id.clone(),
                restored,
                not_restored,
                causes,
            });
        }

        info!(snapshot = %snapshot.id, label, components = restored.len(), "snapshot restored");
        Ok(snapshot)
    }

    pub fn get(&self, snapshot_id: &str) -> Option<Arc<Snapshot>> {
        self.index.read().by_id.get(snapshot_id).cloned()
    }

    /// Most recent snapshot recorded under `label`.
    pub fn latest(&self, label: &str) -> Option<Arc<Snapshot>> {
        self.index.read().latest(label)
    }

    /// Every snapshot in capture order.
    pub fn list(&self) -> Vec<Arc<Snapshot>> {
        self.index.read().by_id.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.index.read().by_id.len()
    }

    /// Drop a snapshot from the store and its archive. Returns `false` when
    /// the id is unknown.
    pub fn remove(&self, snapshot_id: &str) -> bool {
        let removed = {
            let mut index = self.index.write();
            let removed = index.by_id.shift_remove(snapshot_id);
            if let Some(snapshot) = &removed {
                if let Some(ids) = index.labels.get_mut(&snapshot.label) {
                    ids.retain(|id| id != snapshot_id);
                    if ids.is_empty() {
                        index.labels.remove(&snapshot.label);
                    }
                }
            }
            removed
        };
        let Some(snapshot) = removed else {
            return false;
        };
        if let Some(archive) = &self.archive {
            if let Err(err) = archive.remove(&snapshot.label, &snapshot.id) {
                warn!(snapshot = snapshot_id, error = %err, "failed to remove archived snapshot");
            }
        }
        debug!(snapshot = snapshot_id, label = %snapshot.label, "snapshot removed");
        true
    }

    /// Recompute the digest of a stored snapshot and, when archived, check
    /// the sealed copy as well.
    pub fn verify(&self, snapshot_id: &str) -> bool {
        let Some(snapshot) = self.get(snapshot_id) else {
            return false;
        };
        if config_hash(&snapshot.component_states) != snapshot.config_hash {
            return false;
        }
        match &self.archive {
            Some(archive) => archive
                .load::<Snapshot>(&snapshot.label, &snapshot.id)
                .map(|archived| archived == *snapshot)
                .unwrap_or(false),
            None => true,
        }
    }

    /// Index every snapshot found in the archive, oldest first. Snapshots
    /// already known or failing verification are skipped.
    pub fn load_archived(&self) -> usize {
        let Some(archive) = &self.archive else {
            return 0;
        };
        let mut loaded: Vec<Snapshot> = Vec::new();
        for path in archive.list() {
            match load_envelope::<Snapshot>(&path) {
                Ok(snapshot) => loaded.push(snapshot),
                Err(err) => warn!(path = %path.display(), error = %err, "skipping archived snapshot"),
            }
        }
        loaded.sort_by_key(|snapshot| snapshot.created_at);

        let mut index = self.index.write();
        let mut count = 0;
        for snapshot in loaded {
            if index.by_id.contains_key(&snapshot.id) {
                continue;
            }
            index.insert(Arc::new(snapshot));
            count += 1;
        }
        count
    }
}
