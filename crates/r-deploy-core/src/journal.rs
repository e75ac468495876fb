//! ---
//! deploy_section: "02-update-orchestration"
//! deploy_subsection: "module"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "Bridge between the orchestration core and the audit journal."
//! deploy_version: "v0.0.0-prealpha"
//! deploy_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use r_deploy_common::JournalConfig;
use r_deploy_persistence::{
    replay_journal, JournalEntry, JournalWriter, Result as PersistenceResult,
};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::descriptor::{Approval, UpdateDescriptor, UpdateStatus};
use crate::error::DeployError;
use crate::events::DeploymentPhase;

/// Append-only audit trail of registry mutations and run transitions.
///
/// Recording is best effort: a failed append is logged and never fails the
/// operation that triggered it.
#[derive(Debug)]
pub struct DeploymentJournal {
    path: PathBuf,
    writer: Mutex<JournalWriter>,
}

impl DeploymentJournal {
    pub fn open(path: impl Into<PathBuf>) -> PersistenceResult<Self> {
        let path = path.into();
        let writer = JournalWriter::open(&path)?;
        debug!(journal = %path.display(), "deployment journal opened");
        Ok(Self {
            path,
            writer: Mutex::new(writer),
        })
    }

    /// Open the configured journal, or `None` when journaling is disabled.
    pub fn from_config(config: &JournalConfig) -> PersistenceResult<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        Self::open(config.path.clone()).map(Some)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn update_created(&self, descriptor: &UpdateDescriptor) {
        self.append(
            JournalEntry::new(
                "update.created",
                json!({
                    "version": descriptor.version.to_string(),
                    "type": descriptor.update_type.as_ref(),
                    "title": descriptor.title,
                    "components": descriptor.components,
                    "dependencies": descriptor.dependencies,
                    "risk": descriptor.risk.level.as_ref(),
                    "author": descriptor.author,
                }),
            )
            .with_update(&descriptor.id),
        );
    }

    pub fn approval_recorded(&self, update_id: &str, approval: &Approval) {
        self.append(
            JournalEntry::new(
                "update.approval",
                json!({
                    "role": approval.role.as_ref(),
                    "approver": approval.approver,
                    "approved": approval.approved,
                }),
            )
            .with_update(update_id),
        );
    }

    pub fn status_changed(&self, run_id: Option<&str>, update_id: &str, status: UpdateStatus) {
        let mut entry = JournalEntry::new("update.status", json!({ "status": status.as_ref() }))
            .with_update(update_id);
        if let Some(run_id) = run_id {
            entry = entry.with_run(run_id);
        }
        self.append(entry);
    }

    pub fn run_transition(&self, run_id: &str, phase: &DeploymentPhase) {
        let payload = serde_json::to_value(phase).unwrap_or(Value::Null);
        self.append(JournalEntry::new("run.transition", payload).with_run(run_id));
    }

    pub fn run_finished(&self, run_id: &str, outcome: &str, failure: Option<&DeployError>) {
        let payload = json!({
            "outcome": outcome,
            "failure_kind": failure.map(DeployError::kind),
            "failure": failure.map(ToString::to_string),
        });
        self.append(JournalEntry::new("run.finished", payload).with_run(run_id));
    }

    /// Replay every record in append order.
    pub fn replay<F>(&self, handler: F) -> PersistenceResult<usize>
    where
        F: FnMut(JournalEntry) -> PersistenceResult<()>,
    {
        self.writer.lock().flush()?;
        replay_journal(&self.path, handler)
    }

    /// Collect every record; intended for diagnostics and tests.
    pub fn entries(&self) -> PersistenceResult<Vec<JournalEntry>> {
        let mut entries = Vec::new();
        self.replay(|entry| {
            entries.push(entry);
            Ok(())
        })?;
        Ok(entries)
    }

    fn append(&self, entry: JournalEntry) {
        let kind = entry.kind.clone();
        let result = self.writer.lock().append(entry);
        match result {
            Ok((sequence, bytes)) => {
                debug!(kind = %kind, sequence, bytes, "journal record appended")
            }
            Err(err) => warn!(
                kind = %kind,
                journal = %self.path.display(),
                error = %err,
                "failed to append journal record"
            ),
        }
    }
}
