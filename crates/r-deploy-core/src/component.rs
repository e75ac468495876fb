//! ---
//! deploy_section: "02-update-orchestration"
//! deploy_subsection: "module"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "Component updater contract and the deadline-enforcing registry."
//! deploy_version: "v0.0.0-prealpha"
//! deploy_owner: "tbd"
//! ---
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::descriptor::UpdateDescriptor;
use crate::error::{panic_message, ComponentError, ComponentOperation};
use crate::snapshot::Snapshot;

/// State reported by a component; one entry of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentState {
    pub name: String,
    pub version: String,
    pub hash: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub config_state: Value,
}

/// Contract every concrete component fulfils. The core never looks past it.
#[async_trait]
pub trait ComponentUpdater: Send + Sync {
    /// Report the current state. Must not mutate the component.
    async fn describe_state(&self) -> anyhow::Result<ComponentState>;

    /// Apply `update` to this component.
    async fn apply(&self, update: &UpdateDescriptor) -> anyhow::Result<()>;

    /// Return the component to `state`, taken from `snapshot`.
    async fn restore_state(&self, state: &ComponentState, snapshot: &Snapshot)
        -> anyhow::Result<()>;
}

/// Named component updaters in registration order.
///
/// Every call runs under the configured deadline; a timeout is reported as a
/// failure of that component.
pub struct ComponentUpdaterRegistry {
    updaters: RwLock<IndexMap<String, Arc<dyn ComponentUpdater>>>,
    call_timeout: Duration,
}

impl ComponentUpdaterRegistry {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            updaters: RwLock::new(IndexMap::new()),
            call_timeout,
        }
    }

    /// Register or replace the updater for `name`.
    pub fn register(&self, name: impl Into<String>, updater: Arc<dyn ComponentUpdater>) {
        let name = name.into();
        let replaced = self
            .updaters
            .write()
            .insert(name.clone(), updater)
            .is_some();
        debug!(component = %name, replaced, "component updater registered");
    }

    pub fn names(&self) -> Vec<String> {
        self.updaters.read().keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.updaters.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.updaters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.updaters.read().is_empty()
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub async fn describe_state(&self, name: &str) -> Result<ComponentState, ComponentError> {
        let updater = self.lookup(name, ComponentOperation::DescribeState)?;
        let mut state = self
            .call(name, ComponentOperation::DescribeState, updater.describe_state())
            .await?;
        state.name = name.to_owned();
        Ok(state)
    }

    pub async fn apply(
        &self,
        name: &str,
        update: &UpdateDescriptor,
    ) -> Result<(), ComponentError> {
        let updater = self.lookup(name, ComponentOperation::Apply)?;
        self.call(name, ComponentOperation::Apply, updater.apply(update))
            .await
    }

    pub async fn restore_state(
        &self,
        state: &ComponentState,
        snapshot: &Snapshot,
    ) -> Result<(), ComponentError> {
        let updater = self.lookup(&state.name, ComponentOperation::RestoreState)?;
        self.call(
            &state.name,
            ComponentOperation::RestoreState,
            updater.restore_state(state, snapshot),
        )
        .await
    }

    fn lookup(
        &self,
        name: &str,
        operation: ComponentOperation,
    ) -> Result<Arc<dyn ComponentUpdater>, ComponentError> {
        self.updaters
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ComponentError::NotRegistered {
                component: name.to_owned(),
                operation,
            })
    }

    async fn call<T, F>(
        &self,
        name: &str,
        operation: ComponentOperation,
        future: F,
    ) -> Result<T, ComponentError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        // A panicking updater is reported as a failed call so the run still rolls back.
        let guarded = AssertUnwindSafe(future).catch_unwind();
        match tokio::time::timeout(self.call_timeout, guarded).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => {
                let cause = format!("{err:#}");
                warn!(component = name, operation = %operation, error = %cause, "component call failed");
                Err(ComponentError::Failed {
                    component: name.to_owned(),
                    operation,
                    cause,
                })
            }
            Ok(Err(payload)) => {
                let cause = format!("panicked: {}", panic_message(payload));
                warn!(component = name, operation = %operation, error = %cause, "component call panicked");
                Err(ComponentError::Failed {
                    component: name.to_owned(),
                    operation,
                    cause,
                })
            }
            Err(_) => {
                warn!(
                    component = name,
                    operation = %operation,
                    timeout_ms = self.call_timeout.as_millis() as u64,
                    "component call timed out"
                );
                Err(ComponentError::TimedOut {
                    component: name.to_owned(),
                    operation,
                    timeout: self.call_timeout,
                })
            }
        }
    }
}

impl std::fmt::Debug for ComponentUpdaterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentUpdaterRegistry")
            .field("components", &self.names())
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct MemoryState {
    version: String,
    config: Value,
    applied: Vec<String>,
}

/// In-process component holding its state in memory.
///
/// Used by tests and local dry runs; failure and delay knobs let callers
/// exercise the rollback paths.
#[derive(Debug)]
pub struct MemoryComponent {
    name: String,
    state: Mutex<MemoryState>,
    fail_describe: AtomicBool,
    fail_apply: AtomicBool,
    fail_restore: AtomicBool,
    apply_delay: Mutex<Option<Duration>>,
    apply_calls: AtomicUsize,
    restore_calls: AtomicUsize,
}

impl MemoryComponent {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryState {
                version: version.into(),
                config: json!({}),
                applied: Vec::new(),
            }),
            fail_describe: AtomicBool::new(false),
            fail_apply: AtomicBool::new(false),
            fail_restore: AtomicBool::new(false),
            apply_delay: Mutex::new(None),
            apply_calls: AtomicUsize::new(0),
            restore_calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_describe(&self, fail: bool) {
        self.fail_describe.store(fail, Ordering::SeqCst);
    }

    /// When set, `apply` leaves a half-applied marker behind and then fails.
    pub fn fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    pub fn fail_restore(&self, fail: bool) {
        self.fail_restore.store(fail, Ordering::SeqCst);
    }

    pub fn set_apply_delay(&self, delay: Option<Duration>) {
        *self.apply_delay.lock() = delay;
    }

    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    pub fn restore_calls(&self) -> usize {
        self.restore_calls.load(Ordering::SeqCst)
    }

    pub fn version(&self) -> String {
        self.state.lock().version.clone()
    }

    /// Update ids applied since the last restore.
    pub fn applied(&self) -> Vec<String> {
        self.state.lock().applied.clone()
    }

    fn current(&self) -> ComponentState {
        let state = self.state.lock();
        let config_state = json!({
            "config": state.config,
            "applied": state.applied,
        });
        let hash = r_deploy_persistence::content_hash(&config_state).unwrap_or_default();
        ComponentState {
            name: self.name.clone(),
            version: state.version.clone(),
            hash,
            dependencies: Vec::new(),
            config_state,
        }
    }
}

#[async_trait]
impl ComponentUpdater for MemoryComponent {
    async fn describe_state(&self) -> anyhow::Result<ComponentState> {
        if self.fail_describe.load(Ordering::SeqCst) {
            anyhow::bail!("{} is unreachable", self.name);
        }
        Ok(self.current())
    }

    async fn apply(&self, update: &UpdateDescriptor) -> anyhow::Result<()> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.apply_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if self.fail_apply.load(Ordering::SeqCst) {
            state.config["half_applied"] = Value::String(update.id.clone());
            anyhow::bail!("{} rejected update {}", self.name, update.id);
        }
        state.version = update.version.to_string();
        state.config["last_update"] = Value::String(update.id.clone());
        state.applied.push(update.id.clone());
        Ok(())
    }

    async fn restore_state(
        &self,
        state: &ComponentState,
        _snapshot: &Snapshot,
    ) -> anyhow::Result<()> {
        self.restore_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_restore.load(Ordering::SeqCst) {
            anyhow::bail!("{} could not restore version {}", self.name, state.version);
        }
        let mut current = self.state.lock();
        current.version = state.version.clone();
        current.config = state
            .config_state
            .get("config")
            .cloned()
            .unwrap_or_else(|| json!({}));
        current.applied = state
            .config_state
            .get("applied")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use semver::Version;

    use super::*;
    use crate::descriptor::{RiskLevel, UpdateSpec, UpdateType};

    fn update(id: &str) -> UpdateDescriptor {
        UpdateDescriptor::from_spec(
            id.into(),
            Version::new(1, 0, 1),
            UpdateSpec::new(UpdateType::Api, "limits", ["gateway"], RiskLevel::Low),
        )
    }

    #[tokio::test]
    async fn unregistered_component_is_an_error() {
        let registry = ComponentUpdaterRegistry::new(Duration::from_secs(1));
        let err = registry.apply("ghost", &update("u1")).await.unwrap_err();
        assert!(matches!(err, ComponentError::NotRegistered { .. }));
        assert_eq!(err.component(), "ghost");
    }

    #[tokio::test]
    async fn describe_state_uses_registered_name() {
        let registry = ComponentUpdaterRegistry::new(Duration::from_secs(1));
        registry.register("gateway", Arc::new(MemoryComponent::new("gw-internal", "1.0.0")));
        let state = registry.describe_state("gateway").await.unwrap();
        assert_eq!(state.name, "gateway");
        assert_eq!(state.version, "1.0.0");
        assert_eq!(state.hash.len(), 64);
    }

    #[tokio::test]
    async fn apply_failure_carries_cause() {
        let registry = ComponentUpdaterRegistry::new(Duration::from_secs(1));
        let component = Arc::new(MemoryComponent::new("gateway", "1.0.0"));
        component.fail_apply(true);
        registry.register("gateway", component.clone());

        let err = registry.apply("gateway", &update("u1")).await.unwrap_err();
        match err {
            ComponentError::Failed { operation, cause, .. } => {
                assert_eq!(operation, ComponentOperation::Apply);
                assert!(cause.contains("rejected update u1"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(component.apply_calls(), 1);
    }

    #[tokio::test]
    async fn slow_apply_times_out() {
        let registry = ComponentUpdaterRegistry::new(Duration::from_millis(20));
        let component = Arc::new(MemoryComponent::new("gateway", "1.0.0"));
        component.set_apply_delay(Some(Duration::from_millis(500)));
        registry.register("gateway", component.clone());

        let err = registry.apply("gateway", &update("u1")).await.unwrap_err();
        assert!(matches!(err, ComponentError::TimedOut { .. }));
        assert_eq!(component.version(), "1.0.0");
    }

    #[tokio::test]
    async fn successful_apply_changes_reported_state() {
        let registry = ComponentUpdaterRegistry::new(Duration::from_secs(1));
        let component = Arc::new(MemoryComponent::new("gateway", "1.0.0"));
        registry.register("gateway", component.clone());

        let before = registry.describe_state("gateway").await.unwrap();
        registry.apply("gateway", &update("u1")).await.unwrap();
        let after = registry.describe_state("gateway").await.unwrap();
        assert_ne!(before.hash, after.hash);
        assert_eq!(after.version, "1.0.1");
        assert_eq!(component.applied(), vec!["u1".to_owned()]);
    }
}
