//! ---
//! deploy_section: "03-persistence-logging"
//! deploy_subsection: "module"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "Metrics collection and export utilities."
//! deploy_version: "v0.0.0-prealpha"
//! deploy_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tracing::error;

/// Shared registry type used across crates.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Render the registry in the Prometheus text exposition format.
///
/// Serving the text is left to whichever front door embeds the engine.
pub fn encode_text(registry: &Registry) -> String {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => body,
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            String::new()
        }
    }
}

/// Metrics recorded by the deployment coordinator.
#[derive(Clone)]
pub struct DeploymentMetrics {
    registry: SharedRegistry,
    runs_total: IntCounterVec,
    run_duration_seconds: Histogram,
    component_failures_total: IntCounterVec,
    queue_depth: IntGauge,
    snapshots_captured_total: IntCounter,
}

impl DeploymentMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let runs_total = IntCounterVec::new(
            Opts::new(
                "r_deploy_runs_total",
                "Completed deployment runs by terminal outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(runs_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.01, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let run_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "r_deploy_run_duration_seconds",
                "Wall-clock duration of deployment runs from snapshot to terminal state",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(run_duration_seconds.clone()))?;

        let component_failures_total = IntCounterVec::new(
            Opts::new(
                "r_deploy_component_failures_total",
                "Failed or timed out component calls by component and operation",
            ),
            &["component", "operation"],
        )?;
        registry.register(Box::new(component_failures_total.clone()))?;

        let queue_depth = IntGauge::with_opts(Opts::new(
            "r_deploy_queue_depth",
            "Approved updates waiting for the next deployment run",
        ))?;
        registry.register(Box::new(queue_depth.clone()))?;

        let snapshots_captured_total = IntCounter::with_opts(Opts::new(
            "r_deploy_snapshots_captured_total",
            "Pre-update snapshots captured",
        ))?;
        registry.register(Box::new(snapshots_captured_total.clone()))?;

        Ok(Self {
            registry,
            runs_total,
            run_duration_seconds,
            component_failures_total,
            queue_depth,
            snapshots_captured_total,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_run(&self, outcome: &str, duration: Duration) {
        self.runs_total.with_label_values(&[outcome]).inc();
        self.run_duration_seconds.observe(duration.as_secs_f64());
    }

    pub fn record_component_failure(&self, component: &str, operation: &str) {
        self.component_failures_total
            .with_label_values(&[component, operation])
            .inc();
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub fn inc_snapshot(&self) {
        self.snapshots_captured_total.inc();
    }
}

impl std::fmt::Debug for DeploymentMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_render_after_recording() {
        let registry = new_registry();
        let metrics = DeploymentMetrics::new(registry.clone()).unwrap();
        metrics.record_run("deployed", Duration::from_millis(120));
        metrics.record_component_failure("ledger", "apply");
        metrics.set_queue_depth(3);
        metrics.inc_snapshot();

        let text = encode_text(&registry);
        assert!(text.contains("r_deploy_runs_total{outcome=\"deployed\"} 1"));
        assert!(text.contains("r_deploy_queue_depth 3"));
        assert!(text.contains("r_deploy_snapshots_captured_total 1"));
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = new_registry();
        DeploymentMetrics::new(registry.clone()).unwrap();
        assert!(DeploymentMetrics::new(registry).is_err());
    }
}
