//! ---
//! deploy_section: "03-persistence-logging"
//! deploy_subsection: "module"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "Structured logging adapters for deployment runs."
//! deploy_version: "v0.0.0-prealpha"
//! deploy_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Deployment-aware logging helpers. Every event emitted through this crate
//! carries the run, update, component, and phase fields so a run can be
//! reconstructed from the log stream alone.

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Initialize a baseline tracing subscriber suitable for development and tests.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer())
        .try_init();
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Deployment run identifier.
    pub run: Option<&'a str>,
    /// Update identifier the event refers to.
    pub update: Option<&'a str>,
    /// Component name the event refers to.
    pub component: Option<&'a str>,
    /// State machine phase at the time of the event.
    pub phase: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a run identifier.
    pub fn with_run(mut self, run: &'a str) -> Self {
        self.run = Some(run);
        self
    }

    /// Attach an update identifier.
    pub fn with_update(mut self, update: &'a str) -> Self {
        self.update = Some(update);
        self
    }

    /// Attach a component name.
    pub fn with_component(mut self, component: &'a str) -> Self {
        self.component = Some(component);
        self
    }

    /// Attach a state machine phase.
    pub fn with_phase(mut self, phase: &'a str) -> Self {
        self.phase = Some(phase);
        self
    }
}

/// High-level outcome used when emitting lifecycle log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEventOutcome {
    /// The operation completed successfully.
    Success,
    /// The operation ended in a recoverable failure.
    Degraded,
    /// The operation failed and requires operator attention.
    Fault,
}

impl SystemEventOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            SystemEventOutcome::Success => "success",
            SystemEventOutcome::Degraded => "degraded",
            SystemEventOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized system event with an outcome-dependent level.
pub fn log_system_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: SystemEventOutcome,
) {
    let default_ctx = LogContext::default();
    let ctx = context.unwrap_or(&default_ctx);
    // tracing::event! needs a constant level, so branch per outcome.
    match outcome {
        SystemEventOutcome::Success => tracing::event!(
            Level::INFO,
            event,
            outcome = outcome.as_str(),
            run = ctx.run.unwrap_or(""),
            update = ctx.update.unwrap_or(""),
            component = ctx.component.unwrap_or(""),
            phase = ctx.phase.unwrap_or(""),
            message = %message
        ),
        SystemEventOutcome::Degraded => tracing::event!(
            Level::WARN,
            event,
            outcome = outcome.as_str(),
            run = ctx.run.unwrap_or(""),
            update = ctx.update.unwrap_or(""),
            component = ctx.component.unwrap_or(""),
            phase = ctx.phase.unwrap_or(""),
            message = %message
        ),
        SystemEventOutcome::Fault => tracing::event!(
            Level::ERROR,
            event,
            outcome = outcome.as_str(),
            run = ctx.run.unwrap_or(""),
            update = ctx.update.unwrap_or(""),
            component = ctx.component.unwrap_or(""),
            phase = ctx.phase.unwrap_or(""),
            message = %message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macros_emit_without_panic() {
        init();
        let ctx = LogContext::new()
            .with_run("run-1")
            .with_update("upd-1")
            .with_component("ledger");
        deploy_info!(context = ctx.clone(), "component applied");
        deploy_debug!("debug message");
        deploy_warn!(context = ctx.clone(), "slow component: {}ms", 1200);
        deploy_error!(context = ctx, "apply failed: {}", "boom");
    }

    #[test]
    fn system_event_helper_emits() {
        init();
        let ctx = LogContext::new().with_run("run-1").with_phase("committed");
        log_system_event(
            Some(&ctx),
            "deploy.committed",
            "batch committed",
            SystemEventOutcome::Success,
        );
        log_system_event(
            None,
            "deploy.rollback_failed",
            "operator intervention required",
            SystemEventOutcome::Fault,
        );
    }
}
