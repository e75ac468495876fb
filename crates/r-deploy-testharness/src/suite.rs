//! ---
//! deploy_section: "15-testing-qa-runbook"
//! deploy_subsection: "module"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "Post-deployment verification harness and shared exports."
//! deploy_version: "v0.1.0"
//! deploy_owner: "tbd"
//! ---
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::{TestCaseResult, TestHarness, TestReport, TestStatus};

/// Outcome returned by an individual check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    /// Check status.
    pub status: TestStatus,
    /// Operator-facing details.
    pub details: String,
}

impl CheckOutcome {
    /// Successful check.
    pub fn passed(details: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Passed,
            details: details.into(),
        }
    }

    /// Failed check.
    pub fn failed(details: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Failed,
            details: details.into(),
        }
    }

    /// Non-fatal warning.
    pub fn warning(details: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Warning,
            details: details.into(),
        }
    }
}

type CheckFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<CheckOutcome>> + Send + Sync>;

/// Harness running a fixed, ordered list of named async checks.
///
/// A check returning `Err` is recorded as a failed result; the remaining
/// checks still run so the report is complete.
#[derive(Clone, Default)]
pub struct SuiteHarness {
    checks: Vec<(String, CheckFn)>,
}

impl SuiteHarness {
    /// Create an empty suite. An empty suite passes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a named check.
    pub fn check<F, Fut>(mut self, name: impl Into<String>, check: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<CheckOutcome>> + Send + 'static,
    {
        let check: CheckFn = Arc::new(move || check().boxed());
        self.checks.push((name.into(), check));
        self
    }

    /// Number of registered checks.
    pub fn len(&self) -> usize {
        self.checks.len()
    }

    /// Whether the suite has no checks.
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }
}

impl std::fmt::Debug for SuiteHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuiteHarness")
            .field(
                "checks",
                &self.checks.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[async_trait]
impl TestHarness for SuiteHarness {
    async fn run_suite(&self) -> anyhow::Result<TestReport> {
        let mut results = Vec::with_capacity(self.checks.len());
        for (name, check) in &self.checks {
            let started = Instant::now();
            let outcome = match check().await {
                Ok(outcome) => outcome,
                Err(err) => CheckOutcome::failed(format!("{err:#}")),
            };
            let duration = started.elapsed();
            match outcome.status {
                TestStatus::Passed => {
                    debug!(check = %name, ?duration, "verification check passed")
                }
                TestStatus::Warning => {
                    warn!(check = %name, details = %outcome.details, "verification check warning")
                }
                TestStatus::Failed => {
                    warn!(check = %name, details = %outcome.details, "verification check failed")
                }
            }
            results.push(TestCaseResult {
                name: name.clone(),
                status: outcome.status,
                duration,
                details: outcome.details,
            });
        }
        let report = TestReport::from_results(results);
        info!(
            passed = report.passed,
            checks = report.results.len(),
            failed = report.count(TestStatus::Failed),
            "verification suite finished"
        );
        Ok(report)
    }
}
