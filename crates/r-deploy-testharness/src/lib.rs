//! ---
//! deploy_section: "15-testing-qa-runbook"
//! deploy_subsection: "module"
//! deploy_type: "source"
//! deploy_scope: "code"
//! deploy_description: "Post-deployment verification harness and shared exports."
//! deploy_version: "v0.1.0"
//! deploy_owner: "tbd"
//! ---
//! Verification harness invoked after every component of a batch has been
//! applied. The coordinator only looks at [`TestReport::passed`]; the
//! individual results travel with the deployment report for audit.

#![warn(missing_docs)]

pub mod suite;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use strum::{AsRefStr, Display};

pub use suite::{CheckOutcome, SuiteHarness};

/// Status reported for a single verification check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TestStatus {
    /// The check succeeded.
    Passed,
    /// The check failed; the suite as a whole fails.
    Failed,
    /// The check raised a concern that does not fail the suite.
    Warning,
}

/// Result of one named check.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseResult {
    /// Check name.
    pub name: String,
    /// Outcome of the check.
    pub status: TestStatus,
    /// Time spent running the check.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub duration: Duration,
    /// Free-form details for operators.
    pub details: String,
}

/// Aggregate verdict plus ordered per-check results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    /// True iff no check failed.
    pub passed: bool,
    /// Results in execution order.
    pub results: Vec<TestCaseResult>,
}

impl TestReport {
    /// Build a report whose verdict is derived from the results.
    pub fn from_results(results: Vec<TestCaseResult>) -> Self {
        let passed = results
            .iter()
            .all(|result| result.status != TestStatus::Failed);
        Self { passed, results }
    }

    /// A failing report with a single synthetic result, used when the suite
    /// itself could not produce a verdict.
    pub fn aborted(
        name: impl Into<String>,
        duration: Duration,
        details: impl Into<String>,
    ) -> Self {
        Self {
            passed: false,
            results: vec![TestCaseResult {
                name: name.into(),
                status: TestStatus::Failed,
                duration,
                details: details.into(),
            }],
        }
    }

    /// Number of results with the provided status.
    pub fn count(&self, status: TestStatus) -> usize {
        self.results
            .iter()
            .filter(|result| result.status == status)
            .count()
    }
}

/// Post-deployment verification suite consumed by the coordinator.
#[async_trait]
pub trait TestHarness: Send + Sync {
    /// Run the whole suite once.
    async fn run_suite(&self) -> anyhow::Result<TestReport>;
}
