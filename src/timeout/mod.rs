//! Per-stage timeout configuration.
//!
//! Agent dispatches are bounded per stage; the generated test run is bounded
//! separately since it feeds the healing loop rather than failing the run.

use std::time::Duration;

use crate::artifacts::Stage;

/// Wall-clock limits for each external call the pipeline makes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Planner dispatch.
    /// Default: 300 seconds (5 minutes)
    pub plan_timeout: Duration,

    /// Executor dispatch, which drives a real browser.
    /// Default: 900 seconds (15 minutes)
    pub execute_timeout: Duration,

    /// Exporter dispatch.
    /// Default: 300 seconds (5 minutes)
    pub export_timeout: Duration,

    /// One fix request inside the healing loop.
    /// Default: 600 seconds (10 minutes)
    pub fix_timeout: Duration,

    /// One run of the generated test.
    /// Default: 60 seconds
    pub test_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            plan_timeout: Duration::from_secs(300),
            execute_timeout: Duration::from_secs(900),
            export_timeout: Duration::from_secs(300),
            fix_timeout: Duration::from_secs(600),
            test_timeout: Duration::from_secs(60),
        }
    }
}

impl TimeoutConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan_timeout(mut self, timeout: Duration) -> Self {
        self.plan_timeout = timeout;
        self
    }

    pub fn with_execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout = timeout;
        self
    }

    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = timeout;
        self
    }

    /// Sets the limit for each fix request in the healing loop.
    pub fn with_fix_timeout(mut self, timeout: Duration) -> Self {
        self.fix_timeout = timeout;
        self
    }

    /// Sets the limit for each generated-test run. A run exceeding it counts
    /// as a failed attempt.
    pub fn with_test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout = timeout;
        self
    }

    /// Agent dispatch limit for `stage`. Reuse and validation dispatch fix
    /// requests; their test runs use [`TimeoutConfig::test_timeout`].
    pub fn agent_timeout(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Plan => self.plan_timeout,
            Stage::Execute => self.execute_timeout,
            Stage::Export => self.export_timeout,
            Stage::Reuse | Stage::Validate => self.fix_timeout,
        }
    }
}
