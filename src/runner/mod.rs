//! Test-runner boundary.
//!
//! A runner executes one generated test file as a subprocess under a
//! wall-clock limit and reports exit status plus combined output. A run that
//! times out or cannot be started is an ordinary failed outcome, never an
//! error: the self-healing loop treats it like any other failure.

mod playwright;
mod scripted;

pub use playwright::PlaywrightRunner;
pub use scripted::{ScriptedInvocation, ScriptedRunner};

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Counters from the runner's machine-readable report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    #[serde(default)]
    pub expected: u32,
    #[serde(default)]
    pub unexpected: u32,
    #[serde(default)]
    pub flaky: u32,
    #[serde(default)]
    pub skipped: u32,
}

impl RunReport {
    pub fn is_clean_pass(&self) -> bool {
        self.unexpected == 0 && self.expected + self.flaky > 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestRunOutcome {
    /// `None` when the process was not started or was killed.
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr.
    pub output: String,
    pub timed_out: bool,
    pub report: Option<RunReport>,
    pub duration: Duration,
}

impl TestRunOutcome {
    pub fn completed(exit_code: Option<i32>, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
            timed_out: false,
            report: None,
            duration: Duration::ZERO,
        }
    }

    pub fn timed_out(limit: Duration) -> Self {
        Self {
            exit_code: None,
            output: format!("Test timed out after {} seconds", limit.as_secs()),
            timed_out: true,
            report: None,
            duration: limit,
        }
    }

    pub fn with_report(mut self, report: RunReport) -> Self {
        self.report = Some(report);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Pass verdict: exit status zero and, when a report was produced, no
    /// unexpected results with at least one test run. Without a report the
    /// output must carry an `N passed` marker.
    pub fn passed(&self) -> bool {
        if self.timed_out || self.exit_code != Some(0) {
            return false;
        }
        match self.report {
            Some(report) => report.is_clean_pass(),
            None => has_passed_marker(&self.output),
        }
    }
}

static PASSED_MARKER: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\b\d+ passed\b").ok());

fn has_passed_marker(output: &str) -> bool {
    PASSED_MARKER
        .as_ref()
        .map_or(false, |re| re.is_match(output))
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run_test(&self, test_file: &Path) -> TestRunOutcome;
}
