use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{RunReport, TestRunOutcome, TestRunner};

const JSON_OUTPUT_ENV: &str = "PLAYWRIGHT_JSON_OUTPUT_NAME";

static REPORT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Deserialize)]
struct JsonReport {
    #[serde(default)]
    stats: RunReport,
}

/// Runs one test file with the Playwright test runner.
#[derive(Debug, Clone)]
pub struct PlaywrightRunner {
    command: String,
    args: Vec<String>,
    working_dir: PathBuf,
    timeout: Duration,
    json_report: bool,
}

impl PlaywrightRunner {
    pub fn new(working_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: "npx".to_string(),
            args: vec!["playwright".to_string(), "test".to_string()],
            working_dir: working_dir.into(),
            timeout,
            json_report: true,
        }
    }

    pub fn with_command(mut self, command: impl Into<String>, args: Vec<String>) -> Self {
        self.command = command.into();
        self.args = args;
        self
    }

    pub fn with_json_report(mut self, enabled: bool) -> Self {
        self.json_report = enabled;
        self
    }

    fn report_path(&self) -> PathBuf {
        let seq = REPORT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "testsmith-report-{}-{seq}.json",
            std::process::id()
        ))
    }
}

fn read_report(path: &Path) -> Option<RunReport> {
    let content = std::fs::read_to_string(path).ok()?;
    if let Err(err) = std::fs::remove_file(path) {
        debug!(path = %path.display(), error = %err, "could not remove runner report");
    }
    match serde_json::from_str::<JsonReport>(&content) {
        Ok(report) => Some(report.stats),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unreadable runner report; using output markers");
            None
        }
    }
}

#[async_trait]
impl TestRunner for PlaywrightRunner {
    async fn run_test(&self, test_file: &Path) -> TestRunOutcome {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .arg(test_file)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let report_path = self.json_report.then(|| self.report_path());
        if let Some(path) = &report_path {
            command.arg("--reporter=list,json").env(JSON_OUTPUT_ENV, path);
        }

        debug!(test_file = %test_file.display(), "running generated test");
        let started = Instant::now();

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return TestRunOutcome::completed(
                    None,
                    format!("failed to start `{}`: {err}", self.command),
                )
            }
        };

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return TestRunOutcome::completed(None, format!("test runner failed: {err}"))
                    .with_duration(started.elapsed())
            }
            Err(_) => {
                if let Some(path) = &report_path {
                    let _ = std::fs::remove_file(path);
                }
                return TestRunOutcome::timed_out(self.timeout);
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        let mut outcome = TestRunOutcome::completed(output.status.code(), combined)
            .with_duration(started.elapsed());
        if let Some(report) = report_path.as_deref().and_then(read_report) {
            outcome = outcome.with_report(report);
        }
        outcome
    }
}
