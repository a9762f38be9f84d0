use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{TestRunOutcome, TestRunner};

/// A recorded invocation: the file run and its contents at that moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedInvocation {
    pub test_file: PathBuf,
    pub contents: Option<String>,
}

/// Runner that returns queued outcomes in order and records what it ran.
/// When the queue is empty every run fails.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    outcomes: Mutex<VecDeque<TestRunOutcome>>,
    invocations: Mutex<Vec<ScriptedInvocation>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcome(self, outcome: TestRunOutcome) -> Self {
        self.outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(outcome);
        self
    }

    pub fn pass(self) -> Self {
        self.outcome(TestRunOutcome::completed(Some(0), "  1 passed (1.2s)\n"))
    }

    pub fn fail(self, output: impl Into<String>) -> Self {
        self.outcome(TestRunOutcome::completed(Some(1), output))
    }

    pub fn invocations(&self) -> Vec<ScriptedInvocation> {
        self.invocations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl TestRunner for ScriptedRunner {
    async fn run_test(&self, test_file: &Path) -> TestRunOutcome {
        self.invocations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(ScriptedInvocation {
                test_file: test_file.to_path_buf(),
                contents: std::fs::read_to_string(test_file).ok(),
            });

        self.outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .unwrap_or_else(|| TestRunOutcome::completed(Some(1), "no scripted outcome queued"))
    }
}
