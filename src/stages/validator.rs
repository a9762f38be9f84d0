//! Self-healing validation loop.
//!
//! ```text
//! RUNNING --pass--> PASSED
//!    |
//!    +--fail, attempts left--> FIXING --report--> RUNNING (attempt + 1)
//!    |                            |
//!    |                            +--unfixable--> EXHAUSTED
//!    +--fail, budget spent--> EXHAUSTED
//! ```
//!
//! The fix step's effect is a file rewritten by the agent, so the source is
//! always re-read from disk before the next run.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::StageOutput;
use crate::agent::{dispatch_retrying, AgentRequest, AutomationAgent, ToolScope};
use crate::artifacts::Stage;
use crate::error::ValidatorError;
use crate::extract::extract;
use crate::model::{FixOutcome, FixReport, ValidationResult};
use crate::runner::{TestRunOutcome, TestRunner};

/// Failure output kept in a fix prompt.
pub const FIX_PROMPT_OUTPUT_CHARS: usize = 8_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorState {
    Running,
    Passed,
    Fixing,
    Exhausted,
}

impl ValidatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidatorState::Running => "RUNNING",
            ValidatorState::Passed => "PASSED",
            ValidatorState::Fixing => "FIXING",
            ValidatorState::Exhausted => "EXHAUSTED",
        }
    }
}

impl fmt::Display for ValidatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pass through RUNNING, and FIXING when it followed.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub passed: bool,
    pub output: String,
    pub fix_reply: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ValidationRun {
    pub result: ValidationResult,
    pub final_state: ValidatorState,
    pub attempts: Vec<AttemptRecord>,
}

pub struct Validator {
    agent: Arc<dyn AutomationAgent>,
    runner: Arc<dyn TestRunner>,
    fix_timeout: Duration,
    benign_retry_limit: u32,
}

impl Validator {
    pub fn new(
        agent: Arc<dyn AutomationAgent>,
        runner: Arc<dyn TestRunner>,
        fix_timeout: Duration,
        benign_retry_limit: u32,
    ) -> Self {
        Self {
            agent,
            runner,
            fix_timeout,
            benign_retry_limit,
        }
    }

    pub fn build_fix_prompt(test_file: &Path, code: &str, output: &str) -> String {
        format!(
            r#"The Playwright test at {path} is failing. Fix it.

CURRENT CODE:
```typescript
{code}
```

ERROR OUTPUT:
```
{output}
```

STEPS:
1. Analyze the failure
2. Optionally reproduce it with the browser tools
3. Rewrite {path} in place with the fix

COMMON FIXES:
- strict mode violation: narrow the locator or use .first()
- element not found: use a role or label locator matching the page
- timeout: wait for the element state before acting
- multiple elements: add a filter or an exact name

When done, output ONLY this JSON inside a ```json code block:
```json
{{"status": "fixed", "originalError": "...", "fixApplied": "...", "codeChanges": "..."}}
```
or, if you cannot fix it:
```json
{{"status": "failed", "originalError": "...", "remainingIssues": ["..."]}}
```
"#,
            path = test_file.display(),
            code = code,
            output = tail(output, FIX_PROMPT_OUTPUT_CHARS),
        )
    }

    /// Run the test file, asking the agent for in-place fixes between
    /// failing attempts, until it passes or `max_attempts` runs are spent.
    ///
    /// `initial_failure` is a failing run already observed for the current
    /// file contents; it is counted as attempt 1 and the loop starts in
    /// FIXING.
    pub async fn validate_and_fix(
        &self,
        test_file: &Path,
        max_attempts: u32,
        initial_failure: Option<TestRunOutcome>,
    ) -> Result<StageOutput<ValidationRun>, ValidatorError> {
        let max_attempts = max_attempts.max(1);
        let label = test_file.to_string_lossy().into_owned();
        let mut code = read_source(test_file)?;

        let mut current = 1;
        let mut state = ValidatorState::Running;
        let mut records = Vec::new();
        let mut outcome = match initial_failure {
            Some(outcome) => outcome,
            None => self.runner.run_test(test_file).await,
        };

        let result = loop {
            let passed = outcome.passed();
            records.push(AttemptRecord {
                attempt: current,
                passed,
                output: outcome.output.clone(),
                fix_reply: None,
            });

            if passed {
                state = ValidatorState::Passed;
                break ValidationResult::passed(&label, current);
            }
            if current >= max_attempts {
                state = ValidatorState::Exhausted;
                break ValidationResult::exhausted(&label, current, &outcome.output);
            }

            state = transition(state, ValidatorState::Fixing, current);
            let (reply, fix) = self.request_fix(test_file, &code, &outcome).await;
            if let Some(record) = records.last_mut() {
                record.fix_reply = reply;
            }

            match fix {
                Some(FixOutcome::Fixed(details)) => {
                    info!(attempt = current, fix = %details, "agent reports test fixed");
                }
                Some(FixOutcome::Unfixable(issues)) => {
                    state = ValidatorState::Exhausted;
                    break ValidationResult::unfixable(&label, current, issues, &outcome.output);
                }
                None => {
                    warn!(attempt = current, "no usable fix report; counting attempt as failed");
                }
            }

            let reloaded = read_source(test_file)?;
            if reloaded == code {
                warn!(test_file = %label, attempt = current, "test file unchanged after fix request");
            }
            code = reloaded;
            current += 1;

            state = transition(state, ValidatorState::Running, current);
            outcome = self.runner.run_test(test_file).await;
        };

        info!(
            state = state.as_str(),
            attempts = result.attempts,
            test_file = %label,
            "validation finished"
        );

        let transcript = records
            .iter()
            .filter_map(|r| r.fix_reply.as_deref())
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(StageOutput {
            record: ValidationRun {
                result,
                final_state: state,
                attempts: records,
            },
            transcript,
        })
    }

    /// Dispatch a fix request. Dispatch and extraction failures yield no
    /// outcome rather than an error.
    async fn request_fix(
        &self,
        test_file: &Path,
        code: &str,
        outcome: &TestRunOutcome,
    ) -> (Option<String>, Option<FixOutcome>) {
        let prompt = Self::build_fix_prompt(test_file, code, &outcome.output);
        let request = AgentRequest::new(Stage::Validate, prompt, ToolScope::Full).with_timeout(self.fix_timeout);

        let reply = match dispatch_retrying(self.agent.as_ref(), &request, self.benign_retry_limit).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error_kind = err.kind(), "fix request failed");
                return (None, None);
            }
        };

        let fix = match extract(&reply).map(FixReport::from_value) {
            Ok(Ok(report)) => report.outcome(),
            Ok(Err(err)) => {
                warn!(error = %err, "fix report does not match its schema");
                None
            }
            Err(err) => {
                warn!(error = %err, "no fix report in agent reply");
                None
            }
        };
        (Some(reply), fix)
    }
}

fn transition(from: ValidatorState, to: ValidatorState, attempt: u32) -> ValidatorState {
    debug!(from = from.as_str(), to = to.as_str(), attempt, "validator transition");
    to
}

fn read_source(test_file: &Path) -> Result<String, ValidatorError> {
    if !test_file.exists() {
        return Err(ValidatorError::MissingTestFile(PathBuf::from(test_file)));
    }
    fs::read_to_string(test_file).map_err(|source| ValidatorError::Read {
        path: test_file.to_path_buf(),
        source,
    })
}

/// Last `max_chars` characters of `text`.
fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    match text.char_indices().nth(count - max_chars) {
        Some((index, _)) => &text[index..],
        None => text,
    }
}
