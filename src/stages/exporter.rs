use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::StageOutput;
use crate::agent::{dispatch_retrying, AgentRequest, AutomationAgent, ToolScope};
use crate::artifacts::Stage;
use crate::error::ExportError;
use crate::extract::extract;
use crate::model::{ExecutionTrace, ExportResult};

const EXPORT_PROMPT: &str = r#"Convert this execution trace into a Playwright TypeScript test.

REQUIREMENTS:
1. If a step in the execution trace has a "selector" field, USE IT EXACTLY as written
2. Otherwise prefer role-based locators (getByRole, getByLabel, getByText)
3. Wrap each step in test.step() with the step description
4. Keep {{VAR_NAME}} placeholders as process.env.VAR_NAME reads; never inline values
5. Import from '@playwright/test' only

Output ONLY this JSON inside a ```json code block:
```json
{
  "testFilePath": "tests/generated/test-name.spec.ts",
  "code": "import { test, expect } from '@playwright/test';\n...",
  "dependencies": ["@playwright/test"],
  "notes": ["Any notes about the generated test"]
}
```

EXECUTION TRACE:
"#;

/// The exporter's result with its path normalised, and where the code landed.
#[derive(Debug, Clone)]
pub struct Exported {
    pub result: ExportResult,
    pub written_to: PathBuf,
}

/// Turns a trace into runnable test source and writes it to disk.
pub struct Exporter {
    agent: Arc<dyn AutomationAgent>,
    project_root: PathBuf,
    tests_dir: PathBuf,
    timeout: Duration,
    benign_retry_limit: u32,
}

impl Exporter {
    pub fn new(
        agent: Arc<dyn AutomationAgent>,
        project_root: impl Into<PathBuf>,
        tests_dir: impl Into<PathBuf>,
        timeout: Duration,
        benign_retry_limit: u32,
    ) -> Self {
        Self {
            agent,
            project_root: project_root.into(),
            tests_dir: tests_dir.into(),
            timeout,
            benign_retry_limit,
        }
    }

    pub fn build_prompt(trace: &ExecutionTrace) -> Result<String, serde_json::Error> {
        let mut prompt = String::from(EXPORT_PROMPT);
        prompt.push_str(&serde_json::to_string_pretty(trace)?);
        prompt.push('\n');
        Ok(prompt)
    }

    /// Export regardless of the trace's `finalState`: a failed trace still
    /// records selectors worth keeping, and the validator heals the rest.
    pub async fn export(&self, trace: &ExecutionTrace) -> Result<StageOutput<Exported>, ExportError> {
        let request = AgentRequest::new(Stage::Export, Self::build_prompt(trace)?, ToolScope::ReadOnly)
            .with_timeout(self.timeout);
        let reply = dispatch_retrying(self.agent.as_ref(), &request, self.benign_retry_limit).await?;

        let mut result = ExportResult::from_value(extract(&reply)?)?;
        let relative = normalize_test_path(&result.test_file_path, &self.tests_dir);
        result.test_file_path = relative.to_string_lossy().into_owned();

        let written_to = self.project_root.join(&relative);
        if let Some(parent) = written_to.parent() {
            fs::create_dir_all(parent).map_err(|source| ExportError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&written_to, &result.code).map_err(|source| ExportError::Write {
            path: written_to.clone(),
            source,
        })?;
        info!(test_file = %written_to.display(), bytes = result.code.len(), "test code written");

        Ok(StageOutput {
            record: Exported { result, written_to },
            transcript: reply,
        })
    }
}

/// Keep paths already under `tests_dir` or absolute; place anything else
/// under `tests_dir`.
pub fn normalize_test_path(raw: &str, tests_dir: &Path) -> PathBuf {
    let path = Path::new(raw.trim());
    let path = path.strip_prefix("./").unwrap_or(path);
    let tests_dir = tests_dir.strip_prefix("./").unwrap_or(tests_dir);

    if path.is_absolute() || path.starts_with(tests_dir) {
        return path.to_path_buf();
    }
    tests_dir.join(path)
}
