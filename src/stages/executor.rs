use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde_json::Value;
use tracing::{debug, info, warn};

use super::StageOutput;
use crate::agent::{dispatch_retrying, AgentRequest, AutomationAgent, ToolScope};
use crate::artifacts::Stage;
use crate::error::ExecutionError;
use crate::extract::extract;
use crate::model::{ExecutionTrace, Plan};
use crate::runner::{TestRunOutcome, TestRunner};
use crate::secrets::{SecretMap, SecretSubstitutor};

const EXECUTE_PROMPT: &str = r#"Execute this test plan using the browser automation tools.

RULES:
1. Execute the steps in order, one tool call per step where possible
2. Do NOT use browser_snapshot; act on the elements the step names
3. For every interaction, record the EXACT selector you used and its selectorType (role, text, label, placeholder, css)
4. Keep "details" under 10 words and leave every snapshot field null
5. Save screenshots into the current working directory
6. Keep the whole response under 50KB

Output ONLY this JSON inside a ```json code block:
```json
{
  "testName": "...",
  "startTime": "ISO-8601 timestamp",
  "endTime": "ISO-8601 timestamp",
  "duration": 12.5,
  "steps": [
    {
      "stepNumber": 1,
      "action": "click",
      "target": "Login button",
      "selector": "page.getByRole('button', { name: 'Login' })",
      "selectorType": "role",
      "result": "success",
      "error": null,
      "screenshot": null,
      "timestamp": "ISO-8601 timestamp",
      "details": "Clicked login"
    }
  ],
  "finalState": "passed",
  "summary": "One sentence",
  "successCount": 1,
  "failureCount": 0
}
```

"result" is "success" or "failed"; "finalState" is "passed" only if every step succeeded.

PLAN:
"#;

/// A scrubbed trace plus the run-scoped map needed to scrub anything else
/// derived from the resolved plan.
#[derive(Debug, Clone)]
pub struct Executed {
    pub trace: ExecutionTrace,
    pub secrets: SecretMap,
    /// Placeholders that had no value in the secret source.
    pub missing: Vec<String>,
}

/// A plan with its placeholders resolved into the execute prompt. The secret
/// map is available to callers before anything is dispatched.
#[derive(Debug, Clone)]
pub struct ResolvedPlan {
    pub prompt: String,
    pub secrets: SecretMap,
    pub missing: Vec<String>,
}

/// Result of running existing code as-is before any agent work.
#[derive(Debug, Clone)]
pub struct ReuseVerdict {
    pub test_file: PathBuf,
    pub code: String,
    pub outcome: TestRunOutcome,
}

impl ReuseVerdict {
    pub fn passed(&self) -> bool {
        self.outcome.passed()
    }
}

/// Carries out a plan in a real browser through the agent.
pub struct Executor {
    agent: Arc<dyn AutomationAgent>,
    runner: Arc<dyn TestRunner>,
    secrets: SecretSubstitutor,
    timeout: Duration,
    benign_retry_limit: u32,
}

impl Executor {
    pub fn new(
        agent: Arc<dyn AutomationAgent>,
        runner: Arc<dyn TestRunner>,
        secrets: SecretSubstitutor,
        timeout: Duration,
        benign_retry_limit: u32,
    ) -> Self {
        Self {
            agent,
            runner,
            secrets,
            timeout,
            benign_retry_limit,
        }
    }

    pub fn build_prompt(resolved_plan: &Value) -> Result<String, serde_json::Error> {
        let mut prompt = String::from(EXECUTE_PROMPT);
        prompt.push_str(&serde_json::to_string_pretty(resolved_plan)?);
        prompt.push('\n');
        Ok(prompt)
    }

    /// Resolve `plan` into the prompt for [`Executor::dispatch`].
    pub fn resolve(&self, plan: &Plan) -> Result<ResolvedPlan, ExecutionError> {
        let resolution = self.secrets.resolve_plan(plan)?;
        Ok(ResolvedPlan {
            prompt: Self::build_prompt(&resolution.resolved)?,
            secrets: resolution.secrets,
            missing: resolution.missing,
        })
    }

    /// Execute `plan`. Placeholders are resolved only inside the prompt; the
    /// reply is scrubbed before parsing so the returned trace and transcript
    /// carry placeholders, never values.
    pub async fn execute(&self, plan: &Plan) -> Result<StageOutput<Executed>, ExecutionError> {
        let resolved = self.resolve(plan)?;
        self.dispatch(plan, resolved).await
    }

    /// Send an already resolved plan to the agent. Errors are scrubbed with
    /// the plan's secret map.
    pub async fn dispatch(
        &self,
        plan: &Plan,
        resolved: ResolvedPlan,
    ) -> Result<StageOutput<Executed>, ExecutionError> {
        let ResolvedPlan {
            prompt,
            secrets,
            missing,
        } = resolved;
        info!(
            test_name = %plan.test_name,
            steps = plan.steps.len(),
            secrets = secrets.len(),
            "executing plan"
        );

        let request = AgentRequest::new(Stage::Execute, prompt, ToolScope::Full).with_timeout(self.timeout);
        let reply = dispatch_retrying(self.agent.as_ref(), &request, self.benign_retry_limit)
            .await
            .map_err(|err| err.scrubbed(&secrets))?;

        let transcript = secrets.scrub_str(&reply);
        let value = secrets.scrub_value(extract(&transcript)?);
        let mut trace = ExecutionTrace::from_value(value)?;

        if trace.test_name.trim().is_empty() {
            trace.test_name = plan.test_name.clone();
        }
        if let Some((declared, actual)) = trace.count_mismatch() {
            warn!(declared, actual, "trace step counts disagree with step results");
        }

        Ok(StageOutput {
            record: Executed {
                trace,
                secrets,
                missing,
            },
            transcript,
        })
    }

    /// Run code that already exists, without involving the agent.
    pub async fn try_existing(&self, test_file: &Path) -> Result<ReuseVerdict, ExecutionError> {
        let code = fs::read_to_string(test_file)
            .map_err(|_| ExecutionError::MissingCode(test_file.to_path_buf()))?;

        info!(test_file = %test_file.display(), "trying existing code");
        let outcome = self.runner.run_test(test_file).await;
        debug!(passed = outcome.passed(), exit_code = ?outcome.exit_code, "existing code run finished");

        Ok(ReuseVerdict {
            test_file: test_file.to_path_buf(),
            code,
            outcome,
        })
    }
}

/// Move `*.png` files modified at or after `since` from `source_dir` into
/// `dest`. Failures are logged and skipped.
pub fn collect_screenshots(source_dir: &Path, since: SystemTime, dest: &Path) -> Vec<PathBuf> {
    let pattern = source_dir.join("*.png");
    let Some(pattern) = pattern.to_str() else {
        return Vec::new();
    };
    let Ok(paths) = glob::glob(pattern) else {
        return Vec::new();
    };

    let fresh: Vec<PathBuf> = paths
        .filter_map(Result::ok)
        .filter(|path| {
            fs::metadata(path)
                .and_then(|m| m.modified())
                .map(|modified| modified >= since)
                .unwrap_or(false)
        })
        .collect();
    if fresh.is_empty() {
        return Vec::new();
    }

    if let Err(err) = fs::create_dir_all(dest) {
        warn!(dir = %dest.display(), error = %err, "cannot create screenshots directory");
        return Vec::new();
    }

    let mut moved = Vec::new();
    for path in fresh {
        let Some(name) = path.file_name() else { continue };
        let target = dest.join(name);
        let result = fs::rename(&path, &target).or_else(|_| {
            fs::copy(&path, &target)?;
            fs::remove_file(&path)
        });
        match result {
            Ok(()) => moved.push(target),
            Err(err) => warn!(file = %path.display(), error = %err, "failed to collect screenshot"),
        }
    }
    moved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ScriptedAgent;
    use crate::model::FinalState;
    use crate::runner::ScriptedRunner;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn plan() -> Plan {
        Plan::from_value(serde_json::json!({
            "testName": "Login",
            "baseUrl": "https://example.com",
            "steps": [
                {"stepNumber": 1, "action": "navigate", "target": "https://example.com/login", "description": "Open"},
                {"stepNumber": 2, "action": "fill", "target": "Password field", "value": "{{PASSWORD}}", "description": "Type"}
            ]
        }))
        .unwrap()
    }

    fn secrets() -> SecretSubstitutor {
        let mut map = HashMap::new();
        map.insert("PASSWORD".to_string(), "secret123".to_string());
        SecretSubstitutor::new(Arc::new(map))
    }

    fn executor(agent: Arc<ScriptedAgent>, runner: Arc<ScriptedRunner>) -> Executor {
        Executor::new(agent, runner, secrets(), Duration::from_secs(5), 0)
    }

    const ECHOING_REPLY: &str = "```json\n{\"testName\": \"Login\", \"steps\": [{\"stepNumber\": 1, \"action\": \"navigate\", \"result\": \"success\"}, {\"stepNumber\": 2, \"action\": \"fill\", \"selector\": \"page.getByLabel('Password')\", \"result\": \"success\", \"details\": \"Typed secret123\"}], \"finalState\": \"passed\", \"successCount\": 2, \"failureCount\": 0}\n```";

    #[tokio::test]
    async fn test_prompt_has_resolved_values_but_trace_does_not() {
        let agent = Arc::new(ScriptedAgent::new().reply(ECHOING_REPLY));
        let executor = executor(agent.clone(), Arc::new(ScriptedRunner::new()));

        let output = executor.execute(&plan()).await.unwrap();

        let requests = agent.requests();
        assert!(requests[0].prompt.contains("secret123"));
        assert_eq!(requests[0].scope, ToolScope::Full);

        let persisted = serde_json::to_string(&output.record.trace).unwrap();
        assert!(!persisted.contains("secret123"));
        assert!(persisted.contains("{{PASSWORD}}"));
        assert!(!output.transcript.contains("secret123"));
        assert_eq!(output.record.trace.final_state, FinalState::Passed);
        assert_eq!(output.record.secrets.len(), 1);
        assert!(output.record.missing.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_error_is_scrubbed_with_resolved_map() {
        let agent = Arc::new(ScriptedAgent::new().fail(crate::error::AgentError::Exited {
            code: Some(1),
            stderr: "I typed secret123 into the password field".to_string(),
        }));
        let executor = executor(agent, Arc::new(ScriptedRunner::new()));

        let resolved = executor.resolve(&plan()).unwrap();
        assert!(resolved.prompt.contains("secret123"));
        assert_eq!(resolved.secrets.len(), 1);

        let err = executor.dispatch(&plan(), resolved).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Agent(_)));
        let message = err.to_string();
        assert!(!message.contains("secret123"));
        assert!(message.contains("I typed {{PASSWORD}}"));
    }

    #[tokio::test]
    async fn test_missing_test_name_comes_from_plan() {
        let agent = Arc::new(ScriptedAgent::new().reply(
            "```json\n{\"steps\": [{\"stepNumber\": 1, \"result\": \"failed\", \"error\": \"timeout\"}], \"finalState\": \"failed\"}\n```",
        ));
        let output = executor(agent, Arc::new(ScriptedRunner::new()))
            .execute(&plan())
            .await
            .unwrap();
        assert_eq!(output.record.trace.test_name, "Login");
        assert_eq!(output.record.trace.final_state, FinalState::Failed);
    }

    #[tokio::test]
    async fn test_inconsistent_trace_is_schema_error() {
        let agent = Arc::new(ScriptedAgent::new().reply(
            "```json\n{\"steps\": [{\"stepNumber\": 1, \"result\": \"failed\"}], \"finalState\": \"passed\"}\n```",
        ));
        let err = executor(agent, Arc::new(ScriptedRunner::new()))
            .execute(&plan())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Schema(_)));
    }

    #[tokio::test]
    async fn test_try_existing_reports_runner_verdict() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("login.spec.ts");
        fs::write(&file, "test('x', async () => {});").unwrap();

        let runner = Arc::new(ScriptedRunner::new().pass().fail("1 failed"));
        let executor = executor(Arc::new(ScriptedAgent::new()), runner.clone());

        let verdict = executor.try_existing(&file).await.unwrap();
        assert!(verdict.passed());
        assert_eq!(verdict.code, "test('x', async () => {});");

        let verdict = executor.try_existing(&file).await.unwrap();
        assert!(!verdict.passed());
        assert_eq!(runner.invocations().len(), 2);
    }

    #[tokio::test]
    async fn test_try_existing_missing_file() {
        let executor = executor(Arc::new(ScriptedAgent::new()), Arc::new(ScriptedRunner::new()));
        let err = executor
            .try_existing(Path::new("/nonexistent/login.spec.ts"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::MissingCode(_)));
    }

    #[test]
    fn test_collect_screenshots_moves_fresh_pngs() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let since = SystemTime::now() - Duration::from_secs(60);
        fs::write(source.path().join("step-1.png"), b"png").unwrap();
        fs::write(source.path().join("notes.txt"), b"text").unwrap();

        let moved = collect_screenshots(source.path(), since, &dest.path().join("shots"));
        assert_eq!(moved.len(), 1);
        assert!(dest.path().join("shots/step-1.png").exists());
        assert!(!source.path().join("step-1.png").exists());
        assert!(source.path().join("notes.txt").exists());
    }

    #[test]
    fn test_collect_screenshots_ignores_older_files() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(source.path().join("old.png"), b"png").unwrap();
        let since = SystemTime::now() + Duration::from_secs(3600);

        assert!(collect_screenshots(source.path(), since, dest.path()).is_empty());
        assert!(source.path().join("old.png").exists());
    }
}
