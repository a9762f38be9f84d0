//! End-to-end pipeline scenarios driven by the scripted agent and runner.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::io;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tempfile::TempDir;

use testsmith::agent::{ScriptedAgent, ToolScope};
use testsmith::artifacts::{Artifact, LifecycleEventType, RunArtifactSet, RunStatus, Stage};
use testsmith::config::PipelineConfig;
use testsmith::error::AgentError;
use testsmith::pipeline::{ExistingCode, PipelineCoordinator, PipelineRuntime, RunOptions, RunScheduler};
use testsmith::runner::ScriptedRunner;
use testsmith::secrets::SecretSubstitutor;

const SPEC: &str = "# Test: Login\n\n1. Open https://example.com/login\n2. Type the password {{PASSWORD}}\n3. Check the dashboard is visible\n";

const PLAN_REPLY: &str = r#"Here is the plan:
```json
{
  "testName": "Login",
  "description": "Log in and see the dashboard",
  "baseUrl": "https://example.com",
  "steps": [
    {"stepNumber": 1, "action": "navigate", "target": "https://example.com/login", "description": "Open login"},
    {"stepNumber": 2, "action": "fill", "target": "Password field", "value": "{{PASSWORD}}", "description": "Type password"},
    {"stepNumber": 3, "action": "assert", "target": "Dashboard", "assertion": {"type": "visible", "expected": true}, "description": "Dashboard visible"}
  ]
}
```"#;

const TRACE_REPLY: &str = r#"All steps executed.
```json
{
  "testName": "Login",
  "startTime": "2025-01-02T12:00:00Z",
  "endTime": "2025-01-02T12:00:09Z",
  "duration": 9.1,
  "steps": [
    {"stepNumber": 1, "action": "navigate", "target": "https://example.com/login", "selector": null, "selectorType": null, "result": "success", "error": null, "screenshot": null, "timestamp": "2025-01-02T12:00:01Z", "details": "Opened login page"},
    {"stepNumber": 2, "action": "fill", "target": "Password field", "selector": "page.getByLabel('Password')", "selectorType": "label", "result": "success", "error": null, "screenshot": null, "timestamp": "2025-01-02T12:00:04Z", "details": "Typed secret123"},
    {"stepNumber": 3, "action": "assert", "target": "Dashboard", "selector": "page.getByRole('heading', { name: 'Dashboard' })", "selectorType": "role", "result": "success", "error": null, "screenshot": null, "timestamp": "2025-01-02T12:00:08Z", "details": "Dashboard visible"}
  ],
  "finalState": "passed",
  "summary": "Logged in with secret123",
  "successCount": 3,
  "failureCount": 0
}
```"#;

/// Execution reply cut off right after the success counter.
const TRUNCATED_TRACE_REPLY: &str = r#"```json
{"testName": "Login", "steps": [
  {"stepNumber": 1, "action": "navigate", "result": "success"},
  {"stepNumber": 2, "action": "fill", "result": "success"},
  {"stepNumber": 3, "action": "assert", "result": "success"}
], "finalState": "passed", "successCount": 3"#;

const EXPORT_REPLY: &str = r#"```json
{
  "testFilePath": "tests/generated/login.spec.ts",
  "code": "import { test, expect } from '@playwright/test';\n\ntest('login', async ({ page }) => {\n  await page.goto('https://example.com/login');\n  await page.getByLabel('Password').fill(process.env.PASSWORD ?? '');\n  await expect(page.getByRole('heading', { name: 'Dashboard' })).toBeVisible();\n});\n",
  "dependencies": ["@playwright/test"],
  "notes": ["Selectors taken from the trace"]
}
```"#;

const FIXED_REPLY: &str = r#"```json
{"status": "fixed", "originalError": "Timeout 30000ms exceeded", "fixApplied": "Wait for the heading before asserting"}
```"#;

struct Harness {
    root: TempDir,
    spec_path: PathBuf,
}

impl Harness {
    fn new() -> Self {
        let root = TempDir::new().expect("Failed to create temp dir");
        let spec_path = root.path().join("specs").join("login.md");
        fs::create_dir_all(spec_path.parent().unwrap()).unwrap();
        fs::write(&spec_path, SPEC).unwrap();
        Self { root, spec_path }
    }

    fn config(&self) -> PipelineConfig {
        PipelineConfig {
            runs_dir: self.root.path().join("runs"),
            project_root: self.root.path().to_path_buf(),
            ..PipelineConfig::default()
        }
    }

    fn coordinator(&self, agent: &Arc<ScriptedAgent>, runner: &Arc<ScriptedRunner>) -> PipelineCoordinator {
        self.coordinator_with(self.config(), agent, runner)
    }

    fn coordinator_with(
        &self,
        config: PipelineConfig,
        agent: &Arc<ScriptedAgent>,
        runner: &Arc<ScriptedRunner>,
    ) -> PipelineCoordinator {
        let mut env = HashMap::new();
        env.insert("PASSWORD".to_string(), "secret123".to_string());
        let runtime = PipelineRuntime::new(
            config,
            agent.clone(),
            runner.clone(),
            SecretSubstitutor::new(Arc::new(env)),
        )
        .expect("Failed to build runtime");
        PipelineCoordinator::new(Arc::new(runtime))
    }

    fn test_file(&self) -> PathBuf {
        self.root.path().join("tests/generated/login.spec.ts")
    }

    fn write_existing_code(&self, code: &str) -> PathBuf {
        let path = self.test_file();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, code).unwrap();
        path
    }
}

fn open(coordinator: &PipelineCoordinator, run_id: &str) -> RunArtifactSet {
    coordinator.runtime().store.open_run(run_id).expect("Failed to open run")
}

fn read_value(run: &RunArtifactSet, artifact: Artifact) -> Value {
    run.read_json(artifact)
        .expect("Failed to read artifact")
        .expect("Artifact missing")
}

fn event_types(run: &RunArtifactSet) -> Vec<(LifecycleEventType, Option<Stage>)> {
    run.events()
        .unwrap()
        .into_iter()
        .map(|e| (e.event_type, e.stage))
        .collect()
}

/// A clean run: plan, execute with a resolved secret, export, validate on
/// the first attempt. Every artifact lands and no secret value is persisted.
#[tokio::test]
async fn test_full_pipeline_passes_and_keeps_secrets_out_of_artifacts() {
    let harness = Harness::new();
    let agent = Arc::new(
        ScriptedAgent::new()
            .reply(PLAN_REPLY)
            .reply(TRACE_REPLY)
            .reply(EXPORT_REPLY),
    );
    let runner = Arc::new(ScriptedRunner::new().pass());
    let coordinator = harness.coordinator(&agent, &runner);

    let report = coordinator
        .run(&harness.spec_path, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Passed);
    assert!(report.failure.is_none());
    let validation = report.validation.as_ref().unwrap();
    assert!(validation.is_success());
    assert_eq!(validation.attempts, 1);

    let run = open(&coordinator, &report.run_id);
    assert_eq!(run.status().unwrap(), RunStatus::Passed);
    assert_eq!(run.read_text(Artifact::Spec).unwrap().as_deref(), Some(SPEC));

    let plan = read_value(&run, Artifact::Plan);
    assert_eq!(plan["steps"].as_array().unwrap().len(), 3);
    assert_eq!(plan["specFileName"], "login.md");
    assert_eq!(plan["steps"][1]["value"], "{{PASSWORD}}");

    // The agent saw the resolved value; nothing on disk did.
    let requests = agent.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[1].scope, ToolScope::Full);
    assert!(requests[1].prompt.contains("secret123"));

    let trace = run.read_text(Artifact::Run).unwrap().unwrap();
    assert!(trace.contains("{{PASSWORD}}"));
    assert!(!trace.contains("secret123"));
    assert!(!run.read_log().unwrap().contains("secret123"));

    let export = read_value(&run, Artifact::Export);
    assert_eq!(export["testFilePath"], "tests/generated/login.spec.ts");
    assert!(export.get("code").is_none());
    assert!(export["codeBytes"].as_u64().unwrap() > 0);

    assert!(harness.test_file().exists());
    assert_eq!(runner.invocations()[0].test_file, harness.test_file());

    let events = event_types(&run);
    assert_eq!(events.first().unwrap().0, LifecycleEventType::RunStart);
    assert_eq!(events.last().unwrap().0, LifecycleEventType::RunComplete);
    for stage in [Stage::Plan, Stage::Execute, Stage::Export, Stage::Validate] {
        assert!(events.contains(&(LifecycleEventType::StageCompleted, Some(stage))));
    }

    assert_eq!(coordinator.runtime().gate.status().admitted, 2);
}

/// Collects formatted log lines for assertions.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The agent fails mid-execution with output that echoes the resolved
/// secret. The failure record, the event journal and the operator log carry
/// the placeholder instead.
#[tokio::test]
async fn test_execute_failure_keeps_secrets_out_of_failure_artifacts() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let harness = Harness::new();
    let agent = Arc::new(
        ScriptedAgent::new()
            .reply(PLAN_REPLY)
            .fail(AgentError::Transport(
                "exit cancel scope while typing secret123".to_string(),
            ))
            .fail(AgentError::Exited {
                code: Some(1),
                stderr: "error_max_turns: I typed secret123 into the password field".to_string(),
            }),
    );
    let runner = Arc::new(ScriptedRunner::new());
    let coordinator = harness.coordinator(&agent, &runner);

    let report = coordinator
        .run(&harness.spec_path, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(agent.requests().len(), 3);
    assert!(agent.requests()[1].prompt.contains("secret123"));

    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.stage, Stage::Execute);
    assert_eq!(failure.error_type, "execution");
    assert!(failure.message.contains("I typed {{PASSWORD}} into the password field"));

    let run = open(&coordinator, &report.run_id);
    for file in ["failure.json", "events.jsonl"] {
        let content = fs::read_to_string(run.dir().join(file)).unwrap();
        assert!(!content.contains("secret123"), "{file} leaked the secret");
    }
    assert!(!run.read_log().unwrap().contains("secret123"));

    let failed = run
        .events()
        .unwrap()
        .into_iter()
        .find(|e| e.event_type == LifecycleEventType::StageFailed)
        .unwrap();
    assert!(failed.error_message.unwrap().contains("{{PASSWORD}}"));

    let logged = logs.contents();
    assert!(logged.contains("run failed"));
    assert!(logged.contains("retrying dispatch"));
    assert!(!logged.contains("secret123"));
    assert!(runner.invocations().is_empty());
}

/// An execution reply truncated after `"successCount": 3` is repaired.
#[tokio::test]
async fn test_truncated_execution_reply_is_repaired() {
    let harness = Harness::new();
    let agent = Arc::new(
        ScriptedAgent::new()
            .reply(PLAN_REPLY)
            .reply(TRUNCATED_TRACE_REPLY)
            .reply(EXPORT_REPLY),
    );
    let runner = Arc::new(ScriptedRunner::new().pass());
    let coordinator = harness.coordinator(&agent, &runner);

    let report = coordinator
        .run(&harness.spec_path, RunOptions::default())
        .await
        .unwrap();

    assert!(report.passed());
    let trace = read_value(&open(&coordinator, &report.run_id), Artifact::Run);
    assert_eq!(trace["successCount"], 3);
    assert_eq!(trace["steps"].as_array().unwrap().len(), 3);
}

/// A timeout on attempt 1, a fix that rewrites the file, then a pass.
#[tokio::test]
async fn test_failing_test_is_healed_on_second_attempt() {
    let harness = Harness::new();
    let agent = Arc::new(
        ScriptedAgent::new()
            .reply(PLAN_REPLY)
            .reply(TRACE_REPLY)
            .reply(EXPORT_REPLY)
            .reply_after_writing(harness.test_file(), "// healed\n", FIXED_REPLY),
    );
    let runner = Arc::new(
        ScriptedRunner::new()
            .fail("Error: Timeout 30000ms exceeded waiting for getByRole('heading')")
            .pass(),
    );
    let coordinator = harness.coordinator(&agent, &runner);

    let report = coordinator
        .run(&harness.spec_path, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Passed);
    let validation = report.validation.unwrap();
    assert_eq!(validation.attempts, 2);

    let runs = runner.invocations();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[1].contents.as_deref(), Some("// healed\n"));
    assert_ne!(runs[0].contents, runs[1].contents);
}

/// Three failing attempts without a `fixed` report exhaust the budget.
#[tokio::test]
async fn test_validation_exhaustion_is_recorded() {
    let harness = Harness::new();
    let agent = Arc::new(
        ScriptedAgent::new()
            .reply(PLAN_REPLY)
            .reply(TRACE_REPLY)
            .reply(EXPORT_REPLY)
            .reply("I tried a few things but could not confirm a fix.")
            .reply("Still investigating the selector."),
    );
    let runner = Arc::new(
        ScriptedRunner::new()
            .fail("1 failed")
            .fail("1 failed")
            .fail("1 failed: strict mode violation"),
    );
    let coordinator = harness.coordinator(&agent, &runner);

    let report = coordinator
        .run(&harness.spec_path, RunOptions::default().with_max_attempts(3))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    let validation = report.validation.unwrap();
    assert!(!validation.is_success());
    assert_eq!(validation.attempts, 3);
    assert_eq!(validation.last_error.as_deref(), Some("1 failed: strict mode violation"));

    let failure = report.failure.unwrap();
    assert_eq!(failure.stage, Stage::Validate);
    assert_eq!(failure.error_type, "validation_exhausted");
    assert_eq!(runner.invocations().len(), 3);
}

/// A planner reply with no JSON fails the run at the plan stage and keeps a
/// preview of what the agent said.
#[tokio::test]
async fn test_unparseable_plan_fails_run_with_preview() {
    let harness = Harness::new();
    let prose = "Sorry, I cannot turn this into a plan.";
    let agent = Arc::new(ScriptedAgent::new().reply(prose));
    let runner = Arc::new(ScriptedRunner::new());
    let coordinator = harness.coordinator(&agent, &runner);

    let report = coordinator
        .run(&harness.spec_path, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    let failure = report.failure.unwrap();
    assert_eq!(failure.stage, Stage::Plan);
    assert_eq!(failure.error_type, "extraction");
    assert_eq!(failure.preview.as_deref(), Some(prose));

    let run = open(&coordinator, &report.run_id);
    assert!(run.has(Artifact::Spec));
    assert!(!run.has(Artifact::Plan));
    assert!(event_types(&run).contains(&(LifecycleEventType::StageFailed, Some(Stage::Plan))));
    assert!(runner.invocations().is_empty());
}

/// Existing code that passes as-is ends the run without any agent call.
#[tokio::test]
async fn test_reuse_shortcut_skips_regeneration() {
    let harness = Harness::new();
    harness.write_existing_code("test('login', async () => {});\n");
    let agent = Arc::new(ScriptedAgent::new());
    let runner = Arc::new(ScriptedRunner::new().pass());
    let coordinator = harness.coordinator(&agent, &runner);

    let report = coordinator
        .run(
            &harness.spec_path,
            RunOptions::default().with_existing_code(ExistingCode::Auto),
        )
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Passed);
    assert!(agent.requests().is_empty());
    assert!(report.validation.is_none());

    let run = open(&coordinator, &report.run_id);
    let trace = read_value(&run, Artifact::Run);
    assert_eq!(trace["reused"], true);
    assert_eq!(trace["finalState"], "passed");
    let export = read_value(&run, Artifact::Export);
    assert_eq!(export["reused"], true);
    let plan = read_value(&run, Artifact::Plan);
    assert_eq!(plan["steps"].as_array().unwrap().len(), 0);
    assert_eq!(plan["testName"], "Login");

    let summary = coordinator.runtime().store.summary(&report.run_id).unwrap();
    assert!(summary.reused);
    assert_eq!(summary.test_name.as_deref(), Some("Login"));
}

/// Failing existing code goes straight to the healing loop; the observed
/// failure is attempt 1.
#[tokio::test]
async fn test_reuse_failure_is_healed_without_regeneration() {
    let harness = Harness::new();
    let existing = harness.write_existing_code("// stale selectors\n");
    let agent = Arc::new(ScriptedAgent::new().reply_after_writing(&existing, "// fixed selectors\n", FIXED_REPLY));
    let runner = Arc::new(ScriptedRunner::new().fail("1 failed").pass());
    let coordinator = harness.coordinator(&agent, &runner);

    let report = coordinator
        .run(
            &harness.spec_path,
            RunOptions::default().with_existing_code(ExistingCode::Path(existing.clone())),
        )
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Passed);
    assert_eq!(report.validation.as_ref().unwrap().attempts, 2);

    let requests = agent.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].stage, Stage::Validate);
    assert!(requests[0].prompt.contains("// stale selectors"));

    let run = open(&coordinator, &report.run_id);
    assert!(!run.has(Artifact::Run));
    let events = event_types(&run);
    assert!(events.contains(&(LifecycleEventType::StageSkipped, Some(Stage::Plan))));
    assert!(events.contains(&(LifecycleEventType::StageCompleted, Some(Stage::Validate))));
}

/// An explicit path that does not exist falls back to regeneration.
#[tokio::test]
async fn test_missing_existing_code_falls_back_to_planning() {
    let harness = Harness::new();
    let agent = Arc::new(ScriptedAgent::new().reply("no plan"));
    let runner = Arc::new(ScriptedRunner::new());
    let coordinator = harness.coordinator(&agent, &runner);

    let missing = harness.root.path().join("tests/generated/absent.spec.ts");
    let report = coordinator
        .run(
            &harness.spec_path,
            RunOptions::default().with_existing_code(ExistingCode::Path(missing)),
        )
        .await
        .unwrap();

    assert_eq!(agent.requests()[0].stage, Stage::Plan);
    assert_eq!(report.failure.unwrap().stage, Stage::Plan);
}

/// A closed gate fails the run at the first heavyweight stage instead of
/// waiting forever.
#[tokio::test]
async fn test_closed_gate_fails_heavy_stage() {
    let harness = Harness::new();
    let agent = Arc::new(ScriptedAgent::new().reply(PLAN_REPLY));
    let runner = Arc::new(ScriptedRunner::new());
    let coordinator = harness.coordinator(&agent, &runner);
    coordinator.runtime().shutdown();

    let report = coordinator
        .run(&harness.spec_path, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    let failure = report.failure.unwrap();
    assert_eq!(failure.stage, Stage::Execute);
    assert_eq!(failure.error_type, "gate_closed");
    assert_eq!(agent.requests().len(), 1);
}

/// A missing specification is an error before any namespace is allocated.
#[tokio::test]
async fn test_missing_specification_is_an_error() {
    let harness = Harness::new();
    let agent = Arc::new(ScriptedAgent::new());
    let runner = Arc::new(ScriptedRunner::new());
    let coordinator = harness.coordinator(&agent, &runner);

    let result = coordinator
        .run(Path::new("/nonexistent/spec.md"), RunOptions::default())
        .await;

    assert!(result.is_err());
    assert!(coordinator.runtime().store.list_runs().unwrap().is_empty());
}

/// Submitted runs are visible immediately and complete in the background
/// within the gate's capacity.
#[tokio::test]
async fn test_scheduler_runs_in_background() {
    let harness = Harness::new();
    harness.write_existing_code("test('login', async () => {});\n");
    let second_spec = harness.root.path().join("specs").join("login_again.md");
    fs::write(&second_spec, "# Test: Login\n").unwrap();

    let agent = Arc::new(ScriptedAgent::new());
    let runner = Arc::new(ScriptedRunner::new().pass().pass());
    let config = PipelineConfig {
        heavy_stage_capacity: 1,
        ..harness.config()
    };
    let coordinator = harness.coordinator_with(config, &agent, &runner);
    let scheduler = RunScheduler::new(coordinator.clone());
    let options = RunOptions::default().with_existing_code(ExistingCode::Auto);

    let first = scheduler.submit(&harness.spec_path, options.clone()).unwrap();
    let second = scheduler.submit(&second_spec, options).unwrap();
    assert_ne!(first.run_id, second.run_id);
    assert!(first.dir.join("manifest.json").exists());
    assert!(coordinator.runtime().store.open_run(&second.run_id).is_ok());

    let reports = RunScheduler::wait_all(vec![first, second]).await;
    assert_eq!(reports.len(), 2);
    for report in reports {
        assert_eq!(report.unwrap().status, RunStatus::Passed);
    }

    let gate = coordinator.runtime().gate.status();
    assert_eq!(gate.peak, 1);
    assert_eq!(gate.admitted, 2);
    assert_eq!(coordinator.runtime().store.list_runs().unwrap().len(), 2);
}
