use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::Utc;
use tracing::{info, info_span, warn, Instrument};

use super::PipelineRuntime;
use crate::artifacts::{
    Artifact, FailureRecord, LifecycleEvent, LifecycleEventType, RunArtifactSet, RunStatus, Stage,
};
use crate::error::{ExecutionError, PipelineError};
use crate::model::{ExecutionTrace, ExportMetadata, FinalState, Plan, Specification, ValidationResult};
use crate::runner::TestRunOutcome;
use crate::secrets::SecretMap;
use crate::stages::{
    collect_screenshots, find_existing_code, Executor, Exporter, Planner, ValidationRun, Validator,
};

/// Where to look for previously generated code before regenerating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExistingCode {
    /// Try this file.
    Path(PathBuf),
    /// Search the tests directory for code matching the specification.
    Auto,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub existing_code: Option<ExistingCode>,
    /// Overrides the configured validation budget.
    pub max_attempts: Option<u32>,
}

impl RunOptions {
    pub fn with_existing_code(mut self, existing: ExistingCode) -> Self {
        self.existing_code = Some(existing);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Where a finished run ended up.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub dir: PathBuf,
    pub validation: Option<ValidationResult>,
    pub failure: Option<FailureRecord>,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.status == RunStatus::Passed
    }
}

/// A loaded specification with its freshly allocated namespace.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub spec: Specification,
    pub run: RunArtifactSet,
}

impl PreparedRun {
    pub fn run_id(&self) -> &str {
        self.run.run_id()
    }
}

/// A fatal stage failure and the stage it happened in.
struct StageFailure {
    stage: Stage,
    error: PipelineError,
}

fn at<E: Into<PipelineError>>(stage: Stage) -> impl FnOnce(E) -> StageFailure {
    move |error| StageFailure {
        stage,
        error: error.into(),
    }
}

/// Mutable state of one run while its stages execute.
struct RunContext {
    run: RunArtifactSet,
    /// Values resolved for this run; empty until execution.
    secrets: SecretMap,
}

impl RunContext {
    fn log(&self, stage: Stage, text: &str) {
        let scrubbed = self.secrets.scrub_str(text);
        if let Err(err) = self.run.append_log(stage, &scrubbed) {
            warn!(run_id = %self.run.run_id(), error = %err, "failed to append to run log");
        }
    }

    fn started(&self, stage: Stage) {
        info!(stage = stage.as_str(), run_id = %self.run.run_id(), "stage started");
        self.run.emit(LifecycleEvent::for_stage(
            LifecycleEventType::StageStarted,
            self.run.run_id(),
            stage,
        ));
    }

    fn completed(&self, stage: Stage, status: &str) {
        info!(stage = stage.as_str(), run_id = %self.run.run_id(), status, "stage completed");
        self.run.emit(
            LifecycleEvent::for_stage(LifecycleEventType::StageCompleted, self.run.run_id(), stage)
                .with_status(status),
        );
    }

    fn skipped(&self, stage: Stage) {
        self.run.emit(LifecycleEvent::for_stage(
            LifecycleEventType::StageSkipped,
            self.run.run_id(),
            stage,
        ));
    }
}

/// Sequences one run: Plan, Execute, Export, Validate, or the reuse
/// shortcut. Every stage's artifact is persisted before the next starts.
#[derive(Debug, Clone)]
pub struct PipelineCoordinator {
    runtime: Arc<PipelineRuntime>,
}

impl PipelineCoordinator {
    pub fn new(runtime: Arc<PipelineRuntime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &PipelineRuntime {
        &self.runtime
    }

    /// Load the specification and allocate the run's namespace (status
    /// `pending`). Fails only when neither can be done.
    pub fn prepare(&self, spec_path: &Path) -> Result<PreparedRun, PipelineError> {
        let spec = Specification::load(spec_path).map_err(|source| PipelineError::Specification {
            path: spec_path.to_path_buf(),
            source,
        })?;
        let run = self.runtime.store.create_run(spec_path)?;
        info!(run_id = %run.run_id(), spec = %spec_path.display(), "run allocated");
        Ok(PreparedRun { spec, run })
    }

    pub async fn run(&self, spec_path: &Path, options: RunOptions) -> Result<RunReport, PipelineError> {
        let prepared = self.prepare(spec_path)?;
        Ok(self.run_prepared(prepared, options).await)
    }

    /// Drive a prepared run to a terminal status. Stage failures are
    /// recorded in the artifact set, not returned.
    pub async fn run_prepared(&self, prepared: PreparedRun, options: RunOptions) -> RunReport {
        let span = info_span!("pipeline_run", run_id = %prepared.run_id());
        self.drive(prepared, options).instrument(span).await
    }

    async fn drive(&self, prepared: PreparedRun, options: RunOptions) -> RunReport {
        let PreparedRun { spec, run } = prepared;
        let mut ctx = RunContext {
            run,
            secrets: SecretMap::new(),
        };

        let status = match self.stages(&mut ctx, &spec, &options).await {
            Ok(status) => status,
            Err(failure) => {
                self.record_failure(&ctx, failure);
                RunStatus::Failed
            }
        };

        ctx.run.emit(
            LifecycleEvent::new(LifecycleEventType::RunComplete, ctx.run.run_id())
                .with_status(status.as_str()),
        );
        info!(run_id = %ctx.run.run_id(), status = status.as_str(), "run finished");

        RunReport {
            run_id: ctx.run.run_id().to_string(),
            status,
            dir: ctx.run.dir().to_path_buf(),
            validation: ctx.run.read_json(Artifact::Validation).ok().flatten(),
            failure: ctx.run.failure().ok().flatten(),
        }
    }

    async fn stages(
        &self,
        ctx: &mut RunContext,
        spec: &Specification,
        options: &RunOptions,
    ) -> Result<RunStatus, StageFailure> {
        ctx.run
            .write_text(Artifact::Spec, &spec.body)
            .map_err(at(Stage::Plan))?;
        ctx.run.set_status(RunStatus::InProgress).map_err(at(Stage::Plan))?;

        let max_attempts = options.max_attempts.unwrap_or(self.runtime.config.max_attempts);

        if let Some(existing) = self.locate_existing(spec, options.existing_code.as_ref()) {
            return self.reuse(ctx, spec, &existing, max_attempts).await;
        }

        let plan = self.plan(ctx, spec).await?;
        let trace = self.execute(ctx, &plan).await?;
        let test_file = self.export(ctx, &trace).await?;
        self.validate(ctx, &test_file, max_attempts, None).await
    }

    fn locate_existing(&self, spec: &Specification, existing: Option<&ExistingCode>) -> Option<PathBuf> {
        match existing? {
            ExistingCode::Path(path) if path.is_file() => Some(path.clone()),
            ExistingCode::Path(path) => {
                warn!(path = %path.display(), "existing code not found; regenerating");
                None
            }
            ExistingCode::Auto => {
                let tests_dir = self.runtime.config.project_root.join(&self.runtime.config.tests_dir);
                let found = find_existing_code(&tests_dir, spec);
                if found.is_none() {
                    info!(tests_dir = %tests_dir.display(), "no matching existing code; regenerating");
                }
                found
            }
        }
    }

    /// Stage 0: run existing code as-is. A pass ends the run; a failure goes
    /// straight to the healing loop.
    async fn reuse(
        &self,
        ctx: &mut RunContext,
        spec: &Specification,
        test_file: &Path,
        max_attempts: u32,
    ) -> Result<RunStatus, StageFailure> {
        ctx.started(Stage::Reuse);
        let label = test_file.to_string_lossy().into_owned();

        let code_bytes = fs::metadata(test_file)
            .map(|m| m.len() as usize)
            .map_err(|_| at(Stage::Reuse)(ExecutionError::MissingCode(test_file.to_path_buf())))?;
        ctx.run
            .write_json(Artifact::Export, &ExportMetadata::reused(&label, code_bytes))
            .map_err(at(Stage::Reuse))?;
        ctx.run
            .write_json(Artifact::Plan, &stub_plan(spec))
            .map_err(at(Stage::Reuse))?;

        let verdict = {
            let _permit = self.runtime.gate.acquire().await.map_err(at(Stage::Reuse))?;
            self.executor().try_existing(test_file).await.map_err(at(Stage::Reuse))?
        };
        ctx.log(Stage::Reuse, &verdict.outcome.output);

        if verdict.passed() {
            ctx.run
                .write_json(Artifact::Run, &ExecutionTrace::reused(&spec.title, &label))
                .map_err(at(Stage::Reuse))?;
            ctx.completed(Stage::Reuse, "passed");
            for stage in [Stage::Plan, Stage::Execute, Stage::Export, Stage::Validate] {
                ctx.skipped(stage);
            }
            ctx.run.set_status(RunStatus::Passed).map_err(at(Stage::Reuse))?;
            return Ok(RunStatus::Passed);
        }

        ctx.completed(Stage::Reuse, "failed");
        for stage in [Stage::Plan, Stage::Execute, Stage::Export] {
            ctx.skipped(stage);
        }
        self.validate(ctx, test_file, max_attempts, Some(verdict.outcome)).await
    }

    async fn plan(&self, ctx: &mut RunContext, spec: &Specification) -> Result<Plan, StageFailure> {
        ctx.started(Stage::Plan);
        let planner = Planner::new(
            Arc::clone(&self.runtime.agent),
            self.runtime.timeouts.agent_timeout(Stage::Plan),
            self.runtime.config.benign_retry_limit,
        );
        let output = planner.plan(spec).await.map_err(at(Stage::Plan))?;
        ctx.log(Stage::Plan, &output.transcript);

        let mut plan = output.record;
        plan.spec_file_name = Some(spec.file_name());
        plan.spec_file_path = Some(spec.path.display().to_string());
        ctx.run.write_json(Artifact::Plan, &plan).map_err(at(Stage::Plan))?;
        ctx.completed(Stage::Plan, "ok");
        Ok(plan)
    }

    async fn execute(&self, ctx: &mut RunContext, plan: &Plan) -> Result<ExecutionTrace, StageFailure> {
        ctx.started(Stage::Execute);
        let since = SystemTime::now();

        let executor = self.executor();
        let resolved = executor.resolve(plan).map_err(at(Stage::Execute))?;
        ctx.secrets = resolved.secrets.clone();

        let output = {
            let _permit = self.runtime.gate.acquire().await.map_err(at(Stage::Execute))?;
            executor.dispatch(plan, resolved).await.map_err(at(Stage::Execute))?
        };
        let executed = output.record;
        ctx.log(Stage::Execute, &output.transcript);

        let collected = collect_screenshots(&self.runtime.config.project_root, since, &ctx.run.screenshots_dir());
        if !collected.is_empty() {
            info!(count = collected.len(), "screenshots collected");
        }

        let trace = executed.trace;
        ctx.run.write_json(Artifact::Run, &trace).map_err(at(Stage::Execute))?;
        let state = match trace.final_state {
            FinalState::Passed => "passed",
            FinalState::Failed => "failed",
        };
        ctx.completed(Stage::Execute, state);
        Ok(trace)
    }

    async fn export(&self, ctx: &mut RunContext, trace: &ExecutionTrace) -> Result<PathBuf, StageFailure> {
        ctx.started(Stage::Export);
        let config = &self.runtime.config;
        let exporter = Exporter::new(
            Arc::clone(&self.runtime.agent),
            &config.project_root,
            &config.tests_dir,
            self.runtime.timeouts.agent_timeout(Stage::Export),
            config.benign_retry_limit,
        );
        let output = exporter.export(trace).await.map_err(at(Stage::Export))?;
        ctx.log(Stage::Export, &output.transcript);

        let exported = output.record;
        ctx.run
            .write_json(Artifact::Export, &ExportMetadata::from(&exported.result))
            .map_err(at(Stage::Export))?;
        ctx.completed(Stage::Export, "ok");
        Ok(exported.written_to)
    }

    async fn validate(
        &self,
        ctx: &mut RunContext,
        test_file: &Path,
        max_attempts: u32,
        initial_failure: Option<TestRunOutcome>,
    ) -> Result<RunStatus, StageFailure> {
        ctx.started(Stage::Validate);
        let validator = Validator::new(
            Arc::clone(&self.runtime.agent),
            Arc::clone(&self.runtime.runner),
            self.runtime.timeouts.agent_timeout(Stage::Validate),
            self.runtime.config.benign_retry_limit,
        );

        let output = {
            let _permit = self.runtime.gate.acquire().await.map_err(at(Stage::Validate))?;
            validator
                .validate_and_fix(test_file, max_attempts, initial_failure)
                .await
                .map_err(at(Stage::Validate))?
        };
        let ValidationRun { mut result, attempts, .. } = output.record;

        for attempt in &attempts {
            let verdict = if attempt.passed { "passed" } else { "failed" };
            ctx.log(
                Stage::Validate,
                &format!("attempt {} {verdict}\n{}", attempt.attempt, attempt.output),
            );
            if let Some(reply) = &attempt.fix_reply {
                ctx.log(Stage::Validate, reply);
            }
        }

        result.last_error = result.last_error.map(|e| ctx.secrets.scrub_str(&e));
        ctx.run
            .write_json(Artifact::Validation, &result)
            .map_err(at(Stage::Validate))?;

        if !result.is_success() {
            return Err(StageFailure {
                stage: Stage::Validate,
                error: PipelineError::ValidationExhausted {
                    attempts: result.attempts,
                    message: result.message.clone(),
                },
            });
        }

        ctx.completed(Stage::Validate, "success");
        ctx.run.set_status(RunStatus::Passed).map_err(at(Stage::Validate))?;
        Ok(RunStatus::Passed)
    }

    fn executor(&self) -> Executor {
        Executor::new(
            Arc::clone(&self.runtime.agent),
            Arc::clone(&self.runtime.runner),
            self.runtime.secrets.clone(),
            self.runtime.timeouts.agent_timeout(Stage::Execute),
            self.runtime.config.benign_retry_limit,
        )
    }

    fn record_failure(&self, ctx: &RunContext, failure: StageFailure) {
        let StageFailure { stage, error } = failure;
        let message = ctx.secrets.scrub_str(&error.to_string());
        warn!(
            run_id = %ctx.run.run_id(),
            stage = stage.as_str(),
            error_type = error.label(),
            error = %message,
            "run failed"
        );

        let record = FailureRecord {
            stage,
            error_type: error.label().to_string(),
            message: message.clone(),
            preview: error.preview().map(|p| ctx.secrets.scrub_str(p)),
            timestamp: Utc::now(),
        };
        if let Err(err) = ctx.run.record_failure(&record) {
            warn!(run_id = %ctx.run.run_id(), error = %err, "failed to record run failure");
            if let Err(err) = ctx.run.set_status(RunStatus::Failed) {
                warn!(run_id = %ctx.run.run_id(), error = %err, "failed to set run status");
            }
        }

        ctx.run.emit(
            LifecycleEvent::for_stage(LifecycleEventType::StageFailed, ctx.run.run_id(), stage)
                .with_error(error.label(), message),
        );
    }
}

/// Plan recorded for a reuse run: identifies the specification, carries no
/// steps, and is never validated.
fn stub_plan(spec: &Specification) -> Plan {
    Plan {
        test_name: spec.title.clone(),
        description: String::new(),
        base_url: String::new(),
        steps: Vec::new(),
        spec_file_name: Some(spec.file_name()),
        spec_file_path: Some(spec.path.display().to_string()),
    }
}
