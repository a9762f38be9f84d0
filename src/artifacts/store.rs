use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::artifacts::lifecycle::{LifecycleEvent, LifecycleEventType};
use crate::artifacts::run::{Artifact, RunArtifactSet, RunManifest, RunStatus};
use crate::artifacts::run_id::{generate_run_id, is_valid_run_id};
use crate::model::{ValidationResult, ValidationStatus};

/// Current manifest schema version.
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Allocation retries before giving up on a unique run id.
const MAX_ALLOCATION_ATTEMPTS: u32 = 16;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("IO error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error in {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("artifact `{0}` was already written for this run")]
    AlreadyWritten(&'static str),

    #[error("invalid run id `{0}`")]
    InvalidRunId(String),

    #[error("unknown run `{0}`")]
    UnknownRun(String),

    #[error("could not allocate a unique run id after {0} attempts")]
    AllocationExhausted(u32),
}

pub type ArtifactResult<T> = Result<T, ArtifactError>;

/// Listing entry for one run, derived from its artifacts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub test_name: Option<String>,
    pub spec_file_name: Option<String>,
    pub steps: usize,
    pub failed_steps: usize,
    pub reused: bool,
    pub test_file: Option<String>,
    pub validation: Option<ValidationStatus>,
    pub attempts: Option<u32>,
    pub error: Option<String>,
}

/// Root directory holding one namespace per run.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root_dir: PathBuf,
    retention_days: u64,
}

impl ArtifactStore {
    pub fn new(root_dir: impl Into<PathBuf>, retention_days: u64) -> ArtifactResult<Self> {
        let root_dir = root_dir.into();
        fs::create_dir_all(&root_dir).map_err(|source| ArtifactError::Io {
            path: root_dir.clone(),
            source,
        })?;
        Ok(Self {
            root_dir,
            retention_days,
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Allocate a fresh namespace, write its manifest and status `pending`,
    /// and journal the run start. Ids are never reused: the directory is
    /// created exclusively and a collision draws a new id.
    pub fn create_run(&self, spec_path: &Path) -> ArtifactResult<RunArtifactSet> {
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let run_id = generate_run_id();
            let dir = self.root_dir.join(&run_id);
            match fs::create_dir(&dir) {
                Ok(()) => {
                    let run = RunArtifactSet::new(run_id, dir);
                    run.write_manifest(&RunManifest {
                        schema_version: MANIFEST_SCHEMA_VERSION,
                        run_id: run.run_id().to_string(),
                        created_at: Utc::now(),
                        spec_path: spec_path.display().to_string(),
                    })?;
                    run.set_status(RunStatus::Pending)?;
                    run.emit(LifecycleEvent::new(LifecycleEventType::RunStart, run.run_id()));
                    return Ok(run);
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(source) => return Err(ArtifactError::Io { path: dir, source }),
            }
        }
        Err(ArtifactError::AllocationExhausted(MAX_ALLOCATION_ATTEMPTS))
    }

    pub fn open_run(&self, run_id: &str) -> ArtifactResult<RunArtifactSet> {
        if !is_valid_run_id(run_id) {
            return Err(ArtifactError::InvalidRunId(run_id.to_string()));
        }
        let dir = self.root_dir.join(run_id);
        if !dir.is_dir() {
            return Err(ArtifactError::UnknownRun(run_id.to_string()));
        }
        Ok(RunArtifactSet::new(run_id.to_string(), dir))
    }

    /// All runs, newest first.
    pub fn list_runs(&self) -> ArtifactResult<Vec<RunSummary>> {
        let mut summaries = Vec::new();
        for run in self.runs()? {
            summaries.push(summarize(&run)?);
        }
        summaries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        Ok(summaries)
    }

    pub fn summary(&self, run_id: &str) -> ArtifactResult<RunSummary> {
        summarize(&self.open_run(run_id)?)
    }

    pub fn delete_run(&self, run_id: &str) -> ArtifactResult<()> {
        if !is_valid_run_id(run_id) {
            return Err(ArtifactError::InvalidRunId(run_id.to_string()));
        }
        let dir = self.root_dir.join(run_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ArtifactError::Io { path: dir, source }),
        }
    }

    /// Delete runs created more than `retention_days` ago. Runs without a
    /// manifest are left alone. Returns the number of runs deleted.
    pub fn enforce_retention(&self) -> ArtifactResult<usize> {
        if self.retention_days == 0 {
            return Ok(0);
        }

        // A window too large to represent keeps every run.
        let Some(cutoff) = i64::try_from(self.retention_days)
            .ok()
            .and_then(Duration::try_days)
            .and_then(|window| Utc::now().checked_sub_signed(window))
        else {
            return Ok(0);
        };
        let mut deleted = 0;

        for run in self.runs()? {
            let Some(manifest) = run.manifest()? else {
                continue;
            };
            if manifest.created_at < cutoff {
                self.delete_run(run.run_id())?;
                deleted += 1;
            }
        }

        Ok(deleted)
    }

    fn runs(&self) -> ArtifactResult<Vec<RunArtifactSet>> {
        let io_err = |source| ArtifactError::Io {
            path: self.root_dir.clone(),
            source,
        };
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.root_dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            if !entry.file_type().map_err(io_err)?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_valid_run_id(&name) {
                runs.push(RunArtifactSet::new(name, entry.path()));
            }
        }
        Ok(runs)
    }
}

fn string_field(record: &Option<Value>, key: &str) -> Option<String> {
    record
        .as_ref()
        .and_then(|value| value.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Summaries tolerate partially written and stub artifacts, so records are
/// read as loose JSON rather than through the typed models.
fn summarize(run: &RunArtifactSet) -> ArtifactResult<RunSummary> {
    let manifest = run.manifest()?;
    let plan: Option<Value> = run.read_json(Artifact::Plan)?;
    let trace: Option<Value> = run.read_json(Artifact::Run)?;
    let export: Option<Value> = run.read_json(Artifact::Export)?;
    let validation: Option<ValidationResult> = run.read_json(Artifact::Validation)?;
    let failure = run.failure()?;

    let trace_steps = trace
        .as_ref()
        .and_then(|t| t.get("steps"))
        .and_then(Value::as_array);
    let steps = trace_steps.map(Vec::len).unwrap_or_else(|| {
        plan.as_ref()
            .and_then(|p| p.get("steps"))
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    });
    let failed_steps = trace_steps.map_or(0, |steps| {
        steps
            .iter()
            .filter(|s| s.get("result").and_then(Value::as_str) == Some("failed"))
            .count()
    });
    let reused = trace
        .as_ref()
        .and_then(|t| t.get("reused"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Ok(RunSummary {
        run_id: run.run_id().to_string(),
        status: run.status()?,
        created_at: manifest.map(|m| m.created_at),
        test_name: string_field(&plan, "testName"),
        spec_file_name: string_field(&plan, "specFileName"),
        steps,
        failed_steps,
        reused,
        test_file: validation
            .as_ref()
            .map(|v| v.test_file.clone())
            .or_else(|| string_field(&export, "testFilePath")),
        validation: validation.as_ref().map(|v| v.status),
        attempts: validation.as_ref().map(|v| v.attempts),
        error: failure.map(|f| format!("{}: {}", f.error_type, f.message)),
    })
}
