use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::artifacts::lifecycle::{LifecycleEvent, Stage};
use crate::artifacts::store::{ArtifactError, ArtifactResult};

pub(crate) const MANIFEST_FILE_NAME: &str = "manifest.json";
const STATUS_FILE_NAME: &str = "status.txt";
const LOG_FILE_NAME: &str = "execution.log";
const EVENTS_FILE_NAME: &str = "events.jsonl";
const SCREENSHOTS_DIR_NAME: &str = "screenshots";

/// Write-once artifacts of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Spec,
    Plan,
    Run,
    Export,
    Validation,
    Failure,
}

impl Artifact {
    pub fn file_name(&self) -> &'static str {
        match self {
            Artifact::Spec => "spec.md",
            Artifact::Plan => "plan.json",
            Artifact::Run => "run.json",
            Artifact::Export => "export.json",
            Artifact::Validation => "validation.json",
            Artifact::Failure => "failure.json",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Artifact::Spec => "spec",
            Artifact::Plan => "plan",
            Artifact::Run => "run",
            Artifact::Export => "export",
            Artifact::Validation => "validation",
            Artifact::Failure => "failure",
        }
    }
}

/// Plain-text status token in `status.txt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    InProgress,
    Passed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::InProgress => "in_progress",
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Passed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pending" => Ok(RunStatus::Pending),
            "in_progress" => Ok(RunStatus::InProgress),
            "passed" => Ok(RunStatus::Passed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status `{other}`")),
        }
    }
}

/// Identity record written when the namespace is allocated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub spec_path: String,
}

/// Why a run stopped, written alongside status `failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub stage: Stage,
    pub error_type: String,
    pub message: String,
    /// Bounded excerpt of agent output that could not be parsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// The durable namespace of one pipeline run.
///
/// Stage artifacts are write-once: a second write of the same artifact fails
/// with [`ArtifactError::AlreadyWritten`]. The status token, the raw log and
/// the event journal are the only mutable parts.
#[derive(Debug, Clone)]
pub struct RunArtifactSet {
    run_id: String,
    dir: PathBuf,
}

impl RunArtifactSet {
    pub(crate) fn new(run_id: String, dir: PathBuf) -> Self {
        Self { run_id, dir }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, artifact: Artifact) -> PathBuf {
        self.dir.join(artifact.file_name())
    }

    pub fn screenshots_dir(&self) -> PathBuf {
        self.dir.join(SCREENSHOTS_DIR_NAME)
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE_NAME)
    }

    pub fn has(&self, artifact: Artifact) -> bool {
        self.path(artifact).exists()
    }

    pub fn write_text(&self, artifact: Artifact, text: &str) -> ArtifactResult<PathBuf> {
        let path = self.path(artifact);
        if path.exists() {
            return Err(ArtifactError::AlreadyWritten(artifact.label()));
        }
        write_atomic(&path, text.as_bytes())?;
        Ok(path)
    }

    pub fn write_json<T: Serialize>(&self, artifact: Artifact, record: &T) -> ArtifactResult<PathBuf> {
        let json = serde_json::to_string_pretty(record).map_err(|source| ArtifactError::Json {
            path: self.path(artifact),
            source,
        })?;
        self.write_text(artifact, &json)
    }

    pub fn read_text(&self, artifact: Artifact) -> ArtifactResult<Option<String>> {
        read_optional(&self.path(artifact))
    }

    pub fn read_json<T: DeserializeOwned>(&self, artifact: Artifact) -> ArtifactResult<Option<T>> {
        let path = self.path(artifact);
        match read_optional(&path)? {
            Some(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|source| ArtifactError::Json { path, source }),
            None => Ok(None),
        }
    }

    pub fn manifest(&self) -> ArtifactResult<Option<RunManifest>> {
        let path = self.dir.join(MANIFEST_FILE_NAME);
        match read_optional(&path)? {
            Some(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|source| ArtifactError::Json { path, source }),
            None => Ok(None),
        }
    }

    pub(crate) fn write_manifest(&self, manifest: &RunManifest) -> ArtifactResult<()> {
        let path = self.dir.join(MANIFEST_FILE_NAME);
        let json = serde_json::to_string_pretty(manifest).map_err(|source| ArtifactError::Json {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, json.as_bytes())
    }

    pub fn set_status(&self, status: RunStatus) -> ArtifactResult<()> {
        write_atomic(&self.dir.join(STATUS_FILE_NAME), status.as_str().as_bytes())
    }

    /// Current status token. A run whose token is missing or unreadable
    /// counts as pending.
    pub fn status(&self) -> ArtifactResult<RunStatus> {
        let content = read_optional(&self.dir.join(STATUS_FILE_NAME))?;
        Ok(content
            .and_then(|token| token.parse().ok())
            .unwrap_or(RunStatus::Pending))
    }

    pub fn record_failure(&self, failure: &FailureRecord) -> ArtifactResult<()> {
        self.write_json(Artifact::Failure, failure)?;
        self.set_status(RunStatus::Failed)
    }

    pub fn failure(&self) -> ArtifactResult<Option<FailureRecord>> {
        self.read_json(Artifact::Failure)
    }

    /// Append a stage-tagged block to the raw log. Callers scrub secrets.
    pub fn append_log(&self, stage: Stage, text: &str) -> ArtifactResult<()> {
        let path = self.log_path();
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut entry = format!("[{stamp}] [{stage}] ");
        entry.push_str(text.trim_end());
        entry.push('\n');
        append(&path, entry.as_bytes())
    }

    pub fn read_log(&self) -> ArtifactResult<String> {
        Ok(read_optional(&self.log_path())?.unwrap_or_default())
    }

    /// Append to the lifecycle journal. Journal failures are logged and
    /// never abort the run.
    pub fn emit(&self, event: LifecycleEvent) {
        let path = self.dir.join(EVENTS_FILE_NAME);
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(err) => {
                warn!(run_id = %self.run_id, error = %err, "failed to serialize lifecycle event");
                return;
            }
        };
        if let Err(err) = append(&path, format!("{line}\n").as_bytes()) {
            warn!(run_id = %self.run_id, error = %err, "failed to write lifecycle event");
        }
    }

    pub fn events(&self) -> ArtifactResult<Vec<LifecycleEvent>> {
        let path = self.dir.join(EVENTS_FILE_NAME);
        let Some(content) = read_optional(&path)? else {
            return Ok(Vec::new());
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|source| ArtifactError::Json {
                    path: path.clone(),
                    source,
                })
            })
            .collect()
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ArtifactError + '_ {
    move |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn read_optional(path: &Path) -> ArtifactResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_error(path)(err)),
    }
}

fn append(path: &Path, bytes: &[u8]) -> ArtifactResult<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_error(path))?;
    file.write_all(bytes).map_err(io_error(path))?;
    file.sync_all().map_err(io_error(path))
}

/// Write through a sibling temp file and rename, so readers never observe a
/// partially written artifact.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> ArtifactResult<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!("{file_name}.tmp"));

    let mut file = fs::File::create(&temp_path).map_err(io_error(&temp_path))?;
    file.write_all(bytes).map_err(io_error(&temp_path))?;
    file.sync_all().map_err(io_error(&temp_path))?;
    fs::rename(&temp_path, path).map_err(io_error(path))
}
