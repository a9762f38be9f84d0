//! Durable per-run artifact storage.
//!
//! Each pipeline run owns one directory under the runs root:
//!
//! ```text
//! runs/<run-id>/
//!   manifest.json     identity and creation time
//!   status.txt        pending | in_progress | passed | failed
//!   spec.md           specification snapshot
//!   plan.json         Plan
//!   run.json          ExecutionTrace
//!   export.json       ExportResult metadata (code lives at testFilePath)
//!   validation.json   ValidationResult
//!   failure.json      why the run stopped, when it failed
//!   execution.log     raw stage output
//!   events.jsonl      lifecycle journal
//!   screenshots/
//! ```

pub mod lifecycle;
pub mod run;
pub mod run_id;
pub mod store;

pub use lifecycle::{LifecycleEvent, LifecycleEventType, Stage};
pub use run::{Artifact, FailureRecord, RunArtifactSet, RunManifest, RunStatus};
pub use run_id::generate_run_id;
pub use store::{ArtifactError, ArtifactResult, ArtifactStore, RunSummary};
