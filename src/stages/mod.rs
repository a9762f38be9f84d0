//! The four pipeline stages plus the existing-code lookup.
//!
//! Each stage builds a prompt, dispatches it through the agent boundary and
//! reconciles the reply into a validated record. Stages never persist
//! anything themselves; the coordinator owns the run's artifact set.

pub mod executor;
pub mod exporter;
pub mod planner;
pub mod reuse;
pub mod validator;

pub use executor::{collect_screenshots, Executed, Executor, ResolvedPlan, ReuseVerdict};
pub use exporter::{Exported, Exporter};
pub use planner::Planner;
pub use reuse::{find_existing_code, slugify};
pub use validator::{ValidationRun, Validator, ValidatorState};

/// A stage's record together with the raw agent reply it came from.
#[derive(Debug, Clone)]
pub struct StageOutput<T> {
    pub record: T,
    pub transcript: String,
}
