//! Records exchanged between pipeline stages.
//!
//! Every record that originates from agent output is deserialized from a
//! `serde_json::Value` and then checked against its contract, so a stage can
//! tell "not JSON" ([`ExtractionError`](crate::error::ExtractionError)) apart
//! from "JSON with the wrong shape" ([`SchemaValidationError`]).

mod export;
mod plan;
mod spec;
mod trace;
mod validation;

pub use export::{ExportMetadata, ExportResult};
pub use plan::{Action, Assertion, AssertionKind, Plan, Step};
pub use spec::Specification;
pub use trace::{ExecutionTrace, FinalState, StepOutcome, StepResult};
pub use validation::{FixOutcome, FixReport, ValidationResult, ValidationStatus};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::SchemaValidationError;

/// Deserialize `value` into `T`, mapping serde failures to a schema error for
/// `record`.
pub(crate) fn from_value<T: DeserializeOwned>(
    record: &'static str,
    value: Value,
) -> Result<T, SchemaValidationError> {
    serde_json::from_value(value).map_err(|err| SchemaValidationError::from_serde(record, err))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

/// Accept either a single string or a list of strings; `null` is empty.
pub(crate) fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(item)) => vec![item],
        Some(OneOrMany::Many(items)) => items,
    })
}
