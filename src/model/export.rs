use std::collections::BTreeSet;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{from_value, one_or_many};
use crate::error::SchemaValidationError;

const RECORD: &str = "export result";

/// Generated test source plus where it should live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub test_file_path: String,
    pub code: String,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub notes: Vec<String>,
}

impl ExportResult {
    pub fn from_value(value: Value) -> Result<Self, SchemaValidationError> {
        let export: ExportResult = from_value(RECORD, value)?;
        export.validate()?;
        Ok(export)
    }

    pub fn validate(&self) -> Result<(), SchemaValidationError> {
        if self.test_file_path.trim().is_empty() {
            return Err(SchemaValidationError::new(RECORD, "testFilePath", "must not be empty"));
        }
        if Path::new(&self.test_file_path)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(SchemaValidationError::new(
                RECORD,
                "testFilePath",
                "must not contain `..` components",
            ));
        }
        if self.code.trim().is_empty() {
            return Err(SchemaValidationError::new(RECORD, "code", "must not be empty"));
        }
        Ok(())
    }
}

/// The persisted `export` artifact: describes the code write, omits the code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetadata {
    pub test_file_path: String,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub code_bytes: usize,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reused: bool,
}

impl ExportMetadata {
    /// Metadata for code that already existed and is being tried as-is.
    pub fn reused(test_file_path: impl Into<String>, code_bytes: usize) -> Self {
        Self {
            test_file_path: test_file_path.into(),
            dependencies: BTreeSet::new(),
            notes: vec!["Reused existing code".to_string()],
            code_bytes,
            reused: true,
        }
    }
}

impl From<&ExportResult> for ExportMetadata {
    fn from(export: &ExportResult) -> Self {
        Self {
            test_file_path: export.test_file_path.clone(),
            dependencies: export.dependencies.clone(),
            notes: export.notes.clone(),
            code_bytes: export.code.len(),
            reused: false,
        }
    }
}
