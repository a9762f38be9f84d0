//! Secret substitution and scrubbing.
//!
//! Plans refer to credentials with `{{VAR_NAME}}` placeholders. Right before
//! execution the placeholders are resolved against a [`SecretSource`], and
//! every value substituted is remembered in a run-scoped [`SecretMap`]. Any
//! record or text coming back from the agent is scrubbed with that map before
//! it is logged or persisted, so a resolved credential never reaches disk.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use regex::{Captures, Regex};
use serde_json::{Map, Value};
use tracing::warn;

use crate::model::Plan;

const PLACEHOLDER_PATTERN: &str = r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}";

/// Read-only lookup of secret values by name.
pub trait SecretSource: Send + Sync {
    fn lookup(&self, name: &str) -> Option<String>;
}

impl SecretSource for HashMap<String, String> {
    fn lookup(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Secrets taken from the process environment (after `.env` loading).
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl SecretSource for ProcessEnv {
    fn lookup(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Resolved secret value to placeholder token. Never persisted.
#[derive(Clone, Default)]
pub struct SecretMap {
    /// `(value, placeholder)` pairs, longest value first.
    entries: Vec<(String, String)>,
}

impl fmt::Debug for SecretMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretMap")
            .field("secrets", &self.entries.len())
            .finish()
    }
}

impl SecretMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember that `value` was substituted for `{{name}}`. Empty values
    /// cannot be scrubbed and are ignored.
    pub fn insert(&mut self, value: impl Into<String>, name: &str) {
        let value = value.into();
        if value.is_empty() || self.entries.iter().any(|(v, _)| *v == value) {
            return;
        }
        self.entries.push((value, format!("{{{{{name}}}}}")));
        self.entries
            .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace every secret value in `text` with its placeholder.
    ///
    /// Single left-to-right pass preferring the longest value at each
    /// position; inserted placeholders are never rescanned. The JSON-escaped
    /// form of each value is matched too, so raw agent replies can be scrubbed
    /// before they are parsed.
    pub fn scrub_str(&self, text: &str) -> String {
        if self.entries.is_empty() {
            return text.to_string();
        }

        let mut needles: Vec<(String, &str)> = Vec::with_capacity(self.entries.len() * 2);
        for (value, placeholder) in &self.entries {
            needles.push((value.clone(), placeholder.as_str()));
            if let Ok(quoted) = serde_json::to_string(value) {
                let escaped = &quoted[1..quoted.len() - 1];
                if escaped != value {
                    needles.push((escaped.to_string(), placeholder.as_str()));
                }
            }
        }
        needles.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));

        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        'scan: while let Some(c) = rest.chars().next() {
            for (needle, placeholder) in &needles {
                if rest.starts_with(needle.as_str()) {
                    out.push_str(placeholder);
                    rest = &rest[needle.len()..];
                    continue 'scan;
                }
            }
            out.push(c);
            rest = &rest[c.len_utf8()..];
        }
        out
    }

    /// Scrub every string (and object key) in a JSON structure.
    pub fn scrub_value(&self, value: Value) -> Value {
        if self.entries.is_empty() {
            return value;
        }
        match value {
            Value::String(s) => Value::String(self.scrub_str(&s)),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.scrub_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (self.scrub_str(&k), self.scrub_value(v)))
                    .collect::<Map<String, Value>>(),
            ),
            other => other,
        }
    }
}

/// Outcome of resolving placeholders in a structure.
#[derive(Debug, Clone)]
pub struct Resolution<T> {
    pub resolved: T,
    pub secrets: SecretMap,
    /// Placeholder names with no value in the source, in first-seen order.
    pub missing: Vec<String>,
}

/// Resolves `{{VAR}}` placeholders against a shared, read-only source.
#[derive(Clone)]
pub struct SecretSubstitutor {
    source: Arc<dyn SecretSource>,
    placeholder: Option<Regex>,
}

impl fmt::Debug for SecretSubstitutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretSubstitutor").finish_non_exhaustive()
    }
}

impl SecretSubstitutor {
    pub fn new(source: Arc<dyn SecretSource>) -> Self {
        Self {
            source,
            placeholder: Regex::new(PLACEHOLDER_PATTERN).ok(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(Arc::new(ProcessEnv))
    }

    /// Resolve placeholders in every string of `value`.
    ///
    /// Missing names are left unresolved and reported in
    /// [`Resolution::missing`]; they are not an error.
    pub fn resolve(&self, value: &Value) -> Resolution<Value> {
        let mut secrets = SecretMap::new();
        let mut missing = Vec::new();
        let resolved = self.resolve_inner(value, &mut secrets, &mut missing);

        for name in &missing {
            warn!(placeholder = %name, "no value for placeholder; leaving it unresolved");
        }

        Resolution {
            resolved,
            secrets,
            missing,
        }
    }

    /// Resolve a plan into the JSON document embedded in the execution prompt.
    pub fn resolve_plan(&self, plan: &Plan) -> Result<Resolution<Value>, serde_json::Error> {
        let value = serde_json::to_value(plan)?;
        Ok(self.resolve(&value))
    }

    fn resolve_inner(&self, value: &Value, secrets: &mut SecretMap, missing: &mut Vec<String>) -> Value {
        match value {
            Value::String(s) => Value::String(self.resolve_str(s, secrets, missing)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.resolve_inner(v, secrets, missing))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_inner(v, secrets, missing)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn resolve_str(&self, text: &str, secrets: &mut SecretMap, missing: &mut Vec<String>) -> String {
        let Some(placeholder) = self.placeholder.as_ref() else {
            return text.to_string();
        };

        placeholder
            .replace_all(text, |caps: &Captures<'_>| {
                let name = &caps[1];
                match self.source.lookup(name) {
                    Some(value) => {
                        secrets.insert(value.clone(), name);
                        value
                    }
                    None => {
                        if !missing.iter().any(|m| m == name) {
                            missing.push(name.to_string());
                        }
                        caps[0].to_string()
                    }
                }
            })
            .into_owned()
    }
}
