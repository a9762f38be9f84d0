//! Structured-output extraction from free-form agent replies.
//!
//! Agents answer in prose that usually, but not always, carries one JSON
//! object in a fenced code block. [`extract`] locates the most plausible
//! payload and parses it, repairing truncation when a direct parse fails.
//!
//! Candidates are tried in order of preference:
//!
//! 1. blocks fenced as ```` ```json ````
//! 2. any other fenced block
//! 3. the whole reply
//! 4. the slice from the first `{` to the end of the reply
//!
//! Each candidate is parsed as-is and, failing that, once more after
//! [`repair_json`] before the next candidate is considered. A truncated
//! ```` ```json ```` payload therefore wins over a complete snippet elsewhere.

mod repair;

pub use repair::repair_json;

use serde_json::{Deserializer, Value};
use tracing::debug;

use crate::error::ExtractionError;

/// Where a candidate payload was found in the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    JsonFence,
    Fence,
    WholeText,
    FirstBrace,
}

impl CandidateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateSource::JsonFence => "json_fence",
            CandidateSource::Fence => "fence",
            CandidateSource::WholeText => "whole_text",
            CandidateSource::FirstBrace => "first_brace",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate<'a> {
    source: CandidateSource,
    body: &'a str,
    /// Alternative body running to the last fence in the reply; parsed
    /// directly before `body` is repaired.
    extended: Option<&'a str>,
}

impl<'a> Candidate<'a> {
    fn new(source: CandidateSource, body: &'a str) -> Self {
        Self {
            source,
            body,
            extended: None,
        }
    }
}

/// A fenced block: the info token after the opening backticks and the body.
#[derive(Debug, Clone, Copy)]
struct Fence<'a> {
    tag: &'a str,
    /// Body up to the next fence, or to end of text when unclosed.
    body: &'a str,
    /// Body up to the last fence in the text, when that differs from `body`.
    /// Covers payloads whose string values themselves contain backticks.
    extended: Option<&'a str>,
}

const FENCE: &str = "```";

fn is_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+')
}

fn fences(text: &str) -> Vec<Fence<'_>> {
    let last_fence = text.rfind(FENCE);
    let mut found = Vec::new();
    let mut cursor = 0;

    while let Some(rel) = text[cursor..].find(FENCE) {
        let after_ticks = cursor + rel + FENCE.len();
        let tag_len = text[after_ticks..]
            .find(|c: char| !is_tag_char(c))
            .unwrap_or(text.len() - after_ticks);
        let tag = &text[after_ticks..after_ticks + tag_len];
        let body_start = after_ticks + tag_len;

        let body_end = text[body_start..]
            .find(FENCE)
            .map(|i| body_start + i)
            .unwrap_or(text.len());

        let extended = match last_fence {
            Some(last) if last > body_end => Some(text[body_start..last].trim()),
            _ => None,
        };

        found.push(Fence {
            tag,
            body: text[body_start..body_end].trim(),
            extended,
        });

        if body_end >= text.len() {
            break;
        }
        cursor = body_end + FENCE.len();
    }

    found
}

fn candidates(text: &str) -> Vec<Candidate<'_>> {
    let fences = fences(text);
    let mut out = Vec::new();

    for fence in fences.iter().filter(|f| f.tag.eq_ignore_ascii_case("json")) {
        out.push(Candidate {
            extended: fence.extended,
            ..Candidate::new(CandidateSource::JsonFence, fence.body)
        });
    }

    for fence in fences.iter().filter(|f| !f.tag.eq_ignore_ascii_case("json")) {
        out.push(Candidate::new(CandidateSource::Fence, fence.body));
    }

    out.push(Candidate::new(CandidateSource::WholeText, text));

    if let Some(start) = text.find(['{', '[']) {
        if start > 0 || !fences.is_empty() {
            out.push(Candidate::new(CandidateSource::FirstBrace, &text[start..]));
        }
    }

    out
}

/// Parse the leading JSON value of `body`, ignoring anything after it.
fn parse_leading_object(body: &str) -> Result<Value, String> {
    let mut stream = Deserializer::from_str(body).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value @ Value::Object(_))) => Ok(value),
        Some(Ok(_)) => Err("payload is not a JSON object".to_string()),
        Some(Err(err)) => Err(err.to_string()),
        None => Err("no JSON value found".to_string()),
    }
}

/// Direct parse of the body, then of the extended body, then one repair pass
/// over the body. The error is the direct-parse failure.
fn parse_candidate(candidate: &Candidate<'_>) -> Result<Value, String> {
    let direct_failure = match parse_leading_object(candidate.body) {
        Ok(value) => {
            debug!(source = candidate.source.as_str(), "extracted structured output");
            return Ok(value);
        }
        Err(reason) => reason,
    };

    if let Some(Ok(value)) = candidate.extended.map(parse_leading_object) {
        debug!(source = candidate.source.as_str(), "extracted structured output");
        return Ok(value);
    }

    let repaired = repair_json(candidate.body);
    if repaired != candidate.body {
        if let Ok(value) = parse_leading_object(&repaired) {
            debug!(
                source = candidate.source.as_str(),
                "extracted structured output after repair"
            );
            return Ok(value);
        }
    }

    Err(direct_failure)
}

/// Recover the JSON object carried by an agent reply.
///
/// Fails with [`ExtractionError`] (carrying a bounded preview of `text`) when
/// neither a direct parse nor a single repair pass yields an object.
pub fn extract(text: &str) -> Result<Value, ExtractionError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ExtractionError::new("agent reply is empty", text));
    }

    let mut first_failure: Option<String> = None;

    for candidate in candidates(trimmed) {
        match parse_candidate(&candidate) {
            Ok(value) => return Ok(value),
            Err(reason) => {
                first_failure
                    .get_or_insert_with(|| format!("{}: {}", candidate.source.as_str(), reason));
            }
        }
    }

    Err(ExtractionError::new(
        first_failure.unwrap_or_else(|| "no JSON payload found".to_string()),
        trimmed,
    ))
}
