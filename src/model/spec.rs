use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// A natural-language test specification. Never mutated by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Specification {
    pub path: PathBuf,
    pub title: String,
    pub body: String,
}

impl Specification {
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let body = fs::read_to_string(path)?;
        Ok(Self::from_text(path, body))
    }

    pub fn from_text(path: impl Into<PathBuf>, body: impl Into<String>) -> Self {
        let path = path.into();
        let body = body.into();
        let title = heading_title(&body).unwrap_or_else(|| stem_title(&path));
        Self { path, title, body }
    }

    /// File stem of the specification, e.g. `login_flow` for `login_flow.md`.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// File name of the specification, e.g. `login_flow.md`.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn heading_title(body: &str) -> Option<String> {
    let heading = body
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with('#'))?;
    let text = heading.trim_start_matches('#').trim();
    let text = match text.get(..5) {
        Some(prefix) if prefix.eq_ignore_ascii_case("test:") => text[5..].trim(),
        _ => text,
    };
    (!text.is_empty()).then(|| text.to_string())
}

fn stem_title(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    stem.split(|c: char| c == '_' || c == '-' || c.is_whitespace())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
