use std::path::{Path, PathBuf};

use tracing::debug;

use crate::model::Specification;

const TEST_SUFFIX: &str = ".spec.ts";

/// Shortest slug allowed on the contained side of a fuzzy match.
const MIN_FUZZY_SLUG: usize = 4;

fn fuzzy_match(a: &str, b: &str) -> bool {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    short.len() >= MIN_FUZZY_SLUG && long.contains(short)
}

/// Lowercase ASCII alphanumerics joined by single dashes.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

fn file_slug(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(TEST_SUFFIX).unwrap_or(name);
    Some(slugify(stem))
}

/// Previously generated code under `tests_dir` for `spec`, if any.
///
/// An exact slug match on the spec's file stem or title wins; otherwise the
/// first file whose slug contains, or is contained in, one of those slugs,
/// provided the contained slug is at least four characters long.
pub fn find_existing_code(tests_dir: &Path, spec: &Specification) -> Option<PathBuf> {
    let pattern = tests_dir.join("**").join(format!("*{TEST_SUFFIX}"));
    let mut files: Vec<PathBuf> = glob::glob(pattern.to_str()?)
        .ok()?
        .filter_map(Result::ok)
        .collect();
    files.sort();

    let keys: Vec<String> = [slugify(&spec.stem()), slugify(&spec.title)]
        .into_iter()
        .filter(|k| !k.is_empty())
        .collect();
    if keys.is_empty() {
        return None;
    }

    let slugged: Vec<(PathBuf, String)> = files
        .into_iter()
        .filter_map(|path| file_slug(&path).filter(|s| !s.is_empty()).map(|s| (path, s)))
        .collect();

    let found = slugged
        .iter()
        .find(|(_, slug)| keys.iter().any(|k| k == slug))
        .or_else(|| {
            slugged
                .iter()
                .find(|(_, slug)| keys.iter().any(|k| fuzzy_match(k, slug)))
        })
        .map(|(path, _)| path.clone());

    debug!(found = ?found, "existing code lookup");
    found
}
