//! Validation and normalisation of names that become path components.

use std::sync::LazyLock;

use regex::Regex;

static NON_SLUG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("valid regex"));
static NON_SAFE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("valid regex"));

const SAFE_NAME_MAX: usize = 64;

/// Lowercase slug: runs of anything but `[a-z0-9]` collapse to `-`.
///
/// Returns `None` when nothing usable remains.
pub fn slugify(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_lowercase();
    let slug = NON_SLUG.replace_all(&lowered, "-");
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        None
    } else {
        Some(slug.to_string())
    }
}

/// Filesystem-safe name for a captured source entry.
pub fn safe_name(raw: &str) -> String {
    let replaced = NON_SAFE.replace_all(raw.trim(), "_");
    let trimmed = replaced.trim_matches(|c| c == '_' || c == '.');
    let mut name: String = trimmed.chars().take(SAFE_NAME_MAX).collect();
    if name.is_empty() {
        name.push_str("source");
    }
    name
}

/// Check that `name` is a single, non-traversing path component (run and snapshot ids).
pub fn validate_component(kind: &str, name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err(format!("{kind} must not be empty"));
    }
    if name == "." || name == ".." {
        return Err(format!("{kind} `{name}` is not a valid name"));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(format!("{kind} `{name}` contains invalid character {bad:?}"));
    }
    Ok(())
}
