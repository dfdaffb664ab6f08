//! Prompt templating and conclusion extraction.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex"));

/// Substitute `{name}` placeholders from `values`.
///
/// Unknown placeholders are left as written so literal braces in prompts
/// (code samples, JSON) survive.
pub fn fill(template: &str, values: &BTreeMap<&str, String>) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures<'_>| {
            values
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Whether `content` carries the termination marker.
pub fn contains_marker(content: &str, marker: &str) -> bool {
    content.contains(marker)
}

/// Text after the last marker, trimmed; the whole message when no marker is present.
pub fn conclusion(message: &str, marker: &str) -> String {
    if marker.is_empty() {
        return message.trim().to_string();
    }
    match message.rfind(marker) {
        Some(pos) => message[pos + marker.len()..].trim().to_string(),
        None => message.trim().to_string(),
    }
}
