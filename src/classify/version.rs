//! Version strings derived from directory and container names.

use once_cell::sync::Lazy;
use regex::Regex;

static DATE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{8}").unwrap());
static TRIPLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+\.\d+\.\d+").unwrap());
static PAIR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+\.\d+").unwrap());

/// Fallback version for images whose own location carries none.
///
/// `refplat-20241016-fcs` yields `20241016`, `refplat-2.8.0-supplemental`
/// yields `2.8.0`.
pub fn container_version(container: &str) -> String {
    let cleaned = container.replace("refplat-", "");
    [&DATE_RUN, &TRIPLE, &PAIR]
        .into_iter()
        .find_map(|re| re.find(&cleaned))
        .map(|m| m.as_str().to_string())
        .unwrap_or(cleaned)
}

/// Parent directory name minus its first `_`-separated token.
pub fn parent_dir_version(dir: &str) -> Option<&str> {
    let (_, rest) = dir.split_once('_')?;
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}
