//! Release tag normalisation and ordering.

use std::cmp::Ordering;

/// Strip a leading `v` and validate against `^[0-9][0-9A-Za-z._-]*$`.
pub fn normalize_tag(tag: &str) -> Option<String> {
    let tag = tag.trim();
    let tag = tag
        .strip_prefix('v')
        .or_else(|| tag.strip_prefix('V'))
        .unwrap_or(tag);
    let mut chars = tag.chars();
    let first = chars.next()?;
    if !first.is_ascii_digit() {
        return None;
    }
    if chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
        Some(tag.to_string())
    } else {
        None
    }
}

/// Whether `tag` can take part in a version comparison.
pub fn is_version_tag(tag: &str) -> bool {
    normalize_tag(tag).is_some()
}

/// Leading digits of a segment as an integer, `0` when there are none.
fn segment_value(segment: &str) -> u64 {
    let digits: String = segment.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

/// Compare dotted versions component-wise; missing components count as 0.
///
/// Tags that are not version-like compare equal only when identical and
/// otherwise order lexically, so callers get a stable answer either way.
pub fn compare_version_tags(a: &str, b: &str) -> Ordering {
    let (Some(a), Some(b)) = (normalize_tag(a), normalize_tag(b)) else {
        return a.trim().cmp(b.trim());
    };
    let left: Vec<u64> = a.split('.').map(segment_value).collect();
    let right: Vec<u64> = b.split('.').map(segment_value).collect();
    let len = left.len().max(right.len());
    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Whether `latest` should be offered over `current`.
///
/// A non-version current tag (`latest`, `dev`, ...) degrades to a plain
/// inequality check.
pub fn is_update_available(current: Option<&str>, latest: &str) -> bool {
    match current {
        Some(current) if is_version_tag(current) => {
            compare_version_tags(latest, current) == Ordering::Greater
        }
        Some(current) => current.trim() != latest.trim(),
        None => true,
    }
}

/// Highest version among `tags`, ignoring `latest`, `sha-*` and non-versions.
pub fn pick_latest<'a, I>(tags: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    tags.into_iter()
        .map(str::trim)
        .filter(|t| !t.eq_ignore_ascii_case("latest") && !t.starts_with("sha-"))
        .filter(|t| is_version_tag(t))
        .max_by(|a, b| compare_version_tags(a, b))
        .map(str::to_string)
}
