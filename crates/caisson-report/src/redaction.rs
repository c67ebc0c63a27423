use std::collections::BTreeSet;

const MARKER: &str = "[REDACTED]";
const MIN_REDACTED_CHARS: usize = 3;

/// Replace every sensitive value in `text` with a marker.
///
/// Longer values go first so a value that contains another is never left
/// half-masked. Values shorter than three characters are ignored.
#[must_use]
pub fn redact_sensitive(text: &str, sensitive_values: &BTreeSet<String>) -> String {
    let mut values: Vec<&str> = sensitive_values
        .iter()
        .map(String::as_str)
        .filter(|value| value.chars().count() >= MIN_REDACTED_CHARS)
        .collect();
    values.sort_by(|left, right| right.len().cmp(&left.len()).then_with(|| left.cmp(right)));

    values
        .into_iter()
        .fold(text.to_string(), |redacted, value| redacted.replace(value, MARKER))
}
