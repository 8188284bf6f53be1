//! Filename components built from user-supplied identifiers.

/// Characters rejected by at least one common filesystem.
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Make `input` safe to embed in a filename.
///
/// Control and reserved characters become `_` (runs collapse to one), leading
/// and trailing dots or spaces are trimmed so the result can never name a
/// parent directory, and an empty result becomes `"unnamed"`.
pub fn sanitize_filename(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut replaced = false;

    for c in input.chars() {
        if c.is_control() || INVALID_CHARS.contains(&c) {
            if !replaced {
                result.push('_');
                replaced = true;
            }
        } else {
            result.push(c);
            replaced = false;
        }
    }

    let trimmed = result.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}
