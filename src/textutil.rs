//! UTF-8-safe truncation helpers.
//!
//! Result payloads, previews and error bodies are all bounded by character
//! count. Slicing by byte offset can panic inside a multi-byte character, so
//! every cut goes through these helpers.

/// Truncate by characters and append `suffix` when truncation occurs.
pub fn truncate_with_suffix_by_chars(text: &str, max_chars: usize, suffix: &str) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let prefix: String = text.chars().take(max_chars).collect();
    format!("{prefix}{suffix}")
}

/// Return the last `max_chars` characters of `text`.
pub fn tail_by_chars(text: &str, max_chars: usize) -> &str {
    let total = text.chars().count();
    if total <= max_chars {
        return text;
    }
    let skip = total - max_chars;
    match text.char_indices().nth(skip) {
        Some((offset, _)) => &text[offset..],
        None => "",
    }
}

/// Flatten newlines and truncate for single-line previews.
pub fn preview_line(text: &str, max_chars: usize) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    truncate_with_suffix_by_chars(flat.trim(), max_chars, "...")
}
