/// Convert HTML to plain text. If the input doesn't look like HTML, return it as-is.
pub fn strip_html(text: &str) -> String {
    if !text.contains('<') && !text.contains('&') {
        return text.to_string();
    }
    html2text::from_read(text.as_bytes(), 200).unwrap_or_else(|_| text.to_string())
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strip tags, decode entities and collapse whitespace.
pub fn normalize(text: &str) -> String {
    collapse_whitespace(&strip_html(text))
}

/// Shorten `text` to at most `max_chars` characters, preferring a word boundary.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let cut: String = text.chars().take(max_chars).collect();
    let shortened = match cut.rfind(char::is_whitespace) {
        Some(idx) if idx > cut.len() / 2 => &cut[..idx],
        _ => cut.as_str(),
    };
    format!("{}...", shortened.trim_end())
}
