//! Text helpers shared by the analysis pipeline and annotators.

use serde_json::Value;

/// Split text into sentences: after `.`, `!` or `?` followed by whitespace,
/// and at every line break. Empty pieces are dropped.
pub fn tokenize_sentences(text: &str) -> Vec<String> {
    let mut marked = String::with_capacity(text.len() + 16);
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        marked.push(c);
        if matches!(c, '.' | '!' | '?') && chars.peek().is_some_and(|n| n.is_whitespace()) {
            while chars.peek().is_some_and(|n| n.is_whitespace()) {
                chars.next();
            }
            marked.push('\n');
        }
    }

    marked
        .split('\n')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Parse model output as JSON, tolerating markdown fences and chatter around
/// a JSON array.
pub fn parse_json_response(response: &str) -> anyhow::Result<Value> {
    let cleaned = strip_fences(response.trim());

    match serde_json::from_str(cleaned) {
        Ok(value) => Ok(value),
        Err(e) => {
            let span = cleaned
                .find('[')
                .zip(cleaned.rfind(']'))
                .filter(|(start, end)| start < end)
                .map(|(start, end)| &cleaned[start..=end]);
            match span {
                Some(array) => Ok(serde_json::from_str(array)?),
                None => anyhow::bail!("Failed to parse LLM JSON: {}", e),
            }
        }
    }
}

fn strip_fences(text: &str) -> &str {
    let mut rest = text;
    if let Some(stripped) = rest.strip_prefix("```") {
        rest = stripped;
        if rest.get(..4).is_some_and(|tag| tag.eq_ignore_ascii_case("json")) {
            rest = &rest[4..];
        }
        rest = rest.trim_start();
    }
    if let Some(stripped) = rest.trim_end().strip_suffix("```") {
        rest = stripped.trim_end();
    }
    rest
}

/// First non-empty line, at most 80 characters, or `Untitled`.
pub fn infer_title(text: &str) -> String {
    let first = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let title: String = first.chars().take(80).collect();
    let title = title.trim();
    if title.is_empty() {
        "Untitled".to_string()
    } else {
        title.to_string()
    }
}

/// The first `max` characters of `text`.
pub fn head_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
