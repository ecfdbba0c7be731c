//! Helper functions for message content.

use std::time::SystemTime;

use uuid::Uuid;

/// Why a message body was refused before rate limiting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentRejection {
    /// Empty or whitespace-only; dropped without telling the client
    Empty,
    TooLong { length: usize, max: usize },
}

/// Check a raw message body. Length is counted in characters on the raw
/// payload; the returned text is trimmed.
pub fn validate_content(raw: &str, max_len: usize) -> Result<&str, ContentRejection> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ContentRejection::Empty);
    }

    let length = raw.chars().count();
    if length > max_len {
        return Err(ContentRejection::TooLong {
            length,
            max: max_len,
        });
    }

    Ok(trimmed)
}

/// Encode HTML-significant characters as entities.
pub fn sanitize_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '`' => out.push_str("&#x60;"),
            _ => out.push(c),
        }
    }
    out
}

/// Get current Unix timestamp.
pub fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Generate unique message ID.
pub fn generate_msg_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}
