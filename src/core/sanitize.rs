// src/core/sanitize.rs

//! Text message validation and HTML stripping.

/// Why a text message was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextRejection {
    TooLong,
}

/// Validates a text message against the configured limits and, when HTML
/// is not allowed, reduces it to plain text. A limit of 0 disables that
/// check. Messages embedding a data URI are measured against the image
/// limit, everything else against the text limit.
pub fn clean_text_message(
    message: &str,
    allow_html: bool,
    max_text_len: usize,
    max_image_len: usize,
) -> Result<String, TextRejection> {
    let cleaned = if allow_html {
        message.to_string()
    } else {
        strip_tags(message)
    };

    let limit = if cleaned.contains("data:image") {
        max_image_len
    } else {
        max_text_len
    };
    if limit > 0 && cleaned.len() > limit {
        return Err(TextRejection::TooLong);
    }
    Ok(cleaned)
}

/// Removes every `<...>` span. Unterminated tags swallow the remainder of
/// the message rather than leaking markup.
fn strip_tags(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut in_tag = false;
    for ch in message.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}
