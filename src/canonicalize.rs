//! Cleanup of untrusted generated text and canonical forms for hashing.
//!
//! Generated replies, posts, and SQL arrive wrapped in whatever the model
//! felt like: code fences, JSON envelopes, stray quotes, escaped newlines.
//! Everything here is best-effort and never fails; an empty result means the
//! caller should skip the unit of work.
//!
//! # Pipeline (`clean_generated_text`)
//!
//! 1. **Unicode NFC normalization**
//! 2. **Code-fence stripping** - drops ```` ``` ```` / ```` ```json ```` wrappers
//! 3. **JSON unwrapping** - `{"text": ...}` (or `content`, `message`, `response`)
//! 4. **Quote stripping** - one layer of matching surrounding quotes
//! 5. **Newline unescaping** - literal `\n` becomes a line break

use once_cell::sync::Lazy;
use regex::Regex;
use ring::digest::{self, SHA256};
use unicode_normalization::UnicodeNormalization;

/// Keys checked, in order, when generated text is a JSON object.
const JSON_TEXT_KEYS: &[&str] = &["text", "content", "message", "response"];

static MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@[A-Za-z0-9_]{1,15}").expect("valid mention regex"));

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://\S+").expect("valid url regex"));

/// Compute SHA256 hash of text.
#[must_use]
pub fn content_hash(text: &str) -> [u8; 32] {
    let digest = digest::digest(&SHA256, text.as_bytes());
    let mut hash = [0u8; 32];
    hash.copy_from_slice(digest.as_ref());
    hash
}

/// Compute SHA256 hash and return as hex string.
#[must_use]
pub fn content_hash_hex(text: &str) -> String {
    let hash = content_hash(text);
    hex_encode(&hash)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

/// Clean generated post or reply text.
#[must_use]
pub fn clean_generated_text(raw: &str) -> String {
    let normalized: String = raw.nfc().collect();
    let unfenced = strip_code_fences(&normalized);
    let unwrapped = unwrap_json_text(&unfenced).unwrap_or(unfenced);
    let unquoted = strip_surrounding_quotes(unwrapped.trim());
    unquoted.replace("\\n", "\n").trim().to_string()
}

/// Remove a leading ```` ```lang ```` line and a trailing ```` ``` ````.
fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };

    // Drop the language tag on the opening line, if any.
    let body = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric()),
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
        .to_string()
}

fn unwrap_json_text(text: &str) -> Option<String> {
    if !text.starts_with('{') {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let object = value.as_object()?;
    JSON_TEXT_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(serde_json::Value::as_str))
        .map(str::to_string)
}

fn strip_surrounding_quotes(text: &str) -> &str {
    for quote in ['"', '\'', '“'] {
        let close = if quote == '“' { '”' } else { quote };
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(close) {
            return &text[quote.len_utf8()..text.len() - close.len_utf8()];
        }
    }
    text
}

/// Truncate to the last complete sentence that fits in `max_chars`.
///
/// Falls back to the last word boundary plus an ellipsis, then to a hard cut.
#[must_use]
pub fn truncate_to_complete_sentence(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let prefix: String = text.chars().take(max_chars).collect();
    if let Some(end) = prefix.rfind(['.', '!', '?']) {
        let sentence = prefix[..=end].trim();
        if !sentence.is_empty() {
            return sentence.to_string();
        }
    }

    let budget = max_chars.saturating_sub(3);
    let shorter: String = text.chars().take(budget).collect();
    if let Some(space) = shorter.rfind(' ') {
        if space > 0 {
            return format!("{}...", shorter[..space].trim_end());
        }
    }
    format!("{shorter}...")
}

/// Normalize whitespace: collapse runs, trim edges.
#[must_use]
pub fn normalize_whitespace(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut prev_whitespace = true;

    for c in text.chars() {
        if c.is_whitespace() {
            if !prev_whitespace {
                result.push(' ');
                prev_whitespace = true;
            }
        } else {
            result.push(c);
            prev_whitespace = false;
        }
    }

    result.trim_end().to_string()
}

/// Strip wrapping from generated SQL. The result is still untrusted.
#[must_use]
pub fn sanitize_generated_sql(raw: &str) -> String {
    let unfenced = strip_code_fences(raw);
    let unticked = unfenced.replace('`', "");
    unticked
        .trim()
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace())
        .to_string()
}

/// Cache key for a SQL statement; whitespace differences hash the same.
#[must_use]
pub fn sql_cache_key(sql: &str) -> String {
    content_hash_hex(&normalize_whitespace(sql))
}

/// Remove @mentions and links, leaving the words a user actually typed.
#[must_use]
pub fn strip_mentions_and_links(text: &str) -> String {
    let without_urls = URL_RE.replace_all(text, " ");
    let without_mentions = MENTION_RE.replace_all(&without_urls, " ");
    normalize_whitespace(&without_mentions)
}
