//! Redis-style glob patterns for channel subscriptions.
//!
//! Supports `*`, `?`, character classes (`[abc]`, `[a-z]`, `[^a]`) and `\`
//! escapes, matching the way `PSUBSCRIBE` interprets its argument.

use regex::Regex;

use crate::error::{FetchError, FetchResult};

/// A compiled channel pattern
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> FetchResult<Self> {
        let translated = translate(pattern);
        let regex = Regex::new(&translated).map_err(|e| {
            FetchError::configuration("subscribe_pattern", format!("invalid pattern {pattern:?}: {e}"))
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, channel: &str) -> bool {
        self.regex.is_match(channel)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn translate(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("(?s)^");
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' if i + 1 < chars.len() => {
                i += 1;
                out.push_str(&regex::escape(&chars[i].to_string()));
            }
            '[' => match class_end(&chars, i) {
                Some(end) => {
                    out.push_str(&translate_class(&chars[i + 1..end]));
                    i = end;
                }
                // Unterminated class, match the bracket literally
                None => out.push_str(r"\["),
            },
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    out.push('$');
    out
}

fn class_end(chars: &[char], start: usize) -> Option<usize> {
    let mut i = start + 1;
    if chars.get(i) == Some(&'^') {
        i += 1;
    }
    // A leading ']' is a member, not the terminator
    if chars.get(i) == Some(&']') {
        i += 1;
    }
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            ']' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

fn translate_class(body: &[char]) -> String {
    let mut out = String::from("[");
    let mut i = 0;
    if body.first() == Some(&'^') {
        out.push('^');
        i = 1;
    }
    while i < body.len() {
        match body[i] {
            '\\' if i + 1 < body.len() => {
                i += 1;
                out.push_str(&regex::escape(&body[i].to_string()));
            }
            '-' if i > 0 && i + 1 < body.len() => out.push('-'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    out.push(']');
    out
}
