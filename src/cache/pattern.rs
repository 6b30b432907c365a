//! Glob key patterns
//!
//! The syntax is the one Redis `SCAN MATCH` understands, so a pattern means
//! the same thing against both tiers:
//!
//! - `*` matches any run of characters, `?` exactly one
//! - `[abc]`, `[a-z]` and `[^abc]` match one character from (or outside) a set
//! - `\x` matches `x` literally, inside or outside a set
//!
//! Everything else is literal. Unterminated or empty sets are rejected.

use std::iter::Peekable;
use std::str::Chars;

use regex::Regex;

use crate::error::{Error, Result};

/// Compiled glob pattern over cache keys
#[derive(Debug, Clone)]
pub struct KeyPattern {
    glob: String,
    regex: Regex,
}

fn invalid(glob: &str, reason: &str) -> Error {
    Error::InvalidOptions(format!("invalid key pattern '{glob}': {reason}"))
}

fn push_literal(source: &mut String, ch: char) {
    source.push_str(&regex::escape(ch.encode_utf8(&mut [0; 4])));
}

/// Translate the body of a `[...]` set; the opening bracket is consumed
fn translate_set(glob: &str, chars: &mut Peekable<Chars<'_>>, source: &mut String) -> Result<()> {
    source.push('[');
    if chars.next_if_eq(&'^').is_some() {
        source.push('^');
    }

    let mut empty = true;
    loop {
        let ch = chars.next().ok_or_else(|| invalid(glob, "unterminated '['"))?;
        let start = match ch {
            ']' => break,
            '\\' => chars.next().ok_or_else(|| invalid(glob, "unterminated '['"))?,
            other => other,
        };
        empty = false;

        let mut lookahead = chars.clone();
        match (lookahead.next(), lookahead.next()) {
            (Some('-'), Some(end)) if end != ']' => {
                chars.next();
                chars.next();
                // Redis accepts reversed ranges
                let (low, high) = if start <= end { (start, end) } else { (end, start) };
                push_literal(source, low);
                source.push('-');
                push_literal(source, high);
            }
            _ => push_literal(source, start),
        }
    }

    if empty {
        return Err(invalid(glob, "empty '[]'"));
    }
    source.push(']');
    Ok(())
}

impl KeyPattern {
    /// Compile a glob
    pub fn new(glob: impl Into<String>) -> Result<Self> {
        let glob = glob.into();
        if glob.is_empty() {
            return Err(Error::InvalidOptions("key pattern must not be empty".into()));
        }

        // `?` and `*` cross newlines in Redis
        let mut source = String::with_capacity(glob.len() * 2 + 8);
        source.push_str("(?s)^");
        let mut chars = glob.chars().peekable();
        while let Some(ch) = chars.next() {
            match ch {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                '[' => translate_set(&glob, &mut chars, &mut source)?,
                // A trailing backslash is itself literal
                '\\' => push_literal(&mut source, chars.next().unwrap_or('\\')),
                other => push_literal(&mut source, other),
            }
        }
        source.push('$');

        let regex = Regex::new(&source).map_err(|e| invalid(&glob, &e.to_string()))?;

        Ok(Self { glob, regex })
    }

    /// Whether `key` matches
    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    /// The glob text, for forwarding to the remote store
    pub fn as_glob(&self) -> &str {
        &self.glob
    }

    /// Glob text with special characters escaped, for literal prefixes
    pub fn escape_literal(text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for ch in text.chars() {
            if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
                out.push('\\');
            }
            out.push(ch);
        }
        out
    }
}
