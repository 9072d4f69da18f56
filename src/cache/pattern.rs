//! Glob-style key patterns for `delete_pattern`.
//!
//! `*` matches any run of characters (including none), `?` exactly one,
//! `[abc]`, `[a-z]` and `[!a-z]` (or `[^a-z]`) one character from (or not
//! from) a set. An unterminated `[` is literal, as is everything else.

use regex::Regex;

use crate::error::{CacheError, Result};

/// Compile a glob into an anchored regex.
pub fn glob_to_regex(glob: &str) -> Result<Regex> {
    let chars: Vec<char> = glob.chars().collect();
    let mut expr = String::with_capacity(glob.len() + 8);
    expr.push('^');
    let mut literal = String::new();
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        let token = match ch {
            '*' => Some(".*".to_string()),
            '?' => Some(".".to_string()),
            '[' => class(&chars[i + 1..]).map(|(class, consumed)| {
                i += consumed;
                class
            }),
            _ => None,
        };
        match token {
            Some(token) => {
                expr.push_str(&regex::escape(&literal));
                literal.clear();
                expr.push_str(&token);
            }
            None => literal.push(ch),
        }
        i += 1;
    }
    expr.push_str(&regex::escape(&literal));
    expr.push('$');

    Regex::new(&expr)
        .map_err(|e| CacheError::InvalidConfiguration(format!("bad pattern {glob:?}: {e}")))
}

/// Translate the body of a bracket expression starting after `[`.
///
/// Returns the regex class and how many characters it consumed, including the
/// closing `]`; `None` when the bracket is never closed or is empty.
fn class(rest: &[char]) -> Option<(String, usize)> {
    let (negated, start) = match rest.first() {
        Some('!') | Some('^') => (true, 1),
        _ => (false, 0),
    };
    let close = start + rest[start..].iter().position(|&c| c == ']')?;
    if close == start {
        return None;
    }

    let mut class = String::from(if negated { "[^" } else { "[" });
    for &c in &rest[start..close] {
        match c {
            '-' => class.push('-'),
            '\\' | '[' | ']' | '^' | '&' | '~' => {
                class.push('\\');
                class.push(c);
            }
            other => class.push(other),
        }
    }
    class.push(']');
    Some((class, close + 1))
}
