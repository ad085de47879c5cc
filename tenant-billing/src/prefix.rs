//! Tenant prefix generation and the `PREFIX_username` codec.

use std::future::Future;

use crate::error::{CoreError, Result};

pub const MIN_PREFIX_LEN: usize = 3;
pub const MAX_PREFIX_LEN: usize = 8;
const CHARS_PER_WORD: usize = 4;
const PAD_CHAR: char = 'X';
const MAX_SUFFIX: u32 = 999;
const MAX_USERNAME_LEN: usize = 64;

/// Outcome of splitting a login name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUsername {
    pub prefix: Option<String>,
    pub rest: String,
}

impl ParsedUsername {
    pub fn is_prefixed(&self) -> bool {
        self.prefix.is_some()
    }
}

/// `^[A-Z0-9]{3,8}$`
pub fn is_valid_prefix(candidate: &str) -> bool {
    (MIN_PREFIX_LEN..=MAX_PREFIX_LEN).contains(&candidate.len())
        && candidate
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// Letters, digits, `.`, `-` and `_`
pub fn is_valid_username(candidate: &str) -> bool {
    (1..=MAX_USERNAME_LEN).contains(&candidate.len())
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

fn normalized_words(name: &str) -> Vec<String> {
    name.split_whitespace()
        .map(|word| {
            word.chars()
                .filter(char::is_ascii_alphanumeric)
                .map(|c| c.to_ascii_uppercase())
                .collect::<String>()
        })
        .filter(|word| !word.is_empty())
        .collect()
}

/// Deterministic 3-8 character code for an organization name.
///
/// Takes up to four characters from each word in order until eight characters
/// are collected, then pads short results with `X`.
pub fn generate_prefix(name: &str) -> String {
    let mut prefix = String::with_capacity(MAX_PREFIX_LEN);
    for word in normalized_words(name) {
        if prefix.len() >= MAX_PREFIX_LEN {
            break;
        }
        prefix.extend(word.chars().take(CHARS_PER_WORD));
    }
    prefix.truncate(MAX_PREFIX_LEN);
    while prefix.len() < MIN_PREFIX_LEN {
        prefix.push(PAD_CHAR);
    }
    prefix
}

/// Generates a prefix and probes `exists` until a free one is found.
///
/// On collision a numeric suffix `1..=999` is appended, truncating the base so
/// the result stays within eight characters.
pub async fn ensure_unique_prefix<F, Fut>(name: &str, mut exists: F) -> Result<String>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let base = generate_prefix(name);
    if !exists(base.clone()).await? {
        return Ok(base);
    }

    for n in 1..=MAX_SUFFIX {
        let suffix = n.to_string();
        let keep = MAX_PREFIX_LEN - suffix.len();
        let candidate = format!("{}{}", &base[..base.len().min(keep)], suffix);
        if !exists(candidate.clone()).await? {
            return Ok(candidate);
        }
    }
    Err(CoreError::PrefixExhausted { base })
}

/// Splits on the first `_`; the left part counts as a prefix only if it is a valid prefix code
pub fn parse(username: &str) -> ParsedUsername {
    if let Some((head, tail)) = username.split_once('_') {
        if is_valid_prefix(head) && !tail.is_empty() {
            return ParsedUsername {
                prefix: Some(head.to_string()),
                rest: tail.to_string(),
            };
        }
    }
    ParsedUsername {
        prefix: None,
        rest: username.to_string(),
    }
}

pub fn encode(prefix: &str, rest: &str) -> Result<String> {
    if !is_valid_prefix(prefix) {
        return Err(CoreError::validation(format!("invalid tenant prefix '{prefix}'")));
    }
    if !is_valid_username(rest) {
        return Err(CoreError::validation(format!("invalid username '{rest}'")));
    }
    Ok(format!("{prefix}_{rest}"))
}
