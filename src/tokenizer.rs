//! Line tokenizer
//!
//! Splits one log line into an ordered sequence of tokens. Tokens borrow from
//! the input line, so a sequence never outlives the line it was cut from and
//! nothing is copied until the clustering core decides to keep a value.

use crate::error::{ClusterError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::str::FromStr;

/// Most log lines have fewer than 16 tokens, so sequences live on the stack
pub type TokenSequence<'a> = SmallVec<[&'a str; 16]>;

/// How a line is cut into tokens. Empty tokens from repeated delimiters are always dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum DelimiterPolicy {
    /// Runs of Unicode whitespace
    Whitespace,
    /// A single delimiter character
    Char(char),
    /// Any of the listed characters
    AnyOf(String),
    /// Regex matching one delimiter run
    Regex(String),
}

impl Default for DelimiterPolicy {
    fn default() -> Self {
        DelimiterPolicy::Whitespace
    }
}

impl fmt::Display for DelimiterPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelimiterPolicy::Whitespace => write!(f, "whitespace"),
            DelimiterPolicy::Char(c) => write!(f, "char:{}", c),
            DelimiterPolicy::AnyOf(chars) => write!(f, "any:{}", chars),
            DelimiterPolicy::Regex(pattern) => write!(f, "regex:{}", pattern),
        }
    }
}

impl FromStr for DelimiterPolicy {
    type Err = ClusterError;

    /// Parses `whitespace`, `char:<c>`, `any:<chars>` or `regex:<pattern>`
    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("whitespace") {
            return Ok(DelimiterPolicy::Whitespace);
        }

        let (kind, value) = s.split_once(':').ok_or_else(|| {
            ClusterError::invalid_config("delimiter", format!("unrecognized delimiter: {}", s))
        })?;

        match kind {
            "char" => {
                let mut chars = value.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Ok(DelimiterPolicy::Char(c)),
                    _ => Err(ClusterError::invalid_config(
                        "delimiter",
                        format!("char delimiter must be exactly one character, got {:?}", value),
                    )),
                }
            }
            "any" if !value.is_empty() => Ok(DelimiterPolicy::AnyOf(value.to_string())),
            "regex" if !value.is_empty() => Ok(DelimiterPolicy::Regex(value.to_string())),
            _ => Err(ClusterError::invalid_config(
                "delimiter",
                format!("unrecognized delimiter: {}", s),
            )),
        }
    }
}

#[derive(Debug, Clone)]
enum Splitter {
    Whitespace,
    Byte(u8),
    Char(char),
    AnyOf(SmallVec<[char; 8]>),
    Regex(Regex),
}

/// Compiled delimiter policy
#[derive(Debug, Clone)]
pub struct Tokenizer {
    splitter: Splitter,
}

impl Tokenizer {
    pub fn new(policy: &DelimiterPolicy) -> Result<Self> {
        let splitter = match policy {
            DelimiterPolicy::Whitespace => Splitter::Whitespace,
            DelimiterPolicy::Char(c) if c.is_ascii() => Splitter::Byte(*c as u8),
            DelimiterPolicy::Char(c) => Splitter::Char(*c),
            DelimiterPolicy::AnyOf(chars) => Splitter::AnyOf(chars.chars().collect()),
            DelimiterPolicy::Regex(pattern) => Splitter::Regex(Regex::new(pattern)?),
        };
        Ok(Self { splitter })
    }

    pub fn whitespace() -> Self {
        Self {
            splitter: Splitter::Whitespace,
        }
    }

    /// Split a line into tokens, preserving order and discarding empty tokens
    pub fn tokenize<'a>(&self, line: &'a str) -> TokenSequence<'a> {
        match &self.splitter {
            Splitter::Whitespace => line.split_whitespace().collect(),
            Splitter::Byte(delim) => split_on_byte(line, *delim),
            Splitter::Char(delim) => line.split(*delim).filter(|t| !t.is_empty()).collect(),
            Splitter::AnyOf(delims) => line
                .split(|c: char| delims.contains(&c))
                .filter(|t| !t.is_empty())
                .collect(),
            Splitter::Regex(re) => re.split(line).filter(|t| !t.is_empty()).collect(),
        }
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::whitespace()
    }
}

/// memchr-driven split for ASCII delimiters
fn split_on_byte(line: &str, delim: u8) -> TokenSequence<'_> {
    let bytes = line.as_bytes();
    let mut tokens = TokenSequence::new();
    let mut start = 0;

    for pos in memchr::memchr_iter(delim, bytes) {
        if pos > start {
            // ASCII delimiter positions are always char boundaries
            tokens.push(&line[start..pos]);
        }
        start = pos + 1;
    }

    if start < line.len() {
        tokens.push(&line[start..]);
    }

    tokens
}

/// One-shot tokenization for callers that do not keep a compiled tokenizer
pub fn tokenize<'a>(line: &'a str, policy: &DelimiterPolicy) -> Result<TokenSequence<'a>> {
    Ok(Tokenizer::new(policy)?.tokenize(line))
}

/// Decode raw line bytes, stripping the trailing line terminator
pub fn decode_line(bytes: &[u8]) -> Result<&str> {
    let mut end = bytes.len();
    while end > 0 && matches!(bytes[end - 1], b'\n' | b'\r') {
        end -= 1;
    }

    std::str::from_utf8(&bytes[..end]).map_err(|e| ClusterError::MalformedInput {
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace_runs() {
        let tokenizer = Tokenizer::whitespace();
        let tokens = tokenizer.tokenize("  SSH   user1\tconnect \n");
        assert_eq!(tokens.as_slice(), &["SSH", "user1", "connect"]);
    }

    #[test]
    fn test_empty_line() {
        let tokenizer = Tokenizer::whitespace();
        assert!(tokenizer.tokenize("   ").is_empty());
        assert!(tokenizer.tokenize("").is_empty());
    }

    #[test]
    fn test_byte_delimiter_drops_empty_tokens() {
        let tokenizer = Tokenizer::new(&DelimiterPolicy::Char(',')).unwrap();
        let tokens = tokenizer.tokenize(",a,,b,c,");
        assert_eq!(tokens.as_slice(), &["a", "b", "c"]);
    }

    #[test]
    fn test_non_ascii_char_delimiter() {
        let tokenizer = Tokenizer::new(&DelimiterPolicy::Char('→')).unwrap();
        let tokens = tokenizer.tokenize("a→b→→c");
        assert_eq!(tokens.as_slice(), &["a", "b", "c"]);
    }

    #[test]
    fn test_any_of_delimiter() {
        let tokenizer = Tokenizer::new(&DelimiterPolicy::AnyOf("=; ".to_string())).unwrap();
        let tokens = tokenizer.tokenize("uid=0; rhost=10.0.0.1");
        assert_eq!(tokens.as_slice(), &["uid", "0", "rhost", "10.0.0.1"]);
    }

    #[test]
    fn test_regex_delimiter() {
        let tokenizer = Tokenizer::new(&DelimiterPolicy::Regex(r"[\s:]+".to_string())).unwrap();
        let tokens = tokenizer.tokenize("sshd[42]: session opened");
        assert_eq!(tokens.as_slice(), &["sshd[42]", "session", "opened"]);
    }

    #[test]
    fn test_invalid_regex_is_rejected() {
        let result = Tokenizer::new(&DelimiterPolicy::Regex("(".to_string()));
        assert!(matches!(result, Err(ClusterError::InvalidDelimiter(_))));
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(
            "whitespace".parse::<DelimiterPolicy>().unwrap(),
            DelimiterPolicy::Whitespace
        );
        assert_eq!(
            "char:|".parse::<DelimiterPolicy>().unwrap(),
            DelimiterPolicy::Char('|')
        );
        assert_eq!(
            "any:,;".parse::<DelimiterPolicy>().unwrap(),
            DelimiterPolicy::AnyOf(",;".to_string())
        );
        assert_eq!(
            r"regex:\s+".parse::<DelimiterPolicy>().unwrap(),
            DelimiterPolicy::Regex(r"\s+".to_string())
        );
        assert!("char:ab".parse::<DelimiterPolicy>().is_err());
        assert!("tabs".parse::<DelimiterPolicy>().is_err());

        let policy = DelimiterPolicy::AnyOf(",;".to_string());
        assert_eq!(policy.to_string().parse::<DelimiterPolicy>().unwrap(), policy);
    }

    #[test]
    fn test_decode_line() {
        assert_eq!(decode_line(b"SSH user1 connect\r\n").unwrap(), "SSH user1 connect");
        assert!(matches!(
            decode_line(&[0x53, 0xff, 0xfe]),
            Err(ClusterError::MalformedInput { .. })
        ));
    }
}
