use regex::{Regex, RegexBuilder};
use thiserror::Error;
use tracing::warn;

/// A case-insensitive regular expression matched anywhere in a value.
#[derive(Debug, Clone)]
pub struct Matcher {
    pattern: String,
    regex: Regex,
}

impl Matcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// Ordered-subsequence matcher: `abc` matches `fooabc` and `11a11b11c11`
    /// but not `cab`.
    pub fn fuzzy(query: &str) -> Result<Self, regex::Error> {
        let mut pattern = String::with_capacity(query.len() * 4 + 2);
        pattern.push_str(".*");
        for ch in query.chars().filter(|ch| !ch.is_whitespace()) {
            pattern.push_str(&regex::escape(ch.encode_utf8(&mut [0u8; 4])));
            pattern.push_str(".*");
        }
        let regex = RegexBuilder::new(&pattern).case_insensitive(true).build()?;
        Ok(Self {
            pattern: query.to_string(),
            regex,
        })
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchFailure {
    #[error("blacklist \"{0}\"")]
    Blacklisted(String),
    #[error("not matched by any whitelist pattern")]
    NotWhitelisted,
}

/// Whitelist/blacklist filter over paths or names.
#[derive(Debug, Clone, Default)]
pub struct GroupMatch {
    whitelist: Vec<Matcher>,
    blacklist: Vec<Matcher>,
}

impl GroupMatch {
    /// Patterns that fail to compile are logged and left out.
    pub fn new<S: AsRef<str>>(whitelist: &[S], blacklist: &[S]) -> Self {
        Self {
            whitelist: compile_all(whitelist),
            blacklist: compile_all(blacklist),
        }
    }

    /// A blacklist hit rejects the value outright. Otherwise the value must
    /// match some whitelist pattern, and an empty whitelist admits everything.
    pub fn check(&self, value: &str) -> Result<(), MatchFailure> {
        if let Some(hit) = self.blacklist.iter().find(|m| m.is_match(value)) {
            return Err(MatchFailure::Blacklisted(hit.pattern.clone()));
        }
        if self.whitelist.is_empty() || self.whitelist.iter().any(|m| m.is_match(value)) {
            return Ok(());
        }
        Err(MatchFailure::NotWhitelisted)
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.check(value).is_ok()
    }
}

fn compile_all<S: AsRef<str>>(patterns: &[S]) -> Vec<Matcher> {
    patterns
        .iter()
        .filter_map(|pattern| match Matcher::new(pattern.as_ref()) {
            Ok(matcher) => Some(matcher),
            Err(err) => {
                warn!(pattern = pattern.as_ref(), "invalid match pattern: {err}");
                None
            }
        })
        .collect()
}
