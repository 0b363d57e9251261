//! Path-based cache eligibility.
//!
//! A rule is either an exact path (`/robots.txt`) or a prefix wildcard
//! (`/assets/*`, which matches every path starting with `/assets`).

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

/// Errors raised while parsing a path pattern.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("cache pattern must not be empty")]
    Empty,

    #[error("cache pattern {0:?} must start with '/'")]
    NotAbsolute(String),

    #[error("cache pattern {0:?} may only use '*' as a trailing \"/*\"")]
    MisplacedWildcard(String),
}

/// One cache-eligibility rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheRule {
    /// Matches a single path by string equality.
    Exact(String),
    /// Matches every path that starts with the stored prefix.
    Prefix(String),
}

impl CacheRule {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(p) => path == p,
            Self::Prefix(prefix) => path.starts_with(prefix.as_str()),
        }
    }
}

impl FromStr for CacheRule {
    type Err = RuleError;

    fn from_str(pattern: &str) -> Result<Self, Self::Err> {
        if pattern.is_empty() {
            return Err(RuleError::Empty);
        }
        if !pattern.starts_with('/') {
            return Err(RuleError::NotAbsolute(pattern.to_owned()));
        }
        match pattern.strip_suffix("/*") {
            Some(prefix) if !prefix.contains('*') => Ok(Self::Prefix(prefix.to_owned())),
            Some(_) => Err(RuleError::MisplacedWildcard(pattern.to_owned())),
            None if pattern.contains('*') => {
                Err(RuleError::MisplacedWildcard(pattern.to_owned()))
            }
            None => Ok(Self::Exact(pattern.to_owned())),
        }
    }
}

impl fmt::Display for CacheRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(p) => f.write_str(p),
            Self::Prefix(p) => write!(f, "{p}/*"),
        }
    }
}

/// Ordered list of [`CacheRule`]s, evaluated first-match.
///
/// # Examples
///
/// ```
/// use cachegate::cache::rules::CacheRuleSet;
///
/// let rules = CacheRuleSet::parse(["/assets/*", "/exact"]).unwrap();
/// assert!(rules.is_cacheable("/assets/logo.png"));
/// assert!(rules.is_cacheable("/exact"));
/// assert!(!rules.is_cacheable("/api/data"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<String>")]
pub struct CacheRuleSet {
    rules: Vec<CacheRule>,
}

impl CacheRuleSet {
    /// Parses every pattern, failing on the first malformed one.
    pub fn parse<I, S>(patterns: I) -> Result<Self, RuleError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rules = patterns
            .into_iter()
            .map(|p| p.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Returns the first rule matching `path`, if any.
    pub fn first_match(&self, path: &str) -> Option<&CacheRule> {
        self.rules.iter().find(|rule| rule.matches(path))
    }

    pub fn is_cacheable(&self, path: &str) -> bool {
        self.first_match(path).is_some()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CacheRule> {
        self.rules.iter()
    }
}

impl TryFrom<Vec<String>> for CacheRuleSet {
    type Error = RuleError;

    fn try_from(patterns: Vec<String>) -> Result<Self, Self::Error> {
        Self::parse(patterns)
    }
}

/// Matches `path` against raw pattern strings without building a rule set.
///
/// Patterns ending in `/*` are prefix rules, anything else must match exactly.
pub fn is_cacheable<S: AsRef<str>>(path: &str, patterns: &[S]) -> bool {
    patterns.iter().any(|pattern| {
        let pattern = pattern.as_ref();
        match pattern.strip_suffix("/*") {
            Some(prefix) => path.starts_with(prefix),
            None => path == pattern,
        }
    })
}
