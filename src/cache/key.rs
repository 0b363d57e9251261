//! Cache key derivation.
//!
//! A request target is parsed once into a [`RequestTarget`]. Its resolved
//! path drives the cache rules and the upstream URL; its canonical form
//! (skip-listed query parameters dropped, the rest sorted by name) is then
//! digested into a fixed-length hex string. Method and headers never take
//! part in the key.

use std::collections::HashSet;
use std::fmt;

use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

/// Placeholder base used to resolve origin-form request targets (`/path?q`).
const PLACEHOLDER_BASE: &str = "http://cachegate.invalid/";

/// Errors raised while normalizing a request target.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid request URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("request URL {url:?} {reason}")]
    Rejected { url: String, reason: &'static str },
}

/// A request target resolved into the path and query the proxy acts on.
///
/// Dot segments (including percent-encoded ones) are removed from the path.
/// Origin-form targets must not smuggle in an authority (`//host/...`), and
/// absolute-form targets must use `http` or `https`.
///
/// # Examples
///
/// ```
/// use cachegate::cache::key::RequestTarget;
///
/// let target = RequestTarget::parse("/assets/../api/data?x=1").unwrap();
/// assert_eq!(target.path(), "/api/data");
/// assert_eq!(target.query(), Some("x=1"));
/// assert!(RequestTarget::parse("//elsewhere.example/api").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    path: String,
    query: Option<String>,
}

impl RequestTarget {
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let invalid = |source| KeyError::InvalidUrl {
            url: raw.to_owned(),
            source,
        };
        let rejected = |reason| KeyError::Rejected {
            url: raw.to_owned(),
            reason,
        };

        let parsed = if raw.starts_with('/') {
            let base = Url::parse(PLACEHOLDER_BASE).map_err(invalid)?;
            let resolved = base.join(raw).map_err(invalid)?;
            if resolved.host_str() != base.host_str()
                || resolved.port() != base.port()
                || !resolved.username().is_empty()
                || resolved.password().is_some()
            {
                return Err(rejected("names an authority in origin form"));
            }
            resolved
        } else {
            let parsed = Url::parse(raw).map_err(invalid)?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(rejected("does not use http or https"));
            }
            parsed
        };

        Ok(Self {
            path: parsed.path().to_owned(),
            query: parsed.query().map(str::to_owned),
        })
    }

    /// The resolved path, always starting with `/`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The query as received (percent-encoded, without `?`).
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// The canonical `path?query` string the cache key is digested from.
    pub fn canonical(&self, skip_params: &HashSet<String>) -> String {
        let query = self.query.as_deref().unwrap_or_default();
        let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
            .filter(|(name, _)| !skip_params.contains(name.as_ref()))
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));

        let mut canonical = self.path.clone();
        if !pairs.is_empty() {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish();
            canonical.push('?');
            canonical.push_str(&query);
        }
        canonical
    }
}

/// A hex-encoded SHA-256 digest of a normalized request target.
///
/// # Examples
///
/// ```
/// use cachegate::cache::key::derive_key;
///
/// let key = derive_key("/assets/logo.png");
/// assert_eq!(key.as_str().len(), 64);
/// assert_eq!(key, derive_key("/assets/logo.png"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Length of every key in hex characters.
    pub const LEN: usize = 64;

    /// Rebuilds a key from its stored form, rejecting anything that is not
    /// 64 lowercase hex characters.
    pub fn from_stored(raw: &[u8]) -> Option<Self> {
        let valid = raw.len() == Self::LEN
            && raw
                .iter()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b));
        valid.then(|| Self(String::from_utf8_lossy(raw).into_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produces the canonical form of a request target.
///
/// `raw` may be origin-form (`/path?query`) or absolute (`http://host/path`);
/// only the path and query survive. Every query parameter named in
/// `skip_params` is removed, the remaining pairs are stably sorted by name
/// (values of a repeated name keep their relative order) and re-encoded as
/// `application/x-www-form-urlencoded`. An empty query is omitted entirely.
///
/// # Errors
///
/// Returns a [`KeyError`] if `raw` is not a target [`RequestTarget::parse`]
/// accepts.
///
/// # Examples
///
/// ```
/// use std::collections::HashSet;
/// use cachegate::cache::key::normalize;
///
/// let skip: HashSet<String> = ["utm_source".to_owned()].into();
/// let canonical = normalize("/list?b=2&utm_source=x&a=1", &skip).unwrap();
/// assert_eq!(canonical, "/list?a=1&b=2");
/// ```
pub fn normalize(raw: &str, skip_params: &HashSet<String>) -> Result<String, KeyError> {
    Ok(RequestTarget::parse(raw)?.canonical(skip_params))
}

/// Digests a canonical target into a [`CacheKey`]. Pure and deterministic.
pub fn derive_key(canonical: &str) -> CacheKey {
    CacheKey(hex::encode(Sha256::digest(canonical.as_bytes())))
}
