//! The persisted cache record.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// A cached origin response.
///
/// Stored as JSON: `{ "payload": [..], "headers": {..}, "expires_at": {..} }`.
/// Header names are lowercase and repeated fields are already joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub expires_at: SystemTime,
}

impl CacheEntry {
    /// Builds an entry that expires `ttl` after `created_at`.
    pub fn new(
        payload: impl Into<Vec<u8>>,
        headers: BTreeMap<String, String>,
        created_at: SystemTime,
        ttl: Duration,
    ) -> Self {
        Self {
            payload: payload.into(),
            headers,
            expires_at: created_at + ttl,
        }
    }

    /// `true` while `now` is strictly before the expiry instant.
    pub fn is_fresh_at(&self, now: SystemTime) -> bool {
        now < self.expires_at
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        !self.is_fresh_at(now)
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(created_at: SystemTime, ttl: Duration) -> CacheEntry {
        let headers = BTreeMap::from([
            ("content-type".to_owned(), "text/css".to_owned()),
            ("etag".to_owned(), "\"v1\"".to_owned()),
        ]);
        CacheEntry::new(&b"body{color:red}"[..], headers, created_at, ttl)
    }

    #[test]
    fn expiry_is_creation_plus_ttl() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let entry = sample(t0, Duration::from_secs(5));
        assert_eq!(entry.expires_at, t0 + Duration::from_secs(5));
    }

    #[test]
    fn freshness_window() {
        let t0 = SystemTime::now();
        let entry = sample(t0, Duration::from_secs(5));
        assert!(entry.is_fresh_at(t0 + Duration::from_secs(2)));
        assert!(entry.is_expired_at(t0 + Duration::from_secs(5)));
        assert!(entry.is_expired_at(t0 + Duration::from_secs(6)));
    }

    #[test]
    fn survives_encoding() {
        let entry = sample(SystemTime::now(), Duration::from_secs(60));
        let decoded = CacheEntry::decode(&entry.encode().unwrap()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(CacheEntry::decode(b"\x00\x01not json").is_err());
        assert!(CacheEntry::decode(br#"{"payload":[1,2]}"#).is_err());
    }
}
