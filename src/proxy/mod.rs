//! The cache-aside request pipeline.
//!
//! For each inbound request [`ProxyHandler`]:
//!
//! 1. normalizes the target and derives a [`CacheKey`];
//! 2. for cacheable `GET`s, serves a fresh stored entry without contacting
//!    the origin;
//! 3. otherwise forwards to the origin, buffers the reply, stores it when
//!    eligible, and returns it.
//!
//! Caching is best effort: store failures are logged and counted but never
//! change what the client receives.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheKey, CacheStore, RequestTarget, derive_key};
use crate::config::ProxyConfig;
use crate::http::{Method, Request, Response, StatusCode};
use crate::server::{Server, ServerError};

pub mod origin;

pub use origin::{OriginClient, OriginError, OriginResponse};

/// Diagnostic header naming the cache outcome when enabled.
pub const CACHE_STATUS_HEADER: &str = "X-Cache";

/// How a request was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from the store; the origin was not contacted.
    Hit,
    /// Eligible for caching but forwarded to the origin.
    Miss,
    /// Not eligible: non-GET, unmatched path or unparseable URL.
    Bypass,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Bypass => "BYPASS",
        }
    }
}

#[derive(Debug, Default)]
struct ProxyStats {
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,
    bypassed: AtomicU64,
    stored: AtomicU64,
    store_failures: AtomicU64,
    origin_failures: AtomicU64,
}

/// Point-in-time copy of the handler's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyStatsSnapshot {
    pub hits: u64,
    /// Includes `stale`.
    pub misses: u64,
    /// Misses caused by an entry that was present but expired.
    pub stale: u64,
    pub bypassed: u64,
    pub stored: u64,
    pub store_failures: u64,
    pub origin_failures: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Per-request orchestration of key derivation, lookup, forwarding and
/// population. Stateless across requests apart from the shared store.
#[derive(Debug)]
pub struct ProxyHandler {
    config: Arc<ProxyConfig>,
    store: CacheStore,
    origin: OriginClient,
    stats: ProxyStats,
}

impl ProxyHandler {
    /// Builds a handler with an origin client derived from `config`.
    pub fn new(config: ProxyConfig, store: CacheStore) -> Result<Self, OriginError> {
        let origin = OriginClient::new(config.remote_url.clone(), config.origin_timeout())?;
        Ok(Self::with_origin(config, store, origin))
    }

    pub fn with_origin(config: ProxyConfig, store: CacheStore, origin: OriginClient) -> Self {
        Self {
            config: Arc::new(config),
            store,
            origin,
            stats: ProxyStats::default(),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn stats(&self) -> ProxyStatsSnapshot {
        let s = &self.stats;
        ProxyStatsSnapshot {
            hits: s.hits.load(Ordering::Relaxed),
            misses: s.misses.load(Ordering::Relaxed),
            stale: s.stale.load(Ordering::Relaxed),
            bypassed: s.bypassed.load(Ordering::Relaxed),
            stored: s.stored.load(Ordering::Relaxed),
            store_failures: s.store_failures.load(Ordering::Relaxed),
            origin_failures: s.origin_failures.load(Ordering::Relaxed),
        }
    }

    /// Handles one request end to end. Never fails; origin problems become
    /// `502`/`504` responses.
    pub async fn handle(&self, request: Request) -> Response {
        let start = Instant::now();
        let method = request.method().clone();
        let path = request.path().to_owned();

        let (response, cache_status) = self.dispatch(request).await;
        let response = if self.config.cache_status_header {
            response.header(CACHE_STATUS_HEADER, cache_status.as_str())
        } else {
            response
        };

        info!(
            %method,
            %path,
            status = response.status().as_u16(),
            cache = cache_status.as_str(),
            elapsed = ?start.elapsed(),
            "request handled"
        );
        response
    }

    /// Serves requests from `server` until `shutdown` fires.
    pub async fn serve(
        self: Arc<Self>,
        server: Server,
        shutdown: CancellationToken,
    ) -> Result<(), ServerError> {
        server
            .run_until(
                move |request: Request| {
                    let handler = Arc::clone(&self);
                    async move { handler.handle(request).await }
                },
                shutdown,
            )
            .await
    }

    async fn dispatch(&self, request: Request) -> (Response, CacheStatus) {
        // One parse feeds the rules, the key and the upstream URL.
        let target = match RequestTarget::parse(request.target()) {
            Ok(target) => Some(target),
            Err(e) => {
                debug!(error = %e, "request URL not normalizable; bypassing cache");
                None
            }
        };
        let upstream = match &target {
            Some(target) => self.origin.rebase(target),
            None => match self.origin.upstream_url(request.target()) {
                Ok(url) => url,
                Err(e) => {
                    bump(&self.stats.bypassed);
                    return (self.origin_failure(e), CacheStatus::Bypass);
                }
            },
        };

        let Some(key) = target
            .as_ref()
            .and_then(|target| self.cache_key_for(&request, target))
        else {
            bump(&self.stats.bypassed);
            let response = match self.origin.forward(&request, upstream).await {
                Ok(origin) => origin.into_response(),
                Err(e) => self.origin_failure(e),
            };
            return (response, CacheStatus::Bypass);
        };

        if let Some(hit) = self.lookup(&key).await {
            return (hit, CacheStatus::Hit);
        }

        let response = match self.origin.forward(&request, upstream).await {
            Ok(origin) => {
                self.populate(&key, &origin).await;
                origin.into_response()
            }
            Err(e) => self.origin_failure(e),
        };
        (response, CacheStatus::Miss)
    }

    /// Returns the key for a cache-eligible request, or `None` to bypass.
    fn cache_key_for(&self, request: &Request, target: &RequestTarget) -> Option<CacheKey> {
        if *request.method() != Method::Get
            || !self.config.cacheable_paths.is_cacheable(target.path())
        {
            return None;
        }
        Some(derive_key(&target.canonical(&self.config.skip_params)))
    }

    /// Store calls run on the blocking pool; sled may touch disk.
    async fn lookup(&self, key: &CacheKey) -> Option<Response> {
        let store = self.store.clone();
        let lookup_key = key.clone();
        let found = match tokio::task::spawn_blocking(move || store.get(&lookup_key)).await {
            Ok(found) => found,
            Err(e) => {
                bump(&self.stats.misses);
                warn!(%key, error = %e, "cache lookup task failed; treating as miss");
                return None;
            }
        };

        match found {
            Ok(Some(entry)) if entry.is_fresh_at(SystemTime::now()) => {
                bump(&self.stats.hits);
                debug!(%key, "cache hit");
                let mut response = Response::new(StatusCode::OK).body_bytes(entry.payload);
                for (name, value) in entry.headers {
                    response.add_header(name, value);
                }
                Some(response)
            }
            Ok(Some(_)) => {
                bump(&self.stats.misses);
                bump(&self.stats.stale);
                debug!(%key, "cache entry expired");
                None
            }
            Ok(None) => {
                bump(&self.stats.misses);
                debug!(%key, "cache miss");
                None
            }
            Err(e) => {
                bump(&self.stats.misses);
                warn!(%key, error = %e, "cache lookup failed; treating as miss");
                None
            }
        }
    }

    /// Stores a successful origin reply.
    ///
    /// Unlike a plain write-through, only `200 OK` is kept: hits are always
    /// replayed as 200, so any other status would be misreported.
    async fn populate(&self, key: &CacheKey, origin: &OriginResponse) {
        if origin.status != StatusCode::OK {
            debug!(%key, status = origin.status.as_u16(), "origin status not cacheable");
            return;
        }

        let entry = CacheEntry::new(
            origin.body.to_vec(),
            origin.headers.joined(),
            SystemTime::now(),
            self.config.ttl(),
        );
        let bytes = entry.payload.len();
        let store = self.store.clone();
        let store_key = key.clone();
        let written = tokio::task::spawn_blocking(move || store.set(&store_key, &entry)).await;
        match written {
            Ok(Ok(())) => {
                bump(&self.stats.stored);
                debug!(%key, bytes, "response cached");
            }
            Ok(Err(e)) => {
                bump(&self.stats.store_failures);
                warn!(%key, error = %e, "failed to cache response");
            }
            Err(e) => {
                bump(&self.stats.store_failures);
                warn!(%key, error = %e, "cache write task failed");
            }
        }
    }

    fn origin_failure(&self, error: OriginError) -> Response {
        bump(&self.stats.origin_failures);
        warn!(error = %error, "forwarding to origin failed");
        let status = error.status();
        Response::new(status).body(status.canonical_reason())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet};
    use std::time::Duration;

    use super::*;
    use crate::cache::{CacheRuleSet, normalize};

    /// Config pointing at a port nothing listens on, so any forward fails fast.
    fn config() -> ProxyConfig {
        let mut config = ProxyConfig::new("http://127.0.0.1:9".parse().unwrap());
        config.cacheable_paths = CacheRuleSet::parse(["/assets/*", "/exact"]).unwrap();
        config.skip_params = HashSet::from(["session".to_owned()]);
        config.origin_timeout_seconds = 2;
        config.cache_status_header = true;
        config
    }

    fn request(raw: &str) -> Request {
        Request::parse(raw.as_bytes()).unwrap().0
    }

    fn key_for(handler: &ProxyHandler, raw: &str) -> Option<CacheKey> {
        let request = request(raw);
        let target = RequestTarget::parse(request.target()).unwrap();
        handler.cache_key_for(&request, &target)
    }

    fn store_entry(handler: &ProxyHandler, target: &str, created_at: SystemTime, ttl: u64) {
        let key = derive_key(&normalize(target, &handler.config().skip_params).unwrap());
        let headers = BTreeMap::from([("content-type".to_owned(), "image/png".to_owned())]);
        let entry = CacheEntry::new("cached-bytes", headers, created_at, Duration::from_secs(ttl));
        handler.store().set(&key, &entry).unwrap();
    }

    #[test]
    fn eligibility_requires_get_and_matching_path() {
        let handler = ProxyHandler::new(config(), CacheStore::in_memory()).unwrap();
        assert!(key_for(&handler, "GET /assets/a.png HTTP/1.1\r\n\r\n").is_some());
        assert!(key_for(&handler, "POST /assets/a.png HTTP/1.1\r\n\r\n").is_none());
        assert!(key_for(&handler, "HEAD /assets/a.png HTTP/1.1\r\n\r\n").is_none());
        assert!(key_for(&handler, "GET /api/data HTTP/1.1\r\n\r\n").is_none());
    }

    #[test]
    fn rules_see_the_resolved_path() {
        let handler = ProxyHandler::new(config(), CacheStore::in_memory()).unwrap();
        assert!(key_for(&handler, "GET /assets/../api/private HTTP/1.1\r\n\r\n").is_none());
        assert!(key_for(&handler, "GET /assets/%2e%2e/api/private HTTP/1.1\r\n\r\n").is_none());
        assert_eq!(
            key_for(&handler, "GET /api/../exact HTTP/1.1\r\n\r\n"),
            key_for(&handler, "GET /exact HTTP/1.1\r\n\r\n")
        );
    }

    #[test]
    fn skipped_params_share_a_key() {
        let handler = ProxyHandler::new(config(), CacheStore::in_memory()).unwrap();
        let a = key_for(&handler, "GET /exact?session=1&b=2&a=1 HTTP/1.1\r\n\r\n");
        let b = key_for(&handler, "GET /exact?a=1&b=2 HTTP/1.1\r\n\r\n");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn fresh_entry_is_served_without_origin() {
        let handler = ProxyHandler::new(config(), CacheStore::in_memory()).unwrap();
        store_entry(&handler, "/assets/logo.png", SystemTime::now(), 60);

        let response = handler
            .handle(request("GET /assets/logo.png?session=xyz HTTP/1.1\r\n\r\n"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.payload().as_ref(), b"cached-bytes");
        assert_eq!(response.headers().get("content-type"), Some("image/png"));
        assert_eq!(response.headers().get(CACHE_STATUS_HEADER), Some("HIT"));
        assert_eq!(handler.stats().hits, 1);
        assert_eq!(handler.stats().origin_failures, 0);
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss_even_before_sweeping() {
        let handler = ProxyHandler::new(config(), CacheStore::in_memory()).unwrap();
        // TTL 5s, created 6s ago.
        store_entry(&handler, "/assets/logo.png", SystemTime::now() - Duration::from_secs(6), 5);

        let response = handler.handle(request("GET /assets/logo.png HTTP/1.1\r\n\r\n")).await;
        assert_eq!(response.headers().get(CACHE_STATUS_HEADER), Some("MISS"));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let stats = handler.stats();
        assert_eq!((stats.hits, stats.misses, stats.stale), (0, 1, 1));
        assert_eq!(stats.origin_failures, 1);
    }

    #[tokio::test]
    async fn post_is_never_served_from_cache() {
        let handler = ProxyHandler::new(config(), CacheStore::in_memory()).unwrap();
        store_entry(&handler, "/assets/logo.png", SystemTime::now(), 60);

        let response = handler
            .handle(request("POST /assets/logo.png HTTP/1.1\r\nContent-Length: 0\r\n\r\n"))
            .await;
        assert_eq!(response.headers().get(CACHE_STATUS_HEADER), Some("BYPASS"));
        assert_ne!(response.payload().as_ref(), b"cached-bytes");
        assert_eq!(handler.stats().hits, 0);
    }

    #[tokio::test]
    async fn corrupt_entry_degrades_to_miss() {
        let handler = ProxyHandler::new(config(), CacheStore::in_memory()).unwrap();
        let key = derive_key("/exact");
        handler.store().insert_raw(key.as_bytes(), b"\x00garbage").unwrap();

        let response = handler.handle(request("GET /exact HTTP/1.1\r\n\r\n")).await;
        assert_eq!(response.headers().get(CACHE_STATUS_HEADER), Some("MISS"));
        assert_eq!(handler.store().stats().corrupt, 1);
    }

    #[tokio::test]
    async fn authority_in_target_never_reads_the_cache() {
        let handler = ProxyHandler::new(config(), CacheStore::in_memory()).unwrap();
        store_entry(&handler, "/exact", SystemTime::now(), 60);

        let response = handler
            .handle(request("GET //evil.example/exact HTTP/1.1\r\n\r\n"))
            .await;
        assert_eq!(response.headers().get(CACHE_STATUS_HEADER), Some("BYPASS"));
        assert_ne!(response.payload().as_ref(), b"cached-bytes");
        assert_eq!(handler.stats().hits, 0);
    }

    #[test]
    fn status_labels() {
        assert_eq!(CacheStatus::Hit.as_str(), "HIT");
        assert_eq!(CacheStatus::Miss.as_str(), "MISS");
        assert_eq!(CacheStatus::Bypass.as_str(), "BYPASS");
    }
}
