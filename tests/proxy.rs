//! End-to-end tests: a real origin and the proxy on ephemeral ports.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use cachegate::cache::CacheRuleSet;
use cachegate::{
    CacheStore, Method, ProxyConfig, ProxyHandler, Request, Response, Server, StatusCode,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

struct Harness {
    proxy: SocketAddr,
    origin_hits: Arc<AtomicUsize>,
    handler: Arc<ProxyHandler>,
    shutdown: CancellationToken,
    client: reqwest::Client,
}

impl Harness {
    fn url(&self, target: &str) -> String {
        format!("http://{}{}", self.proxy, target)
    }

    async fn get(&self, target: &str) -> reqwest::Response {
        self.client.get(self.url(target)).send().await.unwrap()
    }

    /// Sends `target` byte-for-byte, bypassing client-side URL cleanup.
    async fn raw_get(&self, target: &str) -> String {
        let mut stream = TcpStream::connect(self.proxy).await.unwrap();
        let request = format!("GET {target} HTTP/1.1\r\nHost: proxy\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    fn origin_hits(&self) -> usize {
        self.origin_hits.load(Ordering::SeqCst)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn cache_status(response: &reqwest::Response) -> String {
    response
        .headers()
        .get("x-cache")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}

async fn origin_handler(req: Request, hits: Arc<AtomicUsize>) -> Response {
    let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
    if *req.method() == Method::Head {
        return Response::new(StatusCode::OK)
            .header("Content-Type", "text/css")
            .declared_length(1234);
    }
    match req.path() {
        "/slow" => {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Response::new(StatusCode::OK).body("late")
        }
        "/echo-headers" => Response::new(StatusCode::OK).body(format!(
            "host={};xff={}",
            req.headers().get("host").unwrap_or_default(),
            req.headers().get("x-forwarded-for").unwrap_or_default()
        )),
        path if path.starts_with("/assets/missing") => {
            Response::new(StatusCode::NOT_FOUND).body("no such asset")
        }
        _ => Response::new(StatusCode::OK)
            .header("Content-Type", "text/css")
            .header("Cache-Control", "public")
            .header("Cache-Control", "max-age=60")
            .body_bytes(format!(
                "{} {} #{n} {}",
                req.method(),
                req.target(),
                String::from_utf8_lossy(req.body())
            )),
    }
}

async fn start_origin(hits: Arc<AtomicUsize>, shutdown: CancellationToken) -> SocketAddr {
    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(server.run_until(
        move |req: Request| origin_handler(req, Arc::clone(&hits)),
        shutdown,
    ));
    addr
}

async fn harness(configure: impl FnOnce(&mut ProxyConfig)) -> Harness {
    let shutdown = CancellationToken::new();
    let origin_hits = Arc::new(AtomicUsize::new(0));
    let origin = start_origin(Arc::clone(&origin_hits), shutdown.clone()).await;

    let mut config = ProxyConfig::new(format!("http://{origin}").parse().unwrap());
    config.host = "127.0.0.1".into();
    config.port = 0;
    config.cacheable_paths = CacheRuleSet::parse(["/assets/*", "/exact"]).unwrap();
    config.skip_params = ["session".to_owned()].into();
    config.cache_status_header = true;
    configure(&mut config);

    let server = Server::bind(config.bind_addr()).await.unwrap();
    let proxy = server.local_addr();
    let handler = Arc::new(ProxyHandler::new(config, CacheStore::in_memory()).unwrap());
    tokio::spawn(Arc::clone(&handler).serve(server, shutdown.clone()));

    Harness {
        proxy,
        origin_hits,
        handler,
        shutdown,
        client: reqwest::Client::builder().no_proxy().build().unwrap(),
    }
}

#[tokio::test]
async fn second_get_is_served_from_cache() {
    let h = harness(|_| {}).await;

    let first = h.get("/assets/app.css").await;
    assert_eq!(first.status(), 200);
    assert_eq!(cache_status(&first), "MISS");
    let first_body = first.text().await.unwrap();

    let second = h.get("/assets/app.css").await;
    assert_eq!(second.status(), 200);
    assert_eq!(cache_status(&second), "HIT");
    assert_eq!(second.headers()["content-type"], "text/css");
    assert_eq!(second.headers()["cache-control"], "public, max-age=60");
    assert_eq!(second.text().await.unwrap(), first_body);

    assert_eq!(h.origin_hits(), 1);
    assert_eq!(h.handler.stats().stored, 1);
}

#[tokio::test]
async fn equivalent_queries_share_one_entry() {
    let h = harness(|_| {}).await;

    let first = h.get("/assets/list?x=1&y=2&session=aaa").await;
    assert_eq!(cache_status(&first), "MISS");

    let reordered = h.get("/assets/list?y=2&session=bbb&x=1").await;
    assert_eq!(cache_status(&reordered), "HIT");

    let different = h.get("/assets/list?x=1&y=3").await;
    assert_eq!(cache_status(&different), "MISS");

    assert_eq!(h.origin_hits(), 2);
}

#[tokio::test]
async fn non_cacheable_path_is_never_stored() {
    let h = harness(|_| {}).await;

    for _ in 0..3 {
        let response = h.get("/api/data").await;
        assert_eq!(response.status(), 200);
        assert_eq!(cache_status(&response), "BYPASS");
    }

    assert_eq!(h.origin_hits(), 3);
    assert_eq!(h.handler.store().stats().writes, 0);
    assert_eq!(h.handler.stats().stored, 0);
}

#[tokio::test]
async fn post_always_reaches_origin() {
    let h = harness(|_| {}).await;
    assert_eq!(cache_status(&h.get("/exact").await), "MISS");

    let response = h
        .client
        .post(h.url("/exact"))
        .body("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(cache_status(&response), "BYPASS");
    let body = response.text().await.unwrap();
    assert!(body.starts_with("POST /exact #2 payload"), "{body}");
    assert_eq!(h.origin_hits(), 2);
}

#[tokio::test]
async fn expired_entry_is_fetched_again() {
    let h = harness(|c| c.ttl_seconds = 1).await;

    assert_eq!(cache_status(&h.get("/exact").await), "MISS");
    assert_eq!(cache_status(&h.get("/exact").await), "HIT");

    tokio::time::sleep(Duration::from_millis(1_200)).await;

    let refreshed = h.get("/exact").await;
    assert_eq!(cache_status(&refreshed), "MISS");
    assert!(refreshed.text().await.unwrap().contains("#2"));
    assert_eq!(h.handler.stats().stale, 1);
}

#[tokio::test]
async fn error_responses_are_relayed_but_not_cached() {
    let h = harness(|_| {}).await;

    for _ in 0..2 {
        let response = h.get("/assets/missing.png").await;
        assert_eq!(response.status(), 404);
        assert_eq!(cache_status(&response), "MISS");
        assert_eq!(response.text().await.unwrap(), "no such asset");
    }
    assert_eq!(h.origin_hits(), 2);
}

#[tokio::test]
async fn host_is_rewritten_and_client_recorded() {
    let h = harness(|_| {}).await;
    let origin_host = h.handler.config().remote_url.authority().to_owned();

    let body = h.get("/echo-headers").await.text().await.unwrap();
    assert_eq!(body, format!("host={origin_host};xff=127.0.0.1"));
}

#[tokio::test]
async fn slow_origin_yields_gateway_timeout() {
    let h = harness(|c| c.origin_timeout_seconds = 1).await;

    let response = h.get("/slow").await;
    assert_eq!(response.status(), 504);
    assert_eq!(h.handler.stats().origin_failures, 1);
}

#[tokio::test]
async fn unreachable_origin_yields_bad_gateway() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let h = harness(|c| c.remote_url = format!("http://127.0.0.1:{port}").parse().unwrap()).await;

    let response = h.get("/assets/app.css").await;
    assert_eq!(response.status(), 502);
    assert_eq!(cache_status(&response), "MISS");
    assert_eq!(h.handler.store().stats().writes, 0);
}

#[tokio::test]
async fn authority_in_target_cannot_poison_another_path() {
    let h = harness(|c| c.cacheable_paths = CacheRuleSet::parse(["/*"]).unwrap()).await;

    let smuggled = h.raw_get("//evil.example/exact").await;
    assert!(smuggled.contains("X-Cache: BYPASS\r\n"), "{smuggled}");

    let legit = h.get("/exact").await;
    assert_eq!(cache_status(&legit), "MISS");
    assert!(legit.text().await.unwrap().starts_with("GET /exact #2"));
    assert_eq!(h.origin_hits(), 2);
}

#[tokio::test]
async fn dot_segments_cannot_escape_cache_rules() {
    let h = harness(|_| {}).await;

    for _ in 0..2 {
        let out = h.raw_get("/assets/../api/private").await;
        assert!(out.contains("X-Cache: BYPASS\r\n"), "{out}");
        assert!(out.contains("GET /api/private #"), "{out}");
    }
    let encoded = h.raw_get("/assets/%2e%2e/api/private").await;
    assert!(encoded.contains("X-Cache: BYPASS\r\n"), "{encoded}");

    assert_eq!(h.origin_hits(), 3);
    assert_eq!(h.handler.stats().stored, 0);
}

#[tokio::test]
async fn origin_sees_the_path_the_key_was_derived_from() {
    let h = harness(|_| {}).await;

    let first = h.raw_get("/assets/x/../app.css?session=1").await;
    assert!(first.contains("X-Cache: MISS\r\n"), "{first}");
    assert!(first.contains("GET /assets/app.css?session=1 #1"), "{first}");

    let second = h.get("/assets/app.css").await;
    assert_eq!(cache_status(&second), "HIT");
    assert!(second.text().await.unwrap().starts_with("GET /assets/app.css?session=1 #1"));
    assert_eq!(h.origin_hits(), 1);
}

#[tokio::test]
async fn head_keeps_origin_content_length() {
    let h = harness(|_| {}).await;

    let response = h.client.head(h.url("/exact")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(cache_status(&response), "BYPASS");
    assert_eq!(response.headers()["content-length"], "1234");
}
