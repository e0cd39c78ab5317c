use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use gleaner_core::config::AppConfig;
use gleaner_core::types::{FetchResults, Handler};
use gleaner_core::url::CrawlUrl;
use gleaner_fetcher::{FetchManager, MemoryDatastore};

struct RecordingHandler {
    handled: Mutex<Vec<String>>,
}

impl RecordingHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            handled: Mutex::new(Vec::new()),
        })
    }

    async fn urls(&self) -> Vec<String> {
        self.handled.lock().await.clone()
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn handle_response(&self, results: &FetchResults) -> anyhow::Result<()> {
        self.handled
            .lock()
            .await
            .push(results.url.as_str().to_string());
        Ok(())
    }
}

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.fetcher.num_workers = 1;
    config.fetcher.user_agent = "gleaner-test".to_string();
    // the mock server lives on loopback
    config.http.blacklist_private_ips = false;
    config.politeness.default_crawl_delay_ms = 10;
    config
}

fn link(server: &MockServer, path: &str) -> CrawlUrl {
    CrawlUrl::parse(&format!("{}{path}", server.uri())).unwrap()
}

fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/html")
        .set_body_string(body)
}

async fn mount_robots(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(response)
        .mount(server)
        .await;
}

async fn run_until_idle(
    config: AppConfig,
    store: Arc<MemoryDatastore>,
    handler: Arc<RecordingHandler>,
) {
    let mut manager = FetchManager::new(config, store.clone(), handler).unwrap();
    manager.start().await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(15);
    while !store.idle().await {
        assert!(Instant::now() < deadline, "crawl did not finish in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    manager.stop().await;
}

#[tokio::test]
async fn crawls_host_without_robots() {
    let server = MockServer::start().await;
    mount_robots(&server, ResponseTemplate::new(404)).await;
    Mock::given(method("GET"))
        .and(path("/page1.html"))
        .respond_with(html(
            r#"<html><body>
                <a href="/dir1/">one</a>
                <a href="/dir2/">two</a>
                <a href="http://other.com/">three</a>
            </body></html>"#,
        ))
        .mount(&server)
        .await;
    for page in ["/page2.html", "/page3.html"] {
        Mock::given(method("GET"))
            .and(path(page))
            .respond_with(html("<html><body>nothing here</body></html>"))
            .mount(&server)
            .await;
    }

    let store = Arc::new(MemoryDatastore::new());
    store
        .add_host(
            &server.address().to_string(),
            vec![
                link(&server, "/page1.html"),
                link(&server, "/page2.html"),
                link(&server, "/page3.html"),
            ],
        )
        .await;
    let handler = RecordingHandler::new();
    run_until_idle(test_config(), store.clone(), handler.clone()).await;

    assert_eq!(handler.urls().await.len(), 3);
    let results = store.take_results().await;
    assert_eq!(results.len(), 3);
    for r in &results {
        assert!(r.error.is_none(), "unexpected error: {:?}", r.error);
        assert_eq!(r.response.as_ref().map(|resp| resp.status), Some(200));
        assert!(r.fingerprint.is_some());
        assert_eq!(r.mime_type.as_deref(), Some("text/html"));
    }

    let base = server.uri();
    let parsed: Vec<String> = store
        .parsed_urls()
        .await
        .iter()
        .map(|u| u.as_str().to_string())
        .collect();
    assert_eq!(
        parsed,
        vec![
            format!("{base}/dir1/"),
            format!("{base}/dir2/"),
            "http://other.com/".to_string(),
        ]
    );
}

#[tokio::test]
async fn robots_disallow_prevents_the_get() {
    let server = MockServer::start().await;
    mount_robots(
        &server,
        ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /search\n"),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(html("must never be fetched"))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/other"))
        .respond_with(html("<html><body>fine</body></html>"))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryDatastore::new());
    store
        .add_host(
            &server.address().to_string(),
            vec![link(&server, "/search"), link(&server, "/other")],
        )
        .await;
    let handler = RecordingHandler::new();
    run_until_idle(test_config(), store.clone(), handler.clone()).await;

    let results = store.take_results().await;
    assert_eq!(results.len(), 2);
    let excluded = results
        .iter()
        .find(|r| r.url.path() == "/search")
        .unwrap();
    assert!(excluded.excluded_by_robots);
    assert!(excluded.response.is_none());
    assert!(excluded.fingerprint.is_none());

    let fetched = results.iter().find(|r| r.url.path() == "/other").unwrap();
    assert!(!fetched.excluded_by_robots);
    assert_eq!(fetched.response.as_ref().map(|resp| resp.status), Some(200));

    // only the fetched page reaches the handler
    let handled = handler.urls().await;
    assert_eq!(handled.len(), 1);
    assert!(handled[0].ends_with("/other"));
}

#[tokio::test]
async fn huge_crawl_delay_is_clamped() {
    let server = MockServer::start().await;
    mount_robots(
        &server,
        ResponseTemplate::new(200).set_body_string("User-agent: *\nCrawl-delay: 120\n"),
    )
    .await;
    Mock::given(method("GET"))
        .respond_with(html("<html></html>"))
        .mount(&server)
        .await;

    let mut config = test_config();
    config.politeness.max_crawl_delay_ms = 100;

    let store = Arc::new(MemoryDatastore::new());
    store
        .add_host(
            &server.address().to_string(),
            vec![link(&server, "/a"), link(&server, "/b"), link(&server, "/c")],
        )
        .await;

    let started = Instant::now();
    run_until_idle(config, store.clone(), RecordingHandler::new()).await;
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "three links should finish well under a second, took {:?}",
        started.elapsed()
    );
    assert_eq!(store.take_results().await.len(), 3);
}

#[tokio::test]
async fn redirect_chain_is_recorded_in_order() {
    let server = MockServer::start().await;
    mount_robots(&server, ResponseTemplate::new(404)).await;
    Mock::given(method("GET"))
        .and(path("/page1.html"))
        .respond_with(ResponseTemplate::new(307).insert_header("location", "/page2.html"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/page2.html"))
        .respond_with(ResponseTemplate::new(307).insert_header("location", "/page3.html"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/page3.html"))
        .respond_with(html("<html><body>landed</body></html>"))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryDatastore::new());
    store
        .add_host(&server.address().to_string(), vec![link(&server, "/page1.html")])
        .await;
    run_until_idle(test_config(), store.clone(), RecordingHandler::new()).await;

    let results = store.take_results().await;
    assert_eq!(results.len(), 1);
    let r = &results[0];
    assert!(r.url.as_str().ends_with("/page1.html"));
    let base = server.uri();
    let chain: Vec<String> = r.redirect_chain.iter().map(|u| u.to_string()).collect();
    assert_eq!(
        chain,
        vec![format!("{base}/page2.html"), format!("{base}/page3.html")]
    );
    assert_eq!(r.final_url().as_str(), format!("{base}/page3.html"));
    assert_eq!(r.response.as_ref().map(|resp| resp.status), Some(200));
}

#[tokio::test]
async fn oversized_body_records_size_error() {
    let server = MockServer::start().await;
    mount_robots(&server, ResponseTemplate::new(404)).await;
    Mock::given(method("GET"))
        .and(path("/big.html"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_bytes(vec![b'x'; 100]),
        )
        .mount(&server)
        .await;

    let mut config = test_config();
    config.http.max_content_size_bytes = 10;

    let store = Arc::new(MemoryDatastore::new());
    store
        .add_host(&server.address().to_string(), vec![link(&server, "/big.html")])
        .await;
    let handler = RecordingHandler::new();
    run_until_idle(config, store.clone(), handler.clone()).await;

    assert!(handler.urls().await.is_empty());
    let results = store.take_results().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].error.as_ref().map(|e| e.kind()), Some("size"));
    assert!(results[0].fingerprint.is_none());
}

#[tokio::test]
async fn noindex_suppresses_handler_but_not_links() {
    let server = MockServer::start().await;
    mount_robots(&server, ResponseTemplate::new(404)).await;
    Mock::given(method("GET"))
        .and(path("/page.html"))
        .respond_with(html(
            r#"<html><head><meta name="robots" content="noindex"></head>
               <body><a href="/x">x</a></body></html>"#,
        ))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryDatastore::new());
    store
        .add_host(&server.address().to_string(), vec![link(&server, "/page.html")])
        .await;
    let handler = RecordingHandler::new();
    run_until_idle(test_config(), store.clone(), handler.clone()).await;

    assert!(handler.urls().await.is_empty());
    let results = store.take_results().await;
    assert!(results[0].meta_noindex);
    // noindex never stops link discovery
    assert_eq!(store.parsed_urls().await.len(), 1);
}

#[tokio::test]
async fn honored_nofollow_suppresses_outlink_stores() {
    let server = MockServer::start().await;
    mount_robots(&server, ResponseTemplate::new(404)).await;
    Mock::given(method("GET"))
        .and(path("/page.html"))
        .respond_with(html(
            r#"<html><head><meta name="robots" content="nofollow"></head>
               <body><a href="/x">x</a><a href="/y">y</a></body></html>"#,
        ))
        .mount(&server)
        .await;

    let mut config = test_config();
    config.extract.honor_meta_nofollow = true;

    let store = Arc::new(MemoryDatastore::new());
    store
        .add_host(&server.address().to_string(), vec![link(&server, "/page.html")])
        .await;
    run_until_idle(config, store.clone(), RecordingHandler::new()).await;

    let results = store.take_results().await;
    assert!(results[0].meta_nofollow);
    assert!(store.parsed_urls().await.is_empty());
}

#[tokio::test]
async fn already_crawled_link_sends_conditional_get() {
    let server = MockServer::start().await;
    mount_robots(&server, ResponseTemplate::new(404)).await;
    Mock::given(method("GET"))
        .and(path("/seen.html"))
        .and(header_exists("if-modified-since"))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryDatastore::new());
    let seen = link(&server, "/seen.html").with_last_crawled(Utc::now());
    store.add_host(&server.address().to_string(), vec![seen]).await;
    let handler = RecordingHandler::new();
    run_until_idle(test_config(), store.clone(), handler.clone()).await;

    let results = store.take_results().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].response.as_ref().map(|resp| resp.status), Some(304));
    assert!(results[0].error.is_none());
    assert!(results[0].fingerprint.is_none());
    // a 304 still reaches the handler
    assert_eq!(handler.urls().await.len(), 1);
}

#[tokio::test]
async fn fetch_failure_does_not_abort_the_host() {
    let server = MockServer::start().await;
    mount_robots(&server, ResponseTemplate::new(404)).await;
    Mock::given(method("GET"))
        .and(path("/ok.html"))
        .respond_with(html("<html></html>"))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryDatastore::new());
    // first link points at a dead port, second at the live server
    store
        .add_host(
            &server.address().to_string(),
            vec![
                CrawlUrl::parse("http://127.0.0.1:1/dead").unwrap(),
                link(&server, "/ok.html"),
            ],
        )
        .await;
    run_until_idle(test_config(), store.clone(), RecordingHandler::new()).await;

    let results = store.take_results().await;
    assert_eq!(results.len(), 2);
    let dead = results.iter().find(|r| r.url.path() == "/dead").unwrap();
    assert_eq!(dead.error.as_ref().map(|e| e.kind()), Some("transport"));
    assert!(dead.response.is_none());
    let ok = results.iter().find(|r| r.url.path() == "/ok.html").unwrap();
    assert_eq!(ok.response.as_ref().map(|resp| resp.status), Some(200));
}

#[tokio::test]
async fn requests_are_spaced_by_the_crawl_delay() {
    let server = MockServer::start().await;
    mount_robots(
        &server,
        ResponseTemplate::new(200).set_body_string("User-agent: *\nCrawl-delay: 60\n"),
    )
    .await;
    Mock::given(method("GET"))
        .respond_with(html("<html></html>"))
        .mount(&server)
        .await;

    let mut config = test_config();
    config.politeness.max_crawl_delay_ms = 200; // clamps the 60s above

    let store = Arc::new(MemoryDatastore::new());
    store
        .add_host(
            &server.address().to_string(),
            vec![link(&server, "/a"), link(&server, "/b"), link(&server, "/c")],
        )
        .await;
    run_until_idle(config, store.clone(), RecordingHandler::new()).await;

    let times = store.result_times().await;
    assert_eq!(times.len(), 3);
    for pair in times.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= Duration::from_millis(190),
            "stores only {gap:?} apart"
        );
    }
}

#[tokio::test]
async fn initial_keep_alive_failure_is_fatal() {
    let store = Arc::new(MemoryDatastore::new());
    store.fail_keep_alive(true).await;
    let mut manager =
        FetchManager::new(test_config(), store, RecordingHandler::new()).unwrap();
    assert!(manager.start().await.is_err());
}

#[tokio::test]
async fn double_start_is_rejected() {
    let store = Arc::new(MemoryDatastore::new());
    let mut manager =
        FetchManager::new(test_config(), store, RecordingHandler::new()).unwrap();
    manager.start().await.unwrap();
    assert!(manager.start().await.is_err());
    manager.stop().await;
}

#[tokio::test]
async fn heartbeat_fires_periodically() {
    let mut config = test_config();
    config.heartbeat.active_fetchers_ttl_seconds = 1;
    config.heartbeat.keep_ratio = 0.05; // 50ms interval

    let store = Arc::new(MemoryDatastore::new());
    let mut manager =
        FetchManager::new(config, store.clone(), RecordingHandler::new()).unwrap();
    manager.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    manager.stop().await;

    // one registration plus several beats
    assert!(store.keep_alive_count().await >= 3);
}

#[tokio::test]
async fn stop_releases_the_claimed_host() {
    let server = MockServer::start().await;
    mount_robots(&server, ResponseTemplate::new(404)).await;
    Mock::given(method("GET"))
        .respond_with(html("<html></html>"))
        .mount(&server)
        .await;

    let mut config = test_config();
    config.politeness.default_crawl_delay_ms = 200;

    let links: Vec<CrawlUrl> = (0..20)
        .map(|i| link(&server, &format!("/p{i}.html")))
        .collect();
    let store = Arc::new(MemoryDatastore::new());
    store.add_host(&server.address().to_string(), links).await;

    let mut manager =
        FetchManager::new(config, store.clone(), RecordingHandler::new()).unwrap();
    manager.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    manager.stop().await;

    // the worker broke out mid-segment but still unclaimed its host
    assert!(store.idle().await);
    let results = store.take_results().await;
    assert!(!results.is_empty());
    assert!(results.len() < 20, "stop should interrupt the segment");
}
