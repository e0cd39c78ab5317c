use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fnv::FnvHasher;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use gleaner_core::config::AppConfig;
use gleaner_core::error::FetchError;
use gleaner_core::types::{Datastore, FetchResults, Handler};
use gleaner_core::url::{request_uri, CrawlUrl};
use gleaner_net::robots::{fetch_group, RobotsGroup};
use gleaner_net::{blacklist, snapshot, CachingResolver, HttpClient};
use gleaner_parser::LinkExtractor;

/// How long to sit idle when the store has no host to hand out.
const CLAIM_RETRY: Duration = Duration::from_secs(1);
const MAX_REDIRECTS: usize = 10;

/// One long-running crawl task. A worker owns at most one host at a time and
/// walks its segment serially, spacing requests by the host's crawl delay.
pub(crate) struct FetchWorker {
    id: usize,
    config: Arc<AppConfig>,
    store: Arc<dyn Datastore>,
    handler: Arc<dyn Handler>,
    client: HttpClient,
    resolver: Arc<CachingResolver>,
    extractor: Arc<LinkExtractor>,
    /// Robots groups keyed by the authority actually requested, so a
    /// redirect onto a sibling host consults that host's own rules.
    /// Cleared on every claim.
    robots: HashMap<String, RobotsGroup>,
    /// Reusable body buffer.
    buf: Vec<u8>,
    quit: broadcast::Receiver<()>,
}

impl FetchWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
        config: Arc<AppConfig>,
        store: Arc<dyn Datastore>,
        handler: Arc<dyn Handler>,
        client: HttpClient,
        resolver: Arc<CachingResolver>,
        extractor: Arc<LinkExtractor>,
        quit: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            id,
            config,
            store,
            handler,
            client,
            resolver,
            extractor,
            robots: HashMap::new(),
            buf: Vec::new(),
            quit,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(worker_id = self.id, "worker started");
        loop {
            let claimed = tokio::select! {
                _ = self.quit.recv() => break,
                host = self.store.claim_new_host() => host,
            };
            let Some(host) = claimed else {
                tokio::select! {
                    _ = self.quit.recv() => break,
                    _ = tokio::time::sleep(CLAIM_RETRY) => {}
                }
                continue;
            };

            self.crawl_host(&host).await;
            info!(worker_id = self.id, host = %host, "unclaiming host");
            self.store.unclaim_host(&host).await;

            if self.quitting() {
                break;
            }
        }
        info!(worker_id = self.id, "worker stopped");
    }

    /// True once the quit signal has been sent. Checked between links so an
    /// in-flight fetch always completes.
    fn quitting(&mut self) -> bool {
        use broadcast::error::TryRecvError;
        !matches!(self.quit.try_recv(), Err(TryRecvError::Empty))
    }

    async fn crawl_host(&mut self, host: &str) {
        let Ok(origin) = Url::parse(&format!("http://{host}/")) else {
            warn!(worker_id = self.id, host, "claimed host does not parse, skipping");
            return;
        };

        if self.config.http.blacklist_private_ips {
            if let Some(hostname) = origin.host_str() {
                if blacklist::host_is_private(&self.resolver, hostname).await {
                    info!(worker_id = self.id, host, "host resolves to a private address, skipping");
                    return;
                }
            }
        }

        self.robots.clear();
        let group = fetch_group(&self.client, &origin, &self.config.politeness).await;
        info!(
            worker_id = self.id,
            host,
            crawl_delay_ms = group.crawl_delay.as_millis() as u64,
            "claimed host"
        );
        self.robots.insert(authority(&origin), group);

        let mut links = self.store.links_for_host(host).await;
        while let Some(link) = links.next().await {
            self.process_link(link).await;
            if self.quitting() {
                debug!(worker_id = self.id, host, "quit observed, leaving segment");
                break;
            }
        }
    }

    async fn process_link(&mut self, link: CrawlUrl) {
        // the crawl delay is measured from the moment the body finished
        // arriving, not from fetch start
        let mut mark = Instant::now();
        let (results, crawl_delay) = self.fetch_one(link, &mut mark).await;

        if let Some(e) = &results.error {
            debug!(worker_id = self.id, url = %results.url, kind = e.kind(), error = %e, "fetch failed");
        }
        if let Err(e) = self.store.store_url_fetch_results(results).await {
            error!(worker_id = self.id, error = %e, "storing fetch results failed");
        }

        let elapsed = mark.elapsed();
        if crawl_delay > elapsed {
            tokio::time::sleep(crawl_delay - elapsed).await;
        }
    }

    /// The per-link pipeline: robots gate, GET with manual redirect walking,
    /// bounded body read, fingerprint, extraction, handler, outlink stores.
    /// Never fails the host; everything lands on the returned record.
    async fn fetch_one(&mut self, link: CrawlUrl, mark: &mut Instant) -> (FetchResults, Duration) {
        let mut results = FetchResults::new(link);

        let uri = request_uri(results.url.as_url());
        let (allowed, crawl_delay) = {
            let group = self.robots_group_for(results.url.as_url()).await;
            (group.allows(&uri), group.crawl_delay)
        };
        if !allowed {
            debug!(worker_id = self.id, url = %results.url, "excluded by robots");
            results.excluded_by_robots = true;
            return (results, crawl_delay);
        }

        results.fetch_start = Utc::now();
        let mut current = results.url.as_url().clone();
        let mut response = loop {
            let sent = self
                .client
                .get(&current, results.url.last_crawled, crawl_delay)
                .await;
            let response = match sent {
                Ok(response) => response,
                Err(e) => {
                    results.error = Some(e);
                    *mark = Instant::now();
                    return (results, crawl_delay);
                }
            };

            if !response.status().is_redirection() {
                break response;
            }
            let Some(next) = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|loc| current.join(loc).ok())
            else {
                // redirect without a usable target is terminal
                break response;
            };

            if results.redirect_chain.len() >= MAX_REDIRECTS {
                results.response = Some(snapshot(&response));
                results.error = Some(FetchError::Protocol("too many redirects".into()));
                *mark = Instant::now();
                return (results, crawl_delay);
            }

            // a hop onto another host answers to that host's robots
            let hop_uri = request_uri(&next);
            let hop_allowed = {
                let group = self.robots_group_for(&next).await;
                group.allows(&hop_uri)
            };
            results.redirect_chain.push(next.clone());
            if !hop_allowed {
                debug!(worker_id = self.id, url = %next, "redirect target excluded by robots");
                results.excluded_by_robots = true;
                *mark = Instant::now();
                return (results, crawl_delay);
            }
            current = next;
        };

        let status = response.status();
        results.response = Some(snapshot(&response));
        *mark = Instant::now();

        if status.as_u16() == 304 {
            self.deliver(&results).await;
            return (results, crawl_delay);
        }

        if !status.is_success() {
            results.error = Some(FetchError::HttpStatus(status.as_u16()));
            // any received response is still offered to the handler
            self.deliver(&results).await;
            return (results, crawl_delay);
        }

        let max = self.config.http.max_content_size_bytes;
        let read = self.client.read_body(&mut response, max, &mut self.buf).await;
        *mark = Instant::now();
        if let Err(e) = read {
            results.error = Some(e);
            return (results, crawl_delay);
        }

        let mut hasher = FnvHasher::default();
        hasher.write(&self.buf);
        results.fingerprint = Some(hasher.finish());

        let content_type = results
            .response
            .as_ref()
            .and_then(|r| r.header("content-type"))
            .map(str::to_string);
        results.mime_type = content_type
            .as_deref()
            .and_then(|ct| ct.parse::<mime::Mime>().ok())
            .map(|m| m.essence_str().to_string());

        let mut outlinks = Vec::new();
        if results.mime_type.as_deref() == Some(mime::TEXT_HTML.essence_str()) {
            let page_url = results.final_url().clone();
            let page = self
                .extractor
                .extract(&self.buf, content_type.as_deref(), &page_url);
            results.meta_noindex = page.noindex;
            results.meta_nofollow = page.nofollow;
            if let Some(err) = page.parse_error {
                debug!(worker_id = self.id, url = %results.url, error = err, "html recovered with errors");
            }
            outlinks = page.links;
        }

        if self.config.http.store_response_body {
            results.body = Some(String::from_utf8_lossy(&self.buf).into_owned());
        }

        self.deliver(&results).await;

        for outlink in outlinks {
            if let Err(e) = self.store.store_parsed_url(outlink, Some(&results)).await {
                warn!(worker_id = self.id, error = %e, "storing parsed url failed");
            }
        }

        (results, crawl_delay)
    }

    async fn robots_group_for(&mut self, url: &Url) -> &RobotsGroup {
        let key = authority(url);
        if !self.robots.contains_key(&key) {
            let group = match url.join("/") {
                Ok(origin) => fetch_group(&self.client, &origin, &self.config.politeness).await,
                Err(_) => RobotsGroup::default_group(&self.config.politeness),
            };
            debug!(worker_id = self.id, host = %key, "cached robots group");
            self.robots.insert(key.clone(), group);
        }
        self.robots
            .entry(key)
            .or_insert_with(|| RobotsGroup::default_group(&self.config.politeness))
    }

    /// Hand the record to the user handler unless meta-noindex (when
    /// honored) or the accept-formats filter says otherwise. Handler errors
    /// never propagate.
    async fn deliver(&self, results: &FetchResults) {
        if self.config.extract.honor_meta_noindex && results.meta_noindex {
            debug!(worker_id = self.id, url = %results.url, "noindex, handler skipped");
            return;
        }
        if !self.accepts_format(results) {
            debug!(
                worker_id = self.id,
                url = %results.url,
                mime = results.mime_type.as_deref().unwrap_or("-"),
                "content type not accepted, handler skipped"
            );
            return;
        }
        if let Err(e) = self.handler.handle_response(results).await {
            warn!(worker_id = self.id, url = %results.url, error = %e, "handler error");
        }
    }

    fn accepts_format(&self, results: &FetchResults) -> bool {
        // no Content-Type to judge by (304s, headerless responses): let the
        // handler see what we saw
        let Some(ct) = results
            .response
            .as_ref()
            .and_then(|r| r.header("content-type"))
        else {
            return true;
        };
        let Ok(actual) = ct.parse::<mime::Mime>() else {
            return true;
        };
        self.config.fetcher.accept_formats.iter().any(|accept| {
            accept
                .parse::<mime::Mime>()
                .map(|a| {
                    a.type_() == actual.type_()
                        && (a.subtype() == mime::STAR || a.subtype() == actual.subtype())
                })
                .unwrap_or(false)
        })
    }
}

/// host[:port], the robots cache key.
fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}
