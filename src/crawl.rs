use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::signal;
use tokio::sync::Mutex;
use tracing::{info, warn};

use gleaner_core::types::{Datastore, FetchResults, Handler};
use gleaner_core::url::request_uri;
use gleaner_core::{AppConfig, CrawlUrl, Normalizer};
use gleaner_fetcher::{FetchManager, MemoryDatastore};
use gleaner_net::{fetch_group, CachingResolver, HttpClient};

/// Demo-grade handler: logs every delivered page and optionally appends a
/// JSON line per fetch.
struct JsonlHandler {
    out: Option<Mutex<tokio::fs::File>>,
}

impl JsonlHandler {
    async fn new(output: Option<String>) -> Result<Self> {
        let out = match output {
            Some(path) => Some(Mutex::new(
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await?,
            )),
            None => None,
        };
        Ok(Self { out })
    }
}

#[async_trait]
impl Handler for JsonlHandler {
    async fn handle_response(&self, results: &FetchResults) -> Result<()> {
        info!(
            url = %results.url,
            status = results.response.as_ref().map(|r| r.status).unwrap_or_default(),
            mime = results.mime_type.as_deref().unwrap_or("-"),
            "handled page"
        );
        if let Some(out) = &self.out {
            let record = serde_json::json!({
                "url": results.url.as_str(),
                "final_url": results.final_url().as_str(),
                "status": results.response.as_ref().map(|r| r.status),
                "mime": results.mime_type,
                "fingerprint": results.fingerprint.map(|f| format!("{f:016x}")),
                "redirects": results.redirect_chain.iter().map(|u| u.as_str().to_string()).collect::<Vec<_>>(),
                "noindex": results.meta_noindex,
                "fetched_at": results.fetch_start.to_rfc3339(),
            });
            let mut file = out.lock().await;
            file.write_all(record.to_string().as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        Ok(())
    }
}

pub async fn run_crawl(
    config: AppConfig,
    seeds: Option<String>,
    seed: Option<String>,
    output: Option<String>,
) -> Result<()> {
    let mut seed_urls: Vec<String> = Vec::new();
    if let Some(s) = seed {
        seed_urls.push(s);
    }
    if let Some(arg) = seeds {
        if std::path::Path::new(&arg).exists() {
            let content = std::fs::read_to_string(&arg)?;
            seed_urls.extend(
                content
                    .lines()
                    .map(|l| l.trim().to_string())
                    .filter(|l| !l.is_empty()),
            );
        } else {
            seed_urls.extend(arg.split(',').map(|s| s.trim().to_string()));
        }
    }
    anyhow::ensure!(!seed_urls.is_empty(), "no seeds provided (use --seed or --seeds)");

    // normalize the seeds and group them into per-host segments
    let normalizer = Normalizer::new(&config.politeness.purge_sid_list);
    let store = Arc::new(MemoryDatastore::new());
    let mut by_host: BTreeMap<String, Vec<CrawlUrl>> = BTreeMap::new();
    for raw in &seed_urls {
        match normalizer.parse_and_normalize(raw) {
            Ok(url) if config.fetcher.accept_protocols.iter().any(|p| p == url.scheme()) => {
                let Some(host) = url.host_str().map(str::to_string) else {
                    warn!(url = raw.as_str(), "seed has no host, skipped");
                    continue;
                };
                let key = match url.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host,
                };
                by_host.entry(key).or_default().push(url);
            }
            Ok(url) => warn!(url = %url, "seed scheme not accepted, skipped"),
            Err(e) => warn!(url = raw.as_str(), error = %e, "seed did not parse, skipped"),
        }
    }
    let hosts = by_host.len();
    for (host, links) in by_host {
        for link in &links {
            // manual seeds carry no originating fetch
            store.store_parsed_url(link.clone(), None).await?;
        }
        store.add_host(&host, links).await;
    }
    info!(seeds = seed_urls.len(), hosts, "seeded in-memory store");

    let handler = Arc::new(JsonlHandler::new(output).await?);
    let mut manager = FetchManager::new(config, store.clone(), handler)?;
    manager.start().await?;

    info!("crawling; press Ctrl+C to stop");
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("shutdown signal received");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                if store.idle().await {
                    info!("all hosts processed");
                    break;
                }
            }
        }
    }
    manager.stop().await;

    let results = store.take_results().await;
    let errors = results.iter().filter(|r| r.error.is_some()).count();
    info!(
        fetched = results.len(),
        errors,
        discovered = store.parsed_urls().await.len(),
        "crawl finished"
    );
    Ok(())
}

pub async fn run_check(config: AppConfig, raw: String, robots: bool) -> Result<()> {
    let normalizer = Normalizer::new(&config.politeness.purge_sid_list);
    let url = normalizer.parse_and_normalize(&raw)?;
    println!("normalized: {url}");
    if let Some(domain) = url.tld_plus_one() {
        println!("tld+1:      {domain}");
    }
    match url.subdomain() {
        Some(sub) if !sub.is_empty() => println!("subdomain:  {sub}"),
        _ => {}
    }

    if robots {
        let resolver = Arc::new(CachingResolver::new(config.http.max_dns_cache_entries));
        let client = HttpClient::new(&config, resolver)?;
        let origin = url.join("/")?;
        let group = fetch_group(&client, &origin, &config.politeness).await;
        let verdict = if group.allows(&request_uri(&url)) {
            "allowed"
        } else {
            "disallowed"
        };
        println!("robots:     {verdict} (crawl-delay {:?})", group.crawl_delay);
    }
    Ok(())
}
