use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use rand::distributions::Alphanumeric;
use rand::Rng;
use url::Url;

use crate::error::FetchError;
use crate::url::CrawlUrl;

/// Status line and headers of a completed HTTP exchange. The body is not
/// carried here; workers stream it into a bounded reusable buffer.
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub status: u16,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
}

impl FetchResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(|v| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Everything recorded about one attempted fetch. Created when a link enters
/// the worker pipeline, mutated only by that worker, persisted exactly once.
#[derive(Debug)]
pub struct FetchResults {
    /// The link as handed out by the store.
    pub url: CrawlUrl,
    /// Each redirect target in the order followed; the final URL is last.
    /// Empty when the first response was terminal.
    pub redirect_chain: Vec<Url>,
    /// None when excluded by robots or when the transport failed.
    pub response: Option<FetchResponse>,
    pub error: Option<FetchError>,
    pub fetch_start: DateTime<Utc>,
    pub excluded_by_robots: bool,
    pub meta_noindex: bool,
    pub meta_nofollow: bool,
    /// Media type resolved from Content-Type.
    pub mime_type: Option<String>,
    /// FNV-64 of the response body; None when no body was read.
    pub fingerprint: Option<u64>,
    /// Body capture, populated only when configured.
    pub body: Option<String>,
}

impl FetchResults {
    pub fn new(url: CrawlUrl) -> Self {
        Self {
            url,
            redirect_chain: Vec::new(),
            response: None,
            error: None,
            fetch_start: Utc::now(),
            excluded_by_robots: false,
            meta_noindex: false,
            meta_nofollow: false,
            mime_type: None,
            fingerprint: None,
            body: None,
        }
    }

    /// Where the fetch ended up after redirects.
    pub fn final_url(&self) -> &Url {
        self.redirect_chain.last().unwrap_or_else(|| self.url.as_url())
    }
}

/// Process-wide liveness token. The store keys heartbeats on it so hosts held
/// by a dead fetcher can be reclaimed once the TTL lapses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetcherId(String);

impl FetcherId {
    pub fn generate() -> Self {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        Self(format!("{}-{}", std::process::id(), token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FetcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The shared metadata store fetchers coordinate through. Implementations
/// must be safe for concurrent use by every worker plus the heartbeat task.
#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    /// Hand out a host the caller now exclusively owns, or None when no work
    /// is available. Atomic across all fetchers in the cluster.
    async fn claim_new_host(&self) -> Option<String>;

    /// Release ownership of a claimed host. Idempotent.
    async fn unclaim_host(&self, host: &str);

    /// The current segment of links for a claimed host. The stream is
    /// consumed once per claim; termination means end of segment.
    async fn links_for_host(&self, host: &str) -> BoxStream<'static, CrawlUrl>;

    /// Persist the outcome of one fetch attempt.
    async fn store_url_fetch_results(&self, results: FetchResults) -> Result<(), FetchError>;

    /// Record a newly discovered link. `origin` is the fetch that produced
    /// it, None for manual seeds. Deduplication and crawl scheduling are the
    /// store's concern.
    async fn store_parsed_url(
        &self,
        url: CrawlUrl,
        origin: Option<&FetchResults>,
    ) -> Result<(), FetchError>;

    /// Advertise that this fetcher is alive.
    async fn keep_alive(&self, fetcher: &FetcherId) -> Result<(), FetchError>;
}

/// User-supplied consumer of fetched pages. Called once per received
/// response, including non-2xx and 304, unless suppressed by meta-noindex or
/// the accept-formats filter. Errors are logged and swallowed by the fetcher.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle_response(&self, results: &FetchResults) -> anyhow::Result<()>;
}

/// Materializes per-host segments from the pool of known links. Runs beside
/// the fetchers and is never invoked by them; the contract lives here so
/// deployments can drive both halves through one store. Both calls block.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn start_dispatcher(&self) -> Result<(), FetchError>;
    async fn stop_dispatcher(&self) -> Result<(), FetchError>;
}
