use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use tokio::sync::Mutex;
use tracing::debug;

use gleaner_core::error::FetchError;
use gleaner_core::types::{Datastore, FetchResults, FetcherId};
use gleaner_core::url::CrawlUrl;

/// In-memory datastore for seeding demo crawls and for tests. Hosts are
/// handed out FIFO and exclusively; fetch outcomes and discovered links are
/// retained for inspection.
#[derive(Default)]
pub struct MemoryDatastore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    pending_hosts: VecDeque<String>,
    claimed: HashSet<String>,
    links: HashMap<String, Vec<CrawlUrl>>,
    results: Vec<FetchResults>,
    result_times: Vec<Instant>,
    parsed: Vec<CrawlUrl>,
    keep_alives: u64,
    fail_keep_alive: bool,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a host whose current segment is `links`.
    pub async fn add_host(&self, host: &str, links: Vec<CrawlUrl>) {
        let mut state = self.state.lock().await;
        state
            .links
            .entry(host.to_string())
            .or_default()
            .extend(links);
        if !state.pending_hosts.iter().any(|h| h == host) {
            state.pending_hosts.push_back(host.to_string());
        }
    }

    /// Make every keep-alive call fail, including the initial registration.
    pub async fn fail_keep_alive(&self, fail: bool) {
        self.state.lock().await.fail_keep_alive = fail;
    }

    /// True when no host is pending or claimed.
    pub async fn idle(&self) -> bool {
        let state = self.state.lock().await;
        state.pending_hosts.is_empty() && state.claimed.is_empty()
    }

    pub async fn keep_alive_count(&self) -> u64 {
        self.state.lock().await.keep_alives
    }

    /// Drain recorded fetch outcomes.
    pub async fn take_results(&self) -> Vec<FetchResults> {
        std::mem::take(&mut self.state.lock().await.results)
    }

    /// Instants at which fetch outcomes were stored, in order.
    pub async fn result_times(&self) -> Vec<Instant> {
        self.state.lock().await.result_times.clone()
    }

    pub async fn parsed_urls(&self) -> Vec<CrawlUrl> {
        self.state.lock().await.parsed.clone()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn claim_new_host(&self) -> Option<String> {
        let mut state = self.state.lock().await;
        let host = state.pending_hosts.pop_front()?;
        state.claimed.insert(host.clone());
        Some(host)
    }

    async fn unclaim_host(&self, host: &str) {
        let mut state = self.state.lock().await;
        state.claimed.remove(host);
        debug!(host, "unclaimed");
    }

    async fn links_for_host(&self, host: &str) -> BoxStream<'static, CrawlUrl> {
        let mut state = self.state.lock().await;
        let links = state.links.remove(host).unwrap_or_default();
        Box::pin(stream::iter(links))
    }

    async fn store_url_fetch_results(&self, results: FetchResults) -> Result<(), FetchError> {
        let mut state = self.state.lock().await;
        state.result_times.push(Instant::now());
        state.results.push(results);
        Ok(())
    }

    async fn store_parsed_url(
        &self,
        url: CrawlUrl,
        _origin: Option<&FetchResults>,
    ) -> Result<(), FetchError> {
        self.state.lock().await.parsed.push(url);
        Ok(())
    }

    async fn keep_alive(&self, fetcher: &FetcherId) -> Result<(), FetchError> {
        let mut state = self.state.lock().await;
        if state.fail_keep_alive {
            return Err(FetchError::Store(format!(
                "keep-alive rejected for {fetcher}"
            )));
        }
        state.keep_alives += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(raw: &str) -> CrawlUrl {
        CrawlUrl::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn claims_are_exclusive_and_fifo() {
        let store = MemoryDatastore::new();
        store.add_host("a.com", vec![link("http://a.com/")]).await;
        store.add_host("b.com", vec![link("http://b.com/")]).await;

        assert_eq!(store.claim_new_host().await.as_deref(), Some("a.com"));
        assert_eq!(store.claim_new_host().await.as_deref(), Some("b.com"));
        assert_eq!(store.claim_new_host().await, None);

        assert!(!store.idle().await);
        store.unclaim_host("a.com").await;
        store.unclaim_host("a.com").await; // idempotent
        store.unclaim_host("b.com").await;
        assert!(store.idle().await);
    }

    #[tokio::test]
    async fn segment_is_consumed_once() {
        let store = MemoryDatastore::new();
        store
            .add_host("a.com", vec![link("http://a.com/1"), link("http://a.com/2")])
            .await;
        let host = store.claim_new_host().await.unwrap();

        use futures::StreamExt;
        let first: Vec<_> = store.links_for_host(&host).await.collect().await;
        assert_eq!(first.len(), 2);
        let second: Vec<_> = store.links_for_host(&host).await.collect().await;
        assert!(second.is_empty());
    }
}
