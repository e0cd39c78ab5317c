use std::net::{SocketAddr, ToSocketAddrs};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tokio::sync::Mutex;
use tracing::trace;

/// Bounded LRU in front of the system resolver. One instance is shared by
/// both transports and by the pre-claim blacklist probe.
#[derive(Debug, Clone)]
pub struct CachingResolver {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    cache: Mutex<LruCache<String, Vec<SocketAddr>>>,
}

impl CachingResolver {
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Inner {
                cache: Mutex::new(LruCache::new(capacity)),
            }),
        }
    }

    /// Resolve a bare hostname through the cache.
    pub async fn lookup(&self, host: &str) -> std::io::Result<Vec<SocketAddr>> {
        self.inner.lookup(host).await
    }
}

impl Inner {
    async fn lookup(&self, host: &str) -> std::io::Result<Vec<SocketAddr>> {
        if let Some(addrs) = self.cache.lock().await.get(host) {
            trace!(host, "dns cache hit");
            return Ok(addrs.clone());
        }
        let name = host.to_string();
        let addrs = tokio::task::spawn_blocking(move || {
            (name.as_str(), 0u16)
                .to_socket_addrs()
                .map(|it| it.collect::<Vec<_>>())
        })
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))??;
        self.cache
            .lock()
            .await
            .put(host.to_string(), addrs.clone());
        Ok(addrs)
    }
}

impl Resolve for CachingResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let addrs = inner.lookup(name.as_str()).await?;
            let iter: Addrs = Box::new(addrs.into_iter());
            Ok(iter)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_and_caches_localhost() {
        let resolver = CachingResolver::new(4);
        let first = resolver.lookup("localhost").await.unwrap();
        assert!(!first.is_empty());
        assert!(first.iter().all(|a| a.ip().is_loopback()));

        // second lookup served from cache
        let second = resolver.lookup("localhost").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unresolvable_host_errors() {
        let resolver = CachingResolver::new(4);
        assert!(resolver.lookup("no-such-host.invalid").await.is_err());
    }
}
