use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use gleaner_core::config::AppConfig;
use gleaner_core::error::FetchError;
use gleaner_core::types::{Datastore, FetcherId, Handler};
use gleaner_net::{CachingResolver, HttpClient};
use gleaner_parser::LinkExtractor;

use crate::worker::FetchWorker;

/// Supervises the worker pool and the liveness heartbeat.
pub struct FetchManager {
    config: Arc<AppConfig>,
    store: Arc<dyn Datastore>,
    handler: Arc<dyn Handler>,
    client: HttpClient,
    resolver: Arc<CachingResolver>,
    extractor: Arc<LinkExtractor>,
    id: FetcherId,
    quit: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
}

impl FetchManager {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn Datastore>,
        handler: Arc<dyn Handler>,
    ) -> Result<Self, FetchError> {
        config.validate()?;
        let resolver = Arc::new(CachingResolver::new(config.http.max_dns_cache_entries));
        let client = HttpClient::new(&config, Arc::clone(&resolver))?;
        let extractor = Arc::new(LinkExtractor::new(&config)?);
        let (quit, _) = broadcast::channel(1);
        Ok(Self {
            config: Arc::new(config),
            store,
            handler,
            client,
            resolver,
            extractor,
            id: FetcherId::generate(),
            quit,
            tasks: Vec::new(),
            started: false,
        })
    }

    pub fn fetcher_id(&self) -> &FetcherId {
        &self.id
    }

    /// Register this fetcher and spawn the worker pool plus the heartbeat
    /// task. The first keep-alive is synchronous and fatal: a fetcher that
    /// cannot register must not claim work.
    pub async fn start(&mut self) -> Result<(), FetchError> {
        if self.started {
            return Err(FetchError::Config("fetch manager already started".into()));
        }
        self.store.keep_alive(&self.id).await?;
        self.started = true;
        info!(
            fetcher = %self.id,
            workers = self.config.fetcher.num_workers,
            "fetch manager starting"
        );

        let store = Arc::clone(&self.store);
        let id = self.id.clone();
        let interval = self.config.heartbeat.interval();
        let mut quit = self.quit.subscribe();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = quit.recv() => break,
                    _ = tokio::time::sleep(interval) => {
                        // only the initial registration is fatal
                        if let Err(e) = store.keep_alive(&id).await {
                            warn!(fetcher = %id, error = %e, "keep-alive failed");
                        }
                    }
                }
            }
            debug!(fetcher = %id, "heartbeat stopped");
        }));

        for worker_id in 0..self.config.fetcher.num_workers {
            let worker = FetchWorker::new(
                worker_id,
                Arc::clone(&self.config),
                Arc::clone(&self.store),
                Arc::clone(&self.handler),
                self.client.clone(),
                Arc::clone(&self.resolver),
                Arc::clone(&self.extractor),
                self.quit.subscribe(),
            );
            self.tasks.push(tokio::spawn(worker.run()));
        }
        Ok(())
    }

    /// Signal every worker to quit after its current link and wait for the
    /// pool and the heartbeat to drain. A worker holding a host unclaims it
    /// on the way out, so shutdown is bounded by roughly one request
    /// timeout per worker.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }
        info!("fetch manager stopping");
        let _ = self.quit.send(());
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "fetcher task panicked");
            }
        }
        self.started = false;
        info!("fetch manager stopped");
    }
}
