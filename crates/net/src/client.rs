use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, IF_MODIFIED_SINCE, USER_AGENT};
use reqwest::redirect::Policy;
use url::Url;

use gleaner_core::config::{AppConfig, KeepAliveMode};
use gleaner_core::error::FetchError;
use gleaner_core::types::FetchResponse;
use gleaner_core::url::never_crawled;

use crate::dns::CachingResolver;

/// Two transports over one DNS cache: the default pooled client, and a
/// no-keep-alive twin for hosts whose crawl delay makes idle connections
/// pointless. Redirects are never followed here; the worker walks the chain
/// itself so it can consult robots for every host it lands on.
#[derive(Clone)]
pub struct HttpClient {
    default: reqwest::Client,
    no_keep_alive: reqwest::Client,
    mode: KeepAliveMode,
    keep_alive_threshold: Duration,
    user_agent: String,
    accept: String,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(config: &AppConfig, resolver: Arc<CachingResolver>) -> Result<Self, FetchError> {
        let timeout = config.http.timeout();
        let build = |keep_alive: bool| -> Result<reqwest::Client, FetchError> {
            let mut builder = reqwest::Client::builder()
                .redirect(Policy::none())
                .timeout(timeout)
                .connect_timeout(timeout)
                .dns_resolver(Arc::clone(&resolver));
            if !keep_alive {
                builder = builder.pool_max_idle_per_host(0);
            }
            builder
                .build()
                .map_err(|e| FetchError::Config(format!("http client: {e}")))
        };
        Ok(Self {
            default: build(true)?,
            no_keep_alive: build(false)?,
            mode: config.http.keep_alive_mode()?,
            keep_alive_threshold: config.http.keep_alive_threshold(),
            user_agent: config.fetcher.user_agent.clone(),
            accept: config.fetcher.accept_formats.join(", "),
            timeout,
        })
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Hosts we wait a long time between requests for get a connection that
    /// closes instead of idling in the pool.
    fn transport_for_delay(&self, crawl_delay: Duration) -> &reqwest::Client {
        match self.mode {
            KeepAliveMode::Always => &self.default,
            KeepAliveMode::Never => &self.no_keep_alive,
            KeepAliveMode::Threshold => {
                if crawl_delay > self.keep_alive_threshold {
                    &self.no_keep_alive
                } else {
                    &self.default
                }
            }
        }
    }

    /// One GET, redirects unfollowed. `last_crawled` other than the sentinel
    /// turns into an If-Modified-Since header.
    pub async fn get(
        &self,
        url: &Url,
        last_crawled: DateTime<Utc>,
        crawl_delay: Duration,
    ) -> Result<reqwest::Response, FetchError> {
        let mut request = self
            .transport_for_delay(crawl_delay)
            .get(url.as_str())
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, &self.accept);
        if last_crawled != never_crawled() {
            request = request.header(
                IF_MODIFIED_SINCE,
                last_crawled.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
            );
        }
        request.send().await.map_err(|e| self.classify(e))
    }

    /// Plain GET on the no-keep-alive transport; used for robots.txt, one
    /// request per host claim.
    pub async fn get_no_keep_alive(&self, url: &Url) -> Result<reqwest::Response, FetchError> {
        self.no_keep_alive
            .get(url.as_str())
            .header(USER_AGENT, &self.user_agent)
            .send()
            .await
            .map_err(|e| self.classify(e))
    }

    /// Stream a response body into `buf`, bounded by `max`. The buffer is
    /// caller-owned so a worker reuses one allocation across fetches.
    pub async fn read_body(
        &self,
        response: &mut reqwest::Response,
        max: usize,
        buf: &mut Vec<u8>,
    ) -> Result<(), FetchError> {
        buf.clear();
        if let Some(len) = response.content_length() {
            let len = len as usize;
            if len > max {
                return Err(FetchError::BodyTooLarge { size: len, max });
            }
            buf.reserve(len);
        }
        while let Some(chunk) = response.chunk().await.map_err(|e| self.classify(e))? {
            if buf.len() + chunk.len() > max {
                return Err(FetchError::BodyTooLarge {
                    size: buf.len() + chunk.len(),
                    max,
                });
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(())
    }

    fn classify(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else if e.is_decode() || e.is_body() {
            FetchError::Protocol(e.to_string())
        } else {
            FetchError::Transport(e.to_string())
        }
    }
}

/// Copy the status line and headers out of a live response. Header names
/// come back lowercase from reqwest.
pub fn snapshot(response: &reqwest::Response) -> FetchResponse {
    let mut headers = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_string(), value.to_string());
        }
    }
    FetchResponse {
        status: response.status().as_u16(),
        headers,
    }
}
