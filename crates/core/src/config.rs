use std::time::Duration;

use serde::Deserialize;

use crate::error::FetchError;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub politeness: PolitenessConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

impl AppConfig {
    /// Reject configurations the fetcher cannot run with. Called once at
    /// manager construction, before any worker is spawned.
    pub fn validate(&self) -> Result<(), FetchError> {
        if self.fetcher.num_workers == 0 {
            return Err(FetchError::Config("num_workers must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.heartbeat.keep_ratio) {
            return Err(FetchError::Config(format!(
                "keep_ratio must be in [0, 1), got {}",
                self.heartbeat.keep_ratio
            )));
        }
        self.http.keep_alive_mode()?;
        if self.http.max_content_size_bytes == 0 {
            return Err(FetchError::Config("max_content_size_bytes must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetcherConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Number of concurrent workers, each crawling one claimed host at a time.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Content-Types delivered to the handler; also sent as the Accept header.
    #[serde(default = "default_accept_formats")]
    pub accept_formats: Vec<String>,
    /// Schemes of links that are stored and followed.
    #[serde(default = "default_accept_protocols")]
    pub accept_protocols: Vec<String>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            num_workers: default_num_workers(),
            accept_formats: default_accept_formats(),
            accept_protocols: default_accept_protocols(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_content_size")]
    pub max_content_size_bytes: usize,
    #[serde(default = "default_dns_cache_entries")]
    pub max_dns_cache_entries: usize,
    /// Skip hosts whose address resolves into a private range.
    #[serde(default = "default_true")]
    pub blacklist_private_ips: bool,
    /// "always", "never", or "threshold".
    #[serde(default = "default_keep_alive")]
    pub keep_alive: String,
    /// In threshold mode, crawl delays above this use the no-keep-alive
    /// transport.
    #[serde(default = "default_keep_alive_threshold_ms")]
    pub keep_alive_threshold_ms: u64,
    /// Populate the body capture on fetch records.
    #[serde(default)]
    pub store_response_body: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            max_content_size_bytes: default_max_content_size(),
            max_dns_cache_entries: default_dns_cache_entries(),
            blacklist_private_ips: true,
            keep_alive: default_keep_alive(),
            keep_alive_threshold_ms: default_keep_alive_threshold_ms(),
            store_response_body: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveMode {
    Always,
    Never,
    Threshold,
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn keep_alive_threshold(&self) -> Duration {
        Duration::from_millis(self.keep_alive_threshold_ms)
    }

    pub fn keep_alive_mode(&self) -> Result<KeepAliveMode, FetchError> {
        match self.keep_alive.as_str() {
            "always" => Ok(KeepAliveMode::Always),
            "never" => Ok(KeepAliveMode::Never),
            "threshold" => Ok(KeepAliveMode::Threshold),
            other => Err(FetchError::Config(format!(
                "keep_alive must be always/never/threshold, got {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolitenessConfig {
    /// Used when robots.txt names no crawl-delay.
    #[serde(default = "default_crawl_delay_ms")]
    pub default_crawl_delay_ms: u64,
    /// Upper clamp on robots.txt crawl-delays.
    #[serde(default = "default_max_crawl_delay_ms")]
    pub max_crawl_delay_ms: u64,
    /// Session-id keys stripped from paths and queries during normalization.
    #[serde(default = "default_sid_list")]
    pub purge_sid_list: Vec<String>,
}

impl Default for PolitenessConfig {
    fn default() -> Self {
        Self {
            default_crawl_delay_ms: default_crawl_delay_ms(),
            max_crawl_delay_ms: default_max_crawl_delay_ms(),
            purge_sid_list: default_sid_list(),
        }
    }
}

impl PolitenessConfig {
    pub fn default_crawl_delay(&self) -> Duration {
        Duration::from_millis(self.default_crawl_delay_ms)
    }

    pub fn max_crawl_delay(&self) -> Duration {
        Duration::from_millis(self.max_crawl_delay_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractConfig {
    /// Tags removed from the extractor's built-in include set.
    #[serde(default = "default_ignore_tags")]
    pub ignore_tags: Vec<String>,
    /// Upper bound on outlinks emitted per page; 0 = unlimited.
    #[serde(default)]
    pub max_links_per_page: usize,
    /// Links with longer paths are dropped; 0 = no limit.
    #[serde(default)]
    pub max_path_length: usize,
    #[serde(default = "default_true")]
    pub honor_meta_noindex: bool,
    #[serde(default)]
    pub honor_meta_nofollow: bool,
    /// Links matching any of these are dropped unless an include pattern
    /// matches too.
    #[serde(default)]
    pub exclude_link_patterns: Vec<String>,
    #[serde(default)]
    pub include_link_patterns: Vec<String>,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            ignore_tags: default_ignore_tags(),
            max_links_per_page: 0,
            max_path_length: 0,
            honor_meta_noindex: true,
            honor_meta_nofollow: false,
            exclude_link_patterns: Vec::new(),
            include_link_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HeartbeatConfig {
    /// A fetcher silent for longer than this is considered dead by the store.
    #[serde(default = "default_ttl_seconds")]
    pub active_fetchers_ttl_seconds: u64,
    /// Heartbeats fire every ttl * keep_ratio. Must be in [0, 1).
    #[serde(default = "default_keep_ratio")]
    pub keep_ratio: f64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            active_fetchers_ttl_seconds: default_ttl_seconds(),
            keep_ratio: default_keep_ratio(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.active_fetchers_ttl_seconds as f64 * self.keep_ratio)
    }
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (compatible; gleaner/0.1)".to_string()
}
fn default_num_workers() -> usize { 10 }
fn default_accept_formats() -> Vec<String> {
    vec!["text/html".to_string(), "text/*".to_string()]
}
fn default_accept_protocols() -> Vec<String> {
    vec!["http".to_string(), "https".to_string()]
}
fn default_timeout_seconds() -> u64 { 30 }
fn default_max_content_size() -> usize { 20 * 1024 * 1024 }
fn default_dns_cache_entries() -> usize { 20_000 }
fn default_keep_alive() -> String { "always".to_string() }
fn default_keep_alive_threshold_ms() -> u64 { 15_000 }
fn default_crawl_delay_ms() -> u64 { 1_000 }
fn default_max_crawl_delay_ms() -> u64 { 300_000 }
fn default_sid_list() -> Vec<String> {
    vec![
        "jsessionid".to_string(),
        "phpsessid".to_string(),
        "aspsessionid".to_string(),
    ]
}
fn default_ignore_tags() -> Vec<String> {
    vec!["script".to_string(), "img".to_string(), "link".to_string()]
}
fn default_ttl_seconds() -> u64 { 900 }
fn default_keep_ratio() -> f64 { 0.75 }
fn default_true() -> bool { true }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.fetcher.num_workers, 10);
        assert_eq!(config.http.keep_alive_mode().unwrap(), KeepAliveMode::Always);
        assert_eq!(config.politeness.purge_sid_list.len(), 3);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [fetcher]
            num_workers = 3

            [http]
            keep_alive = "threshold"
            keep_alive_threshold_ms = 2000
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.fetcher.num_workers, 3);
        assert_eq!(config.http.keep_alive_mode().unwrap(), KeepAliveMode::Threshold);
        assert_eq!(config.http.timeout_seconds, 30);
        assert_eq!(config.politeness.default_crawl_delay_ms, 1000);
    }

    #[test]
    fn bad_keep_ratio_rejected() {
        let mut config = AppConfig::default();
        config.heartbeat.keep_ratio = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_keep_alive_mode_rejected() {
        let mut config = AppConfig::default();
        config.http.keep_alive = "sometimes".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn heartbeat_interval_uses_ratio() {
        let heartbeat = HeartbeatConfig {
            active_fetchers_ttl_seconds: 100,
            keep_ratio: 0.5,
        };
        assert_eq!(heartbeat.interval(), Duration::from_secs(50));
    }
}
