use regex::RegexSet;
use url::Url;

use gleaner_core::config::{ExtractConfig, FetcherConfig};
use gleaner_core::error::FetchError;
use gleaner_core::url::request_uri;

/// Decides whether a discovered link may be stored and followed. Exclude
/// patterns drop a link unless an include pattern matches the same
/// request-URI, so includes act as allow-list exceptions.
#[derive(Debug)]
pub struct LinkFilter {
    accept_protocols: Vec<String>,
    max_path_length: usize,
    exclude: Option<RegexSet>,
    include: Option<RegexSet>,
}

impl LinkFilter {
    pub fn new(fetcher: &FetcherConfig, extract: &ExtractConfig) -> Result<Self, FetchError> {
        Ok(Self {
            accept_protocols: fetcher
                .accept_protocols
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            max_path_length: extract.max_path_length,
            exclude: compile(&extract.exclude_link_patterns)?,
            include: compile(&extract.include_link_patterns)?,
        })
    }

    pub fn accepts(&self, url: &Url) -> bool {
        if !self.accept_protocols.iter().any(|p| p == url.scheme()) {
            return false;
        }
        if self.max_path_length > 0 && url.path().len() > self.max_path_length {
            return false;
        }
        let uri = request_uri(url);
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(&uri) {
                let allowed = self
                    .include
                    .as_ref()
                    .map(|inc| inc.is_match(&uri))
                    .unwrap_or(false);
                if !allowed {
                    return false;
                }
            }
        }
        true
    }
}

fn compile(patterns: &[String]) -> Result<Option<RegexSet>, FetchError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    RegexSet::new(patterns)
        .map(Some)
        .map_err(|e| FetchError::Config(format!("bad link pattern: {e}")))
}
