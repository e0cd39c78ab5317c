use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("malformed response: {0}")]
    Protocol(String),

    #[error("http status {0}")]
    HttpStatus(u16),

    #[error("body too large: {size} bytes (max {max})")]
    BodyTooLarge { size: usize, max: usize },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("host resolves to a blacklisted address: {0}")]
    Blacklisted(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl FetchError {
    /// Coarse bucket used in log fields and persisted fetch records.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Transport(_) | FetchError::Timeout(_) => "transport",
            FetchError::Protocol(_) | FetchError::HttpStatus(_) => "protocol",
            FetchError::BodyTooLarge { .. } => "size",
            FetchError::Parse(_) => "parse",
            FetchError::InvalidUrl(_) | FetchError::Blacklisted(_) => "policy",
            FetchError::Store(_) => "store",
            FetchError::Config(_) => "config",
            FetchError::Other(_) => "other",
        }
    }
}
