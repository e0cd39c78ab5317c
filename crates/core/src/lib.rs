pub mod config;
pub mod error;
pub mod types;
pub mod url;

pub use crate::config::AppConfig;
pub use crate::error::FetchError;
pub use crate::types::*;
pub use crate::url::{never_crawled, CrawlUrl, Normalizer};
