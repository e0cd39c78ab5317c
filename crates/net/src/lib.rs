pub mod blacklist;
pub mod client;
pub mod dns;
pub mod robots;

pub use client::{snapshot, HttpClient};
pub use dns::CachingResolver;
pub use robots::{fetch_group, RobotsGroup};
