use std::time::Duration;

use texting_robots::Robot;
use tracing::debug;
use url::Url;

use gleaner_core::config::PolitenessConfig;

use crate::client::HttpClient;

/// What one host's robots.txt yields for our user-agent: an allow predicate
/// over request-URIs plus a crawl delay already clamped to the configured
/// maximum. Absent rules mean allow-all with the default delay.
pub struct RobotsGroup {
    rules: Option<Robot>,
    pub crawl_delay: Duration,
}

impl RobotsGroup {
    /// Used when robots.txt is missing, unreachable, or malformed.
    pub fn default_group(politeness: &PolitenessConfig) -> Self {
        Self {
            rules: None,
            crawl_delay: politeness
                .default_crawl_delay()
                .min(politeness.max_crawl_delay()),
        }
    }

    pub fn parse(user_agent: &str, body: &[u8], politeness: &PolitenessConfig) -> Self {
        match Robot::new(user_agent, body) {
            Ok(robot) => {
                // try_from rejects negative, NaN, and absurdly large values
                let delay = robot
                    .delay
                    .and_then(|secs| Duration::try_from_secs_f32(secs).ok())
                    .unwrap_or_else(|| politeness.default_crawl_delay());
                Self {
                    crawl_delay: delay.min(politeness.max_crawl_delay()),
                    rules: Some(robot),
                }
            }
            Err(e) => {
                debug!(error = %e, "robots.txt did not parse, allowing all");
                Self::default_group(politeness)
            }
        }
    }

    /// Tested against the request-URI (path plus query), never the full URL.
    pub fn allows(&self, request_uri: &str) -> bool {
        self.rules
            .as_ref()
            .map(|r| r.allowed(request_uri))
            .unwrap_or(true)
    }
}

/// Fetch and evaluate robots.txt for an origin (scheme + authority). Any
/// failure, including non-2xx, falls back to the default group.
pub async fn fetch_group(
    client: &HttpClient,
    origin: &Url,
    politeness: &PolitenessConfig,
) -> RobotsGroup {
    let Ok(robots_url) = origin.join("/robots.txt") else {
        return RobotsGroup::default_group(politeness);
    };
    match client.get_no_keep_alive(&robots_url).await {
        Ok(response) if response.status().is_success() => match response.bytes().await {
            Ok(body) => RobotsGroup::parse(client.user_agent(), &body, politeness),
            Err(e) => {
                debug!(url = %robots_url, error = %e, "robots.txt body read failed");
                RobotsGroup::default_group(politeness)
            }
        },
        Ok(response) => {
            debug!(url = %robots_url, status = response.status().as_u16(), "no robots.txt");
            RobotsGroup::default_group(politeness)
        }
        Err(e) => {
            debug!(url = %robots_url, error = %e, "robots.txt fetch failed");
            RobotsGroup::default_group(politeness)
        }
    }
}
