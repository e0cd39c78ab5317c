use std::fmt;
use std::ops::Deref;

use chrono::{DateTime, Utc};
use url::Url;

use crate::error::FetchError;

/// Sentinel meaning "this URL has never been crawled".
pub fn never_crawled() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// An absolute URL plus the time it was last crawled. Immutable after
/// construction; the sentinel for "never" is the Unix epoch so the
/// conditional-GET check is a plain comparison.
#[derive(Debug, Clone)]
pub struct CrawlUrl {
    url: Url,
    pub last_crawled: DateTime<Utc>,
}

impl CrawlUrl {
    /// Parse without normalizing. Use `Normalizer::parse_and_normalize` for
    /// discovered links.
    pub fn parse(raw: &str) -> Result<Self, FetchError> {
        let url = Url::parse(raw.trim()).map_err(|e| FetchError::InvalidUrl(format!("{raw}: {e}")))?;
        Ok(Self { url, last_crawled: never_crawled() })
    }

    pub fn from_url(url: Url) -> Self {
        Self { url, last_crawled: never_crawled() }
    }

    pub fn with_last_crawled(mut self, last_crawled: DateTime<Utc>) -> Self {
        self.last_crawled = last_crawled;
        self
    }

    /// Assemble from a registrable domain, optional subdomain, path, and
    /// scheme.
    pub fn from_parts(
        domain: &str,
        subdomain: &str,
        path: &str,
        scheme: &str,
        last_crawled: DateTime<Utc>,
    ) -> Result<Self, FetchError> {
        if domain.is_empty() {
            return Err(FetchError::InvalidUrl("empty domain".into()));
        }
        let host = if subdomain.is_empty() {
            domain.to_string()
        } else {
            format!("{subdomain}.{domain}")
        };
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let url = Url::parse(&format!("{scheme}://{host}{path}"))
            .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        Ok(Self { url, last_crawled })
    }

    pub fn as_url(&self) -> &Url {
        &self.url
    }

    pub fn into_url(self) -> Url {
        self.url
    }

    pub fn is_never_crawled(&self) -> bool {
        self.last_crawled == never_crawled()
    }

    /// Effective TLD plus one label, per the public-suffix list.
    pub fn tld_plus_one(&self) -> Option<String> {
        let host = self.url.host_str()?;
        psl::domain_str(host).map(|d| d.to_string())
    }

    /// Host minus TLD+1 minus the joining dot; empty when host == TLD+1.
    pub fn subdomain(&self) -> Option<String> {
        let host = self.url.host_str()?;
        let domain = psl::domain_str(host)?;
        let sub = host.strip_suffix(domain)?;
        Some(sub.trim_end_matches('.').to_string())
    }

    /// Equality on the URL alone, disregarding crawl history.
    pub fn eq_ignoring_last_crawled(&self, other: &CrawlUrl) -> bool {
        same_page(&self.url, &other.url)
    }
}

impl PartialEq for CrawlUrl {
    fn eq(&self, other: &Self) -> bool {
        self.eq_ignoring_last_crawled(other) && self.last_crawled == other.last_crawled
    }
}

impl Eq for CrawlUrl {}

impl Deref for CrawlUrl {
    type Target = Url;

    fn deref(&self) -> &Url {
        &self.url
    }
}

impl fmt::Display for CrawlUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.url.fmt(f)
    }
}

fn same_page(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port() == b.port()
        && a.path() == b.path()
        && a.query() == b.query()
}

/// Path plus query, the form robots rules and link filters match against.
pub fn request_uri(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    }
}

/// Canonicalizes URLs: lowercase scheme/host and stripped default ports come
/// from the parser itself; on top of that, unreserved percent-escapes are
/// decoded, query parameters are sorted, fragments dropped, and configured
/// session-id keys removed from both path segments and the query.
#[derive(Debug, Clone)]
pub struct Normalizer {
    sid_keys: Vec<String>,
}

impl Normalizer {
    pub fn new(purge_sid_list: &[String]) -> Self {
        Self {
            sid_keys: purge_sid_list.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    pub fn parse_and_normalize(&self, raw: &str) -> Result<CrawlUrl, FetchError> {
        let mut crawl_url = CrawlUrl::parse(raw)?;
        self.normalize(&mut crawl_url.url);
        Ok(crawl_url)
    }

    /// Resolve `raw` against `base` (for links found in a page), then
    /// normalize.
    pub fn join_and_normalize(&self, base: &Url, raw: &str) -> Result<CrawlUrl, FetchError> {
        let url = base
            .join(raw.trim())
            .map_err(|e| FetchError::InvalidUrl(format!("{raw}: {e}")))?;
        let mut crawl_url = CrawlUrl::from_url(url);
        self.normalize(&mut crawl_url.url);
        Ok(crawl_url)
    }

    pub fn normalize(&self, url: &mut Url) {
        url.set_fragment(None);

        if url.cannot_be_a_base() {
            return;
        }

        let path = self.clean_path(url.path());
        if path != url.path() {
            url.set_path(&path);
        }

        match url.query() {
            Some(q) => {
                let cleaned = self.clean_query(q);
                if cleaned.is_empty() {
                    url.set_query(None);
                } else if cleaned != q {
                    url.set_query(Some(&cleaned));
                }
            }
            None => {}
        }
    }

    fn is_sid_key(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.sid_keys.iter().any(|k| *k == key)
    }

    /// Decode unreserved escapes and drop `;key=value` matrix parameters
    /// whose key is a configured session id.
    fn clean_path(&self, path: &str) -> String {
        let segments: Vec<String> = path
            .split('/')
            .map(|segment| {
                let mut parts = segment.split(';');
                let base = parts.next().unwrap_or("");
                let mut cleaned = decode_unreserved(base);
                for param in parts {
                    let key = param.split('=').next().unwrap_or(param);
                    if self.is_sid_key(&decode_unreserved(key)) {
                        continue;
                    }
                    cleaned.push(';');
                    cleaned.push_str(&decode_unreserved(param));
                }
                cleaned
            })
            .collect();
        segments.join("/")
    }

    /// Drop session-id parameters, decode unreserved escapes, sort.
    fn clean_query(&self, query: &str) -> String {
        let mut params: Vec<String> = query
            .split('&')
            .filter(|p| !p.is_empty())
            .filter(|p| {
                let name = p.split('=').next().unwrap_or(p);
                !self.is_sid_key(&decode_unreserved(name))
            })
            .map(decode_unreserved)
            .collect();
        params.sort();
        params.join("&")
    }
}

/// Decode %XX escapes whose decoded byte is an RFC 3986 unreserved character
/// (ALPHA / DIGIT / "-" / "." / "_" / "~"). Reserved escapes are left intact,
/// so applying this twice equals applying it once.
fn decode_unreserved(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            ) {
                let decoded = (hi * 16 + lo) as u8;
                if decoded.is_ascii_alphanumeric() || matches!(decoded, b'-' | b'.' | b'_' | b'~') {
                    out.push(decoded as char);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> Normalizer {
        Normalizer::new(&[
            "jsessionid".to_string(),
            "phpsessid".to_string(),
            "aspsessionid".to_string(),
        ])
    }

    #[test]
    fn strips_session_ids_from_path_and_query() {
        let url = normalizer()
            .parse_and_normalize("http://a.com/p;JSESSIONID=X?PHPSESSID=Y&z=1#frag")
            .unwrap();
        assert_eq!(url.as_str(), "http://a.com/p?z=1");
    }

    #[test]
    fn normalization_is_idempotent() {
        let n = normalizer();
        for raw in [
            "HTTP://WWW.Example.COM:80/A%7Eb/c;jsessionid=1?b=2&a=1#x",
            "https://a.com/%41%2Fpath?q=%7e",
            "http://a.com/p;x=1;PHPSESSID=2/q",
        ] {
            let once = n.parse_and_normalize(raw).unwrap();
            let twice = n.parse_and_normalize(once.as_str()).unwrap();
            assert_eq!(once.as_str(), twice.as_str(), "input {raw}");
        }
    }

    #[test]
    fn sorts_query_and_drops_fragment() {
        let url = normalizer()
            .parse_and_normalize("http://a.com/?c=3&a=1&b=2#frag")
            .unwrap();
        assert_eq!(url.as_str(), "http://a.com/?a=1&b=2&c=3");
    }

    #[test]
    fn lowercases_and_strips_default_port() {
        let url = normalizer()
            .parse_and_normalize("HTTP://Example.COM:80/Path")
            .unwrap();
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.host_str(), Some("example.com"));
        assert_eq!(url.port(), None);
        // path case is significant and untouched
        assert_eq!(url.path(), "/Path");
    }

    #[test]
    fn decodes_only_unreserved_escapes() {
        let url = normalizer()
            .parse_and_normalize("http://a.com/%41%7E%2Fx?q=%2D")
            .unwrap();
        // %41 -> A, %7E -> ~, %2D -> -, but %2F (reserved '/') survives
        assert_eq!(url.path(), "/A~%2Fx");
        assert_eq!(url.query(), Some("q=-"));
    }

    #[test]
    fn keeps_non_sid_matrix_params() {
        let url = normalizer()
            .parse_and_normalize("http://a.com/p;view=flat;jsessionid=abc/q")
            .unwrap();
        assert_eq!(url.path(), "/p;view=flat/q");
    }

    #[test]
    fn tld_plus_one_and_subdomain() {
        let url = CrawlUrl::parse("http://www.news.bbc.co.uk/story").unwrap();
        assert_eq!(url.tld_plus_one().as_deref(), Some("bbc.co.uk"));
        assert_eq!(url.subdomain().as_deref(), Some("www.news"));

        let bare = CrawlUrl::parse("http://bbc.co.uk/").unwrap();
        assert_eq!(bare.subdomain().as_deref(), Some(""));
    }

    #[test]
    fn from_parts_builds_expected_url() {
        let url = CrawlUrl::from_parts("bbc.co.uk", "www", "/news", "http", never_crawled()).unwrap();
        assert_eq!(url.as_str(), "http://www.bbc.co.uk/news");
        let bare = CrawlUrl::from_parts("a.com", "", "p", "https", never_crawled()).unwrap();
        assert_eq!(bare.as_str(), "https://a.com/p");
    }

    #[test]
    fn equality_respects_last_crawled() {
        let a = CrawlUrl::parse("http://a.com/p?x=1").unwrap();
        let b = CrawlUrl::parse("http://a.com/p?x=1").unwrap();
        assert_eq!(a, b);

        let later = b.clone().with_last_crawled(Utc::now());
        assert_ne!(a, later);
        assert!(a.eq_ignoring_last_crawled(&later));
    }

    #[test]
    fn request_uri_includes_query() {
        let url = CrawlUrl::parse("http://a.com/p/q?x=1").unwrap();
        assert_eq!(request_uri(&url), "/p/q?x=1");
        let bare = CrawlUrl::parse("http://a.com/p").unwrap();
        assert_eq!(request_uri(&bare), "/p");
    }

    #[test]
    fn never_crawled_sentinel() {
        let url = CrawlUrl::parse("http://a.com/").unwrap();
        assert!(url.is_never_crawled());
        assert!(!url.clone().with_last_crawled(Utc::now()).is_never_crawled());
    }
}
