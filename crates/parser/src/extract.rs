use std::collections::HashSet;

use scraper::{ElementRef, Html, Selector};
use tracing::trace;
use url::Url;

use gleaner_core::config::AppConfig;
use gleaner_core::error::FetchError;
use gleaner_core::url::{CrawlUrl, Normalizer};

use crate::filter::LinkFilter;

/// Tags the extractor knows how to pull a link out of. The configured
/// ignore list is subtracted from this set.
const INCLUDE_TAGS: &[&str] = &[
    "a", "area", "form", "frame", "iframe", "script", "link", "img", "object", "embed", "meta",
];

/// Inline srcdoc documents nest; anything deeper than this is ignored.
const MAX_SRCDOC_DEPTH: usize = 4;

/// What one HTML document yielded.
#[derive(Debug, Default)]
pub struct ExtractedPage {
    /// Absolute, normalized, filter-approved outlinks in document order.
    pub links: Vec<CrawlUrl>,
    pub noindex: bool,
    pub nofollow: bool,
    /// First tokenizer complaint, if any. Extraction still returns whatever
    /// it recovered.
    pub parse_error: Option<String>,
}

pub struct LinkExtractor {
    normalizer: Normalizer,
    filter: LinkFilter,
    tag_selector: Selector,
    /// meta refresh targets count as outlinks only when meta is not ignored.
    meta_links: bool,
    honor_nofollow: bool,
    max_links: usize,
}

impl LinkExtractor {
    pub fn new(config: &AppConfig) -> Result<Self, FetchError> {
        let ignored: HashSet<String> = config
            .extract
            .ignore_tags
            .iter()
            .map(|t| t.to_lowercase())
            .collect();
        // meta stays in the selector even when ignored: robots directives
        // must be seen regardless, only the refresh outlink is suppressed.
        let tags: Vec<&str> = INCLUDE_TAGS
            .iter()
            .copied()
            .filter(|t| *t == "meta" || !ignored.contains(*t))
            .collect();
        let tag_selector = Selector::parse(&tags.join(", "))
            .map_err(|e| FetchError::Config(format!("tag selector: {e}")))?;

        Ok(Self {
            normalizer: Normalizer::new(&config.politeness.purge_sid_list),
            filter: LinkFilter::new(&config.fetcher, &config.extract)?,
            tag_selector,
            meta_links: !ignored.contains("meta"),
            honor_nofollow: config.extract.honor_meta_nofollow,
            max_links: config.extract.max_links_per_page,
        })
    }

    /// Extract outlinks and meta flags from a response body. `content_type`
    /// is the raw Content-Type header, used for charset resolution.
    pub fn extract(&self, body: &[u8], content_type: Option<&str>, page_url: &Url) -> ExtractedPage {
        let text = decode_body(body, content_type);
        let document = Html::parse_document(&text);

        let mut page = ExtractedPage::default();
        if let Some(err) = document.errors.first() {
            page.parse_error = Some(err.to_string());
        }
        self.walk(&document, page_url, &mut page, 0);
        trace!(links = page.links.len(), noindex = page.noindex, nofollow = page.nofollow, "extracted page");
        page
    }

    fn walk(&self, document: &Html, page_url: &Url, page: &mut ExtractedPage, depth: usize) {
        for element in document.select(&self.tag_selector) {
            match element.value().name() {
                "meta" => self.visit_meta(element, page_url, page),
                "iframe" => {
                    if let Some(srcdoc) = element.value().attr("srcdoc") {
                        if depth < MAX_SRCDOC_DEPTH {
                            let inner = Html::parse_document(srcdoc);
                            self.walk(&inner, page_url, page, depth + 1);
                        }
                    } else if let Some(src) = element.value().attr("src") {
                        self.push_link(src, page_url, page);
                    }
                }
                tag => {
                    if let Some(raw) = link_attr(tag, element) {
                        self.push_link(raw, page_url, page);
                    }
                }
            }
        }
    }

    fn visit_meta(&self, element: ElementRef<'_>, page_url: &Url, page: &mut ExtractedPage) {
        let value = element.value();
        if let (Some(name), Some(content)) = (value.attr("name"), value.attr("content")) {
            if name.eq_ignore_ascii_case("robots") {
                let content = content.to_lowercase();
                if content.contains("noindex") {
                    page.noindex = true;
                }
                if content.contains("nofollow") {
                    page.nofollow = true;
                }
            }
        }
        if !self.meta_links {
            return;
        }
        if let (Some(equiv), Some(content)) = (value.attr("http-equiv"), value.attr("content")) {
            if equiv.eq_ignore_ascii_case("refresh") {
                if let Some(target) = refresh_target(content) {
                    self.push_link(target, page_url, page);
                }
            }
        }
    }

    fn push_link(&self, raw: &str, page_url: &Url, page: &mut ExtractedPage) {
        if self.honor_nofollow && page.nofollow {
            return;
        }
        if self.max_links > 0 && page.links.len() >= self.max_links {
            return;
        }
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with('#') {
            return;
        }
        let Ok(link) = self.normalizer.join_and_normalize(page_url, raw) else {
            return;
        };
        if self.filter.accepts(&link) {
            page.links.push(link);
        }
    }
}

fn link_attr<'a>(tag: &str, element: ElementRef<'a>) -> Option<&'a str> {
    let value = element.value();
    match tag {
        "a" | "area" | "link" => value.attr("href"),
        "form" => value.attr("action"),
        "frame" | "img" | "embed" | "script" => value.attr("src"),
        "object" => value.attr("data"),
        _ => None,
    }
}

/// Pull the url= part out of a `<meta http-equiv=refresh>` content value,
/// e.g. `5;url=/next` or `0; URL='/next'`.
fn refresh_target(content: &str) -> Option<&str> {
    for part in content.split(';') {
        let part = part.trim();
        if let Some(rest) = part
            .get(..4)
            .filter(|prefix| prefix.eq_ignore_ascii_case("url="))
            .and_then(|_| part.get(4..))
        {
            return Some(rest.trim().trim_matches(|c| c == '\'' || c == '"'));
        }
    }
    None
}

/// Decode a body to text. Charset comes from the Content-Type header when it
/// names one, otherwise from a `<meta charset>` sniff over the head of the
/// document, otherwise UTF-8 with replacement.
fn decode_body(body: &[u8], content_type: Option<&str>) -> String {
    if let Some(encoding) = content_type
        .and_then(|ct| ct.parse::<mime::Mime>().ok())
        .and_then(|m| {
            m.get_param(mime::CHARSET)
                .and_then(|cs| encoding_rs::Encoding::for_label(cs.as_str().as_bytes()))
        })
    {
        return encoding.decode(body).0.into_owned();
    }
    if let Some(encoding) = sniff_meta_charset(body) {
        return encoding.decode(body).0.into_owned();
    }
    String::from_utf8_lossy(body).into_owned()
}

/// Look for `charset=<label>` in the first 1024 bytes.
fn sniff_meta_charset(body: &[u8]) -> Option<&'static encoding_rs::Encoding> {
    let head = &body[..body.len().min(1024)];
    let head = String::from_utf8_lossy(head).to_lowercase();
    let pos = head.find("charset=")?;
    let rest = &head[pos + "charset=".len()..];
    let label: String = rest
        .trim_start_matches(['"', '\''])
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    encoding_rs::Encoding::for_label(label.as_bytes())
}
