//! Link extraction for iterative crawls.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use std::collections::HashSet;
use url::Url;

static ANCHOR_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href]").expect("invalid anchor selector"));

const SKIPPED_SCHEMES: &[&str] = &["javascript:", "mailto:", "tel:", "data:", "file:"];

/// Pulls absolute links out of an HTML document.
pub trait LinkExtractor: Send + Sync {
    fn extract_links(&self, html: &str, base_url: &Url) -> Vec<Url>;
}

/// `<a href>` extraction built on `scraper`. Fragments are dropped and
/// duplicates removed, first occurrence wins.
#[derive(Debug, Clone, Default)]
pub struct ScraperLinkExtractor;

impl ScraperLinkExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl LinkExtractor for ScraperLinkExtractor {
    fn extract_links(&self, html: &str, base_url: &Url) -> Vec<Url> {
        let document = Html::parse_document(html);
        let mut seen = HashSet::new();
        let mut links = Vec::new();

        for element in document.select(&ANCHOR_SELECTOR) {
            let Some(href) = element.value().attr("href") else {
                continue;
            };
            let href = href.trim();
            if href.is_empty()
                || href.starts_with('#')
                || SKIPPED_SCHEMES
                    .iter()
                    .any(|scheme| {
                        href.get(..scheme.len())
                            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
                    })
            {
                continue;
            }

            let Ok(mut url) = base_url.join(href) else {
                log::debug!("skipping unparsable link {href:?} on {base_url}");
                continue;
            };
            if !matches!(url.scheme(), "http" | "https") {
                continue;
            }
            url.set_fragment(None);
            if seen.insert(url.as_str().to_string()) {
                links.push(url);
            }
        }

        links
    }
}

/// Decides which discovered links an iterative crawl follows.
#[derive(Debug, Clone)]
pub struct LinkFilter {
    domain: Option<String>,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl LinkFilter {
    /// Accepts everything.
    pub fn any() -> Self {
        Self {
            domain: None,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }

    /// Restricts links to the host of `base` and its subdomains.
    pub fn same_domain(base: &Url) -> Self {
        let domain = base
            .host_str()
            .map(|host| host.trim_start_matches("www.").to_ascii_lowercase());
        Self {
            domain,
            ..Self::any()
        }
    }

    pub fn include<I, S>(mut self, patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            self.include.push(Regex::new(pattern.as_ref())?);
        }
        Ok(self)
    }

    pub fn exclude<I, S>(mut self, patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            self.exclude.push(Regex::new(pattern.as_ref())?);
        }
        Ok(self)
    }

    pub fn allows(&self, url: &Url) -> bool {
        if let Some(domain) = &self.domain {
            let Some(host) = url.host_str() else {
                return false;
            };
            let host = host.to_ascii_lowercase();
            let host = host.trim_start_matches("www.");
            if host != domain && !host.ends_with(&format!(".{domain}")) {
                return false;
            }
        }

        let raw = url.as_str();
        if !self.include.is_empty() && !self.include.iter().any(|re| re.is_match(raw)) {
            return false;
        }
        !self.exclude.iter().any(|re| re.is_match(raw))
    }
}

impl Default for LinkFilter {
    fn default() -> Self {
        Self::any()
    }
}
