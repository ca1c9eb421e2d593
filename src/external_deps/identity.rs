//! Template-based request identities.
//!
//! Picks one desktop browser template and keeps presenting its headers until
//! the identity is refreshed.

use http::header::{ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, HeaderName, HeaderValue, USER_AGENT};
use http::HeaderMap;
use rand::seq::SliceRandom;

use super::FingerprintProvider;
use crate::modules::strategy::FingerprintIntensity;

#[derive(Debug, Clone, Copy)]
struct IdentityTemplate {
    user_agent: &'static str,
    platform: &'static str,
    client_hints: Option<&'static str>,
}

const TEMPLATES: &[IdentityTemplate] = &[
    IdentityTemplate {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        platform: "\"Windows\"",
        client_hints: Some("\"Chromium\";v=\"124\", \"Google Chrome\";v=\"124\", \"Not-A.Brand\";v=\"99\""),
    },
    IdentityTemplate {
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        platform: "\"macOS\"",
        client_hints: Some("\"Chromium\";v=\"123\", \"Google Chrome\";v=\"123\", \"Not-A.Brand\";v=\"99\""),
    },
    IdentityTemplate {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
        platform: "\"Windows\"",
        client_hints: Some("\"Chromium\";v=\"124\", \"Microsoft Edge\";v=\"124\", \"Not-A.Brand\";v=\"99\""),
    },
    IdentityTemplate {
        user_agent: "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
        platform: "\"Linux\"",
        client_hints: None,
    },
    IdentityTemplate {
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
        platform: "\"macOS\"",
        client_hints: None,
    },
];

const ACCEPT_LANGUAGES: &[&str] = &["en-US,en;q=0.9", "en-GB,en;q=0.8", "en-US,en;q=0.8,de;q=0.5"];

/// Default [`FingerprintProvider`].
#[derive(Debug, Clone)]
pub struct HeaderIdentityProvider {
    template: IdentityTemplate,
    accept_language: &'static str,
    generation: u64,
}

impl HeaderIdentityProvider {
    pub fn new() -> Self {
        let (template, accept_language) = pick();
        Self {
            template,
            accept_language,
            generation: 0,
        }
    }

    pub fn user_agent(&self) -> &'static str {
        self.template.user_agent
    }

    /// Number of refreshes so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Default for HeaderIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FingerprintProvider for HeaderIdentityProvider {
    fn generate_identity(&mut self, intensity: FingerprintIntensity) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(self.template.user_agent));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(self.accept_language));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate, br"));

        if intensity == FingerprintIntensity::Advanced {
            headers.insert(
                HeaderName::from_static("upgrade-insecure-requests"),
                HeaderValue::from_static("1"),
            );
            headers.insert(HeaderName::from_static("sec-fetch-dest"), HeaderValue::from_static("document"));
            headers.insert(HeaderName::from_static("sec-fetch-mode"), HeaderValue::from_static("navigate"));
            headers.insert(HeaderName::from_static("sec-fetch-site"), HeaderValue::from_static("none"));
            if let Some(hints) = self.template.client_hints {
                headers.insert(HeaderName::from_static("sec-ch-ua"), HeaderValue::from_static(hints));
                headers.insert(
                    HeaderName::from_static("sec-ch-ua-platform"),
                    HeaderValue::from_static(self.template.platform),
                );
            }
        }

        headers
    }

    fn refresh_identity(&mut self) {
        let (template, accept_language) = pick();
        self.template = template;
        self.accept_language = accept_language;
        self.generation += 1;
    }
}

fn pick() -> (IdentityTemplate, &'static str) {
    let mut rng = rand::thread_rng();
    let template = TEMPLATES.choose(&mut rng).copied().unwrap_or(TEMPLATES[0]);
    let language = ACCEPT_LANGUAGES.choose(&mut rng).copied().unwrap_or(ACCEPT_LANGUAGES[0]);
    (template, language)
}
