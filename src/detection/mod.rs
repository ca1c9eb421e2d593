//! Block detection.
//!
//! Pattern-based classification of fetch responses into "served" and
//! "blocked", with a coarse signal describing which defence fired. The
//! signal drives the size of the risk increase applied afterwards.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use url::Url;

/// Bodies shorter than this on a 200 are treated as thin, suspicious pages.
pub const THIN_CONTENT_THRESHOLD: usize = 500;

/// Which defence a blocked response looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockSignal {
    Captcha,
    Forbidden,
    RateLimited,
    ServiceUnavailable,
    Signature,
    ThinContent,
}

impl BlockSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockSignal::Captcha => "captcha",
            BlockSignal::Forbidden => "forbidden",
            BlockSignal::RateLimited => "rate_limited",
            BlockSignal::ServiceUnavailable => "service_unavailable",
            BlockSignal::Signature => "signature",
            BlockSignal::ThinContent => "thin_content",
        }
    }
}

/// Result of classifying one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockVerdict {
    pub blocked: bool,
    pub signal: Option<BlockSignal>,
}

impl BlockVerdict {
    pub const CLEAR: BlockVerdict = BlockVerdict {
        blocked: false,
        signal: None,
    };

    pub fn blocked(signal: BlockSignal) -> Self {
        Self {
            blocked: true,
            signal: Some(signal),
        }
    }
}

/// Decides whether a response is a block page.
pub trait BlockDetector: Send + Sync {
    fn is_blocked(&self, status: u16, body: &str, content_type: Option<&str>) -> bool;

    /// Richer classification; the default only knows blocked or not.
    fn classify(
        &self,
        status: u16,
        body: &str,
        content_type: Option<&str>,
        _url: &Url,
    ) -> BlockVerdict {
        if self.is_blocked(status, body, content_type) {
            BlockVerdict::blocked(BlockSignal::Signature)
        } else {
            BlockVerdict::CLEAR
        }
    }
}

static CAPTCHA_CONTENT: Lazy<Regex> = Lazy::new(|| {
    build_regex(
        r"captcha|recaptcha|hcaptcha|g-recaptcha|验证码|人机验证|请证明您不是机器人|security check",
    )
});

static DENIED_CONTENT: Lazy<Regex> =
    Lazy::new(|| build_regex(r"\baccess (is |was )?denied\b|\b403 forbidden\b|拒绝访问"));

static RATE_LIMIT_CONTENT: Lazy<Regex> =
    Lazy::new(|| build_regex(r"too many requests|rate limit(ed)?|slow down"));

static BOT_CONTENT: Lazy<Regex> = Lazy::new(|| {
    build_regex(
        concat!(
            r"\b(are you a robot|not a robot|robot check|bot detected",
            r"|automated (access|requests?|queries|traffic)",
            r"|(you have been|you've been|request (was|has been)|access (was|has been)) blocked",
            r"|suspicious (activity|traffic|behaviou?r)|unusual (activity|traffic))\b",
            r"|distil_r|distil networks",
        ),
    )
});

static CHALLENGE_URL: Lazy<Regex> =
    Lazy::new(|| build_regex(r"/(captcha|challenge|verify)([/?#._-]|$)"));

/// Status, keyword and thin-content based detector.
#[derive(Debug, Clone)]
pub struct DefaultBlockDetector {
    thin_content_threshold: usize,
}

impl DefaultBlockDetector {
    pub fn new() -> Self {
        Self {
            thin_content_threshold: THIN_CONTENT_THRESHOLD,
        }
    }

    pub fn with_thin_content_threshold(mut self, bytes: usize) -> Self {
        self.thin_content_threshold = bytes;
        self
    }

    fn content_signal(&self, body: &str) -> Option<BlockSignal> {
        if CAPTCHA_CONTENT.is_match(body) {
            Some(BlockSignal::Captcha)
        } else if DENIED_CONTENT.is_match(body) {
            Some(BlockSignal::Forbidden)
        } else if RATE_LIMIT_CONTENT.is_match(body) {
            Some(BlockSignal::RateLimited)
        } else if BOT_CONTENT.is_match(body) {
            Some(BlockSignal::Signature)
        } else {
            None
        }
    }

    fn is_thin(&self, status: u16, body: &str, content_type: Option<&str>) -> bool {
        if status != 200 || body.len() >= self.thin_content_threshold {
            return false;
        }
        let content_type = content_type.unwrap_or("").to_ascii_lowercase();
        !(content_type.contains("application/json") || content_type.contains("image/"))
    }
}

impl Default for DefaultBlockDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDetector for DefaultBlockDetector {
    fn is_blocked(&self, status: u16, body: &str, content_type: Option<&str>) -> bool {
        matches!(status, 403 | 429 | 503)
            || self.content_signal(body).is_some()
            || self.is_thin(status, body, content_type)
    }

    fn classify(
        &self,
        status: u16,
        body: &str,
        content_type: Option<&str>,
        url: &Url,
    ) -> BlockVerdict {
        // Captcha content outranks the status code: it is the strongest signal.
        let content = self.content_signal(body);
        if content == Some(BlockSignal::Captcha) {
            return BlockVerdict::blocked(BlockSignal::Captcha);
        }

        match status {
            403 => return BlockVerdict::blocked(BlockSignal::Forbidden),
            429 => return BlockVerdict::blocked(BlockSignal::RateLimited),
            503 => return BlockVerdict::blocked(BlockSignal::ServiceUnavailable),
            _ => {}
        }

        if let Some(signal) = content {
            return BlockVerdict::blocked(signal);
        }
        if CHALLENGE_URL.is_match(url.path()) {
            return BlockVerdict::blocked(BlockSignal::Captcha);
        }
        if self.is_thin(status, body, content_type) {
            return BlockVerdict::blocked(BlockSignal::ThinContent);
        }
        BlockVerdict::CLEAR
    }
}

fn build_regex(pattern: &str) -> Regex {
    regex::RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|err| panic!("invalid block signature regex `{}`: {}", pattern, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(words: &str) -> String {
        format!("<html><body>{}{}</body></html>", words, "lorem ipsum ".repeat(60))
    }

    fn url() -> Url {
        Url::parse("https://example.com/products").unwrap()
    }

    #[test]
    fn status_codes_map_to_signals() {
        let detector = DefaultBlockDetector::new();
        let body = page("catalogue");
        assert_eq!(
            detector.classify(403, &body, Some("text/html"), &url()).signal,
            Some(BlockSignal::Forbidden)
        );
        assert_eq!(
            detector.classify(429, &body, Some("text/html"), &url()).signal,
            Some(BlockSignal::RateLimited)
        );
        assert_eq!(
            detector.classify(503, &body, Some("text/html"), &url()).signal,
            Some(BlockSignal::ServiceUnavailable)
        );
        assert!(!detector.classify(200, &body, Some("text/html"), &url()).blocked);
    }

    #[test]
    fn captcha_content_outranks_status() {
        let detector = DefaultBlockDetector::new();
        let body = page("<div class=\"g-recaptcha\"></div>");
        let verdict = detector.classify(403, &body, Some("text/html"), &url());
        assert_eq!(verdict.signal, Some(BlockSignal::Captcha));
    }

    #[test]
    fn thin_html_is_blocked_but_thin_json_is_not() {
        let detector = DefaultBlockDetector::new();
        assert!(detector.is_blocked(200, "<html></html>", Some("text/html")));
        assert!(!detector.is_blocked(200, "{\"ok\":true}", Some("application/json; charset=utf-8")));
        assert!(!detector.is_blocked(200, "", Some("image/png")));
    }

    #[test]
    fn challenge_urls_are_flagged() {
        let detector = DefaultBlockDetector::new();
        let challenge = Url::parse("https://example.com/captcha?return=/").unwrap();
        let verdict = detector.classify(200, &page("welcome"), Some("text/html"), &challenge);
        assert_eq!(verdict.signal, Some(BlockSignal::Captcha));
    }

    #[test]
    fn bot_keywords_are_generic_signatures() {
        let detector = DefaultBlockDetector::new();
        let verdict = detector.classify(200, &page("Unusual activity from your network"), None, &url());
        assert_eq!(verdict.signal, Some(BlockSignal::Signature));
        for phrase in ["You have been blocked", "Automated requests are not allowed", "Bot detected"] {
            let verdict = detector.classify(200, &page(phrase), Some("text/html"), &url());
            assert_eq!(verdict.signal, Some(BlockSignal::Signature), "{phrase}");
        }
    }

    #[test]
    fn ordinary_pages_are_not_signatures() {
        let detector = DefaultBlockDetector::new();
        for words in [
            "<meta name=\"robots\" content=\"index, follow\">",
            "Our robotics kit ships with an automated coffee grinder.",
            "Plumbers clear blocked drains; smoking is forbidden on site.",
            "Suspiciously good prices on automation tools.",
        ] {
            let verdict = detector.classify(200, &page(words), Some("text/html"), &url());
            assert!(!verdict.blocked, "{words} -> {:?}", verdict.signal);
        }
    }
}
