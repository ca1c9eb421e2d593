//! Collaborator seams.
//!
//! The orchestrator depends on a handful of narrow capabilities: request
//! identities, proxies and link extraction. Each is a trait here with a small
//! default implementation, so embedders can swap in their own.

pub mod identity;
pub mod links;

use http::HeaderMap;

use crate::modules::proxy::ProxyHealthReport;
use crate::modules::strategy::FingerprintIntensity;

pub use identity::HeaderIdentityProvider;
pub use links::{LinkExtractor, LinkFilter, ScraperLinkExtractor};

/// Supplies the header set a request presents as its identity.
pub trait FingerprintProvider: Send + Sync {
    /// Headers for the current identity at the given intensity. Repeated
    /// calls return the same identity until [`refresh_identity`] is called.
    ///
    /// [`refresh_identity`]: FingerprintProvider::refresh_identity
    fn generate_identity(&mut self, intensity: FingerprintIntensity) -> HeaderMap;

    fn refresh_identity(&mut self);
}

/// Pool of outbound proxies.
pub trait ProxyProvider: Send + Sync {
    /// Current proxy, selecting one first if none is active.
    fn next_proxy(&mut self) -> Option<String>;

    /// Switches to a different proxy and returns it.
    fn rotate(&mut self) -> Option<String>;

    fn proxy_count(&self) -> usize;

    /// Up to `len` distinct proxies, current first.
    fn chain(&mut self, len: usize) -> Vec<String> {
        self.next_proxy().into_iter().take(len.min(1)).collect()
    }

    fn report_success(&mut self, _proxy: &str) {}

    fn report_failure(&mut self, _proxy: &str) {}

    fn health_report(&self) -> Option<ProxyHealthReport> {
        None
    }
}
