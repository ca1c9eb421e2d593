//! Proxy rotation and health tracking.
//!
//! Tracks proxy performance, bans endpoints that keep failing, and selects
//! the next candidate according to the configured rotation strategy.

use rand::seq::SliceRandom;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::weighted_index;
use crate::external_deps::ProxyProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    Sequential,
    Random,
    Smart,
    Weighted,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub rotation_strategy: RotationStrategy,
    pub ban_time: Duration,
    pub failure_threshold: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            rotation_strategy: RotationStrategy::Sequential,
            ban_time: Duration::from_secs(300),
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyHealthReport {
    pub total_proxies: usize,
    pub available_proxies: usize,
    pub banned_proxies: usize,
    pub current: Option<String>,
    pub details: HashMap<String, ProxyStats>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProxyStats {
    pub successes: u64,
    pub failures: u64,
    #[serde(skip)]
    pub last_used: Option<Instant>,
    #[serde(skip)]
    pub last_failure: Option<Instant>,
}

#[derive(Debug, Clone)]
struct ProxyEntry {
    endpoint: String,
    stats: ProxyStats,
    banned_until: Option<Instant>,
}

impl ProxyEntry {
    fn is_available(&self, now: Instant) -> bool {
        self.banned_until.is_none_or(|until| now >= until)
    }

    fn score(&self, now: Instant) -> f64 {
        let total = self.stats.successes + self.stats.failures;
        let success_rate = if total == 0 {
            1.0
        } else {
            self.stats.successes as f64 / total as f64
        };
        let recency = self
            .stats
            .last_used
            .map(|ts| now.saturating_duration_since(ts).as_secs_f64())
            .unwrap_or(300.0)
            / 300.0;
        (success_rate * 0.7) + (recency.clamp(0.0, 1.0) * 0.3)
    }
}

/// Proxy pool with rotation policies and temporary bans.
#[derive(Debug)]
pub struct ProxyManager {
    config: ProxyConfig,
    proxies: Vec<ProxyEntry>,
    cursor: usize,
    current: Option<usize>,
}

impl ProxyManager {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            proxies: Vec::new(),
            cursor: 0,
            current: None,
        }
    }

    pub fn load<I>(&mut self, proxies: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.proxies.clear();
        self.current = None;
        self.cursor = 0;
        for proxy in proxies {
            self.add_proxy(proxy);
        }
    }

    pub fn add_proxy(&mut self, proxy: impl Into<String>) {
        let endpoint = proxy.into();
        if endpoint.trim().is_empty() || self.proxies.iter().any(|entry| entry.endpoint == endpoint) {
            return;
        }
        self.proxies.push(ProxyEntry {
            endpoint,
            stats: ProxyStats::default(),
            banned_until: None,
        });
    }

    pub fn remove_proxy(&mut self, proxy: &str) {
        let current = self.current_endpoint().map(str::to_string);
        self.proxies.retain(|entry| entry.endpoint != proxy);
        self.current = current.and_then(|endpoint| self.position(&endpoint));
    }

    pub fn current_endpoint(&self) -> Option<&str> {
        self.current
            .and_then(|idx| self.proxies.get(idx))
            .map(|entry| entry.endpoint.as_str())
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Selects a new proxy, preferring one different from the current.
    fn select(&mut self) -> Option<usize> {
        if self.proxies.is_empty() {
            return None;
        }

        let now = Instant::now();
        for entry in &mut self.proxies {
            if entry.banned_until.is_some_and(|until| until <= now) {
                entry.banned_until = None;
            }
        }

        let mut available: Vec<usize> = (0..self.proxies.len())
            .filter(|&idx| self.proxies[idx].is_available(now))
            .collect();
        if available.len() > 1
            && let Some(current) = self.current
        {
            available.retain(|&idx| idx != current);
        }

        let selected = if available.is_empty() {
            // Everything is banned: release the ban that expires first.
            let index = self
                .proxies
                .iter()
                .enumerate()
                .min_by_key(|(_, entry)| entry.banned_until.unwrap_or(now))
                .map(|(idx, _)| idx)?;
            self.proxies[index].banned_until = None;
            index
        } else {
            let mut rng = rand::thread_rng();
            match self.config.rotation_strategy {
                RotationStrategy::Sequential => {
                    let pick = available
                        .iter()
                        .copied()
                        .find(|&idx| idx >= self.cursor)
                        .unwrap_or(available[0]);
                    self.cursor = pick + 1;
                    pick
                }
                RotationStrategy::Random => *available.choose(&mut rng)?,
                RotationStrategy::Smart => available
                    .iter()
                    .copied()
                    .max_by(|&lhs, &rhs| {
                        self.proxies[lhs]
                            .score(now)
                            .partial_cmp(&self.proxies[rhs].score(now))
                            .unwrap_or(Ordering::Equal)
                    })?,
                RotationStrategy::Weighted => {
                    let weights: Vec<f64> = available
                        .iter()
                        .map(|&idx| self.proxies[idx].score(now).max(0.1))
                        .collect();
                    weighted_index(&mut rng, &weights)
                        .map(|pos| available[pos])
                        .unwrap_or(available[0])
                }
            }
        };

        self.proxies[selected].stats.last_used = Some(now);
        self.current = Some(selected);
        Some(selected)
    }

    fn position(&self, endpoint: &str) -> Option<usize> {
        self.proxies.iter().position(|entry| entry.endpoint == endpoint)
    }

    pub fn health_report(&self) -> ProxyHealthReport {
        let now = Instant::now();
        let mut details = HashMap::new();
        let mut available = 0;
        let mut banned = 0;
        for entry in &self.proxies {
            if entry.is_available(now) {
                available += 1;
            } else {
                banned += 1;
            }
            details.insert(entry.endpoint.clone(), entry.stats.clone());
        }

        ProxyHealthReport {
            total_proxies: self.proxies.len(),
            available_proxies: available,
            banned_proxies: banned,
            current: self.current_endpoint().map(str::to_string),
            details,
        }
    }
}

impl Default for ProxyManager {
    fn default() -> Self {
        Self::new(ProxyConfig::default())
    }
}

impl ProxyProvider for ProxyManager {
    fn next_proxy(&mut self) -> Option<String> {
        if self.current_endpoint().is_none() {
            self.select()?;
        }
        self.current_endpoint().map(str::to_string)
    }

    fn rotate(&mut self) -> Option<String> {
        self.select()?;
        self.current_endpoint().map(str::to_string)
    }

    fn proxy_count(&self) -> usize {
        self.proxies.len()
    }

    fn chain(&mut self, len: usize) -> Vec<String> {
        let Some(first) = self.next_proxy() else {
            return Vec::new();
        };
        let now = Instant::now();
        let mut chain = vec![first];
        let mut others: Vec<&ProxyEntry> = self
            .proxies
            .iter()
            .filter(|entry| entry.is_available(now) && !chain.contains(&entry.endpoint))
            .collect();
        others.shuffle(&mut rand::thread_rng());
        chain.extend(
            others
                .into_iter()
                .take(len.saturating_sub(1))
                .map(|entry| entry.endpoint.clone()),
        );
        chain
    }

    fn report_success(&mut self, proxy: &str) {
        if let Some(entry) = self.proxies.iter_mut().find(|entry| entry.endpoint == proxy) {
            entry.stats.successes += 1;
            entry.banned_until = None;
        }
    }

    fn report_failure(&mut self, proxy: &str) {
        let threshold = u64::from(self.config.failure_threshold.max(1));
        let ban_time = self.config.ban_time;
        if let Some(entry) = self.proxies.iter_mut().find(|entry| entry.endpoint == proxy) {
            let now = Instant::now();
            entry.stats.failures += 1;
            entry.stats.last_failure = Some(now);
            if entry.stats.failures % threshold == 0 {
                entry.banned_until = Some(now + ban_time);
                log::warn!("proxy {} banned for {:?}", entry.endpoint, ban_time);
            }
        }
    }

    fn health_report(&self) -> Option<ProxyHealthReport> {
        Some(ProxyManager::health_report(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_moves_off_the_current_proxy() {
        let mut manager = ProxyManager::default();
        manager.load(["http://1.1.1.1:8080", "http://2.2.2.2:8080", "http://3.3.3.3:8080"]);
        let first = manager.next_proxy().unwrap();
        assert_eq!(manager.next_proxy().as_deref(), Some(first.as_str()));
        for _ in 0..6 {
            let before = manager.next_proxy().unwrap();
            let after = manager.rotate().unwrap();
            assert_ne!(before, after);
        }
    }

    #[test]
    fn bans_after_failures() {
        let mut manager = ProxyManager::new(ProxyConfig {
            failure_threshold: 1,
            ban_time: Duration::from_secs(60),
            ..Default::default()
        });
        manager.add_proxy("http://1.1.1.1:8080");
        manager.add_proxy("http://2.2.2.2:8080");
        let proxy = manager.next_proxy().unwrap();
        manager.report_failure(&proxy);
        let report = manager.health_report();
        assert_eq!(report.banned_proxies, 1);
        assert_ne!(manager.rotate().unwrap(), proxy);
    }

    #[test]
    fn chain_has_distinct_entries() {
        let mut manager = ProxyManager::new(ProxyConfig {
            rotation_strategy: RotationStrategy::Weighted,
            ..Default::default()
        });
        manager.load(["http://a:1", "http://b:1", "http://c:1"]);
        let chain = manager.chain(2);
        assert_eq!(chain.len(), 2);
        assert_ne!(chain[0], chain[1]);
        assert_eq!(manager.chain(10).len(), 3);
        assert!(ProxyManager::default().chain(2).is_empty());
    }
}
