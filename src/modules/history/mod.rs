//! Bounded attempt history.
//!
//! A fixed-capacity ring buffer of [`AttemptRecord`]s shared between the
//! orchestrator (writer) and everything that derives rates from recent
//! outcomes (readers). Eviction is strict FIFO.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use url::Url;

use crate::fetch::{FetchErrorKind, FetchTier};

pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Classified outcome of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Blocked,
    Error,
}

/// Immutable record of one attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub url: Url,
    pub timestamp: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    /// `None` when the request never produced a response.
    pub status_code: Option<u16>,
    pub response_time_secs: f64,
    pub blocked: bool,
    pub tier: FetchTier,
    pub error_kind: Option<FetchErrorKind>,
}

impl AttemptRecord {
    pub fn success(url: Url, status: u16, response_time_secs: f64, tier: FetchTier) -> Self {
        Self {
            url,
            timestamp: Utc::now(),
            outcome: AttemptOutcome::Success,
            status_code: Some(status),
            response_time_secs,
            blocked: false,
            tier,
            error_kind: None,
        }
    }

    pub fn blocked(url: Url, status: u16, response_time_secs: f64, tier: FetchTier) -> Self {
        Self {
            url,
            timestamp: Utc::now(),
            outcome: AttemptOutcome::Blocked,
            status_code: Some(status),
            response_time_secs,
            blocked: true,
            tier,
            error_kind: None,
        }
    }

    pub fn error(url: Url, kind: FetchErrorKind, response_time_secs: f64, tier: FetchTier) -> Self {
        Self {
            url,
            timestamp: Utc::now(),
            outcome: AttemptOutcome::Error,
            status_code: None,
            response_time_secs,
            blocked: false,
            tier,
            error_kind: Some(kind),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}

#[derive(Debug)]
struct HistoryBuffer {
    records: VecDeque<AttemptRecord>,
    capacity: usize,
}

/// Thread-safe ring buffer of attempt records.
#[derive(Clone, Debug)]
pub struct HistoryStore {
    inner: Arc<RwLock<HistoryBuffer>>,
}

impl HistoryStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(RwLock::new(HistoryBuffer {
                records: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
                capacity,
            })),
        }
    }

    pub fn append(&self, record: AttemptRecord) {
        if let Ok(mut guard) = self.inner.write() {
            if guard.records.len() == guard.capacity {
                guard.records.pop_front();
            }
            guard.records.push_back(record);
        }
    }

    /// The `n` most recent records, oldest first.
    pub fn recent(&self, n: usize) -> Vec<AttemptRecord> {
        self.inner
            .read()
            .map(|guard| {
                let skip = guard.records.len().saturating_sub(n);
                guard.records.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|guard| guard.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().map(|guard| guard.capacity).unwrap_or(0)
    }

    /// Share of non-successful outcomes among the last `window` records.
    /// An empty window reports `0.0`.
    pub fn failure_rate(&self, window: usize) -> f64 {
        self.ratio(window, |record| !record.is_success())
    }

    pub fn error_rate(&self, window: usize) -> f64 {
        self.ratio(window, |record| record.outcome == AttemptOutcome::Error)
    }

    /// Share of successes among the last `window` records, `1.0` when empty.
    pub fn success_rate(&self, window: usize) -> f64 {
        if self.is_empty() {
            return 1.0;
        }
        self.ratio(window, AttemptRecord::is_success)
    }

    pub fn avg_response_time(&self, window: usize) -> Option<f64> {
        let recent = self.recent(window);
        if recent.is_empty() {
            return None;
        }
        let total: f64 = recent.iter().map(|record| record.response_time_secs).sum();
        Some(total / recent.len() as f64)
    }

    /// Blocked share of the recent records that targeted `host`.
    pub fn host_block_rate(&self, host: &str, window: usize) -> Option<f64> {
        let guard = self.inner.read().ok()?;
        let matching: Vec<&AttemptRecord> = guard
            .records
            .iter()
            .rev()
            .filter(|record| record.url.host_str() == Some(host))
            .take(window)
            .collect();
        if matching.is_empty() {
            return None;
        }
        let blocked = matching.iter().filter(|record| record.blocked).count();
        Some(blocked as f64 / matching.len() as f64)
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.inner.write() {
            guard.records.clear();
        }
    }

    fn ratio<F>(&self, window: usize, predicate: F) -> f64
    where
        F: Fn(&AttemptRecord) -> bool,
    {
        let recent = self.recent(window);
        if recent.is_empty() {
            return 0.0;
        }
        let hits = recent.iter().filter(|record| predicate(record)).count();
        hits as f64 / recent.len() as f64
    }
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
