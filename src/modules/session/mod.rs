//! Crawl session bookkeeping and the analysis re-entry guard.

use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Per-crawler counters. `retry_round` is the retry count most recently
/// scheduled by any call and drops back to zero only on success or session
/// reset. Concurrent calls share it, so it reads as "latest", not per call.
#[derive(Debug, Clone)]
pub struct CrawlSession {
    pub session_id: String,
    pub consecutive_failures: u32,
    pub success_streak: u32,
    pub retry_round: u32,
    pub max_retry_rounds: u32,
    pub last_reset: Instant,
    pub last_identity_rotation: Instant,
    pub request_timeout: Duration,
    pub total_attempts: u64,
    pub total_successes: u64,
    pub resets: u32,
    /// Outcomes whose analysis step was refused by the [`AnalysisGuard`].
    pub skipped_analyses: u64,
    default_timeout: Duration,
}

impl CrawlSession {
    pub fn new(max_retry_rounds: u32, request_timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            session_id: new_session_id(),
            consecutive_failures: 0,
            success_streak: 0,
            retry_round: 0,
            max_retry_rounds,
            last_reset: now,
            last_identity_rotation: now,
            request_timeout,
            total_attempts: 0,
            total_successes: 0,
            resets: 0,
            skipped_analyses: 0,
            default_timeout: request_timeout,
        }
    }

    pub fn needs_reset(&self, now: Instant, interval: Duration) -> bool {
        now.saturating_duration_since(self.last_reset) > interval
    }

    /// Starts a fresh session: new id, zeroed retry state, default timeout.
    pub fn reset(&mut self, now: Instant) {
        self.session_id = new_session_id();
        self.retry_round = 0;
        self.success_streak = 0;
        self.request_timeout = self.default_timeout;
        self.last_reset = now;
        self.last_identity_rotation = now;
        self.resets += 1;
    }

    pub fn rotation_due(&self, now: Instant, interval: Duration) -> bool {
        now.saturating_duration_since(self.last_identity_rotation) >= interval
    }

    pub fn mark_rotation(&mut self, now: Instant) {
        self.last_identity_rotation = now;
    }

    pub fn record_success(&mut self) {
        self.total_attempts += 1;
        self.total_successes += 1;
        self.success_streak += 1;
        self.consecutive_failures = 0;
        self.retry_round = 0;
    }

    pub fn record_failure(&mut self) {
        self.total_attempts += 1;
        self.success_streak = 0;
        self.consecutive_failures += 1;
    }

    /// Raises the request timeout by `step`, never beyond `ceiling`.
    pub fn raise_timeout(&mut self, step: Duration, ceiling: Duration) -> Duration {
        self.request_timeout = (self.request_timeout + step).min(ceiling.max(self.default_timeout));
        self.request_timeout
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            consecutive_failures: self.consecutive_failures,
            success_streak: self.success_streak,
            retry_round: self.retry_round,
            max_retry_rounds: self.max_retry_rounds,
            request_timeout_secs: self.request_timeout.as_secs_f64(),
            total_attempts: self.total_attempts,
            total_successes: self.total_successes,
            resets: self.resets,
            skipped_analyses: self.skipped_analyses,
            secs_since_reset: self.last_reset.elapsed().as_secs_f64(),
        }
    }
}

/// Serializable view of a [`CrawlSession`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub consecutive_failures: u32,
    pub success_streak: u32,
    pub retry_round: u32,
    pub max_retry_rounds: u32,
    pub request_timeout_secs: f64,
    pub total_attempts: u64,
    pub total_successes: u64,
    pub resets: u32,
    pub skipped_analyses: u64,
    pub secs_since_reset: f64,
}

fn new_session_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}", rng.r#gen::<u64>())
}

/// Non-blocking guard around the post-outcome analysis step.
///
/// Entering never waits: when the analysis is already running at the
/// maximum depth the caller gets `None` and is expected to skip its work.
#[derive(Debug)]
pub struct AnalysisGuard {
    in_progress: AtomicBool,
    depth: AtomicUsize,
    max_depth: usize,
    skipped: AtomicU64,
}

impl AnalysisGuard {
    pub fn new(max_depth: usize) -> Self {
        Self {
            in_progress: AtomicBool::new(false),
            depth: AtomicUsize::new(0),
            max_depth: max_depth.max(1),
            skipped: AtomicU64::new(0),
        }
    }

    pub fn try_enter(&self) -> Option<AnalysisPermit<'_>> {
        let depth = self.depth.fetch_add(1, Ordering::AcqRel);
        if depth >= self.max_depth {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        if depth == 0
            && self
                .in_progress
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        Some(AnalysisPermit { guard: self })
    }

    pub fn is_active(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Number of refused entries since creation.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

impl Default for AnalysisGuard {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Held while the analysis runs; released on drop.
#[derive(Debug)]
pub struct AnalysisPermit<'a> {
    guard: &'a AnalysisGuard,
}

impl AnalysisPermit<'_> {
    pub fn depth(&self) -> usize {
        self.guard.depth()
    }
}

impl Drop for AnalysisPermit<'_> {
    fn drop(&mut self) {
        if self.guard.depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.guard.in_progress.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_refuses_reentry_and_releases_on_drop() {
        let guard = AnalysisGuard::new(1);
        {
            let permit = guard.try_enter().expect("first entry");
            assert_eq!(permit.depth(), 1);
            assert!(guard.is_active());
            assert!(guard.try_enter().is_none());
            assert_eq!(guard.skipped(), 1);
        }
        assert!(!guard.is_active());
        assert_eq!(guard.depth(), 0);
        assert!(guard.try_enter().is_some());
    }

    #[test]
    fn guard_allows_bounded_nesting() {
        let guard = AnalysisGuard::new(2);
        let outer = guard.try_enter();
        let inner = guard.try_enter();
        assert!(outer.is_some() && inner.is_some());
        assert!(guard.try_enter().is_none());
        drop(inner);
        assert!(guard.is_active());
        drop(outer);
        assert!(!guard.is_active());
    }

    #[test]
    fn guard_is_released_when_a_panic_unwinds() {
        let guard = AnalysisGuard::new(1);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _permit = guard.try_enter();
            panic!("analysis failed");
        }));
        assert!(result.is_err());
        assert!(!guard.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn session_counters_and_timeout_ceiling() {
        let mut session = CrawlSession::new(3, Duration::from_secs(30));
        session.record_failure();
        session.record_failure();
        session.retry_round = 2;
        assert_eq!(session.consecutive_failures, 2);
        session.record_success();
        assert_eq!(session.consecutive_failures, 0);
        assert_eq!(session.success_streak, 1);
        assert_eq!(session.retry_round, 0);

        let ceiling = Duration::from_secs(60);
        for _ in 0..5 {
            session.raise_timeout(Duration::from_secs(10), ceiling);
        }
        assert_eq!(session.request_timeout, ceiling);

        tokio::time::advance(Duration::from_secs(3601)).await;
        let now = Instant::now();
        assert!(session.needs_reset(now, Duration::from_secs(3600)));
        let old_id = session.session_id.clone();
        session.reset(now);
        assert_ne!(session.session_id, old_id);
        assert_eq!(session.request_timeout, Duration::from_secs(30));
        assert_eq!(session.success_streak, 0);
        assert!(!session.needs_reset(now, Duration::from_secs(3600)));
    }
}
