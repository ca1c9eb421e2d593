//! Event system for the crawl orchestrator.
//!
//! Every decision the orchestrator takes is published as a [`CrawlEvent`] so
//! callers can log, count or react to it without touching the control loop.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::behavior::PatternTransition;
use super::history::AttemptOutcome;
use super::learner::AdaptationPlan;
use crate::fetch::FetchTier;

#[derive(Debug, Clone)]
pub struct AttemptEvent {
    pub url: Url,
    pub tier: FetchTier,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OutcomeEvent {
    pub url: Url,
    pub tier: FetchTier,
    pub outcome: AttemptOutcome,
    pub status: Option<u16>,
    pub latency: Duration,
    pub risk: f64,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub url: Url,
    pub retry_round: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EscalationEvent {
    pub url: Url,
    pub from: FetchTier,
    pub to: FetchTier,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct IdentityRotationEvent {
    pub reason: String,
    pub proxy: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AnalysisSkippedEvent {
    pub url: Url,
    pub depth: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum CrawlEvent {
    Attempt(AttemptEvent),
    Outcome(OutcomeEvent),
    Retry(RetryEvent),
    Escalation(EscalationEvent),
    IdentityRotation(IdentityRotationEvent),
    PatternChanged(PatternTransition),
    WarmupFailed { url: Url, error: String },
    SessionReset { session_id: String },
    AnalysisSkipped(AnalysisSkippedEvent),
    Adaptation(AdaptationPlan),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &CrawlEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn dispatch(&self, event: CrawlEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &CrawlEvent) {
        match event {
            CrawlEvent::Attempt(attempt) => {
                log::debug!("-> [{}] {} (attempt {})", attempt.tier, attempt.url, attempt.attempt);
            }
            CrawlEvent::Outcome(outcome) => {
                log::debug!(
                    "<- [{}] {} -> {:?} status={:?} ({:.2}s, risk {:.2})",
                    outcome.tier,
                    outcome.url,
                    outcome.outcome,
                    outcome.status,
                    outcome.latency.as_secs_f64(),
                    outcome.risk
                );
            }
            CrawlEvent::Retry(retry) => {
                log::info!(
                    "retry {} round {} after {:.2}s: {}",
                    retry.url,
                    retry.retry_round,
                    retry.scheduled_after.as_secs_f64(),
                    retry.reason
                );
            }
            CrawlEvent::Escalation(escalation) => {
                log::info!(
                    "escalating {} from {} to {}: {}",
                    escalation.url,
                    escalation.from,
                    escalation.to,
                    escalation.reason
                );
            }
            CrawlEvent::IdentityRotation(rotation) => {
                log::info!("rotated identity ({}), proxy={:?}", rotation.reason, rotation.proxy);
            }
            CrawlEvent::PatternChanged(transition) => {
                log::info!(
                    "behavior pattern {} -> {} ({})",
                    transition.from,
                    transition.to,
                    transition.reason
                );
            }
            CrawlEvent::WarmupFailed { url, error } => {
                log::warn!("warm-up {} failed: {}", url, error);
            }
            CrawlEvent::SessionReset { session_id } => {
                log::info!("session reset, new session {}", session_id);
            }
            CrawlEvent::AnalysisSkipped(skipped) => {
                log::warn!(
                    "analysis already running (depth {}), skipped for {}",
                    skipped.depth,
                    skipped.url
                );
            }
            CrawlEvent::Adaptation(plan) => {
                if let Some(top) = plan.top() {
                    log::warn!(
                        "adaptation suggested: {} [{:?}] confidence {:.2}",
                        top.kind,
                        top.priority,
                        plan.confidence
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &CrawlEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher.dispatch(CrawlEvent::SessionReset {
            session_id: "abc".into(),
        });
        dispatcher.dispatch(CrawlEvent::WarmupFailed {
            url: Url::parse("https://cdn.example.net/a.js").unwrap(),
            error: "timeout".into(),
        });
        assert_eq!(*counter.0.lock().unwrap(), 2);
    }
}
