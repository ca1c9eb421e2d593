//! Adaptive components of the crawler.
//!
//! Risk perception, attempt history, behavior patterns, strategy synthesis,
//! learning, session bookkeeping, events, proxies and resource monitoring.

pub mod behavior;
pub mod events;
pub mod history;
pub mod learner;
pub mod monitor;
pub mod proxy;
pub mod risk;
pub mod session;
pub mod strategy;

use rand::Rng;

pub use behavior::{BehaviorPattern, BehaviorPatternController, PatternTransition};
pub use events::{
    AnalysisSkippedEvent, AttemptEvent, CrawlEvent, EscalationEvent, EventDispatcher,
    EventHandler, IdentityRotationEvent, LoggingHandler, OutcomeEvent, RetryEvent,
};
pub use history::{AttemptOutcome, AttemptRecord, HistoryStore};
pub use learner::{
    AdaptationLearner, AdaptationPlan, AdaptationSuggestion, LearnerAction, LearnerSummary,
    PerformanceObservation, PerformancePattern, Priority, StrategyPerformance,
};
pub use monitor::{FixedSampler, ResourceSampler, spawn_resource_monitor};
pub use proxy::{ProxyConfig, ProxyHealthReport, ProxyManager, RotationStrategy};
pub use risk::{EfficiencyScore, ResourcePressure, RiskPerceptionModel, RiskState};
pub use session::{AnalysisGuard, AnalysisPermit, CrawlSession, SessionSnapshot};
pub use strategy::{
    FingerprintIntensity, ProxyPolicy, StrategyAdjustment, StrategyProfile,
    StrategySynthesizer, SynthesisInput,
};

/// Picks an index with probability proportional to its weight.
/// Non-positive weights are never picked; `None` when nothing is pickable.
pub(crate) fn weighted_index<R: Rng + ?Sized>(rng: &mut R, weights: &[f64]) -> Option<usize> {
    let total: f64 = weights.iter().filter(|w| **w > 0.0).sum();
    if total <= f64::EPSILON {
        return None;
    }

    let mut target = rng.gen_range(0.0..total);
    let mut last_positive = None;
    for (index, weight) in weights.iter().enumerate() {
        if *weight <= 0.0 {
            continue;
        }
        if target < *weight {
            return Some(index);
        }
        target -= *weight;
        last_positive = Some(index);
    }

    last_positive
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn weighted_index_skips_zero_weights() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            let idx = weighted_index(&mut rng, &[0.0, 1.0, 0.0, 2.0]).unwrap();
            assert!(idx == 1 || idx == 3);
        }
        assert_eq!(weighted_index(&mut rng, &[0.0, 0.0]), None);
        assert_eq!(weighted_index(&mut rng, &[]), None);
    }
}
