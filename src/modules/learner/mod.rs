//! Adaptation learner.
//!
//! Tabular Q-learning over eight performance buckets and six strategy
//! adjustments, with an experience replay buffer, per-strategy performance
//! tracking and a rule-based suggestion engine.

use rand::Rng;
use rand::seq::IteratorRandom;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::fmt;

use super::strategy::StrategyAdjustment;
use crate::config::LearnerConfig;

pub const STATE_COUNT: usize = 8;
pub const ACTION_COUNT: usize = 6;
const REWARD_BOUND: f64 = 20.0;
const REWARD_WINDOW: usize = 100;

/// Strategy adjustments the learner can pick from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LearnerAction {
    EnhanceFingerprint,
    IncreaseDelay,
    LengthenChain,
    ChangeProxy,
    HumanizeBehavior,
    ReduceSpeed,
}

impl LearnerAction {
    pub const ALL: [LearnerAction; ACTION_COUNT] = [
        LearnerAction::EnhanceFingerprint,
        LearnerAction::IncreaseDelay,
        LearnerAction::LengthenChain,
        LearnerAction::ChangeProxy,
        LearnerAction::HumanizeBehavior,
        LearnerAction::ReduceSpeed,
    ];

    pub fn index(&self) -> usize {
        match self {
            LearnerAction::EnhanceFingerprint => 0,
            LearnerAction::IncreaseDelay => 1,
            LearnerAction::LengthenChain => 2,
            LearnerAction::ChangeProxy => 3,
            LearnerAction::HumanizeBehavior => 4,
            LearnerAction::ReduceSpeed => 5,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Strategy family the action belongs to, used for performance tracking.
    pub fn strategy_type(&self) -> &'static str {
        match self {
            LearnerAction::EnhanceFingerprint => "fingerprint",
            LearnerAction::IncreaseDelay => "delay",
            LearnerAction::LengthenChain => "request_chain",
            LearnerAction::ChangeProxy => "proxy",
            LearnerAction::HumanizeBehavior => "behavior",
            LearnerAction::ReduceSpeed => "conservative",
        }
    }

    pub fn adjustment(&self) -> StrategyAdjustment {
        let base = StrategyAdjustment::default();
        match self {
            LearnerAction::EnhanceFingerprint => StrategyAdjustment {
                force_advanced: true,
                evasion_boost: 1,
                ..base
            },
            LearnerAction::IncreaseDelay => StrategyAdjustment {
                delay_factor: 1.3,
                ..base
            },
            LearnerAction::LengthenChain => StrategyAdjustment {
                extra_warmups: 2,
                ..base
            },
            LearnerAction::ChangeProxy => StrategyAdjustment {
                rotate_proxy: true,
                ..base
            },
            LearnerAction::HumanizeBehavior => StrategyAdjustment {
                delay_factor: 1.15,
                evasion_boost: 1,
                ..base
            },
            LearnerAction::ReduceSpeed => StrategyAdjustment {
                delay_factor: 1.5,
                ..base
            },
        }
    }
}

impl fmt::Display for LearnerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LearnerAction::EnhanceFingerprint => "enhance-fingerprint",
            LearnerAction::IncreaseDelay => "increase-delay",
            LearnerAction::LengthenChain => "lengthen-chain",
            LearnerAction::ChangeProxy => "change-proxy",
            LearnerAction::HumanizeBehavior => "humanize-behavior",
            LearnerAction::ReduceSpeed => "reduce-speed",
        };
        f.write_str(name)
    }
}

/// Detection pattern observed by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformancePattern {
    #[default]
    Normal,
    Suspicious,
    Blocked,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PerformanceObservation {
    pub success_rate: f64,
    pub avg_response_time: f64,
    pub error_rate: f64,
    pub resource_pressure: f64,
    pub pattern: PerformancePattern,
}

impl Default for PerformanceObservation {
    fn default() -> Self {
        Self {
            success_rate: 1.0,
            avg_response_time: 2.0,
            error_rate: 0.0,
            resource_pressure: 0.0,
            pattern: PerformancePattern::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    fn weight(&self) -> f64 {
        match self {
            Priority::Critical => 0.95,
            Priority::High => 0.9,
            Priority::Medium => 0.75,
            Priority::Low => 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdaptationSuggestion {
    pub priority: Priority,
    pub kind: &'static str,
    pub description: &'static str,
    pub actions: Vec<&'static str>,
}

impl AdaptationSuggestion {
    fn new(
        priority: Priority,
        kind: &'static str,
        description: &'static str,
        actions: &[&'static str],
    ) -> Self {
        Self {
            priority,
            kind,
            description,
            actions: actions.to_vec(),
        }
    }
}

/// Suggestions ordered by descending priority, with an overall confidence.
#[derive(Debug, Clone, Serialize)]
pub struct AdaptationPlan {
    pub suggestions: Vec<AdaptationSuggestion>,
    pub confidence: f64,
}

impl AdaptationPlan {
    pub fn top(&self) -> Option<&AdaptationSuggestion> {
        self.suggestions.first()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StrategyPerformance {
    pub total_attempts: u64,
    pub successful_attempts: u64,
    pub success_rate: f64,
    pub average_reward: f64,
    #[serde(skip)]
    rewards: VecDeque<f64>,
}

impl StrategyPerformance {
    fn record(&mut self, success: bool, reward: f64) {
        self.total_attempts += 1;
        if success {
            self.successful_attempts += 1;
        }
        self.success_rate = self.successful_attempts as f64 / self.total_attempts as f64;
        if self.rewards.len() == REWARD_WINDOW {
            self.rewards.pop_front();
        }
        self.rewards.push_back(reward);
        self.average_reward = self.rewards.iter().sum::<f64>() / self.rewards.len() as f64;
    }

    fn score(&self) -> f64 {
        self.success_rate * 0.7 + self.average_reward * 0.3
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LearnerSummary {
    pub learning_rate: f64,
    pub discount_factor: f64,
    pub exploration_rate: f64,
    pub overall_success_rate: f64,
    pub best_strategies: Vec<(String, f64)>,
    pub strategy_details: HashMap<String, StrategyPerformance>,
    pub average_q_value: f64,
    pub max_q_value: f64,
    pub min_q_value: f64,
    pub replay_len: usize,
}

#[derive(Debug, Clone, Copy)]
struct Experience {
    state: usize,
    action: usize,
    reward: f64,
    next_state: usize,
}

#[derive(Debug)]
pub struct AdaptationLearner {
    config: LearnerConfig,
    q_table: [[f64; ACTION_COUNT]; STATE_COUNT],
    exploration_rate: f64,
    replay: VecDeque<Experience>,
    since_replay: usize,
    performance: HashMap<String, StrategyPerformance>,
}

impl AdaptationLearner {
    pub fn new(config: LearnerConfig) -> Self {
        let exploration_rate = config.initial_exploration;
        Self {
            replay: VecDeque::with_capacity(config.replay_capacity.min(1024)),
            config,
            q_table: [[0.0; ACTION_COUNT]; STATE_COUNT],
            exploration_rate,
            since_replay: 0,
            performance: initial_performance(),
        }
    }

    pub fn exploration_rate(&self) -> f64 {
        self.exploration_rate
    }

    pub fn q_value(&self, state: usize, action: LearnerAction) -> f64 {
        self.q_table
            .get(state)
            .map(|row| row[action.index()])
            .unwrap_or(0.0)
    }

    /// Maps an observation to bucket `0` (best) through `7` (worst).
    pub fn encode_state(&self, observation: &PerformanceObservation) -> usize {
        self.config
            .thresholds
            .rules
            .iter()
            .position(|rule| {
                observation.success_rate > rule.min_success_rate
                    && observation.avg_response_time < rule.max_response_time
                    && observation.error_rate < rule.max_error_rate
                    && observation.resource_pressure < rule.max_resource_pressure
            })
            .unwrap_or(STATE_COUNT - 1)
    }

    pub fn select_action(&mut self, state: usize) -> LearnerAction {
        self.select_action_with_rng(&mut rand::thread_rng(), state)
    }

    /// Epsilon-greedy selection. Every call decays epsilon toward its floor.
    pub fn select_action_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R, state: usize) -> LearnerAction {
        let explore = rng.r#gen::<f64>() < self.exploration_rate;
        self.exploration_rate = (self.exploration_rate * self.config.exploration_decay)
            .max(self.config.min_exploration);

        if explore {
            return LearnerAction::ALL[rng.gen_range(0..ACTION_COUNT)];
        }

        let row = &self.q_table[state.min(STATE_COUNT - 1)];
        let best = row
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal).then(ib.cmp(ia)))
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        LearnerAction::ALL[best]
    }

    pub fn reward(
        &self,
        success: bool,
        response_time_secs: f64,
        resource_usage: f64,
        success_streak: u32,
    ) -> f64 {
        let base = if success { 10.0 } else { -15.0 };
        let time_penalty = (response_time_secs.max(0.0) * 0.5).min(5.0);
        let resource_penalty = resource_usage.clamp(0.0, 1.0) * 2.0;
        let streak_bonus = (success_streak as f64 * 0.5).min(10.0);
        (base - time_penalty - resource_penalty + streak_bonus).clamp(-REWARD_BOUND, REWARD_BOUND)
    }

    /// Q-update; also stores the transition for replay.
    pub fn learn(&mut self, state: usize, action: LearnerAction, reward: f64, next_state: usize) {
        let experience = Experience {
            state: state.min(STATE_COUNT - 1),
            action: action.index(),
            reward,
            next_state: next_state.min(STATE_COUNT - 1),
        };
        self.apply(experience);
        if self.config.replay_capacity > 0 {
            if self.replay.len() == self.config.replay_capacity {
                self.replay.pop_front();
            }
            self.replay.push_back(experience);
        }
        self.since_replay += 1;
    }

    /// Re-learns a random batch from the buffer. Returns the batch size used.
    pub fn replay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> usize {
        let batch = self.config.replay_batch;
        if batch == 0 || self.replay.len() < batch {
            return 0;
        }
        let sample: Vec<Experience> = self.replay.iter().copied().choose_multiple(rng, batch);
        for experience in &sample {
            self.apply(*experience);
        }
        sample.len()
    }

    pub fn replay(&mut self) -> usize {
        self.replay_with_rng(&mut rand::thread_rng())
    }

    /// Replays once `replay_interval` experiences were learned since the
    /// last automatic replay. Returns the batch size used.
    pub fn replay_if_due<R: Rng + ?Sized>(&mut self, rng: &mut R) -> usize {
        let interval = self.config.replay_interval;
        if interval == 0 || self.since_replay < interval {
            return 0;
        }
        self.since_replay = 0;
        self.replay_with_rng(rng)
    }

    pub fn update_strategy_performance(&mut self, strategy_type: &str, success: bool, reward: f64) {
        self.performance
            .entry(strategy_type.to_string())
            .or_default()
            .record(success, reward);
    }

    pub fn strategy_performance(&self, strategy_type: &str) -> Option<&StrategyPerformance> {
        self.performance.get(strategy_type)
    }

    /// Top strategy families by `0.7 * success_rate + 0.3 * average_reward`.
    pub fn best_strategies(&self, n: usize) -> Vec<(String, f64)> {
        let mut scored: Vec<(String, f64)> = self
            .performance
            .iter()
            .filter(|(_, perf)| perf.total_attempts > 0)
            .map(|(name, perf)| (name.clone(), perf.score()))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(n);
        scored
    }

    pub fn suggest_adaptation(&self, performance: &PerformanceObservation) -> AdaptationPlan {
        let mut suggestions = Vec::new();

        if performance.success_rate < 0.6 {
            suggestions.push(AdaptationSuggestion::new(
                Priority::Critical,
                "drastic_change",
                "success rate too low, overhaul the strategy",
                &["change_fingerprint", "switch_proxy", "increase_delay"],
            ));
        } else if performance.success_rate < 0.8 {
            suggestions.push(AdaptationSuggestion::new(
                Priority::Medium,
                "moderate_change",
                "success rate mediocre, adjust moderately",
                &["enhance_fingerprint", "lengthen_request_chain"],
            ));
        }

        if performance.avg_response_time > 8.0 && performance.success_rate > 0.8 {
            suggestions.push(AdaptationSuggestion::new(
                Priority::Low,
                "efficiency_improvement",
                "slow responses with healthy success, trim pacing",
                &["optimize_delay", "reduce_request_chain"],
            ));
        }

        if performance.error_rate > 0.3 {
            suggestions.push(AdaptationSuggestion::new(
                Priority::High,
                "stability_improvement",
                "error rate too high, improve stability",
                &["increase_retry", "improve_error_handling"],
            ));
        }

        match performance.pattern {
            PerformancePattern::Blocked => suggestions.push(AdaptationSuggestion::new(
                Priority::Critical,
                "emergency_evasion",
                "blocking detected, evade immediately",
                &["reset_all", "use_stealth_mode", "reduce_frequency"],
            )),
            PerformancePattern::Suspicious => suggestions.push(AdaptationSuggestion::new(
                Priority::High,
                "evasion_tactics",
                "suspicious responses, vary behavior",
                &["change_behavior_pattern", "vary_request_timing"],
            )),
            PerformancePattern::Normal => {}
        }

        if suggestions.is_empty() {
            suggestions.push(AdaptationSuggestion::new(
                Priority::Low,
                "routine_optimization",
                "performance healthy, routine tuning",
                &["fine_tune_parameters", "update_fingerprints"],
            ));
        }

        suggestions.sort_by(|a, b| b.priority.cmp(&a.priority));
        let base = suggestions
            .first()
            .map(|top| top.priority.weight())
            .unwrap_or(0.5);
        let confidence = (base * (1.0 - self.exploration_rate * 0.5)).clamp(0.1, 1.0);

        AdaptationPlan {
            suggestions,
            confidence,
        }
    }

    pub fn summary(&self) -> LearnerSummary {
        let (successes, attempts) = self
            .performance
            .values()
            .fold((0u64, 0u64), |(s, a), perf| {
                (s + perf.successful_attempts, a + perf.total_attempts)
            });
        let values = self.q_table.iter().flatten().copied();
        let (sum, max, min) = values.fold(
            (0.0, f64::NEG_INFINITY, f64::INFINITY),
            |(sum, max, min), v: f64| (sum + v, max.max(v), min.min(v)),
        );

        LearnerSummary {
            learning_rate: self.config.learning_rate,
            discount_factor: self.config.discount_factor,
            exploration_rate: self.exploration_rate,
            overall_success_rate: if attempts > 0 {
                successes as f64 / attempts as f64
            } else {
                0.0
            },
            best_strategies: self.best_strategies(3),
            strategy_details: self.performance.clone(),
            average_q_value: sum / (STATE_COUNT * ACTION_COUNT) as f64,
            max_q_value: max,
            min_q_value: min,
            replay_len: self.replay.len(),
        }
    }

    pub fn reset(&mut self) {
        self.q_table = [[0.0; ACTION_COUNT]; STATE_COUNT];
        self.replay.clear();
        self.since_replay = 0;
        self.exploration_rate = self.config.initial_exploration;
        self.performance = initial_performance();
        log::info!("adaptation learner reset");
    }

    fn apply(&mut self, experience: Experience) {
        let next_max = self.q_table[experience.next_state]
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let cell = &mut self.q_table[experience.state][experience.action];
        *cell += self.config.learning_rate
            * (experience.reward + self.config.discount_factor * next_max - *cell);
    }
}

impl Default for AdaptationLearner {
    fn default() -> Self {
        Self::new(LearnerConfig::default())
    }
}

fn initial_performance() -> HashMap<String, StrategyPerformance> {
    LearnerAction::ALL
        .iter()
        .map(|action| (action.strategy_type().to_string(), StrategyPerformance::default()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn observation(success: f64, rt: f64, error: f64) -> PerformanceObservation {
        PerformanceObservation {
            success_rate: success,
            avg_response_time: rt,
            error_rate: error,
            ..PerformanceObservation::default()
        }
    }

    #[test]
    fn buckets_are_ordered() {
        let learner = AdaptationLearner::default();
        assert_eq!(learner.encode_state(&observation(0.95, 1.0, 0.0)), 0);
        assert_eq!(learner.encode_state(&observation(0.85, 4.0, 0.05)), 1);
        assert_eq!(learner.encode_state(&observation(0.75, 7.0, 0.15)), 2);
        assert_eq!(learner.encode_state(&observation(0.45, 30.0, 0.9)), 5);
        assert_eq!(learner.encode_state(&observation(0.3, 30.0, 0.9)), 6);
        assert_eq!(learner.encode_state(&observation(0.1, 30.0, 0.9)), 7);
    }

    #[test]
    fn q_update_matches_formula() {
        let mut learner = AdaptationLearner::default();
        learner.learn(0, LearnerAction::IncreaseDelay, 10.0, 1);
        assert!((learner.q_value(0, LearnerAction::IncreaseDelay) - 1.0).abs() < 1e-9);

        learner.learn(1, LearnerAction::ChangeProxy, 0.0, 0);
        // 0 + 0.1 * (0 + 0.9 * 1.0 - 0)
        assert!((learner.q_value(1, LearnerAction::ChangeProxy) - 0.09).abs() < 1e-9);
    }

    #[test]
    fn exploration_decays_to_floor() {
        let mut learner = AdaptationLearner::default();
        let mut rng = StdRng::seed_from_u64(5);
        let first = learner.exploration_rate();
        learner.select_action_with_rng(&mut rng, 0);
        assert!((learner.exploration_rate() - first * 0.995).abs() < 1e-12);
        for _ in 0..2000 {
            learner.select_action_with_rng(&mut rng, 3);
        }
        assert!((learner.exploration_rate() - 0.05).abs() < 1e-12);
    }

    #[test]
    fn greedy_selection_prefers_highest_value() {
        let mut learner = AdaptationLearner::new(LearnerConfig {
            initial_exploration: 0.0,
            min_exploration: 0.0,
            ..LearnerConfig::default()
        });
        learner.learn(2, LearnerAction::LengthenChain, 15.0, 2);
        let mut rng = StdRng::seed_from_u64(9);
        assert_eq!(learner.select_action_with_rng(&mut rng, 2), LearnerAction::LengthenChain);
    }

    #[test]
    fn reward_is_bounded() {
        let learner = AdaptationLearner::default();
        assert_eq!(learner.reward(true, 0.0, 0.0, 1000), 20.0);
        assert_eq!(learner.reward(false, 100.0, 1.0, 0), -20.0);
        let reward = learner.reward(true, 2.0, 0.5, 4);
        assert!((reward - (10.0 - 1.0 - 1.0 + 2.0)).abs() < 1e-9);
    }

    #[test]
    fn suggestions_follow_priority_rules() {
        let learner = AdaptationLearner::default();

        let plan = learner.suggest_adaptation(&observation(0.4, 2.0, 0.5));
        assert_eq!(plan.top().map(|s| s.kind), Some("drastic_change"));
        assert!(plan.suggestions.iter().any(|s| s.kind == "stability_improvement"));

        let plan = learner.suggest_adaptation(&observation(0.7, 2.0, 0.0));
        assert_eq!(plan.top().map(|s| s.priority), Some(Priority::Medium));

        let plan = learner.suggest_adaptation(&observation(0.95, 9.0, 0.0));
        assert_eq!(plan.top().map(|s| s.kind), Some("efficiency_improvement"));

        let blocked = PerformanceObservation {
            pattern: PerformancePattern::Blocked,
            ..PerformanceObservation::default()
        };
        let plan = learner.suggest_adaptation(&blocked);
        assert_eq!(plan.top().map(|s| s.kind), Some("emergency_evasion"));
        assert!((plan.confidence - 0.95 * 0.9).abs() < 1e-9);

        let plan = learner.suggest_adaptation(&PerformanceObservation::default());
        assert_eq!(plan.top().map(|s| s.kind), Some("routine_optimization"));
    }

    #[test]
    fn automatic_replay_follows_learned_experiences() {
        let mut learner = AdaptationLearner::default();
        let mut rng = StdRng::seed_from_u64(4);
        let mut replays = Vec::new();
        for step in 1..=250 {
            learner.learn(step % STATE_COUNT, LearnerAction::IncreaseDelay, 2.0, 0);
            if learner.replay_if_due(&mut rng) > 0 {
                replays.push(step);
            }
        }
        assert_eq!(replays, vec![50, 100, 150, 200, 250]);

        let mut disabled = AdaptationLearner::new(LearnerConfig {
            replay_interval: 0,
            ..LearnerConfig::default()
        });
        for _ in 0..120 {
            disabled.learn(0, LearnerAction::IncreaseDelay, 2.0, 0);
            assert_eq!(disabled.replay_if_due(&mut rng), 0);
        }
    }

    #[test]
    fn replay_requires_full_batch_and_reset_clears() {
        let mut learner = AdaptationLearner::default();
        let mut rng = StdRng::seed_from_u64(2);
        for i in 0..10 {
            learner.learn(i % STATE_COUNT, LearnerAction::ReduceSpeed, 1.0, 0);
        }
        assert_eq!(learner.replay_with_rng(&mut rng), 0);
        for _ in 0..40 {
            learner.learn(0, LearnerAction::ReduceSpeed, 1.0, 0);
        }
        assert_eq!(learner.replay_with_rng(&mut rng), 32);

        learner.update_strategy_performance("delay", true, 12.0);
        learner.update_strategy_performance("proxy", false, -10.0);
        let best = learner.best_strategies(2);
        assert_eq!(best[0].0, "delay");

        learner.reset();
        assert_eq!(learner.summary().replay_len, 0);
        assert_eq!(learner.q_value(0, LearnerAction::ReduceSpeed), 0.0);
        assert!(learner.best_strategies(3).is_empty());
    }
}
