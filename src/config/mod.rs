//! Crawler configuration.
//!
//! Plain value structs with defaults. Durations are expressed in seconds so
//! the structs deserialize cleanly from whatever source the caller uses;
//! loading files is left to the embedding application.

use serde::Deserialize;
use std::time::Duration;

/// Top-level configuration consumed by [`crate::AdaptiveCrawler`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Timeout applied to the main request of an attempt.
    pub request_timeout_secs: f64,
    /// Upper bound the main-request timeout may be raised to after timeouts.
    pub timeout_ceiling_secs: f64,
    /// Timeout applied to warm-up requests.
    pub warmup_timeout_secs: f64,
    pub max_retry_rounds: u32,
    /// Human-like pause bounds used between batch/iterative requests.
    pub min_delay_secs: f64,
    pub max_delay_secs: f64,
    pub reset_interval_secs: f64,
    pub escalation_risk_threshold: f64,
    pub fingerprint_rotation_interval_secs: f64,
    /// Behavior pattern dwell time between automatic transitions.
    pub pattern_cooldown_secs: f64,
    /// Consecutive failures after which the behavior pattern is shifted manually.
    pub shift_after_failures: u32,
    pub history_capacity: usize,
    /// Window used by the failure-rate identity rotation trigger.
    pub failure_window: usize,
    pub failure_rotation_threshold: f64,
    /// Candidate warm-up resources. The target URL is always appended last.
    pub warmup_resources: Vec<String>,
    pub proxies: Vec<String>,
    pub batch_chunk_size: usize,
    pub batch_pause_secs: (f64, f64),
    /// Maximum nesting allowed for the post-outcome analysis step.
    pub analysis_max_depth: usize,
    pub backoff: BackoffConfig,
    pub learner: LearnerConfig,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30.0,
            timeout_ceiling_secs: 60.0,
            warmup_timeout_secs: 4.0,
            max_retry_rounds: 3,
            min_delay_secs: 1.0,
            max_delay_secs: 5.0,
            reset_interval_secs: 3600.0,
            escalation_risk_threshold: 0.6,
            fingerprint_rotation_interval_secs: 300.0,
            pattern_cooldown_secs: 300.0,
            shift_after_failures: 3,
            history_capacity: 1000,
            failure_window: 10,
            failure_rotation_threshold: 0.5,
            warmup_resources: vec![
                "https://code.jquery.com/jquery-3.6.0.min.js".into(),
                "https://fonts.googleapis.com/css?family=Roboto".into(),
                "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/5.15.3/css/all.min.css".into(),
            ],
            proxies: Vec::new(),
            batch_chunk_size: 3,
            batch_pause_secs: (5.0, 10.0),
            analysis_max_depth: 1,
            backoff: BackoffConfig::default(),
            learner: LearnerConfig::default(),
        }
    }
}

impl CrawlerConfig {
    pub fn request_timeout(&self) -> Duration {
        secs(self.request_timeout_secs)
    }

    pub fn timeout_ceiling(&self) -> Duration {
        secs(self.timeout_ceiling_secs.max(self.request_timeout_secs))
    }

    pub fn warmup_timeout(&self) -> Duration {
        secs(self.warmup_timeout_secs)
    }

    pub fn reset_interval(&self) -> Duration {
        secs(self.reset_interval_secs)
    }

    pub fn fingerprint_rotation_interval(&self) -> Duration {
        secs(self.fingerprint_rotation_interval_secs)
    }

    pub fn pattern_cooldown(&self) -> Duration {
        secs(self.pattern_cooldown_secs)
    }

    /// Validates invariants the orchestrator relies on.
    pub fn validate(&self) -> Result<(), String> {
        if self.request_timeout_secs <= 0.0 {
            return Err("request_timeout_secs must be positive".into());
        }
        if self.history_capacity == 0 {
            return Err("history_capacity must be at least 1".into());
        }
        if self.min_delay_secs < 0.0 || self.max_delay_secs < self.min_delay_secs {
            return Err("delay bounds must satisfy 0 <= min_delay <= max_delay".into());
        }
        if !(0.0..=1.0).contains(&self.escalation_risk_threshold) {
            return Err("escalation_risk_threshold must be within [0, 1]".into());
        }
        if self.analysis_max_depth == 0 {
            return Err("analysis_max_depth must be at least 1".into());
        }
        Ok(())
    }
}

/// Retry backoff: `base * retry_round * (1 + jitter)`, jitter drawn from `[0, max_jitter)`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_secs: f64,
    pub max_jitter: f64,
    /// Extra timeout granted after each timeout error.
    pub timeout_step_secs: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_secs: 2.0,
            max_jitter: 1.0,
            timeout_step_secs: 10.0,
        }
    }
}

impl BackoffConfig {
    pub fn delay_for(&self, retry_round: u32, jitter: f64) -> Duration {
        let jitter = jitter.clamp(0.0, self.max_jitter.max(0.0));
        secs(self.base_secs * retry_round as f64 * (1.0 + jitter))
    }
}

/// Q-learning parameters for the adaptation learner.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LearnerConfig {
    pub learning_rate: f64,
    pub discount_factor: f64,
    pub initial_exploration: f64,
    pub exploration_decay: f64,
    pub min_exploration: f64,
    pub replay_capacity: usize,
    pub replay_batch: usize,
    /// Experiences learned between automatic replays; `0` disables them.
    pub replay_interval: usize,
    pub thresholds: StateBucketThresholds,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            discount_factor: 0.9,
            initial_exploration: 0.2,
            exploration_decay: 0.995,
            min_exploration: 0.05,
            replay_capacity: 1000,
            replay_batch: 32,
            replay_interval: 50,
            thresholds: StateBucketThresholds::default(),
        }
    }
}

/// One bucket rule: an observation falls in the bucket when
/// `success_rate > min_success_rate`, `avg_response_time < max_response_time`,
/// `error_rate < max_error_rate` and `resource_pressure < max_resource_pressure`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BucketRule {
    pub min_success_rate: f64,
    pub max_response_time: f64,
    pub max_error_rate: f64,
    pub max_resource_pressure: f64,
}

impl BucketRule {
    const fn new(success: f64, response: f64, error: f64) -> Self {
        Self {
            min_success_rate: success,
            max_response_time: response,
            max_error_rate: error,
            max_resource_pressure: f64::INFINITY,
        }
    }
}

/// Ordered bucket rules; bucket `i` is the first matching rule, the final
/// bucket (7) catches everything else.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateBucketThresholds {
    pub rules: [BucketRule; 7],
}

impl Default for StateBucketThresholds {
    fn default() -> Self {
        Self {
            rules: [
                BucketRule::new(0.9, 3.0, 0.05),
                BucketRule::new(0.8, 5.0, 0.1),
                BucketRule::new(0.7, 8.0, 0.2),
                BucketRule::new(0.6, 10.0, 0.3),
                BucketRule::new(0.5, 15.0, 0.4),
                BucketRule::new(0.4, f64::INFINITY, f64::INFINITY),
                BucketRule::new(0.2, f64::INFINITY, f64::INFINITY),
            ],
        }
    }
}

pub(crate) fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}
