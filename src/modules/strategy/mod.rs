//! Strategy synthesis.
//!
//! Turns the current behavior pattern, risk and target difficulty into a
//! concrete per-attempt [`StrategyProfile`]: fingerprint intensity, pacing,
//! warm-up chain, proxy policy and evasion level. Per-pattern parameters
//! live in a single table.

use rand::Rng;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

use super::behavior::BehaviorPattern;
use super::risk::RiskState;
use super::weighted_index;
use crate::config::secs;

const MAX_EVASION_LEVEL: u8 = 3;
const LONG_CHAIN: (usize, usize) = (5, 8);
const SHORT_CHAIN: (usize, usize) = (1, 3);
/// Delay bounds used when exploration randomizes pacing.
const EXPLORATION_DELAY: (f64, f64) = (0.6, 8.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintIntensity {
    Basic,
    Advanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyPolicy {
    None,
    Single,
    Chain,
}

impl ProxyPolicy {
    const ALL: [ProxyPolicy; 3] = [ProxyPolicy::None, ProxyPolicy::Single, ProxyPolicy::Chain];

    /// Downgrades the policy to what the proxy pool can support.
    pub fn constrained_to(self, available_proxies: usize) -> Self {
        match (self, available_proxies) {
            (_, 0) => ProxyPolicy::None,
            (ProxyPolicy::Chain, 1) => ProxyPolicy::Single,
            (policy, _) => policy,
        }
    }
}

/// Plan for one attempt. The target is always the last chain entry.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyProfile {
    pub pattern: BehaviorPattern,
    pub fingerprint_intensity: FingerprintIntensity,
    pub base_delay: Duration,
    pub warmup_chain: Vec<Url>,
    pub proxy_policy: ProxyPolicy,
    pub evasion_level: u8,
    /// Set when exploration replaced one dimension.
    pub explored: Option<&'static str>,
}

impl StrategyProfile {
    /// Chain entries before the target.
    pub fn warmups(&self) -> &[Url] {
        match self.warmup_chain.split_last() {
            Some((_, warmups)) => warmups,
            None => &[],
        }
    }

    pub fn target(&self) -> Option<&Url> {
        self.warmup_chain.last()
    }
}

#[derive(Debug, Clone, Copy)]
struct PatternParams {
    delay_secs: (f64, f64),
    chain_len: (usize, usize),
    base_evasion: u8,
}

fn pattern_params(pattern: BehaviorPattern) -> PatternParams {
    match pattern {
        BehaviorPattern::Normal => PatternParams {
            delay_secs: (1.0, 3.0),
            chain_len: (3, 5),
            base_evasion: 1,
        },
        BehaviorPattern::Careful => PatternParams {
            delay_secs: (2.0, 5.0),
            chain_len: (3, 6),
            base_evasion: 2,
        },
        BehaviorPattern::Hurried => PatternParams {
            delay_secs: (0.6, 1.5),
            chain_len: SHORT_CHAIN,
            base_evasion: 0,
        },
        BehaviorPattern::Stealth => PatternParams {
            delay_secs: (4.0, 8.0),
            chain_len: LONG_CHAIN,
            base_evasion: 3,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxyTier {
    Low,
    Medium,
    High,
}

impl ProxyTier {
    fn for_conditions(risk: f64, difficulty: f64) -> Self {
        if difficulty > 0.7 || risk > 0.7 {
            ProxyTier::High
        } else if risk > 0.4 || difficulty > 0.4 {
            ProxyTier::Medium
        } else {
            ProxyTier::Low
        }
    }

    /// Weights for `[None, Single, Chain]`.
    fn weights(&self) -> [f64; 3] {
        match self {
            ProxyTier::Low => [0.8, 0.2, 0.0],
            ProxyTier::Medium => [0.15, 0.7, 0.15],
            ProxyTier::High => [0.0, 0.2, 0.8],
        }
    }
}

/// Everything the synthesizer looks at for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct SynthesisInput<'a> {
    pub pattern: BehaviorPattern,
    pub risk: &'a RiskState,
    pub target_difficulty: Option<f64>,
    pub target: &'a Url,
    pub warmup_pool: &'a [Url],
    pub available_proxies: usize,
    pub exploration_rate: f64,
}

/// Learner hint applied on top of a synthesized profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StrategyAdjustment {
    pub delay_factor: f64,
    pub extra_warmups: usize,
    pub force_advanced: bool,
    pub evasion_boost: u8,
    pub rotate_proxy: bool,
}

impl Default for StrategyAdjustment {
    fn default() -> Self {
        Self {
            delay_factor: 1.0,
            extra_warmups: 0,
            force_advanced: false,
            evasion_boost: 0,
            rotate_proxy: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StrategySynthesizer;

impl StrategySynthesizer {
    pub fn new() -> Self {
        Self
    }

    pub fn synthesize(&self, input: &SynthesisInput<'_>) -> StrategyProfile {
        self.synthesize_with_rng(&mut rand::thread_rng(), input)
    }

    pub fn synthesize_with_rng<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        input: &SynthesisInput<'_>,
    ) -> StrategyProfile {
        let risk = input.risk.detection_risk;
        let difficulty = input.target_difficulty.unwrap_or(0.0);
        let params = pattern_params(input.pattern);

        let fingerprint_intensity = if risk > 0.5
            || input.pattern == BehaviorPattern::Stealth
            || difficulty > 0.7
        {
            FingerprintIntensity::Advanced
        } else {
            FingerprintIntensity::Basic
        };

        let mut delay = sample_range(rng, params.delay_secs);
        if risk > 0.7 {
            delay *= rng.gen_range(1.5..=2.0);
        } else if risk > 0.4 {
            delay *= rng.gen_range(1.2..=1.3);
        }

        let chain_bounds = match input.target_difficulty {
            Some(d) if d > 0.7 => LONG_CHAIN,
            Some(d) if d < 0.3 && input.pattern != BehaviorPattern::Stealth => SHORT_CHAIN,
            _ => params.chain_len,
        };
        let mut chain_len = rng.gen_range(chain_bounds.0..=chain_bounds.1);

        let tier = ProxyTier::for_conditions(risk, difficulty);
        let mut proxy_policy = weighted_index(rng, &tier.weights())
            .map(|idx| ProxyPolicy::ALL[idx])
            .unwrap_or(ProxyPolicy::None);

        let mut profile_intensity = fingerprint_intensity;
        let mut explored = None;
        if input.exploration_rate > 0.0 && rng.gen_bool(input.exploration_rate.clamp(0.0, 1.0)) {
            match rng.gen_range(0..4) {
                0 => {
                    profile_intensity = match profile_intensity {
                        FingerprintIntensity::Basic => FingerprintIntensity::Advanced,
                        FingerprintIntensity::Advanced => FingerprintIntensity::Basic,
                    };
                    explored = Some("fingerprint_intensity");
                }
                1 => {
                    delay = sample_range(rng, EXPLORATION_DELAY);
                    explored = Some("base_delay");
                }
                2 => {
                    chain_len = rng.gen_range(SHORT_CHAIN.0..=LONG_CHAIN.1);
                    explored = Some("warmup_chain");
                }
                _ => {
                    let alternatives: Vec<ProxyPolicy> = ProxyPolicy::ALL
                        .iter()
                        .copied()
                        .filter(|policy| *policy != proxy_policy)
                        .collect();
                    if let Some(policy) = alternatives.choose(rng) {
                        proxy_policy = *policy;
                    }
                    explored = Some("proxy_policy");
                }
            }
        }

        let evasion_level = if risk > 0.7 {
            params.base_evasion + 1
        } else {
            params.base_evasion
        }
        .min(MAX_EVASION_LEVEL);

        StrategyProfile {
            pattern: input.pattern,
            fingerprint_intensity: profile_intensity,
            base_delay: secs(delay),
            warmup_chain: build_chain(rng, input.target, input.warmup_pool, chain_len),
            proxy_policy: proxy_policy.constrained_to(input.available_proxies),
            evasion_level,
            explored,
        }
    }

    /// Applies a learner hint to a synthesized profile.
    pub fn adjust<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        mut profile: StrategyProfile,
        adjustment: &StrategyAdjustment,
        input: &SynthesisInput<'_>,
    ) -> StrategyProfile {
        if adjustment.delay_factor.is_finite() && adjustment.delay_factor > 0.0 {
            profile.base_delay = profile.base_delay.mul_f64(adjustment.delay_factor);
        }
        if adjustment.force_advanced {
            profile.fingerprint_intensity = FingerprintIntensity::Advanced;
        }
        profile.evasion_level = profile
            .evasion_level
            .saturating_add(adjustment.evasion_boost)
            .min(MAX_EVASION_LEVEL);
        if adjustment.rotate_proxy && profile.proxy_policy == ProxyPolicy::None {
            profile.proxy_policy = ProxyPolicy::Single.constrained_to(input.available_proxies);
        }
        if adjustment.extra_warmups > 0 {
            let len = profile.warmup_chain.len() + adjustment.extra_warmups;
            profile.warmup_chain = build_chain(rng, input.target, input.warmup_pool, len);
        }
        profile
    }
}

/// Samples `len - 1` distinct warm-ups (never the target) and appends the target.
fn build_chain<R: Rng + ?Sized>(rng: &mut R, target: &Url, pool: &[Url], len: usize) -> Vec<Url> {
    let mut seen = HashSet::new();
    let candidates: Vec<&Url> = pool
        .iter()
        .filter(|url| *url != target)
        .filter(|url| seen.insert(url.as_str()))
        .collect();

    let warmups = len.saturating_sub(1).min(candidates.len());
    let mut chain: Vec<Url> = candidates
        .choose_multiple(rng, warmups)
        .map(|url| (*url).clone())
        .collect();
    chain.push(target.clone());
    chain
}

fn sample_range<R: Rng + ?Sized>(rng: &mut R, (low, high): (f64, f64)) -> f64 {
    if high > low {
        rng.gen_range(low..=high)
    } else {
        low
    }
}
