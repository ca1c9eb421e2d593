//! Risk perception.
//!
//! Keeps a single detection-risk score in `[0, 1]` alongside resource
//! pressure and efficiency gauges. The score moves in fixed steps after each
//! attempt; it never decays on its own.

use serde::Serialize;
use std::sync::{Arc, RwLock};

use crate::detection::BlockSignal;
use crate::modules::history::{AttemptOutcome, AttemptRecord};

const CAPTCHA_DELTA: f64 = 0.40;
const FORBIDDEN_DELTA: f64 = 0.35;
const RATE_LIMIT_DELTA: f64 = 0.25;
const BLOCK_DELTA: f64 = 0.20;
const FAILURE_DELTA: f64 = 0.15;
const SUCCESS_DELTA: f64 = 0.05;
const STREAK_BONUS_CAP: f64 = 0.10;
const STREAK_BONUS_STEP: f64 = 0.01;
const EMA_ALPHA: f64 = 0.1;

/// Host resource usage, each axis in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourcePressure {
    pub cpu: f64,
    pub memory: f64,
    pub network: f64,
}

impl ResourcePressure {
    pub fn new(cpu: f64, memory: f64, network: f64) -> Self {
        Self {
            cpu: clamp_unit(cpu),
            memory: clamp_unit(memory),
            network: clamp_unit(network),
        }
    }

    /// Mean of the three axes.
    pub fn overall(&self) -> f64 {
        (self.cpu + self.memory + self.network) / 3.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EfficiencyScore {
    /// Exponential moving average, seconds.
    pub avg_response_time: f64,
    pub success_rate: f64,
}

impl Default for EfficiencyScore {
    fn default() -> Self {
        Self {
            avg_response_time: 1.0,
            success_rate: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RiskState {
    pub detection_risk: f64,
    pub resource_pressure: ResourcePressure,
    pub efficiency: EfficiencyScore,
    pub captcha_count: u64,
    pub block_count: u64,
}

/// Shared handle over a [`RiskState`]. Clones observe the same state.
#[derive(Clone, Debug, Default)]
pub struct RiskPerceptionModel {
    state: Arc<RwLock<RiskState>>,
}

impl RiskPerceptionModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies the risk step for one attempt and returns the new score.
    ///
    /// `signal` is the detector's classification for blocked attempts;
    /// `success_streak` is the streak including this attempt.
    pub fn update(
        &self,
        record: &AttemptRecord,
        signal: Option<BlockSignal>,
        success_streak: u32,
    ) -> f64 {
        let Ok(mut state) = self.state.write() else {
            return 0.0;
        };

        let delta = match record.outcome {
            AttemptOutcome::Success => {
                let bonus = (STREAK_BONUS_STEP * success_streak as f64).min(STREAK_BONUS_CAP);
                -(SUCCESS_DELTA + bonus)
            }
            AttemptOutcome::Blocked => {
                state.block_count += 1;
                match signal {
                    Some(BlockSignal::Captcha) => {
                        state.captcha_count += 1;
                        CAPTCHA_DELTA
                    }
                    Some(BlockSignal::Forbidden) => FORBIDDEN_DELTA,
                    Some(BlockSignal::RateLimited) => RATE_LIMIT_DELTA,
                    _ => match record.status_code {
                        Some(403) => FORBIDDEN_DELTA,
                        Some(429) => RATE_LIMIT_DELTA,
                        _ => BLOCK_DELTA,
                    },
                }
            }
            AttemptOutcome::Error => FAILURE_DELTA,
        };

        state.detection_risk = clamp_unit(state.detection_risk + delta);

        let succeeded = if record.is_success() { 1.0 } else { 0.0 };
        state.efficiency.success_rate =
            ema(state.efficiency.success_rate, succeeded);
        if record.response_time_secs.is_finite() && record.response_time_secs >= 0.0 {
            state.efficiency.avg_response_time =
                ema(state.efficiency.avg_response_time, record.response_time_secs);
        }

        state.detection_risk
    }

    pub fn risk(&self) -> f64 {
        self.state
            .read()
            .map(|state| state.detection_risk)
            .unwrap_or(0.0)
    }

    pub fn resource_pressure(&self) -> ResourcePressure {
        self.state
            .read()
            .map(|state| state.resource_pressure)
            .unwrap_or_default()
    }

    pub fn set_resource_pressure(&self, cpu: f64, memory: f64, network: f64) {
        if let Ok(mut state) = self.state.write() {
            state.resource_pressure = ResourcePressure::new(cpu, memory, network);
        }
    }

    pub fn efficiency(&self) -> EfficiencyScore {
        self.state
            .read()
            .map(|state| state.efficiency)
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> RiskState {
        self.state
            .read()
            .map(|state| state.clone())
            .unwrap_or_default()
    }
}

fn ema(previous: f64, sample: f64) -> f64 {
    previous * (1.0 - EMA_ALPHA) + sample * EMA_ALPHA
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchErrorKind, FetchTier};
    use url::Url;

    fn url() -> Url {
        Url::parse("https://example.com/").unwrap()
    }

    #[test]
    fn block_signals_raise_risk_by_specificity() {
        let model = RiskPerceptionModel::new();
        let forbidden = AttemptRecord::blocked(url(), 403, 0.2, FetchTier::Http);
        assert!((model.update(&forbidden, Some(BlockSignal::Forbidden), 0) - 0.35).abs() < 1e-9);

        let captcha = AttemptRecord::blocked(url(), 200, 0.2, FetchTier::Http);
        assert!((model.update(&captcha, Some(BlockSignal::Captcha), 0) - 0.75).abs() < 1e-9);

        let state = model.snapshot();
        assert_eq!(state.block_count, 2);
        assert_eq!(state.captcha_count, 1);
    }

    #[test]
    fn risk_stays_in_unit_interval() {
        let model = RiskPerceptionModel::new();
        let error = AttemptRecord::error(url(), FetchErrorKind::Timeout, 30.0, FetchTier::Http);
        for _ in 0..20 {
            model.update(&error, None, 0);
        }
        assert_eq!(model.risk(), 1.0);

        let success = AttemptRecord::success(url(), 200, 0.3, FetchTier::Http);
        for streak in 1..40 {
            model.update(&success, None, streak);
        }
        assert_eq!(model.risk(), 0.0);
    }

    #[test]
    fn success_bonus_grows_with_streak_up_to_cap() {
        let model = RiskPerceptionModel::new();
        let error = AttemptRecord::error(url(), FetchErrorKind::Connection, 1.0, FetchTier::Http);
        for _ in 0..4 {
            model.update(&error, None, 0);
        }
        let before = model.risk();
        let success = AttemptRecord::success(url(), 200, 0.3, FetchTier::Http);
        let after = model.update(&success, None, 3);
        assert!((before - after - 0.08).abs() < 1e-9);

        let capped = model.update(&success, None, 50);
        assert!((after - capped - 0.15).abs() < 1e-9);
    }

    #[test]
    fn clones_share_state_and_pressure_is_clamped() {
        let model = RiskPerceptionModel::new();
        let shared = model.clone();
        shared.set_resource_pressure(1.4, -0.2, 0.5);
        let pressure = model.resource_pressure();
        assert_eq!(pressure.cpu, 1.0);
        assert_eq!(pressure.memory, 0.0);
        assert_eq!(pressure.network, 0.5);
    }
}
