//! Behavior pattern state machine.
//!
//! Four crawl temperaments with hysteresis: automatic transitions driven by
//! [`BehaviorPatternController::evaluate`] are spaced by a cooldown, while
//! [`BehaviorPatternController::shift_pattern`] forces a change immediately.
//! The cooldown runs on the tokio clock, like the crawl session deadlines.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use super::weighted_index;

const TRANSITION_HISTORY_CAP: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BehaviorPattern {
    Normal,
    Careful,
    Hurried,
    Stealth,
}

impl BehaviorPattern {
    pub const ALL: [BehaviorPattern; 4] = [
        BehaviorPattern::Normal,
        BehaviorPattern::Careful,
        BehaviorPattern::Hurried,
        BehaviorPattern::Stealth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BehaviorPattern::Normal => "normal",
            BehaviorPattern::Careful => "careful",
            BehaviorPattern::Hurried => "hurried",
            BehaviorPattern::Stealth => "stealth",
        }
    }

    /// Target pattern for the observed risk and success rate.
    pub fn target_for(risk: f64, success_rate: f64) -> Self {
        if risk > 0.7 {
            BehaviorPattern::Stealth
        } else if risk > 0.4 || success_rate < 0.6 {
            BehaviorPattern::Careful
        } else {
            BehaviorPattern::Normal
        }
    }

    /// Relative preference used by manual shifts.
    fn shift_weight(&self, risk: f64) -> f64 {
        match (self, risk) {
            (BehaviorPattern::Stealth, r) if r > 0.7 => 6.0,
            (BehaviorPattern::Careful, r) if r > 0.7 => 3.0,
            (BehaviorPattern::Normal, r) if r > 0.7 => 1.0,
            (BehaviorPattern::Hurried, r) if r > 0.7 => 0.0,
            (BehaviorPattern::Careful, r) if r > 0.4 => 4.0,
            (BehaviorPattern::Stealth, r) if r > 0.4 => 3.0,
            (BehaviorPattern::Normal, r) if r > 0.4 => 2.0,
            (BehaviorPattern::Hurried, r) if r > 0.4 => 1.0,
            (BehaviorPattern::Normal, _) => 3.5,
            (BehaviorPattern::Careful, _) => 3.0,
            (BehaviorPattern::Hurried, _) => 2.0,
            (BehaviorPattern::Stealth, _) => 1.5,
        }
    }
}

impl fmt::Display for BehaviorPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PatternTransition {
    pub from: BehaviorPattern,
    pub to: BehaviorPattern,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct BehaviorPatternController {
    current: BehaviorPattern,
    last_change: Option<Instant>,
    cooldown: Duration,
    history: VecDeque<PatternTransition>,
}

impl BehaviorPatternController {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            current: BehaviorPattern::Normal,
            last_change: None,
            cooldown,
            history: VecDeque::with_capacity(TRANSITION_HISTORY_CAP),
        }
    }

    pub fn current(&self) -> BehaviorPattern {
        self.current
    }

    pub fn last_change(&self) -> Option<Instant> {
        self.last_change
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn transitions(&self) -> impl DoubleEndedIterator<Item = &PatternTransition> {
        self.history.iter()
    }

    pub fn evaluate(&mut self, risk: f64, success_rate: f64) -> Option<PatternTransition> {
        self.evaluate_at(Instant::now(), risk, success_rate)
    }

    /// Moves toward the target pattern if the cooldown has elapsed.
    /// Returns the transition when one happened.
    pub fn evaluate_at(
        &mut self,
        now: Instant,
        risk: f64,
        success_rate: f64,
    ) -> Option<PatternTransition> {
        let target = BehaviorPattern::target_for(risk, success_rate);
        if target == self.current || !self.cooldown_elapsed(now) {
            return None;
        }
        let reason = format!("risk {:.2}, success rate {:.2}", risk, success_rate);
        Some(self.apply(now, target, reason))
    }

    pub fn shift_pattern<R: Rng + ?Sized>(&mut self, rng: &mut R, risk: f64) -> PatternTransition {
        self.shift_pattern_at(Instant::now(), rng, risk)
    }

    /// Forces a move to a different pattern, ignoring the cooldown.
    pub fn shift_pattern_at<R: Rng + ?Sized>(
        &mut self,
        now: Instant,
        rng: &mut R,
        risk: f64,
    ) -> PatternTransition {
        let candidates: Vec<BehaviorPattern> = BehaviorPattern::ALL
            .iter()
            .copied()
            .filter(|pattern| *pattern != self.current)
            .collect();
        let weights: Vec<f64> = candidates.iter().map(|p| p.shift_weight(risk)).collect();
        let target = weighted_index(rng, &weights)
            .map(|idx| candidates[idx])
            .unwrap_or(BehaviorPattern::Careful);
        self.apply(now, target, format!("manual shift at risk {:.2}", risk))
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        self.last_change
            .is_none_or(|last| now.saturating_duration_since(last) >= self.cooldown)
    }

    fn apply(&mut self, now: Instant, to: BehaviorPattern, reason: String) -> PatternTransition {
        let transition = PatternTransition {
            from: self.current,
            to,
            reason,
            timestamp: Utc::now(),
        };
        self.current = to;
        self.last_change = Some(now);
        if self.history.len() == TRANSITION_HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(transition.clone());
        transition
    }
}

impl Default for BehaviorPatternController {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}
