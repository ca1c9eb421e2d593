//! Background resource monitoring.
//!
//! A tokio task samples host pressure on a fixed interval and writes it into
//! the shared risk model until its cancellation token fires.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::risk::{ResourcePressure, RiskPerceptionModel};

/// Source of host resource pressure readings.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> ResourcePressure;
}

/// Sampler that always reports the same reading.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedSampler(pub ResourcePressure);

impl ResourceSampler for FixedSampler {
    fn sample(&self) -> ResourcePressure {
        self.0
    }
}

pub fn spawn_resource_monitor(
    model: RiskPerceptionModel,
    sampler: Arc<dyn ResourceSampler>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let every = every.max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("resource monitor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let reading = sampler.sample();
                    model.set_resource_pressure(reading.cpu, reading.memory, reading.network);
                    if reading.overall() > 0.8 {
                        log::warn!("high resource pressure: {:.2}", reading.overall());
                    }
                }
            }
        }
    })
}
