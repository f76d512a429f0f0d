//! Cross-sink tick alignment.
//!
//! When enabled, every sink mixer starts its tick at a shared barrier and
//! paces itself with a rate-adjusted sleep instead of a free-running
//! interval. The barrier bounds how far tick starts can spread; the
//! proportional controller nudges each sink's sleep so its cumulative
//! output time tracks the shared reference clock, keeping barrier waits
//! short.
//!
//! Membership is dynamic: sinks join and leave while others keep ticking. A
//! member that misses the barrier past the timeout proceeds alone rather
//! than stalling the mix.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::state::EngineTuning;

/// Controller parameters, frozen at engine start.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub barrier_timeout: Duration,
    pub proportional_gain: f64,
    pub max_rate_adjustment: f64,
    pub smoothing_factor: f64,
}

impl From<&EngineTuning> for SyncConfig {
    fn from(tuning: &EngineTuning) -> Self {
        Self {
            barrier_timeout: Duration::from_millis(tuning.barrier_timeout_ms),
            proportional_gain: tuning.sync_proportional_gain,
            max_rate_adjustment: tuning.max_rate_adjustment,
            smoothing_factor: tuning.sync_smoothing_factor,
        }
    }
}

struct BarrierState {
    members: usize,
    arrived: usize,
    generation: u64,
}

/// Shared barrier + reference clock for all synchronized sinks.
pub struct SinkSyncCoordinator {
    config: SyncConfig,
    state: Mutex<BarrierState>,
    release: Notify,
}

impl SinkSyncCoordinator {
    pub fn new(config: SyncConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(BarrierState {
                members: 0,
                arrived: 0,
                generation: 0,
            }),
            release: Notify::new(),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Joins the barrier. The membership count takes effect on the next
    /// tick.
    pub fn register(self: &Arc<Self>) -> SyncMember {
        self.state.lock().members += 1;
        SyncMember {
            coordinator: Arc::clone(self),
        }
    }

    pub fn member_count(&self) -> usize {
        self.state.lock().members
    }

    fn release_generation(&self) {
        self.release.notify_waiters();
    }
}

/// One sink's membership in the barrier. Leaving releases peers that were
/// waiting on this member.
pub struct SyncMember {
    coordinator: Arc<SinkSyncCoordinator>,
}

impl SyncMember {
    /// Arrives at the barrier and waits for the rest of the members, up to
    /// the configured timeout. A straggler past the timeout proceeds alone.
    pub async fn wait_tick(&self) {
        let my_generation = {
            let mut state = self.coordinator.state.lock();
            state.arrived += 1;
            if state.arrived >= state.members {
                state.arrived = 0;
                state.generation += 1;
                drop(state);
                self.coordinator.release_generation();
                return;
            }
            state.generation
        };

        let timeout = tokio::time::sleep(self.coordinator.config.barrier_timeout);
        tokio::pin!(timeout);
        loop {
            let released = self.coordinator.release.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if self.coordinator.state.lock().generation != my_generation {
                return;
            }
            tokio::select! {
                _ = &mut timeout => return,
                _ = released => {}
            }
        }
    }
}

impl Drop for SyncMember {
    fn drop(&mut self) {
        let mut state = self.coordinator.state.lock();
        state.members = state.members.saturating_sub(1);
        // Peers may have been waiting on us
        if state.members > 0 && state.arrived >= state.members {
            state.arrived = 0;
            state.generation += 1;
            drop(state);
            self.coordinator.release_generation();
        }
    }
}

/// Per-sink output clock: rate-adjusted pacing against the shared
/// reference.
///
/// The sleep for each tick is the nominal chunk duration scaled by a
/// bounded correction proportional to the smoothed drift between this
/// sink's ideal timeline and the wall clock.
pub struct RateController {
    chunk_duration: Duration,
    proportional_gain: f64,
    max_rate_adjustment: f64,
    smoothing_factor: f64,
    epoch: Instant,
    ticks: u64,
    smoothed_drift_secs: f64,
}

impl RateController {
    pub fn new(chunk_duration: Duration, config: &SyncConfig) -> Self {
        Self {
            chunk_duration,
            proportional_gain: config.proportional_gain,
            max_rate_adjustment: config.max_rate_adjustment,
            smoothing_factor: config.smoothing_factor,
            epoch: Instant::now(),
            ticks: 0,
            smoothed_drift_secs: 0.0,
        }
    }

    /// Records one emitted tick and returns the sleep until the next one.
    pub fn next_sleep(&mut self) -> Duration {
        self.ticks += 1;
        let ideal_secs = self.chunk_duration.as_secs_f64() * self.ticks as f64;
        let actual_secs = self.epoch.elapsed().as_secs_f64();
        // Positive drift = running late = shorten the sleep
        let drift = actual_secs - ideal_secs;
        self.smoothed_drift_secs += self.smoothing_factor * (drift - self.smoothed_drift_secs);

        let adjustment = (self.proportional_gain * self.smoothed_drift_secs
            / self.chunk_duration.as_secs_f64())
        .clamp(-self.max_rate_adjustment, self.max_rate_adjustment);

        Duration::from_secs_f64((self.chunk_duration.as_secs_f64() * (1.0 - adjustment)).max(0.0))
    }

    /// Smoothed drift from the ideal timeline, for metrics.
    pub fn drift_secs(&self) -> f64 {
        self.smoothed_drift_secs
    }
}
