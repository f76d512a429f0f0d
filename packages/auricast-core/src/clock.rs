//! Shared pacing clocks for receivers.
//!
//! Paced receivers must release exactly one chunk's worth of samples per
//! period without each stream owning a timer. The [`ClockManager`] runs one
//! metronome task per unique PCM format; streams with identical formats share
//! a single refcounted [`ClockCondition`] whose monotonic `sequence` counter
//! advances on every tick.
//!
//! Missed ticks are not hidden: the interval runs with
//! [`MissedTickBehavior::Burst`], so a consumer that falls behind observes
//! the sequence jumping and decides for itself whether to synthesize silence
//! or fast-forward.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::format::AudioFormat;

/// Key identifying one shared clock: formats with equal rate/channels/depth
/// tick together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClockKey {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl From<&AudioFormat> for ClockKey {
    fn from(format: &AudioFormat) -> Self {
        Self {
            sample_rate: format.sample_rate,
            channels: format.channels,
            bit_depth: format.bit_depth,
        }
    }
}

/// Shared tick condition with a monotonic sequence counter.
pub struct ClockCondition {
    sequence: AtomicU64,
    notify: Notify,
}

impl ClockCondition {
    fn new() -> Self {
        Self {
            sequence: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Current tick count.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Waits until the sequence advances past `last_seen` and returns the
    /// current value. A jump of more than one means ticks were missed.
    pub async fn wait_past(&self, last_seen: u64) -> u64 {
        loop {
            let current = self.sequence();
            if current > last_seen {
                return current;
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let current = self.sequence();
            if current > last_seen {
                return current;
            }
            notified.await;
        }
    }

    fn tick(&self) {
        self.sequence.fetch_add(1, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// Handle to a registered clock condition. Pass back to
/// [`ClockManager::unregister_clock_condition`] when done.
pub struct ClockHandle {
    key: ClockKey,
    condition: Arc<ClockCondition>,
}

impl ClockHandle {
    pub fn condition(&self) -> &Arc<ClockCondition> {
        &self.condition
    }
}

struct ClockEntry {
    condition: Arc<ClockCondition>,
    refcount: usize,
    cancel: CancellationToken,
}

/// Registry of per-format metronome tasks.
///
/// `chunk_size_bytes` fixes how much audio one tick represents: the period of
/// a format's clock is `chunk_frames / sample_rate`.
pub struct ClockManager {
    chunk_size_bytes: usize,
    entries: Mutex<HashMap<ClockKey, ClockEntry>>,
    tracker: TaskTracker,
    cancel_all: CancellationToken,
}

impl ClockManager {
    pub fn new(chunk_size_bytes: usize) -> Self {
        Self {
            chunk_size_bytes,
            entries: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            cancel_all: CancellationToken::new(),
        }
    }

    /// Frames represented by one tick of a clock for `format`.
    pub fn frames_per_chunk(&self, format: &AudioFormat) -> usize {
        self.chunk_size_bytes / format.bytes_per_frame()
    }

    /// Registers interest in a paced clock for `format`.
    ///
    /// Identical formats share one condition; the first registration spawns
    /// the metronome task.
    pub fn register_clock_condition(&self, format: &AudioFormat) -> ClockHandle {
        let key = ClockKey::from(format);
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(&key) {
            entry.refcount += 1;
            return ClockHandle {
                key,
                condition: Arc::clone(&entry.condition),
            };
        }

        let condition = Arc::new(ClockCondition::new());
        let cancel = self.cancel_all.child_token();
        let frames = self.frames_per_chunk(format);
        let period = Duration::from_secs_f64(frames as f64 / format.sample_rate as f64);

        log::debug!(
            "[Clock] Starting metronome: format={format}, frames/tick={frames}, period={:?}",
            period
        );

        let worker_condition = Arc::clone(&condition);
        let worker_cancel = cancel.clone();
        self.tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                tokio::select! {
                    biased;
                    _ = worker_cancel.cancelled() => break,
                    _ = ticker.tick() => worker_condition.tick(),
                }
            }
        });

        entries.insert(
            key,
            ClockEntry {
                condition: Arc::clone(&condition),
                refcount: 1,
                cancel,
            },
        );
        ClockHandle { key, condition }
    }

    /// Releases one registration; the metronome stops when the last holder
    /// leaves.
    pub fn unregister_clock_condition(&self, handle: ClockHandle) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&handle.key) else {
            return;
        };
        entry.refcount -= 1;
        if entry.refcount == 0 {
            entry.cancel.cancel();
            entries.remove(&handle.key);
            log::debug!("[Clock] Stopped metronome for {:?}", handle.key);
        }
    }

    /// Number of live metronome tasks.
    pub fn active_clocks(&self) -> usize {
        self.entries.lock().len()
    }

    /// Stops every metronome and waits for the workers to exit. Idempotent.
    pub async fn stop(&self) {
        self.cancel_all.cancel();
        self.entries.lock().clear();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
