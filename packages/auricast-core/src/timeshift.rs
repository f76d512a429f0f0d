//! Timeshift buffer and unified jitter manager.
//!
//! Central fan-in/fan-out of the pipeline: receivers write tagged packets
//! in, registered processors read them out through bounded queues. Each
//! source stream keeps a rolling history bounded by the configured retention
//! so consumers can request delayed playout, and a single adaptive playout
//! delay shared by every consumer of the stream.
//!
//! The unified delay is what keeps two processors of the same source in
//! sync: the dispatch loop releases a given packet to all of a stream's
//! consumers in the same iteration, so inter-consumer skew is bounded by
//! queue consumer latency, not by independent jitter buffers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::packet::TaggedAudioPacket;
use crate::queue::BoundedQueue;
use crate::receiver::PacketDispatch;
use crate::state::EngineTuning;
use crate::stats::{ConsumerStats, StreamStats};

/// Packets are shared between consumers; cloning is an Arc bump.
pub type SharedPacket = Arc<TaggedAudioPacket>;

/// Timing parameters of the manager, frozen at engine start.
#[derive(Debug, Clone)]
pub struct TimeshiftConfig {
    pub retention: Duration,
    pub target_buffer_level_ms: f64,
    pub max_adaptive_delay_ms: f64,
    pub late_packet_threshold_ms: f64,
    pub loop_max_sleep: Duration,
    pub jitter_smoothing_factor: f64,
    pub jitter_safety_margin: f64,
    pub cleanup_interval: Duration,
}

impl From<&EngineTuning> for TimeshiftConfig {
    fn from(tuning: &EngineTuning) -> Self {
        Self {
            retention: Duration::from_secs(tuning.timeshift_retention_secs),
            target_buffer_level_ms: tuning.target_buffer_level_ms,
            max_adaptive_delay_ms: tuning.max_adaptive_delay_ms,
            late_packet_threshold_ms: tuning.late_packet_threshold_ms,
            loop_max_sleep: Duration::from_millis(tuning.loop_max_sleep_ms),
            jitter_smoothing_factor: tuning.jitter_smoothing_factor,
            jitter_safety_margin: tuning.jitter_safety_margin_multiplier,
            cleanup_interval: Duration::from_millis(tuning.cleanup_interval_ms),
        }
    }
}

struct Consumer {
    queue: Arc<BoundedQueue<SharedPacket>>,
    static_delay_ms: f64,
    timeshift_sec: f64,
    /// Absolute read position (see `Stream::base_index`).
    read_index: u64,
}

struct Stream {
    /// Rolling packet history; `packets[0]` has absolute index `base_index`.
    packets: VecDeque<SharedPacket>,
    base_index: u64,
    last_arrival: Option<Instant>,
    smoothed_jitter_ms: f64,
    unified_delay_ms: f64,
    late_packets: u64,
    /// Absolute index up to which lateness has been counted (once per packet).
    late_watermark: u64,
    consumers: HashMap<String, Consumer>,
}

impl Stream {
    fn new(floor_delay_ms: f64) -> Self {
        Self {
            packets: VecDeque::new(),
            base_index: 0,
            last_arrival: None,
            smoothed_jitter_ms: 0.0,
            unified_delay_ms: floor_delay_ms,
            late_packets: 0,
            late_watermark: 0,
            consumers: HashMap::new(),
        }
    }

    /// Absolute index one past the newest packet.
    fn tail_index(&self) -> u64 {
        self.base_index + self.packets.len() as u64
    }

    /// Shared delay: the largest consumer static delay or the jitter-derived
    /// safety margin, clamped to the configured window.
    fn recompute_unified_delay(&mut self, config: &TimeshiftConfig) {
        let static_max = self
            .consumers
            .values()
            .map(|c| c.static_delay_ms)
            .fold(0.0f64, f64::max);
        let jitter_term = self.smoothed_jitter_ms * config.jitter_safety_margin;
        self.unified_delay_ms = static_max
            .max(jitter_term)
            .clamp(config.target_buffer_level_ms, config.max_adaptive_delay_ms);
    }

    /// Positions a read index `timeshift_sec` back from the live tail.
    fn seek_index(&self, now: Instant, timeshift_sec: f64) -> u64 {
        if timeshift_sec <= 0.0 {
            return self.tail_index();
        }
        let horizon = now.checked_sub(Duration::from_secs_f64(timeshift_sec));
        let Some(horizon) = horizon else {
            return self.base_index;
        };
        // Packets are in arrival order; scan back for the first at or after
        // the horizon.
        let mut index = self.tail_index();
        for packet in self.packets.iter().rev() {
            if packet.received_time < horizon {
                break;
            }
            index -= 1;
        }
        index
    }
}

/// Per-source rolling buffers with a shared dispatch loop.
pub struct TimeshiftManager {
    config: TimeshiftConfig,
    streams: DashMap<String, Arc<Mutex<Stream>>>,
    dispatch_wake: Notify,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl TimeshiftManager {
    pub fn new(config: TimeshiftConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            streams: DashMap::new(),
            dispatch_wake: Notify::new(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Spawns the dispatch loop. Call once after construction.
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        self.tracker.spawn(async move {
            manager.run_dispatch().await;
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Ingest
    // ─────────────────────────────────────────────────────────────────────

    /// Appends a packet to its stream, updating jitter and the unified
    /// delay. Invariants are re-checked; a bad packet is dropped.
    pub fn add_packet(&self, packet: TaggedAudioPacket) {
        if let Err(err) = packet.validate() {
            log::warn!(
                "[Timeshift] Dropping invalid packet for '{}': {err}",
                packet.source_tag
            );
            return;
        }

        let stream = self
            .streams
            .entry(packet.source_tag.clone())
            .or_insert_with(|| {
                log::info!("[Timeshift] New stream '{}'", packet.source_tag);
                Arc::new(Mutex::new(Stream::new(self.config.target_buffer_level_ms)))
            })
            .clone();

        {
            let mut stream = stream.lock();
            let now = packet.received_time;

            // Jitter EWMA from |arrival interval − expected interval|
            if let Some(last) = stream.last_arrival {
                let expected_ms = packet
                    .format
                    .frames_duration_secs(packet.frames())
                    * 1000.0;
                let observed_ms = now.duration_since(last).as_secs_f64() * 1000.0;
                let deviation = (observed_ms - expected_ms).abs();
                let alpha = self.config.jitter_smoothing_factor;
                stream.smoothed_jitter_ms += alpha * (deviation - stream.smoothed_jitter_ms);
            }
            stream.last_arrival = Some(now);

            stream.packets.push_back(Arc::new(packet));

            // Evict history older than retention
            let cutoff = now.checked_sub(self.config.retention);
            if let Some(cutoff) = cutoff {
                while stream
                    .packets
                    .front()
                    .is_some_and(|p| p.received_time < cutoff)
                {
                    stream.packets.pop_front();
                    stream.base_index += 1;
                }
            }

            stream.recompute_unified_delay(&self.config);
        }

        self.dispatch_wake.notify_one();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Consumer registration
    // ─────────────────────────────────────────────────────────────────────

    /// Registers a processor as a consumer of `source_tag`.
    ///
    /// The read position starts `timeshift_sec` back from the live tail; the
    /// unified delay is recomputed to account for the new static delay.
    pub fn register_processor(
        &self,
        processor_id: &str,
        source_tag: &str,
        queue: Arc<BoundedQueue<SharedPacket>>,
        static_delay_ms: f64,
        timeshift_sec: f64,
    ) {
        let stream = self
            .streams
            .entry(source_tag.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Stream::new(self.config.target_buffer_level_ms)))
            })
            .clone();

        let mut stream = stream.lock();
        let read_index = stream.seek_index(Instant::now(), timeshift_sec);
        stream.consumers.insert(
            processor_id.to_string(),
            Consumer {
                queue,
                static_delay_ms,
                timeshift_sec,
                read_index,
            },
        );
        stream.recompute_unified_delay(&self.config);
        log::info!(
            "[Timeshift] Registered processor {processor_id} on '{source_tag}' \
             (delay={static_delay_ms}ms, timeshift={timeshift_sec}s)"
        );
    }

    /// Removes a processor from its stream. The stream itself is reaped by
    /// the cleanup sweep once it is idle past retention.
    pub fn unregister_processor(&self, processor_id: &str, source_tag: &str) {
        if let Some(stream) = self.streams.get(source_tag) {
            let mut stream = stream.lock();
            if stream.consumers.remove(processor_id).is_some() {
                stream.recompute_unified_delay(&self.config);
                log::info!("[Timeshift] Unregistered processor {processor_id} from '{source_tag}'");
            }
        }
    }

    /// Re-seeks a consumer's read position for a new timeshift value.
    pub fn update_timeshift(&self, processor_id: &str, source_tag: &str, timeshift_sec: f64) {
        if let Some(stream) = self.streams.get(source_tag) {
            let mut stream = stream.lock();
            let read_index = stream.seek_index(Instant::now(), timeshift_sec);
            if let Some(consumer) = stream.consumers.get_mut(processor_id) {
                consumer.timeshift_sec = timeshift_sec;
                consumer.read_index = read_index;
            }
        }
    }

    /// Updates the static delay a consumer contributes to the unified delay.
    pub fn update_static_delay(&self, processor_id: &str, source_tag: &str, static_delay_ms: f64) {
        if let Some(stream) = self.streams.get(source_tag) {
            let mut stream = stream.lock();
            if let Some(consumer) = stream.consumers.get_mut(processor_id) {
                consumer.static_delay_ms = static_delay_ms;
            }
            stream.recompute_unified_delay(&self.config);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────────────

    async fn run_dispatch(&self) {
        log::info!("[Timeshift] Dispatch loop started");
        let mut last_cleanup = Instant::now();
        loop {
            self.deliver_due(Instant::now());

            if last_cleanup.elapsed() >= self.config.cleanup_interval {
                self.cleanup(Instant::now());
                last_cleanup = Instant::now();
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.dispatch_wake.notified() => {}
                _ = tokio::time::sleep(self.config.loop_max_sleep) => {}
            }
        }
        log::info!("[Timeshift] Dispatch loop stopped");
    }

    /// Releases every packet whose playout time has arrived to all consumers
    /// of its stream in this same iteration.
    fn deliver_due(&self, now: Instant) {
        for entry in self.streams.iter() {
            let mut stream = entry.value().lock();
            let stream = &mut *stream;
            let unified_delay = Duration::from_secs_f64(stream.unified_delay_ms / 1000.0);
            let late_threshold =
                Duration::from_secs_f64(self.config.late_packet_threshold_ms / 1000.0);

            let base = stream.base_index;
            let tail = stream.base_index + stream.packets.len() as u64;
            // Dedupes lateness across consumers so each packet counts once
            let mut late_marks: std::collections::BTreeSet<u64> = std::collections::BTreeSet::new();

            for consumer in stream.consumers.values_mut() {
                // History evicted under this consumer: skip forward
                if consumer.read_index < base {
                    consumer.read_index = base;
                }

                while consumer.read_index < tail {
                    let packet = &stream.packets[(consumer.read_index - base) as usize];

                    // Positive timeshift replays the past: the packet at the
                    // seeked position plays out one buffer-depth later.
                    let mut target = packet.received_time + unified_delay;
                    if consumer.timeshift_sec > 0.0 {
                        target += Duration::from_secs_f64(consumer.timeshift_sec);
                    } else if consumer.timeshift_sec < 0.0 {
                        target = target
                            .checked_sub(Duration::from_secs_f64(-consumer.timeshift_sec))
                            .unwrap_or(packet.received_time);
                    }

                    if now < target {
                        break;
                    }

                    // Late packets are still delivered; count once per packet
                    if now.duration_since(target) > late_threshold
                        && consumer.read_index >= stream.late_watermark
                    {
                        late_marks.insert(consumer.read_index);
                    }

                    // force_push never blocks the dispatch loop; a full
                    // consumer queue drops and counts on that queue alone
                    consumer.queue.force_push(Arc::clone(packet));
                    consumer.read_index += 1;
                }
            }

            if let Some(&max_mark) = late_marks.last() {
                stream.late_packets += late_marks.len() as u64;
                stream.late_watermark = max_mark + 1;
            }
        }
    }

    /// Drops streams with no consumers and no packets newer than retention.
    fn cleanup(&self, now: Instant) {
        let cutoff = now.checked_sub(self.config.retention);
        self.streams.retain(|tag, stream| {
            let stream = stream.lock();
            if !stream.consumers.is_empty() {
                return true;
            }
            let has_fresh = match cutoff {
                Some(cutoff) => stream
                    .packets
                    .back()
                    .is_some_and(|p| p.received_time >= cutoff),
                None => !stream.packets.is_empty(),
            };
            if !has_fresh {
                log::info!("[Timeshift] Reaping idle stream '{tag}'");
            }
            has_fresh
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Introspection / shutdown
    // ─────────────────────────────────────────────────────────────────────

    /// Point-in-time metrics for every stream.
    pub fn stats(&self) -> Vec<StreamStats> {
        self.streams
            .iter()
            .map(|entry| {
                let stream = entry.value().lock();
                let tail = stream.tail_index();
                StreamStats {
                    source_tag: entry.key().clone(),
                    buffer_depth: stream.packets.len(),
                    smoothed_jitter_ms: stream.smoothed_jitter_ms,
                    unified_delay_ms: stream.unified_delay_ms,
                    late_packets: stream.late_packets,
                    consumers: stream
                        .consumers
                        .iter()
                        .map(|(id, c)| ConsumerStats {
                            processor_id: id.clone(),
                            read_lag: tail.saturating_sub(c.read_index),
                            queue_len: c.queue.len(),
                            queue_dropped: c.queue.dropped(),
                        })
                        .collect(),
                }
            })
            .collect()
    }

    /// Number of live streams.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Stops the dispatch loop and waits for it. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl PacketDispatch for TimeshiftManager {
    fn dispatch_ready_packet(&self, packet: TaggedAudioPacket) {
        self.add_packet(packet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::AudioFormat;
    use bytes::Bytes;

    fn config() -> TimeshiftConfig {
        TimeshiftConfig::from(&EngineTuning::default())
    }

    fn packet(tag: &str, rtp: u32, received: Instant) -> TaggedAudioPacket {
        TaggedAudioPacket {
            source_tag: tag.into(),
            received_time: received,
            rtp_timestamp: Some(rtp),
            format: AudioFormat::new(48000, 2, 16),
            audio_data: Bytes::from(vec![rtp as u8; 1152]),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn all_consumers_see_identical_sequences() {
        let manager = TimeshiftManager::new(config());
        let qa = Arc::new(BoundedQueue::new(128));
        let qb = Arc::new(BoundedQueue::new(128));
        // Different static delays, same stream: the unified delay makes the
        // delivered sequences identical
        manager.register_processor("a", "src", Arc::clone(&qa), 50.0, 0.0);
        manager.register_processor("b", "src", Arc::clone(&qb), 150.0, 0.0);

        let start = Instant::now();
        for i in 0..10u32 {
            manager.add_packet(packet("src", i * 480, start));
        }

        // Past the unified delay (clamped max 200ms), everything is due
        tokio::time::advance(Duration::from_millis(250)).await;
        manager.deliver_due(Instant::now());

        for i in 0..10u32 {
            let pa = qa.try_pop().expect("a should have packet");
            let pb = qb.try_pop().expect("b should have packet");
            assert_eq!(pa.rtp_timestamp, Some(i * 480));
            assert_eq!(pb.rtp_timestamp, Some(i * 480));
            assert_eq!(pa.audio_data, pb.audio_data);
            // Same iteration, same Arc
            assert!(Arc::ptr_eq(&pa, &pb));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unified_delay_takes_max_of_static_delays() {
        let manager = TimeshiftManager::new(config());
        let qa = Arc::new(BoundedQueue::new(8));
        let qb = Arc::new(BoundedQueue::new(8));
        manager.register_processor("a", "src", qa, 50.0, 0.0);
        manager.register_processor("b", "src", qb, 150.0, 0.0);

        manager.add_packet(packet("src", 0, Instant::now()));
        let stats = manager.stats();
        assert_eq!(stats.len(), 1);
        assert!((stats[0].unified_delay_ms - 150.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn packet_not_delivered_before_unified_delay() {
        let manager = TimeshiftManager::new(config());
        let q = Arc::new(BoundedQueue::new(8));
        manager.register_processor("a", "src", Arc::clone(&q), 100.0, 0.0);

        manager.add_packet(packet("src", 0, Instant::now()));
        manager.deliver_due(Instant::now());
        assert!(q.try_pop().is_none(), "delivery before the delay elapsed");

        tokio::time::advance(Duration::from_millis(120)).await;
        manager.deliver_due(Instant::now());
        assert!(q.try_pop().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn late_packet_is_delivered_and_counted_once() {
        let manager = TimeshiftManager::new(config());
        let q = Arc::new(BoundedQueue::new(8));
        manager.register_processor("a", "src", Arc::clone(&q), 0.0, 0.0);

        // Arrived 200ms ago: already far past its playout target
        tokio::time::advance(Duration::from_millis(300)).await;
        let received = Instant::now() - Duration::from_millis(200);
        manager.add_packet(packet("src", 7, received));

        manager.deliver_due(Instant::now());
        assert!(q.try_pop().is_some(), "late packet must still be delivered");
        assert_eq!(manager.stats()[0].late_packets, 1);

        // A second dispatch pass must not double-count
        manager.deliver_due(Instant::now());
        assert_eq!(manager.stats()[0].late_packets, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_consumer_queue_drops_without_blocking_others() {
        let manager = TimeshiftManager::new(config());
        let small = Arc::new(BoundedQueue::new(2));
        let large = Arc::new(BoundedQueue::new(64));
        manager.register_processor("small", "src", Arc::clone(&small), 0.0, 0.0);
        manager.register_processor("large", "src", Arc::clone(&large), 0.0, 0.0);

        let start = Instant::now();
        for i in 0..10u32 {
            manager.add_packet(packet("src", i, start));
        }
        tokio::time::advance(Duration::from_millis(50)).await;
        manager.deliver_due(Instant::now());

        assert_eq!(small.len(), 2);
        assert_eq!(small.dropped(), 8);
        assert_eq!(large.len(), 10);
        assert_eq!(large.dropped(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_streams_are_reaped_after_retention() {
        let manager = TimeshiftManager::new(config());
        manager.add_packet(packet("src", 0, Instant::now()));
        assert_eq!(manager.stream_count(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        manager.cleanup(Instant::now());
        assert_eq!(manager.stream_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn registered_stream_survives_cleanup() {
        let manager = TimeshiftManager::new(config());
        let q = Arc::new(BoundedQueue::new(8));
        manager.register_processor("a", "src", q, 0.0, 0.0);

        tokio::time::advance(Duration::from_secs(60)).await;
        manager.cleanup(Instant::now());
        assert_eq!(manager.stream_count(), 1, "stream with consumer must stay");
    }
}
