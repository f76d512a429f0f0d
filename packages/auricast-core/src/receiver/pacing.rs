//! Clock-paced staging between Scream receivers and the timeshift buffer.
//!
//! Scream senders burst: a busy source machine can emit several datagrams
//! back-to-back and then nothing for tens of milliseconds. The paced
//! dispatcher absorbs that by staging arrived packets per stream and
//! releasing exactly one per clock tick of the stream's format, synthesizing
//! a zero-filled packet when the staging queue is empty. Downstream the
//! timeshift manager therefore sees a continuous timebase, and every
//! released packet carries a synthesized `rtp_timestamp` advancing by one
//! chunk of frames per tick.
//!
//! Stream lifecycle: a pacer is created on the first packet for a tag,
//! replaced when the stream's format changes (pending packets dropped, old
//! clock unregistered), and retires itself after an idle timeout so paused
//! sources eventually stop producing silence and can be reaped downstream.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::clock::ClockManager;
use crate::format::AudioFormat;
use crate::packet::TaggedAudioPacket;
use crate::protocol_constants::{PACER_IDLE_TIMEOUT_SECS, PACER_STAGING_CAPACITY};
use crate::queue::BoundedQueue;

use super::PacketDispatch;

struct Pacer {
    id: Uuid,
    format: AudioFormat,
    queue: Arc<BoundedQueue<TaggedAudioPacket>>,
    cancel: CancellationToken,
}

/// Fans incoming packets into per-stream pacer tasks.
pub struct PacedDispatcher {
    clocks: Arc<ClockManager>,
    downstream: Arc<dyn PacketDispatch>,
    pacers: Arc<DashMap<String, Pacer>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl PacedDispatcher {
    pub fn new(clocks: Arc<ClockManager>, downstream: Arc<dyn PacketDispatch>) -> Arc<Self> {
        Arc::new(Self {
            clocks,
            downstream,
            pacers: Arc::new(DashMap::new()),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Number of live per-stream pacer tasks.
    pub fn active_pacers(&self) -> usize {
        self.pacers.len()
    }

    /// Stops all pacers and waits for them. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        for entry in self.pacers.iter() {
            entry.queue.stop();
        }
        self.pacers.clear();
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn spawn_pacer(&self, packet: &TaggedAudioPacket) -> Pacer {
        let id = Uuid::new_v4();
        let format = packet.format;
        let tag = packet.source_tag.clone();
        let queue = Arc::new(BoundedQueue::new(PACER_STAGING_CAPACITY));
        let cancel = self.cancel.child_token();

        log::info!("[Pacing] Starting pacer for '{tag}' ({format})");

        let task_queue = Arc::clone(&queue);
        let task_cancel = cancel.clone();
        let clocks = Arc::clone(&self.clocks);
        let downstream = Arc::clone(&self.downstream);
        let pacers = Arc::clone(&self.pacers);
        self.tracker.spawn(async move {
            run_pacer(
                tag.clone(),
                format,
                task_queue,
                clocks,
                downstream,
                task_cancel,
            )
            .await;
            // Self-retire; a format change may already have replaced us
            pacers.remove_if(&tag, |_, p| p.id == id);
        });

        Pacer {
            id,
            format,
            queue,
            cancel,
        }
    }
}

impl PacketDispatch for PacedDispatcher {
    fn dispatch_ready_packet(&self, packet: TaggedAudioPacket) {
        if self.cancel.is_cancelled() {
            return;
        }

        // Format change replaces the pacer: pending queue dropped, old clock
        // unregistered by the retiring task
        if let Some(pacer) = self.pacers.get(&packet.source_tag) {
            if pacer.format != packet.format {
                log::info!(
                    "[Pacing] Format change on '{}': {} -> {}",
                    packet.source_tag,
                    pacer.format,
                    packet.format
                );
                let stale = pacer.id;
                pacer.cancel.cancel();
                pacer.queue.stop();
                drop(pacer);
                self.pacers
                    .remove_if(&packet.source_tag, |_, p| p.id == stale);
            }
        }

        let pacer = self
            .pacers
            .entry(packet.source_tag.clone())
            .or_insert_with(|| self.spawn_pacer(&packet));
        pacer.queue.force_push(packet);
    }
}

async fn run_pacer(
    tag: String,
    format: AudioFormat,
    queue: Arc<BoundedQueue<TaggedAudioPacket>>,
    clocks: Arc<ClockManager>,
    downstream: Arc<dyn PacketDispatch>,
    cancel: CancellationToken,
) {
    let handle = clocks.register_clock_condition(&format);
    let condition = Arc::clone(handle.condition());
    let frames = clocks.frames_per_chunk(&format);
    let idle_timeout = Duration::from_secs(PACER_IDLE_TIMEOUT_SECS);

    let mut next_rtp_timestamp: u32 = 0;
    let mut last_seq = condition.sequence();
    let mut last_real_packet = Instant::now();

    'run: loop {
        let seq = tokio::select! {
            biased;
            _ = cancel.cancelled() => break 'run,
            seq = condition.wait_past(last_seq) => seq,
        };
        // A jump of more than one means missed ticks; emit for each so the
        // downstream timebase stays gapless
        let ticks = seq - last_seq;
        last_seq = seq;

        for _ in 0..ticks {
            match queue.try_pop() {
                Some(mut packet) => {
                    last_real_packet = Instant::now();
                    packet.received_time = Instant::now();
                    packet.rtp_timestamp = Some(next_rtp_timestamp);
                    downstream.dispatch_ready_packet(packet);
                }
                None => {
                    if last_real_packet.elapsed() >= idle_timeout {
                        log::info!("[Pacing] Stream '{tag}' idle, stopping pacer");
                        break 'run;
                    }
                    downstream.dispatch_ready_packet(TaggedAudioPacket {
                        source_tag: tag.clone(),
                        received_time: Instant::now(),
                        rtp_timestamp: Some(next_rtp_timestamp),
                        format,
                        audio_data: format.silence_frames(frames),
                    });
                }
            }
            next_rtp_timestamp = next_rtp_timestamp.wrapping_add(frames as u32);
        }
    }

    clocks.unregister_clock_condition(handle);
    queue.stop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_constants::SCREAM_CHUNK_SIZE;
    use crate::receiver::test_support::RecordingDispatch;
    use bytes::Bytes;

    fn packet(tag: &str, fill: u8) -> TaggedAudioPacket {
        TaggedAudioPacket {
            source_tag: tag.into(),
            received_time: Instant::now(),
            rtp_timestamp: None,
            format: AudioFormat::new(48000, 2, 16),
            audio_data: Bytes::from(vec![fill; SCREAM_CHUNK_SIZE]),
        }
    }

    /// Lets freshly spawned pacer/clock tasks register their timers, then
    /// advances the paused clock tick by tick.
    async fn run_ticks(count: u32) {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        for _ in 0..count {
            // 288 frames @ 48kHz stereo 16-bit = one 6ms tick
            tokio::time::advance(Duration::from_millis(6)).await;
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn releases_one_packet_per_tick_with_synthesized_timestamps() {
        let clocks = Arc::new(ClockManager::new(SCREAM_CHUNK_SIZE));
        let sink = Arc::new(RecordingDispatch::default());
        let paced = PacedDispatcher::new(Arc::clone(&clocks), Arc::clone(&sink) as _);

        for fill in 1..=3u8 {
            paced.dispatch_ready_packet(packet("src", fill));
        }
        assert_eq!(paced.active_pacers(), 1);

        run_ticks(3).await;

        let released = sink.packets.lock();
        assert!(released.len() >= 3, "got {} packets", released.len());
        for (i, pkt) in released.iter().take(3).enumerate() {
            assert_eq!(pkt.rtp_timestamp, Some(i as u32 * 288));
            assert_eq!(pkt.audio_data[0], (i + 1) as u8);
        }
        drop(released);

        paced.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn synthesizes_silence_when_staging_is_empty() {
        let clocks = Arc::new(ClockManager::new(SCREAM_CHUNK_SIZE));
        let sink = Arc::new(RecordingDispatch::default());
        let paced = PacedDispatcher::new(Arc::clone(&clocks), Arc::clone(&sink) as _);

        paced.dispatch_ready_packet(packet("src", 9));

        // Several ticks with only one staged packet: the rest are silence
        run_ticks(4).await;

        let released = sink.packets.lock();
        assert!(released.len() >= 3);
        assert_eq!(released[0].audio_data[0], 9);
        assert!(released[1].audio_data.iter().all(|&b| b == 0));
        // Timebase is continuous across real and synthesized packets
        for (i, pkt) in released.iter().enumerate() {
            assert_eq!(pkt.rtp_timestamp, Some(i as u32 * 288));
        }
        drop(released);

        paced.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn format_change_replaces_the_pacer() {
        let clocks = Arc::new(ClockManager::new(SCREAM_CHUNK_SIZE));
        let sink = Arc::new(RecordingDispatch::default());
        let paced = PacedDispatcher::new(Arc::clone(&clocks), Arc::clone(&sink) as _);

        paced.dispatch_ready_packet(packet("src", 1));
        let mut changed = packet("src", 2);
        changed.format = AudioFormat::new(44100, 2, 16);
        paced.dispatch_ready_packet(changed);

        assert_eq!(paced.active_pacers(), 1);
        run_ticks(4).await;

        let released = sink.packets.lock();
        // Only the 44.1kHz pacer survives; its packets restart the timebase
        assert!(released.iter().all(|p| p.format.sample_rate == 44100));
        drop(released);

        paced.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_pacer_retires_itself() {
        let clocks = Arc::new(ClockManager::new(SCREAM_CHUNK_SIZE));
        let sink = Arc::new(RecordingDispatch::default());
        let paced = PacedDispatcher::new(Arc::clone(&clocks), Arc::clone(&sink) as _);

        paced.dispatch_ready_packet(packet("src", 1));
        // First tick consumes the staged packet
        run_ticks(1).await;
        // Then a long gap with no input retires the pacer
        tokio::time::advance(Duration::from_secs(PACER_IDLE_TIMEOUT_SECS + 1)).await;
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        assert_eq!(paced.active_pacers(), 0);
        assert_eq!(clocks.active_clocks(), 0);

        paced.stop().await;
    }
}
