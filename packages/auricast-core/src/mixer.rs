//! Per-sink mixer.
//!
//! One task per sink, ticking at the sink's chunk cadence. Each tick it
//! takes the most recent chunk from every connected source path, sums them
//! in a wide accumulator, clamps (or soft-clips) into 32-bit range, converts
//! to the sink's wire format and hands the result to the network sender.
//!
//! A contributor with nothing queued after the grace period contributes
//! silence and counts an underrun; one that stays empty past the underrun
//! hold is muted until a chunk arrives, so a paused source cannot stall the
//! mix or skew the downstream AGC.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::dsp::encode_i32_to_pcm;
use crate::format::AudioFormat;
use crate::processor::ProcessedChunk;
use crate::queue::BoundedQueue;
use crate::sender::{NetworkSender, WirePayload};
use crate::state::EngineTuning;
use crate::stats::SinkStats;
use crate::sync::{RateController, SinkSyncCoordinator};

/// MP3 side-stream encoder contract.
///
/// The engine ships no codec (encoder selection is the embedder's concern,
/// installed through [`crate::engine::AudioEngine::install_mp3_encoder`]),
/// but the transport is wired: frames pushed to the broadcast queue are
/// drained by the sink's RTP sender, which transmits them under the
/// sink-configured MP3 payload type with the marker bit on the first packet
/// of each frame.
pub trait Mp3Encoder: Send {
    /// Feeds one chunk of full-scale 32-bit interleaved PCM and returns the
    /// complete MP3 frames that became available. May return none while the
    /// encoder is still buffering toward a frame boundary.
    fn encode(&mut self, pcm: &[i32], format: &AudioFormat) -> Vec<Bytes>;
}

/// Mixer timing/shape parameters, fixed per sink.
#[derive(Clone)]
pub struct MixerConfig {
    pub sink_id: String,
    pub format: AudioFormat,
    pub frames_per_chunk: usize,
    pub grace_period: Duration,
    pub underrun_hold: Duration,
    pub soft_clip_enabled: bool,
    pub soft_clip_threshold: f32,
    pub soft_clip_knee: f32,
    pub mp3_enabled: bool,
    pub mp3_queue_max_size: usize,
}

impl MixerConfig {
    pub fn from_tuning(
        sink_id: String,
        format: AudioFormat,
        frames_per_chunk: usize,
        mp3_enabled: bool,
        tuning: &EngineTuning,
    ) -> Self {
        Self {
            sink_id,
            format,
            frames_per_chunk,
            grace_period: Duration::from_millis(tuning.grace_period_timeout_ms),
            underrun_hold: Duration::from_millis(tuning.underrun_hold_timeout_ms),
            soft_clip_enabled: tuning.soft_clip_enabled,
            soft_clip_threshold: tuning.soft_clip_threshold,
            soft_clip_knee: tuning.soft_clip_knee,
            mp3_enabled,
            mp3_queue_max_size: tuning.mp3_output_queue_max_size,
        }
    }
}

struct MixerInput {
    queue: Arc<BoundedQueue<ProcessedChunk>>,
    muted: bool,
    last_chunk_at: Instant,
}

/// Mixes all connected source paths into one wire stream.
pub struct SinkMixer {
    config: MixerConfig,
    inputs: Arc<Mutex<HashMap<String, MixerInput>>>,
    sender: Arc<dyn NetworkSender>,
    sync: Option<Arc<SinkSyncCoordinator>>,
    mp3_queue: Option<Arc<BoundedQueue<Bytes>>>,
    mp3_encoder: Arc<Mutex<Option<Box<dyn Mp3Encoder>>>>,
    chunks_mixed: Arc<AtomicU64>,
    underruns: Arc<AtomicU64>,
    send_errors: Arc<AtomicU64>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl SinkMixer {
    /// `sync` enables cross-sink tick alignment when the engine runs with
    /// multi-sink sync on; `None` lets the sink free-run on its own cadence.
    pub fn new(
        config: MixerConfig,
        sender: Arc<dyn NetworkSender>,
        sync: Option<Arc<SinkSyncCoordinator>>,
    ) -> Self {
        let mp3_queue = config
            .mp3_enabled
            .then(|| Arc::new(BoundedQueue::new(config.mp3_queue_max_size)));
        Self {
            config,
            inputs: Arc::new(Mutex::new(HashMap::new())),
            sender,
            sync,
            mp3_queue,
            mp3_encoder: Arc::new(Mutex::new(None)),
            chunks_mixed: Arc::new(AtomicU64::new(0)),
            underruns: Arc::new(AtomicU64::new(0)),
            send_errors: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Spawns the mix loop.
    pub fn start(&self) {
        let worker = MixWorker {
            config: self.config.clone(),
            inputs: Arc::clone(&self.inputs),
            sender: Arc::clone(&self.sender),
            sync: self.sync.clone(),
            mp3_queue: self.mp3_queue.clone(),
            mp3_encoder: Arc::clone(&self.mp3_encoder),
            chunks_mixed: Arc::clone(&self.chunks_mixed),
            underruns: Arc::clone(&self.underruns),
            send_errors: Arc::clone(&self.send_errors),
        };
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            worker.run(cancel).await;
        });
    }

    /// Connects a source path's output queue to this mix.
    pub fn connect(&self, path_id: &str, queue: Arc<BoundedQueue<ProcessedChunk>>) {
        log::info!("[Mixer] {}: connected path '{path_id}'", self.config.sink_id);
        self.inputs.lock().insert(
            path_id.to_string(),
            MixerInput {
                queue,
                muted: false,
                last_chunk_at: Instant::now(),
            },
        );
    }

    /// Disconnects a source path. Its queued chunks are discarded.
    pub fn disconnect(&self, path_id: &str) {
        if self.inputs.lock().remove(path_id).is_some() {
            log::info!(
                "[Mixer] {}: disconnected path '{path_id}'",
                self.config.sink_id
            );
        }
    }

    pub fn connected_paths(&self) -> Vec<String> {
        self.inputs.lock().keys().cloned().collect()
    }

    /// Installs the MP3 side-stream encoder.
    pub fn set_mp3_encoder(&self, encoder: Box<dyn Mp3Encoder>) {
        *self.mp3_encoder.lock() = Some(encoder);
    }

    /// The bounded MP3 broadcast queue, when the sink has MP3 enabled.
    pub fn mp3_stream(&self) -> Option<Arc<BoundedQueue<Bytes>>> {
        self.mp3_queue.clone()
    }

    pub fn stats(&self) -> SinkStats {
        let inputs = self.inputs.lock();
        SinkStats {
            sink_id: self.config.sink_id.clone(),
            chunks_mixed: self.chunks_mixed.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            muted_sources: inputs.values().filter(|i| i.muted).count(),
            connected_paths: inputs.len(),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }

    /// Stops the mix loop and waits for it. Idempotent. The sender is left
    /// to the engine to close (it may be shared with the signaling layer).
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mix loop
// ─────────────────────────────────────────────────────────────────────────────

struct MixWorker {
    config: MixerConfig,
    inputs: Arc<Mutex<HashMap<String, MixerInput>>>,
    sender: Arc<dyn NetworkSender>,
    sync: Option<Arc<SinkSyncCoordinator>>,
    mp3_queue: Option<Arc<BoundedQueue<Bytes>>>,
    mp3_encoder: Arc<Mutex<Option<Box<dyn Mp3Encoder>>>>,
    chunks_mixed: Arc<AtomicU64>,
    underruns: Arc<AtomicU64>,
    send_errors: Arc<AtomicU64>,
}

/// Scratch buffers reused every tick.
struct MixBuffers {
    accumulator: Vec<i64>,
    mixed: Vec<i32>,
    wire: Vec<u8>,
}

impl MixWorker {
    async fn run(self, cancel: CancellationToken) {
        let chunk_duration = Duration::from_secs_f64(
            self.config.frames_per_chunk as f64 / self.config.format.sample_rate as f64,
        );
        log::info!(
            "[Mixer] {} running at {:?} cadence (sync={})",
            self.config.sink_id,
            chunk_duration,
            self.sync.is_some(),
        );

        let chunk_samples = self.config.frames_per_chunk * self.config.format.channels as usize;
        let mut buffers = MixBuffers {
            accumulator: vec![0; chunk_samples],
            mixed: vec![0; chunk_samples],
            wire: Vec::new(),
        };

        match self.sync.clone() {
            None => self.run_free(chunk_duration, &mut buffers, cancel).await,
            Some(sync) => self.run_synced(sync, chunk_duration, &mut buffers, cancel).await,
        }
        log::info!("[Mixer] {} stopped", self.config.sink_id);
    }

    /// Free-running cadence: a plain interval with burst catch-up.
    async fn run_free(
        &self,
        chunk_duration: Duration,
        buffers: &mut MixBuffers,
        cancel: CancellationToken,
    ) {
        let mut ticker = interval(chunk_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.mix_once(buffers).await;
        }
    }

    /// Synchronized cadence: tick starts align at the shared barrier and a
    /// rate controller keeps this sink's clock on the reference timeline.
    async fn run_synced(
        &self,
        sync: Arc<SinkSyncCoordinator>,
        chunk_duration: Duration,
        buffers: &mut MixBuffers,
        cancel: CancellationToken,
    ) {
        let member = sync.register();
        let mut controller = RateController::new(chunk_duration, sync.config());
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = member.wait_tick() => {}
            }
            self.mix_once(buffers).await;

            let pause = controller.next_sleep();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// One mix tick: gather, sum, clip, convert, transmit.
    async fn mix_once(&self, buffers: &mut MixBuffers) {
        let MixBuffers {
            accumulator,
            mixed,
            wire,
        } = buffers;

        let (contributions, csrcs) = self.collect_contributions().await;

        accumulator.iter_mut().for_each(|s| *s = 0);
        for chunk in &contributions {
            for (acc, &sample) in accumulator.iter_mut().zip(chunk.pcm.iter()) {
                *acc += i64::from(sample);
            }
        }

        for (out, &acc) in mixed.iter_mut().zip(accumulator.iter()) {
            *out = if self.config.soft_clip_enabled {
                soft_clip(
                    acc,
                    self.config.soft_clip_threshold,
                    self.config.soft_clip_knee,
                )
            } else {
                acc.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
            };
        }

        // Config was validated at sink creation; a conversion failure skips
        // this tick only
        if encode_i32_to_pcm(mixed, self.config.format.bit_depth, wire).is_err() {
            return;
        }

        if let Err(err) = self
            .sender
            .send_payload(WirePayload {
                bytes: wire,
                pcm: mixed,
                format: self.config.format,
                csrcs: &csrcs,
            })
            .await
        {
            self.send_errors.fetch_add(1, Ordering::Relaxed);
            log::debug!("[Mixer] {}: send failed: {err}", self.config.sink_id);
        }
        self.chunks_mixed.fetch_add(1, Ordering::Relaxed);

        self.encode_mp3(mixed);
    }

    /// Gathers the freshest chunk per connected path, waiting one grace
    /// period for laggards. Returns the chunks and the CSRC ids of the
    /// paths that contributed.
    async fn collect_contributions(&self) -> (Vec<ProcessedChunk>, Vec<u32>) {
        let mut contributions: Vec<ProcessedChunk> = Vec::new();
        let mut csrcs: Vec<u32> = Vec::new();
        let mut missing: Vec<String> = Vec::new();

        {
            let mut inputs = self.inputs.lock();
            for (path_id, input) in inputs.iter_mut() {
                match drain_latest(&input.queue) {
                    Some(chunk) => {
                        input.muted = false;
                        input.last_chunk_at = chunk.produced_at;
                        csrcs.push(csrc_of(path_id));
                        contributions.push(chunk);
                    }
                    None if !input.muted => missing.push(path_id.clone()),
                    None => {}
                }
            }
        }

        if !missing.is_empty() {
            tokio::time::sleep(self.config.grace_period).await;
            let mut inputs = self.inputs.lock();
            for path_id in missing {
                let Some(input) = inputs.get_mut(&path_id) else {
                    continue;
                };
                match drain_latest(&input.queue) {
                    Some(chunk) => {
                        input.muted = false;
                        input.last_chunk_at = chunk.produced_at;
                        csrcs.push(csrc_of(&path_id));
                        contributions.push(chunk);
                    }
                    None => {
                        self.underruns.fetch_add(1, Ordering::Relaxed);
                        if input.last_chunk_at.elapsed() >= self.config.underrun_hold {
                            log::info!(
                                "[Mixer] {}: muting silent path '{path_id}'",
                                self.config.sink_id
                            );
                            input.muted = true;
                        }
                    }
                }
            }
        }

        (contributions, csrcs)
    }

    fn encode_mp3(&self, mixed: &[i32]) {
        let Some(queue) = self.mp3_queue.as_ref() else {
            return;
        };
        let mut encoder = self.mp3_encoder.lock();
        let Some(encoder) = encoder.as_mut() else {
            return;
        };
        // One queue entry per complete frame so the sender can mark frame
        // boundaries; drop-oldest keeps the broadcast bounded
        for frame in encoder.encode(mixed, &self.config.format) {
            queue.force_push(frame);
        }
    }
}

/// Pops everything queued and keeps only the most recent chunk.
fn drain_latest(queue: &BoundedQueue<ProcessedChunk>) -> Option<ProcessedChunk> {
    let mut latest = None;
    while let Some(chunk) = queue.try_pop() {
        latest = Some(chunk);
    }
    latest
}

/// Stable 32-bit contributing-source id for a path.
fn csrc_of(path_id: &str) -> u32 {
    let mut hasher = DefaultHasher::new();
    path_id.hash(&mut hasher);
    hasher.finish() as u32
}

/// Tanh-like knee above the threshold; hard clamp past the knee.
fn soft_clip(sample: i64, threshold: f32, knee: f32) -> i32 {
    const FULL: f64 = 2147483648.0;
    let x = sample as f64 / FULL;
    let t = threshold as f64;
    let k = (knee as f64).max(1e-6);

    let shaped = if x.abs() <= t {
        x
    } else {
        let sign = x.signum();
        let over = (x.abs() - t) / k;
        sign * (t + k * over.tanh())
    };
    (shaped * FULL).clamp(i32::MIN as f64, i32::MAX as f64) as i32
}
