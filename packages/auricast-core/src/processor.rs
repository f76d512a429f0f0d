//! Per-path source processor.
//!
//! One task per (source × sink) path. Consumes jitter-buffered packets,
//! runs the DSP chain (normalize, speaker-layout remap, resample, delay,
//! 18-band EQ, smoothed volume, optional AGC) and emits fixed-size 32-bit
//! chunks to the target sink's mixer queue.
//!
//! Parameter updates arrive on a separate non-blocking command channel and
//! are applied between chunks; an update never splits a chunk. Timeshift
//! changes are forwarded to the timeshift manager, which re-seeks this
//! path's read position.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tokio::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::dsp::{
    self, apply_matrix, is_identity, resolve_matrix, AgcNormalizer, DelayLine, EqBank,
    StreamResampler, VolumeSmoother,
};
use crate::format::AudioFormat;
use crate::state::{SourceParameterUpdates, SourcePathSpec};
use crate::timeshift::{SharedPacket, TimeshiftManager};
use crate::queue::BoundedQueue;

/// Default target RMS for the optional volume normalization stage.
const AGC_TARGET_RMS: f32 = 0.25;

/// One processed chunk: exactly `frames_per_chunk` frames of interleaved
/// full-scale 32-bit samples at the sink's rate and channel count.
#[derive(Clone)]
pub struct ProcessedChunk {
    pub path_id: Arc<str>,
    pub pcm: Arc<Vec<i32>>,
    pub produced_at: Instant,
}

/// Static configuration of one processor instance.
pub struct ProcessorConfig {
    pub instance_id: String,
    pub spec: SourcePathSpec,
    /// Frames per emitted chunk, fixed by the target sink's chunk size.
    pub frames_per_chunk: usize,
    pub volume_smoothing_factor: f32,
}

/// Handle to a running processor task.
pub struct SourceProcessor {
    path_id: String,
    instance_id: String,
    source_tag: String,
    commands: mpsc::UnboundedSender<SourceParameterUpdates>,
    input: Arc<BoundedQueue<SharedPacket>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl SourceProcessor {
    /// Spawns the processing task.
    ///
    /// `input` is the queue the timeshift manager delivers into; `output`
    /// is the mixer input queue of the target sink.
    pub fn spawn(
        config: ProcessorConfig,
        input: Arc<BoundedQueue<SharedPacket>>,
        output: Arc<BoundedQueue<ProcessedChunk>>,
        timeshift: Weak<TimeshiftManager>,
    ) -> Self {
        let path_id = config.spec.path_id.clone();
        let instance_id = config.instance_id.clone();
        let source_tag = config.spec.source_tag.clone();
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let worker = Worker::new(config, Arc::clone(&input), output, timeshift);
        let task_cancel = cancel.clone();
        tracker.spawn(async move {
            worker.run(commands_rx, task_cancel).await;
        });

        Self {
            path_id,
            instance_id,
            source_tag,
            commands,
            input,
            cancel,
            tracker,
        }
    }

    pub fn path_id(&self) -> &str {
        &self.path_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn source_tag(&self) -> &str {
        &self.source_tag
    }

    /// Queues a parameter update; applied between chunks.
    pub fn send_update(&self, update: SourceParameterUpdates) {
        let _ = self.commands.send(update);
    }

    /// Stops the task and waits for it. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.input.stop();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker
// ─────────────────────────────────────────────────────────────────────────────

struct Worker {
    path_id: Arc<str>,
    instance_id: String,
    spec: SourcePathSpec,
    output_format: AudioFormat,
    frames_per_chunk: usize,

    input: Arc<BoundedQueue<SharedPacket>>,
    output: Arc<BoundedQueue<ProcessedChunk>>,
    timeshift: Weak<TimeshiftManager>,

    // DSP state (output side)
    volume: VolumeSmoother,
    agc: AgcNormalizer,
    eq: EqBank,
    delay: DelayLine,

    // Input-format dependent state, rebuilt on format change
    input_format: Option<AudioFormat>,
    matrix: Vec<Vec<f32>>,
    resampler: Option<StreamResampler>,

    // Accumulated post-DSP samples awaiting chunk framing
    pending: Vec<f32>,

    // Scratch buffers reused between packets
    scratch_decode: Vec<f32>,
    scratch_remap: Vec<f32>,
    scratch_resample: Vec<f32>,

    /// Formats already reported as unsupported, to log once per stream.
    reported_bad_formats: HashSet<(u32, u16, u16)>,
}

impl Worker {
    fn new(
        config: ProcessorConfig,
        input: Arc<BoundedQueue<SharedPacket>>,
        output: Arc<BoundedQueue<ProcessedChunk>>,
        timeshift: Weak<TimeshiftManager>,
    ) -> Self {
        let spec = config.spec;
        let output_format = AudioFormat::new(
            spec.target_output_samplerate,
            spec.target_output_channels,
            32,
        );

        let mut eq = EqBank::new(output_format.sample_rate, output_format.channels as usize);
        eq.set_gains(&spec.eq_values, spec.eq_normalization);

        let delay_frames =
            (spec.delay_ms as u64 * output_format.sample_rate as u64 / 1000) as usize;
        let delay = DelayLine::new(delay_frames, output_format.channels as usize);

        let mut agc = AgcNormalizer::new(AGC_TARGET_RMS);
        agc.set_enabled(spec.volume_normalization);

        Self {
            path_id: Arc::from(spec.path_id.as_str()),
            instance_id: config.instance_id,
            volume: VolumeSmoother::new(spec.volume, config.volume_smoothing_factor),
            agc,
            eq,
            delay,
            spec,
            output_format,
            frames_per_chunk: config.frames_per_chunk,
            input,
            output,
            timeshift,
            input_format: None,
            matrix: Vec::new(),
            resampler: None,
            pending: Vec::new(),
            scratch_decode: Vec::new(),
            scratch_remap: Vec::new(),
            scratch_resample: Vec::new(),
            reported_bad_formats: HashSet::new(),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SourceParameterUpdates>,
        cancel: CancellationToken,
    ) {
        log::info!(
            "[Processor] {} started for '{}' -> sink '{}'",
            self.instance_id,
            self.spec.source_tag,
            self.spec.target_sink_id
        );

        loop {
            let packet = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                packet = self.input.pop() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
            };

            // Parameter updates land between chunks, never inside one
            while let Ok(update) = commands.try_recv() {
                self.apply_update(update);
            }

            if !self.process_packet(&packet) {
                // Unsupported input: hold the output shape with silence
                self.pending.extend(std::iter::repeat(0.0).take(
                    self.frames_per_chunk * self.output_format.channels as usize,
                ));
            }

            if !self.flush_chunks(&cancel).await {
                break;
            }
        }

        log::info!("[Processor] {} stopped", self.instance_id);
    }

    fn apply_update(&mut self, update: SourceParameterUpdates) {
        if let Some(volume) = update.volume {
            self.volume.set_target(volume);
            self.spec.volume = volume;
        }
        if let Some(eq_values) = update.eq_values {
            self.spec.eq_values = eq_values;
        }
        if let Some(eq_normalization) = update.eq_normalization {
            self.spec.eq_normalization = eq_normalization;
        }
        if update.eq_values.is_some() || update.eq_normalization.is_some() {
            self.eq
                .set_gains(&self.spec.eq_values, self.spec.eq_normalization);
        }
        if let Some(enabled) = update.volume_normalization {
            self.agc.set_enabled(enabled);
            self.spec.volume_normalization = enabled;
        }
        if let Some(delay_ms) = update.delay_ms {
            if delay_ms != self.spec.delay_ms {
                let delay_frames =
                    (delay_ms as u64 * self.output_format.sample_rate as u64 / 1000) as usize;
                self.delay =
                    DelayLine::new(delay_frames, self.output_format.channels as usize);
                self.spec.delay_ms = delay_ms;
                if let Some(manager) = self.timeshift.upgrade() {
                    manager.update_static_delay(
                        &self.instance_id,
                        &self.spec.source_tag,
                        delay_ms as f64,
                    );
                }
            }
        }
        if let Some(timeshift_sec) = update.timeshift_sec {
            self.spec.timeshift_sec = timeshift_sec;
            if let Some(manager) = self.timeshift.upgrade() {
                manager.update_timeshift(
                    &self.instance_id,
                    &self.spec.source_tag,
                    timeshift_sec as f64,
                );
            }
        }
        if let Some(map) = update.speaker_layouts_map {
            self.spec.speaker_layouts_map = map;
            // Force matrix re-resolution on the next packet
            self.input_format = None;
        }
    }

    /// Rebuilds input-side state when the source format changes.
    fn adopt_input_format(&mut self, format: AudioFormat) {
        let in_channels = format.channels as usize;
        let out_channels = self.output_format.channels as usize;
        self.matrix = resolve_matrix(
            self.spec.speaker_layouts_map.get(&format.channels),
            in_channels,
            out_channels,
        );
        self.resampler = if format.sample_rate != self.output_format.sample_rate {
            match StreamResampler::new(
                format.sample_rate,
                self.output_format.sample_rate,
                out_channels,
            ) {
                Ok(resampler) => Some(resampler),
                Err(err) => {
                    log::warn!("[Processor] {}: {err}; muting path", self.instance_id);
                    None
                }
            }
        } else {
            None
        };
        self.input_format = Some(format);
    }

    /// Runs one packet through the chain. Returns false when the packet's
    /// format is unusable.
    fn process_packet(&mut self, packet: &SharedPacket) -> bool {
        if self.input_format != Some(packet.format) {
            if packet.format.validate().is_err() {
                let key = (
                    packet.format.sample_rate,
                    packet.format.channels,
                    packet.format.bit_depth,
                );
                if self.reported_bad_formats.insert(key) {
                    log::warn!(
                        "[Processor] {}: unsupported format {} on '{}', emitting silence",
                        self.instance_id,
                        packet.format,
                        packet.source_tag
                    );
                }
                return false;
            }
            self.adopt_input_format(packet.format);
        }

        // 1. Normalize wire PCM to f32
        if dsp::decode_pcm_to_f32(
            &packet.audio_data,
            packet.format.bit_depth,
            &mut self.scratch_decode,
        )
        .is_err()
        {
            return false;
        }

        // 2. Channel remap (skipped when identity)
        let in_channels = packet.format.channels as usize;
        let remapped: &[f32] = if is_identity(&self.matrix) {
            &self.scratch_decode
        } else {
            apply_matrix(
                &self.matrix,
                &self.scratch_decode,
                in_channels,
                &mut self.scratch_remap,
            );
            &self.scratch_remap
        };

        // 3. Resample to the sink rate
        let resampled: &[f32] = match self.resampler.as_mut() {
            Some(resampler) => {
                self.scratch_resample.clear();
                if resampler
                    .process(remapped, &mut self.scratch_resample)
                    .is_err()
                {
                    return false;
                }
                &self.scratch_resample
            }
            None => remapped,
        };

        // 4..7. Delay, EQ, volume, AGC, in place on the pending tail
        let start = self.pending.len();
        self.pending.extend_from_slice(resampled);
        let tail = &mut self.pending[start..];
        self.delay.process(tail);
        self.eq.process_interleaved(tail);
        self.volume
            .process_interleaved(tail, self.output_format.channels as usize);
        self.agc.process(tail);
        true
    }

    /// Emits every complete chunk in the pending buffer. Returns false when
    /// the output queue is stopped or the processor is cancelled.
    ///
    /// The push applies back-pressure, so cancellation must be able to
    /// interrupt it: a disconnected mixer would otherwise wedge this task.
    async fn flush_chunks(&mut self, cancel: &CancellationToken) -> bool {
        let chunk_samples = self.frames_per_chunk * self.output_format.channels as usize;
        while self.pending.len() >= chunk_samples {
            let rest = self.pending.split_off(chunk_samples);
            let frame: Vec<f32> = std::mem::replace(&mut self.pending, rest);

            let mut pcm = Vec::with_capacity(chunk_samples);
            dsp::f32_buffer_to_i32(&frame, &mut pcm);

            let chunk = ProcessedChunk {
                path_id: Arc::clone(&self.path_id),
                pcm: Arc::new(pcm),
                produced_at: Instant::now(),
            };
            let pushed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                pushed = self.output.push(chunk) => pushed,
            };
            if !pushed {
                return false;
            }
        }
        true
    }
}
