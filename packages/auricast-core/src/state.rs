//! Declarative engine state and tuning configuration.
//!
//! [`DesiredEngineState`] is the pure value object the reconciler applies:
//! the full set of sinks and source paths the embedder wants live, with
//! connections expressed on each sink. Everything here is plain data with
//! serde derives; the engine never mutates these objects.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::format::AudioFormat;
use crate::protocol_constants::{
    DEFAULT_CLEANUP_INTERVAL_MS, DEFAULT_GRACE_PERIOD_TIMEOUT_MS, DEFAULT_JITTER_SAFETY_MARGIN,
    DEFAULT_JITTER_SMOOTHING_FACTOR, DEFAULT_LATE_PACKET_THRESHOLD_MS, DEFAULT_LOOP_MAX_SLEEP_MS,
    DEFAULT_MAX_ADAPTIVE_DELAY_MS, DEFAULT_MP3_BITRATE_KBPS, DEFAULT_MP3_QUEUE_MAX_SIZE,
    DEFAULT_BARRIER_TIMEOUT_MS, DEFAULT_MAX_RATE_ADJUSTMENT, DEFAULT_SYNC_PROPORTIONAL_GAIN,
    DEFAULT_SYNC_SMOOTHING_FACTOR, DEFAULT_TARGET_BUFFER_LEVEL_MS,
    DEFAULT_TIMESHIFT_RETENTION_SECS, DEFAULT_UNDERRUN_HOLD_TIMEOUT_MS,
    DEFAULT_VOLUME_SMOOTHING_FACTOR, EQ_BANDS, SCREAM_CHUNK_SIZE,
};

/// Tolerance for float comparison when diffing desired vs applied state.
///
/// Values that survive a serialize/deserialize round trip can pick up noise
/// in the last few bits; anything closer than this is "unchanged".
pub const FLOAT_TOLERANCE: f32 = 100.0 * f32::EPSILON;

/// Returns true when two floats differ beyond [`FLOAT_TOLERANCE`].
pub fn float_changed(a: f32, b: f32) -> bool {
    (a - b).abs() > FLOAT_TOLERANCE * a.abs().max(b.abs()).max(1.0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Sink Specification
// ─────────────────────────────────────────────────────────────────────────────

/// Wire protocol a sink transmits over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkProtocol {
    /// 5-byte Scream header + PCM over UDP.
    LegacyScream,
    /// RFC 3550 RTP over UDP.
    Rtp,
    /// Opus over a WebRTC media track.
    Webrtc,
    /// RTP whose session lifecycle is owned by an external SIP layer; the
    /// engine only transmits to the address it is given.
    SipManaged,
}

/// Declarative description of one output sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkSpec {
    pub sink_id: String,
    pub protocol: SinkProtocol,
    pub ip: String,
    pub port: u16,
    pub samplerate: u32,
    pub bitdepth: u16,
    pub channels: u16,
    #[serde(default)]
    pub chlayout1: u8,
    #[serde(default)]
    pub chlayout2: u8,
    #[serde(default)]
    pub mp3_enabled: bool,
    /// RTP payload type the MP3 side stream transmits under.
    #[serde(default = "default_mp3_payload_type")]
    pub mp3_payload_type: u8,
    /// IDs of the source paths this sink mixes. Unordered set semantics.
    #[serde(default)]
    pub connected_source_path_ids: Vec<String>,
}

impl SinkSpec {
    /// The PCM format this sink emits. Stable once the sink exists.
    pub fn output_format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.samplerate,
            channels: self.channels,
            bit_depth: self.bitdepth,
            chlayout1: self.chlayout1,
            chlayout2: self.chlayout2,
        }
    }

    /// True when the engine-level configuration changed (anything except the
    /// connection set). Connection changes are handled separately.
    pub fn engine_config_changed(&self, other: &Self) -> bool {
        self.protocol != other.protocol
            || self.ip != other.ip
            || self.port != other.port
            || self.samplerate != other.samplerate
            || self.bitdepth != other.bitdepth
            || self.channels != other.channels
            || self.chlayout1 != other.chlayout1
            || self.chlayout2 != other.chlayout2
            || self.mp3_enabled != other.mp3_enabled
            || self.mp3_payload_type != other.mp3_payload_type
    }

    /// True when the connection set changed, ignoring order.
    pub fn connections_changed(&self, other: &Self) -> bool {
        let mut a = self.connected_source_path_ids.clone();
        let mut b = other.connected_source_path_ids.clone();
        a.sort();
        b.sort();
        a != b
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Source Path Specification
// ─────────────────────────────────────────────────────────────────────────────

/// Speaker-layout remap for one input channel count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakerLayout {
    /// When set, the engine's fixed mapping table is used and `matrix` is
    /// ignored.
    pub auto_mode: bool,
    /// Explicit mixing matrix, rows = output channels, cols = input channels.
    #[serde(default)]
    pub matrix: Vec<Vec<f32>>,
}

impl Default for SpeakerLayout {
    fn default() -> Self {
        Self {
            auto_mode: true,
            matrix: Vec::new(),
        }
    }
}

/// Declarative description of one (source × sink) processing path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcePathSpec {
    pub path_id: String,
    pub source_tag: String,
    pub target_sink_id: String,
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default = "default_eq")]
    pub eq_values: [f32; EQ_BANDS],
    #[serde(default)]
    pub eq_normalization: bool,
    #[serde(default)]
    pub volume_normalization: bool,
    #[serde(default)]
    pub delay_ms: u32,
    #[serde(default)]
    pub timeshift_sec: f32,
    /// Mapping from input channel count to the remap applied for it.
    #[serde(default)]
    pub speaker_layouts_map: HashMap<u16, SpeakerLayout>,
    pub target_output_channels: u16,
    pub target_output_samplerate: u32,
}

fn default_mp3_payload_type() -> u8 {
    crate::protocol_constants::RTP_MPA_PAYLOAD_TYPE
}

fn default_volume() -> f32 {
    1.0
}

fn default_eq() -> [f32; EQ_BANDS] {
    [1.0; EQ_BANDS]
}

impl SourcePathSpec {
    /// Fundamental changes require tearing down and re-creating the DSP
    /// instance; everything else travels as a parameter update.
    pub fn fundamental_changed(&self, other: &Self) -> bool {
        self.source_tag != other.source_tag
            || self.target_sink_id != other.target_sink_id
            || self.target_output_channels != other.target_output_channels
            || self.target_output_samplerate != other.target_output_samplerate
    }

    /// Parametric changes are applied to the running DSP thread.
    pub fn parametric_changed(&self, other: &Self) -> bool {
        float_changed(self.volume, other.volume)
            || self
                .eq_values
                .iter()
                .zip(other.eq_values.iter())
                .any(|(a, b)| float_changed(*a, *b))
            || self.eq_normalization != other.eq_normalization
            || self.volume_normalization != other.volume_normalization
            || self.delay_ms != other.delay_ms
            || float_changed(self.timeshift_sec, other.timeshift_sec)
            || self.speaker_layouts_map != other.speaker_layouts_map
    }

    /// The parameter-update message equivalent to this spec's tunable state.
    pub fn as_parameter_updates(&self) -> SourceParameterUpdates {
        SourceParameterUpdates {
            volume: Some(self.volume),
            eq_values: Some(self.eq_values),
            eq_normalization: Some(self.eq_normalization),
            volume_normalization: Some(self.volume_normalization),
            delay_ms: Some(self.delay_ms),
            timeshift_sec: Some(self.timeshift_sec),
            speaker_layouts_map: Some(self.speaker_layouts_map.clone()),
        }
    }
}

/// Incremental parameter update pushed to a running source processor.
///
/// `None` fields are left unchanged. Applied between chunks; an update never
/// splits a chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceParameterUpdates {
    pub volume: Option<f32>,
    pub eq_values: Option<[f32; EQ_BANDS]>,
    pub eq_normalization: Option<bool>,
    pub volume_normalization: Option<bool>,
    pub delay_ms: Option<u32>,
    pub timeshift_sec: Option<f32>,
    pub speaker_layouts_map: Option<HashMap<u16, SpeakerLayout>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Desired Engine State
// ─────────────────────────────────────────────────────────────────────────────

/// The full state the embedder wants live. Applied atomically by the
/// reconciler; unchanged components are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredEngineState {
    #[serde(default)]
    pub sinks: Vec<SinkSpec>,
    #[serde(default)]
    pub source_paths: Vec<SourcePathSpec>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine Tuning
// ─────────────────────────────────────────────────────────────────────────────

/// Startup-only tuning parameters. All values default per the protocol
/// constants; the server binary may override them from its YAML config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineTuning {
    /// PCM bytes per chunk flowing through the pipeline.
    pub chunk_size_bytes: usize,
    /// Rolling history kept per source stream (seconds).
    pub timeshift_retention_secs: u64,
    /// Floor for the unified adaptive playout delay (ms).
    pub target_buffer_level_ms: f64,
    /// Ceiling for the unified adaptive playout delay (ms).
    pub max_adaptive_delay_ms: f64,
    /// Arrival lateness beyond which a packet counts as late (ms).
    pub late_packet_threshold_ms: f64,
    /// Longest the dispatch loop sleeps between scans (ms).
    pub loop_max_sleep_ms: u64,
    /// EWMA weight for new jitter observations.
    pub jitter_smoothing_factor: f64,
    /// Multiplier applied to smoothed jitter when sizing the delay.
    pub jitter_safety_margin_multiplier: f64,
    /// Interval between stale-stream sweeps (ms).
    pub cleanup_interval_ms: u64,
    /// How long a mixer waits for a contributor before mixing silence (ms).
    pub grace_period_timeout_ms: u64,
    /// Continuous underrun time after which a contributor is muted (ms).
    pub underrun_hold_timeout_ms: u64,
    /// Per-sample one-pole smoothing coefficient for volume changes.
    pub volume_smoothing_factor: f32,
    /// Soft clipper enable + knee shape for mixers.
    pub soft_clip_enabled: bool,
    pub soft_clip_threshold: f32,
    pub soft_clip_knee: f32,
    /// Multistream Opus on WebRTC sinks wider than stereo; when off those
    /// sinks downmix to stereo ahead of the encoder.
    pub webrtc_multichannel_enabled: bool,
    /// Cross-sink tick alignment (barrier + rate controller). Off by
    /// default; sinks free-run on their own cadence.
    pub enable_multi_sink_sync: bool,
    pub barrier_timeout_ms: u64,
    pub sync_proportional_gain: f64,
    pub max_rate_adjustment: f64,
    pub sync_smoothing_factor: f64,
    /// MP3 fan-out settings (used only when a sink enables MP3 and the
    /// embedder installed an encoder).
    pub mp3_bitrate_kbps: u32,
    pub mp3_vbr_enabled: bool,
    pub mp3_output_queue_max_size: usize,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            chunk_size_bytes: SCREAM_CHUNK_SIZE,
            timeshift_retention_secs: DEFAULT_TIMESHIFT_RETENTION_SECS,
            target_buffer_level_ms: DEFAULT_TARGET_BUFFER_LEVEL_MS,
            max_adaptive_delay_ms: DEFAULT_MAX_ADAPTIVE_DELAY_MS,
            late_packet_threshold_ms: DEFAULT_LATE_PACKET_THRESHOLD_MS,
            loop_max_sleep_ms: DEFAULT_LOOP_MAX_SLEEP_MS,
            jitter_smoothing_factor: DEFAULT_JITTER_SMOOTHING_FACTOR,
            jitter_safety_margin_multiplier: DEFAULT_JITTER_SAFETY_MARGIN,
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
            grace_period_timeout_ms: DEFAULT_GRACE_PERIOD_TIMEOUT_MS,
            underrun_hold_timeout_ms: DEFAULT_UNDERRUN_HOLD_TIMEOUT_MS,
            volume_smoothing_factor: DEFAULT_VOLUME_SMOOTHING_FACTOR,
            soft_clip_enabled: false,
            soft_clip_threshold: 0.9,
            soft_clip_knee: 0.05,
            webrtc_multichannel_enabled: true,
            enable_multi_sink_sync: false,
            barrier_timeout_ms: DEFAULT_BARRIER_TIMEOUT_MS,
            sync_proportional_gain: DEFAULT_SYNC_PROPORTIONAL_GAIN,
            max_rate_adjustment: DEFAULT_MAX_RATE_ADJUSTMENT,
            sync_smoothing_factor: DEFAULT_SYNC_SMOOTHING_FACTOR,
            mp3_bitrate_kbps: DEFAULT_MP3_BITRATE_KBPS,
            mp3_vbr_enabled: false,
            mp3_output_queue_max_size: DEFAULT_MP3_QUEUE_MAX_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(id: &str) -> SourcePathSpec {
        SourcePathSpec {
            path_id: id.into(),
            source_tag: "10.0.0.1      ".into(),
            target_sink_id: "sink-a".into(),
            volume: 1.0,
            eq_values: [1.0; EQ_BANDS],
            eq_normalization: false,
            volume_normalization: false,
            delay_ms: 0,
            timeshift_sec: 0.0,
            speaker_layouts_map: HashMap::new(),
            target_output_channels: 2,
            target_output_samplerate: 48000,
        }
    }

    #[test]
    fn float_tolerance_absorbs_round_trip_noise() {
        assert!(!float_changed(0.5, 0.5 + f32::EPSILON));
        assert!(float_changed(0.5, 0.6));
    }

    #[test]
    fn volume_change_is_parametric_not_fundamental() {
        let a = path("p1");
        let mut b = a.clone();
        b.volume = 0.5;
        assert!(a.parametric_changed(&b));
        assert!(!a.fundamental_changed(&b));
    }

    #[test]
    fn retarget_is_fundamental() {
        let a = path("p1");
        let mut b = a.clone();
        b.target_output_samplerate = 44100;
        assert!(a.fundamental_changed(&b));
    }

    #[test]
    fn sink_connection_diff_ignores_order() {
        let a = SinkSpec {
            sink_id: "s".into(),
            protocol: SinkProtocol::LegacyScream,
            ip: "10.0.0.9".into(),
            port: 4010,
            samplerate: 48000,
            bitdepth: 16,
            channels: 2,
            chlayout1: 0,
            chlayout2: 0,
            mp3_enabled: false,
            mp3_payload_type: 14,
            connected_source_path_ids: vec!["a".into(), "b".into()],
        };
        let mut b = a.clone();
        b.connected_source_path_ids = vec!["b".into(), "a".into()];
        assert!(!a.connections_changed(&b));
        b.connected_source_path_ids = vec!["b".into(), "c".into()];
        assert!(a.connections_changed(&b));
    }

    #[test]
    fn desired_state_round_trips_through_json() {
        let state = DesiredEngineState {
            sinks: vec![],
            source_paths: vec![path("p1")],
        };
        let json = serde_json::to_string(&state).unwrap();
        let back: DesiredEngineState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.source_paths[0], state.source_paths[0]);
    }
}
