//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by external specifications (Scream wire format,
//! RTP/SAP, Opus) and changing them would break interoperability with
//! existing senders and receivers.

// ─────────────────────────────────────────────────────────────────────────────
// Scream Wire Format
// ─────────────────────────────────────────────────────────────────────────────

/// Size of the Scream format header in bytes.
///
/// Layout: `[rate byte, bit depth, channel count, layout lo, layout hi]`.
pub const SCREAM_HEADER_SIZE: usize = 5;

/// PCM payload size of a Scream packet in bytes.
///
/// Fixed by the protocol: every Scream datagram carries exactly this much
/// interleaved PCM regardless of format.
pub const SCREAM_CHUNK_SIZE: usize = 1152;

/// Total size of a legacy Scream datagram (header + payload).
pub const SCREAM_PACKET_SIZE: usize = SCREAM_HEADER_SIZE + SCREAM_CHUNK_SIZE;

/// Width of the ASCII program tag prefixed to per-process Scream datagrams.
///
/// Space- or NUL-padded on the wire; trailing padding is trimmed on parse.
pub const PROGRAM_TAG_SIZE: usize = 30;

/// Total size of a per-process Scream datagram (program tag + header + payload).
pub const PER_PROCESS_PACKET_SIZE: usize = PROGRAM_TAG_SIZE + SCREAM_PACKET_SIZE;

/// Width that sender IPs are padded to when forming source tags.
///
/// `"192.168.1.2"` becomes `"192.168.1.2    "` so per-process tags can be
/// split back into IP and program name at a fixed offset.
pub const SOURCE_TAG_IP_WIDTH: usize = 15;

/// Sample-rate bases selectable by the high bit of the Scream rate byte.
pub const SCREAM_RATE_BASE_44100: u32 = 44100;
pub const SCREAM_RATE_BASE_48000: u32 = 48000;

// ─────────────────────────────────────────────────────────────────────────────
// RTP / SAP
// ─────────────────────────────────────────────────────────────────────────────

/// Well-known SAP announcement port (RFC 2974).
pub const SAP_PORT: u16 = 9875;

/// SAP multicast group for local-scope session announcements.
pub const SAP_MULTICAST_ADDR: &str = "239.255.255.255";

/// RTP payload type used for L16 PCM when none is negotiated via SDP.
pub const RTP_DEFAULT_PCM_PAYLOAD_TYPE: u8 = 127;

/// RTP header length without CSRCs (RFC 3550).
pub const RTP_HEADER_SIZE: usize = 12;

/// Static RTP payload type for MPEG audio (RFC 3551), the default for the
/// MP3 side stream when the sink does not configure one.
pub const RTP_MPA_PAYLOAD_TYPE: u8 = 14;

/// Samples per MPEG-1 Layer III frame.
pub const MP3_SAMPLES_PER_FRAME: u32 = 1152;

/// Largest MP3 payload carried per RTP packet; longer frames fragment and
/// only the first packet of the frame carries the marker bit.
pub const MP3_RTP_MAX_PAYLOAD: usize = 1400;

// ─────────────────────────────────────────────────────────────────────────────
// Opus / WebRTC
// ─────────────────────────────────────────────────────────────────────────────

/// Sample rate Opus operates at on WebRTC tracks.
pub const OPUS_SAMPLE_RATE: u32 = 48000;

/// Samples per channel in one 2.5 ms Opus frame at 48 kHz.
pub const OPUS_FRAME_SAMPLES: usize = 120;

/// Seconds a WebRTC sender may sit in a terminal state before the engine
/// reaps it.
pub const WEBRTC_CLEANUP_TIMEOUT_SECS: u64 = 30;

// ─────────────────────────────────────────────────────────────────────────────
// Application Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Application name used in user-facing protocol data.
pub const APP_NAME: &str = "Auricast";

/// Service identifier reported by the health endpoint.
pub const SERVICE_ID: &str = "auricast";

// ─────────────────────────────────────────────────────────────────────────────
// Audio Limits
// ─────────────────────────────────────────────────────────────────────────────

/// Maximum interleaved channel count accepted from the wire.
pub const MAX_CHANNELS: u16 = 64;

/// Number of EQ bands exposed per source path.
///
/// The band count is the user-visible contract; the per-band centre
/// frequencies live in `dsp::biquad`.
pub const EQ_BANDS: usize = 18;

// ─────────────────────────────────────────────────────────────────────────────
// Default Ports
// ─────────────────────────────────────────────────────────────────────────────

/// Default UDP port for legacy Scream ingest.
pub const DEFAULT_SCREAM_PORT: u16 = 4010;

/// Default UDP port for per-process Scream ingest.
pub const DEFAULT_PER_PROCESS_PORT: u16 = 16402;

/// Default UDP port for RTP ingest.
pub const DEFAULT_RTP_PORT: u16 = 4011;

// ─────────────────────────────────────────────────────────────────────────────
// Engine Timing Defaults (startup-only tuning)
// ─────────────────────────────────────────────────────────────────────────────

/// Base unit for the linear socket re-open backoff (ms).
pub const SOCKET_REOPEN_BACKOFF_MS: u64 = 100;

/// Ceiling for the socket re-open backoff (ms).
pub const SOCKET_REOPEN_BACKOFF_MAX_MS: u64 = 5000;

/// Packets a paced receiver stages per stream while waiting for clock ticks.
pub const PACER_STAGING_CAPACITY: usize = 16;

/// Seconds without a real packet before a paced stream stops synthesizing
/// silence and lets the stream go idle.
pub const PACER_IDLE_TIMEOUT_SECS: u64 = 5;

/// Rolling history kept per source stream (seconds).
pub const DEFAULT_TIMESHIFT_RETENTION_SECS: u64 = 30;

/// Floor for the unified adaptive playout delay (ms).
pub const DEFAULT_TARGET_BUFFER_LEVEL_MS: f64 = 8.0;

/// Ceiling for the unified adaptive playout delay (ms).
pub const DEFAULT_MAX_ADAPTIVE_DELAY_MS: f64 = 200.0;

/// Arrival lateness beyond which a packet is counted as late (ms).
pub const DEFAULT_LATE_PACKET_THRESHOLD_MS: f64 = 10.0;

/// Longest the timeshift dispatch loop sleeps between scans (ms).
pub const DEFAULT_LOOP_MAX_SLEEP_MS: u64 = 10;

/// EWMA weight applied to new inter-arrival jitter observations.
pub const DEFAULT_JITTER_SMOOTHING_FACTOR: f64 = 1.0 / 16.0;

/// Multiplier applied to smoothed jitter when sizing the adaptive delay.
pub const DEFAULT_JITTER_SAFETY_MARGIN: f64 = 2.5;

/// Interval between stale-stream sweeps in the timeshift manager (ms).
pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 1000;

/// How long a mixer waits for a contributor before mixing silence (ms).
pub const DEFAULT_GRACE_PERIOD_TIMEOUT_MS: u64 = 10;

/// Continuous underrun time after which a contributor is muted (ms).
pub const DEFAULT_UNDERRUN_HOLD_TIMEOUT_MS: u64 = 500;

/// Per-sample one-pole smoothing coefficient for volume changes.
pub const DEFAULT_VOLUME_SMOOTHING_FACTOR: f32 = 0.02;

/// Default MP3 bitrate handed to the encoder hook (kbps).
pub const DEFAULT_MP3_BITRATE_KBPS: u32 = 192;

/// Bound on the MP3 broadcast queue (encoded frames; oldest dropped first).
pub const DEFAULT_MP3_QUEUE_MAX_SIZE: usize = 128;

/// Barrier wait bound when multi-sink sync is enabled (ms).
pub const DEFAULT_BARRIER_TIMEOUT_MS: u64 = 20;

/// Proportional gain of the sink-sync rate controller.
pub const DEFAULT_SYNC_PROPORTIONAL_GAIN: f64 = 0.1;

/// Bound on the per-tick rate adjustment applied by sink sync.
pub const DEFAULT_MAX_RATE_ADJUSTMENT: f64 = 0.02;

/// EWMA weight for the sink-sync drift estimate.
pub const DEFAULT_SYNC_SMOOTHING_FACTOR: f64 = 0.1;

/// Capacity of each processor's jitter-buffer output queue (packets).
pub const PROCESSOR_QUEUE_CAPACITY: usize = 64;

/// Capacity of each mixer input queue (processed chunks).
pub const MIXER_QUEUE_CAPACITY: usize = 16;
