//! PCM audio format description shared across the engine.
//!
//! Every packet, processor and sink carries an [`AudioFormat`] describing the
//! interleaved PCM it holds. The format also generates cached silence frames
//! used by paced receivers and mixers during gaps.

use std::collections::HashMap;
use std::sync::OnceLock;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::packet::PacketError;
use crate::protocol_constants::MAX_CHANNELS;

// ─────────────────────────────────────────────────────────────────────────────
// Silence Frame Cache
// ─────────────────────────────────────────────────────────────────────────────

/// Global cache for silence frames to avoid repeated allocations.
///
/// Silence frames are keyed by byte length since different formats with the
/// same chunk size produce the same byte count. The cache is lazily
/// initialized and never cleared (silence frames are small and finite).
static SILENCE_CACHE: OnceLock<RwLock<HashMap<usize, Bytes>>> = OnceLock::new();

/// Gets a cached silence frame of the given byte length, or creates and caches one.
///
/// The `Bytes::clone()` is O(1) (Arc bump), so paced receivers can synthesize
/// silence every tick without allocating.
fn get_or_create_silence(byte_len: usize) -> Bytes {
    let cache = SILENCE_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    if let Some(silence) = cache.read().get(&byte_len) {
        return silence.clone();
    }

    let mut cache_write = cache.write();
    // Double-check after acquiring write lock (another task may have inserted)
    if let Some(silence) = cache_write.get(&byte_len) {
        return silence.clone();
    }

    let silence = Bytes::from(vec![0u8; byte_len]);
    cache_write.insert(byte_len, silence.clone());
    silence
}

// ─────────────────────────────────────────────────────────────────────────────
// AudioFormat
// ─────────────────────────────────────────────────────────────────────────────

/// PCM format of one stream: rate, depth, channel count and the two opaque
/// Scream channel-layout bytes.
///
/// The layout bytes are carried verbatim from ingress to egress; the engine
/// never interprets them beyond re-emitting them in Scream headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    #[serde(default)]
    pub chlayout1: u8,
    #[serde(default)]
    pub chlayout2: u8,
}

impl AudioFormat {
    /// Creates a format with zeroed layout bytes.
    pub fn new(sample_rate: u32, channels: u16, bit_depth: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bit_depth,
            chlayout1: 0,
            chlayout2: 0,
        }
    }

    /// Validates the format against the wire-level invariants.
    ///
    /// `channels ∈ [1,64]`, `bit_depth ∈ {8,16,24,32}`, `sample_rate > 0`.
    pub fn validate(&self) -> Result<(), PacketError> {
        if self.sample_rate == 0 {
            return Err(PacketError::BadSampleRate(self.sample_rate));
        }
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(PacketError::BadChannelCount(self.channels));
        }
        match self.bit_depth {
            8 | 16 | 24 | 32 => Ok(()),
            other => Err(PacketError::UnsupportedBitDepth(other)),
        }
    }

    /// Returns bytes per sample (e.g. 2 for 16-bit audio).
    #[inline]
    pub const fn bytes_per_sample(&self) -> usize {
        (self.bit_depth / 8) as usize
    }

    /// Returns bytes per interleaved frame (one sample per channel).
    #[inline]
    pub const fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    /// Returns the frame count carried by a payload of `byte_len` bytes.
    ///
    /// Caller must have validated alignment; truncates otherwise.
    #[inline]
    pub const fn frames_in(&self, byte_len: usize) -> usize {
        byte_len / self.bytes_per_frame()
    }

    /// Returns the number of frames covering the given duration.
    #[inline]
    pub fn frames_for_duration_ms(&self, duration_ms: u32) -> usize {
        ((self.sample_rate as u64 * duration_ms as u64) / 1000) as usize
    }

    /// Duration of `frames` frames at this sample rate, in seconds.
    #[inline]
    pub fn frames_duration_secs(&self, frames: usize) -> f64 {
        frames as f64 / self.sample_rate as f64
    }

    /// Creates a silence payload of exactly `frames` frames.
    ///
    /// Returns a cached `Bytes` buffer filled with zeros; cloning it is an
    /// Arc reference count bump.
    pub fn silence_frames(&self, frames: usize) -> Bytes {
        get_or_create_silence(frames * self.bytes_per_frame())
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::new(48000, 2, 16)
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}Hz/{}bit/{}ch",
            self.sample_rate, self.bit_depth, self.channels
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_wire_invariants() {
        assert!(AudioFormat::new(48000, 2, 16).validate().is_ok());
        assert!(AudioFormat::new(0, 2, 16).validate().is_err());
        assert!(AudioFormat::new(48000, 0, 16).validate().is_err());
        assert!(AudioFormat::new(48000, 65, 16).validate().is_err());
        assert!(AudioFormat::new(48000, 2, 20).validate().is_err());
    }

    #[test]
    fn frame_arithmetic_matches_format() {
        let fmt = AudioFormat::new(48000, 2, 16);
        assert_eq!(fmt.bytes_per_sample(), 2);
        assert_eq!(fmt.bytes_per_frame(), 4);
        assert_eq!(fmt.frames_in(1152), 288);
        assert_eq!(fmt.frames_for_duration_ms(10), 480);
    }

    #[test]
    fn silence_is_cached_and_zeroed() {
        let fmt = AudioFormat::new(48000, 2, 16);
        let a = fmt.silence_frames(288);
        let b = fmt.silence_frames(288);
        assert_eq!(a.len(), 1152);
        assert!(a.iter().all(|&b| b == 0));
        // Same backing allocation (cache hit)
        assert_eq!(a.as_ptr(), b.as_ptr());
    }
}
