//! Per-path signal processing building blocks.
//!
//! The processor pipeline normalizes wire PCM to `f32`, runs the remap /
//! resample / delay / EQ / gain stages, and converts back to full-scale
//! 32-bit integers for the mixer. Each stage lives in its own module and
//! bypasses itself when configured as identity, so a path with neutral
//! settings round-trips samples bit-exactly.

pub mod biquad;
pub mod layout;
pub mod resampler;
pub mod volume;

pub use biquad::EqBank;
pub use layout::{apply_matrix, default_matrix, identity_matrix, is_identity, resolve_matrix};
pub use resampler::StreamResampler;
pub use volume::{AgcNormalizer, DelayLine, VolumeSmoother};

use crate::packet::PacketError;

/// Full-scale factor mapping `f32` in [-1, 1) to 32-bit integer samples.
const FULL_SCALE: f64 = 2147483648.0; // 2^31

// ─────────────────────────────────────────────────────────────────────────────
// Wire PCM ↔ f32
// ─────────────────────────────────────────────────────────────────────────────

/// Decodes big-endian interleaved wire PCM into normalized `f32` samples.
///
/// 8-bit PCM is unsigned (offset binary) per common practice; 16/24/32 are
/// signed two's complement.
pub fn decode_pcm_to_f32(data: &[u8], bit_depth: u16, out: &mut Vec<f32>) -> Result<(), PacketError> {
    out.clear();
    match bit_depth {
        8 => {
            out.reserve(data.len());
            for &b in data {
                out.push((b as f32 - 128.0) / 128.0);
            }
        }
        16 => {
            out.reserve(data.len() / 2);
            for chunk in data.chunks_exact(2) {
                let v = i16::from_be_bytes([chunk[0], chunk[1]]);
                out.push(v as f32 / 32768.0);
            }
        }
        24 => {
            out.reserve(data.len() / 3);
            for chunk in data.chunks_exact(3) {
                // Sign-extend the 3 wire bytes into the top of an i32
                let v = i32::from_be_bytes([chunk[0], chunk[1], chunk[2], 0]) >> 8;
                out.push(v as f32 / 8388608.0);
            }
        }
        32 => {
            out.reserve(data.len() / 4);
            for chunk in data.chunks_exact(4) {
                let v = i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                out.push(v as f32 / FULL_SCALE as f32);
            }
        }
        other => return Err(PacketError::UnsupportedBitDepth(other)),
    }
    Ok(())
}

/// Converts a normalized `f32` sample to a full-scale 32-bit integer.
///
/// Uses f64 internally so 16-bit material converts without rounding error.
#[inline]
pub fn f32_to_i32_full_scale(sample: f32) -> i32 {
    let scaled = (sample as f64 * FULL_SCALE).round();
    scaled.clamp(i32::MIN as f64, i32::MAX as f64) as i32
}

/// Converts a slice of normalized `f32` samples to full-scale i32.
pub fn f32_buffer_to_i32(samples: &[f32], out: &mut Vec<i32>) {
    out.clear();
    out.reserve(samples.len());
    out.extend(samples.iter().map(|&s| f32_to_i32_full_scale(s)));
}

/// Encodes full-scale i32 samples to big-endian wire PCM at `bit_depth`.
pub fn encode_i32_to_pcm(samples: &[i32], bit_depth: u16, out: &mut Vec<u8>) -> Result<(), PacketError> {
    out.clear();
    match bit_depth {
        8 => {
            out.reserve(samples.len());
            for &s in samples {
                out.push((((s >> 24) as i16) + 128) as u8);
            }
        }
        16 => {
            out.reserve(samples.len() * 2);
            for &s in samples {
                out.extend_from_slice(&((s >> 16) as i16).to_be_bytes());
            }
        }
        24 => {
            out.reserve(samples.len() * 3);
            for &s in samples {
                let b = s.to_be_bytes();
                out.extend_from_slice(&b[..3]);
            }
        }
        32 => {
            out.reserve(samples.len() * 4);
            for &s in samples {
                out.extend_from_slice(&s.to_be_bytes());
            }
        }
        other => return Err(PacketError::UnsupportedBitDepth(other)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sixteen_bit_round_trips_exactly() {
        let wire: Vec<u8> = [0i16, 1, -1, 32767, -32768, 12345]
            .iter()
            .flat_map(|v| v.to_be_bytes())
            .collect();

        let mut f32s = Vec::new();
        decode_pcm_to_f32(&wire, 16, &mut f32s).unwrap();
        let mut i32s = Vec::new();
        f32_buffer_to_i32(&f32s, &mut i32s);
        let mut back = Vec::new();
        encode_i32_to_pcm(&i32s, 16, &mut back).unwrap();

        assert_eq!(back, wire);
    }

    #[test]
    fn twenty_four_bit_sign_extends() {
        let wire = [0x80, 0x00, 0x00, 0x7F, 0xFF, 0xFF];
        let mut f32s = Vec::new();
        decode_pcm_to_f32(&wire, 24, &mut f32s).unwrap();
        assert!((f32s[0] + 1.0).abs() < 1e-6);
        assert!((f32s[1] - (8388607.0 / 8388608.0)).abs() < 1e-6);
    }

    #[test]
    fn eight_bit_uses_offset_binary() {
        let mut f32s = Vec::new();
        decode_pcm_to_f32(&[0x80, 0x00, 0xFF], 8, &mut f32s).unwrap();
        assert_eq!(f32s[0], 0.0);
        assert_eq!(f32s[1], -1.0);

        let mut bytes = Vec::new();
        encode_i32_to_pcm(&[0, i32::MIN], 8, &mut bytes).unwrap();
        assert_eq!(bytes, vec![128, 0]);
    }

    #[test]
    fn rejects_unknown_depth() {
        let mut f32s = Vec::new();
        assert!(decode_pcm_to_f32(&[0; 4], 20, &mut f32s).is_err());
        let mut bytes = Vec::new();
        assert!(encode_i32_to_pcm(&[0], 12, &mut bytes).is_err());
    }

    #[test]
    fn full_scale_conversion_clamps() {
        assert_eq!(f32_to_i32_full_scale(1.5), i32::MAX);
        assert_eq!(f32_to_i32_full_scale(-1.5), i32::MIN);
        assert_eq!(f32_to_i32_full_scale(0.0), 0);
    }
}
