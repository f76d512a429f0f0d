//! Wire packet types: the tagged ingress unit and the Scream header codec.
//!
//! A [`TaggedAudioPacket`] is the immutable unit of ingress audio flowing
//! from receivers through the timeshift buffer to processors. Payload bytes
//! are held in [`Bytes`] so fan-out to many consumers clones a pointer, not
//! the audio.

use tokio::time::Instant;

use bytes::Bytes;
use thiserror::Error;

use crate::format::AudioFormat;
use crate::protocol_constants::{
    PROGRAM_TAG_SIZE, SCREAM_HEADER_SIZE, SCREAM_RATE_BASE_44100, SCREAM_RATE_BASE_48000,
    SOURCE_TAG_IP_WIDTH,
};

/// Errors from wire packet validation and parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Datagram shorter than the fixed header.
    #[error("packet too short: {got} bytes, need at least {need}")]
    TooShort { got: usize, need: usize },

    /// Datagram size does not match the variant's fixed size gate.
    #[error("unexpected packet size: {got} bytes, expected {expected}")]
    BadSize { got: usize, expected: usize },

    /// Bit depth outside {8, 16, 24, 32}.
    #[error("unsupported bit depth: {0}")]
    UnsupportedBitDepth(u16),

    /// Channel count outside [1, 64].
    #[error("bad channel count: {0}")]
    BadChannelCount(u16),

    /// Zero or undecodable sample rate.
    #[error("bad sample rate: {0}")]
    BadSampleRate(u32),

    /// Payload length is not a whole number of interleaved frames.
    #[error("payload of {len} bytes is not aligned to {frame_bytes}-byte frames")]
    Misaligned { len: usize, frame_bytes: usize },

    /// RTP payload type with no announced session.
    #[error("no session announced for payload type {0}")]
    UnknownPayloadType(u8),
}

/// An immutable unit of ingress audio.
///
/// `source_tag` is the opaque stream identity: for Scream, the sender IP
/// padded to 15 chars; for per-process Scream, the padded IP plus the trimmed
/// program name; for RTP, a session/SSRC-derived name.
#[derive(Debug, Clone)]
pub struct TaggedAudioPacket {
    pub source_tag: String,
    /// Monotonic timestamp captured at ingest.
    pub received_time: Instant,
    /// 32-bit sample counter, when the receiver can compute one from packet
    /// pacing or the wire header.
    pub rtp_timestamp: Option<u32>,
    pub format: AudioFormat,
    pub audio_data: Bytes,
}

impl TaggedAudioPacket {
    /// Validates the packet against the data-model invariants: format limits
    /// plus payload alignment to whole interleaved frames.
    pub fn validate(&self) -> Result<(), PacketError> {
        self.format.validate()?;
        let frame_bytes = self.format.bytes_per_frame();
        if self.audio_data.len() % frame_bytes != 0 {
            return Err(PacketError::Misaligned {
                len: self.audio_data.len(),
                frame_bytes,
            });
        }
        Ok(())
    }

    /// Frames of audio carried by this packet.
    pub fn frames(&self) -> usize {
        self.format.frames_in(self.audio_data.len())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scream Header Codec
// ─────────────────────────────────────────────────────────────────────────────

/// Parses the 5-byte Scream format header.
///
/// Byte 0 bit 7 selects the 44100 base, bits 0–6 the divisor (`0` treated as
/// `1`). Byte 1 is bit depth, byte 2 channel count, bytes 3–4 the opaque
/// channel layout mask.
pub fn parse_scream_header(header: &[u8]) -> Result<AudioFormat, PacketError> {
    if header.len() < SCREAM_HEADER_SIZE {
        return Err(PacketError::TooShort {
            got: header.len(),
            need: SCREAM_HEADER_SIZE,
        });
    }

    let rate_byte = header[0];
    let base = if rate_byte & 0x80 != 0 {
        SCREAM_RATE_BASE_44100
    } else {
        SCREAM_RATE_BASE_48000
    };
    let divisor = u32::from(rate_byte & 0x7F).max(1);
    let sample_rate = base / divisor;

    let format = AudioFormat {
        sample_rate,
        bit_depth: u16::from(header[1]),
        channels: u16::from(header[2]),
        chlayout1: header[3],
        chlayout2: header[4],
    };
    format.validate()?;
    Ok(format)
}

/// Encodes a format back into the 5-byte Scream header.
///
/// Rates divisible into 48000 use the 48 kHz base; otherwise the 44.1 kHz
/// base is used. Property: `parse(encode(f)) == f` for any valid format whose
/// rate divides one of the bases.
pub fn encode_scream_header(format: &AudioFormat) -> [u8; SCREAM_HEADER_SIZE] {
    let rate_byte = if format.sample_rate != 0 && SCREAM_RATE_BASE_48000 % format.sample_rate == 0 {
        (SCREAM_RATE_BASE_48000 / format.sample_rate) as u8 & 0x7F
    } else if format.sample_rate != 0 && SCREAM_RATE_BASE_44100 % format.sample_rate == 0 {
        0x80 | ((SCREAM_RATE_BASE_44100 / format.sample_rate) as u8 & 0x7F)
    } else {
        // Non-divisor rates cannot be represented; emit the 48k base marker
        // with divisor 1 so receivers still get a decodable header.
        0x01
    };

    [
        rate_byte,
        format.bit_depth as u8,
        format.channels as u8,
        format.chlayout1,
        format.chlayout2,
    ]
}

// ─────────────────────────────────────────────────────────────────────────────
// Source Tags
// ─────────────────────────────────────────────────────────────────────────────

/// Pads a sender IP to the fixed source-tag width.
pub fn ip_source_tag(ip: &std::net::IpAddr) -> String {
    format!("{:<width$}", ip, width = SOURCE_TAG_IP_WIDTH)
}

/// Parses the 30-byte ASCII program tag of a per-process datagram.
///
/// Trailing spaces and NULs are trimmed; interior bytes are passed through
/// lossily so a non-UTF8 tag still yields a stable identity.
pub fn parse_program_tag(raw: &[u8]) -> String {
    let tag = &raw[..raw.len().min(PROGRAM_TAG_SIZE)];
    let end = tag
        .iter()
        .rposition(|&b| b != b' ' && b != 0)
        .map_or(0, |i| i + 1);
    String::from_utf8_lossy(&tag[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn parses_48k_stereo_header() {
        // divisor 1, 48k base
        let fmt = parse_scream_header(&[0x01, 16, 2, 0x03, 0x00]).unwrap();
        assert_eq!(fmt.sample_rate, 48000);
        assert_eq!(fmt.bit_depth, 16);
        assert_eq!(fmt.channels, 2);
        assert_eq!(fmt.chlayout1, 0x03);
    }

    #[test]
    fn parses_44k_base_and_divisors() {
        let fmt = parse_scream_header(&[0x81, 16, 2, 0, 0]).unwrap();
        assert_eq!(fmt.sample_rate, 44100);
        let fmt = parse_scream_header(&[0x82, 16, 2, 0, 0]).unwrap();
        assert_eq!(fmt.sample_rate, 22050);
    }

    #[test]
    fn zero_divisor_is_treated_as_one() {
        let fmt = parse_scream_header(&[0x00, 16, 2, 0, 0]).unwrap();
        assert_eq!(fmt.sample_rate, 48000);
        let fmt = parse_scream_header(&[0x80, 16, 2, 0, 0]).unwrap();
        assert_eq!(fmt.sample_rate, 44100);
    }

    #[test]
    fn rejects_invalid_format_bytes() {
        assert!(parse_scream_header(&[0x01, 20, 2, 0, 0]).is_err());
        assert!(parse_scream_header(&[0x01, 16, 0, 0, 0]).is_err());
        assert!(parse_scream_header(&[0x01, 16]).is_err());
    }

    #[test]
    fn header_round_trips() {
        for (rate, depth, ch) in [(48000, 16, 2), (44100, 24, 6), (96000, 32, 8), (24000, 16, 1)]
        {
            let mut fmt = AudioFormat::new(rate, ch, depth);
            fmt.chlayout1 = 0x3F;
            let parsed = parse_scream_header(&encode_scream_header(&fmt)).unwrap();
            assert_eq!(parsed, fmt, "round trip for {rate}Hz");
        }
    }

    #[test]
    fn ip_tag_is_padded_to_width() {
        let tag = ip_source_tag(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(tag.len(), 15);
        assert!(tag.starts_with("10.0.0.7"));
    }

    #[test]
    fn program_tag_trims_padding() {
        let mut raw = [b' '; 30];
        raw[..7].copy_from_slice(b"firefox");
        assert_eq!(parse_program_tag(&raw), "firefox");

        let mut raw = [0u8; 30];
        raw[..4].copy_from_slice(b"mpv\0");
        assert_eq!(parse_program_tag(&raw), "mpv");
    }

    #[test]
    fn misaligned_payload_is_rejected() {
        let pkt = TaggedAudioPacket {
            source_tag: "test".into(),
            received_time: Instant::now(),
            rtp_timestamp: None,
            format: AudioFormat::new(48000, 2, 16),
            audio_data: Bytes::from(vec![0u8; 1151]),
        };
        assert!(matches!(
            pkt.validate(),
            Err(PacketError::Misaligned { .. })
        ));
    }
}
