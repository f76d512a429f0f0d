//! Multistream Opus for channel counts beyond stereo.
//!
//! The Opus binding exposes mono/stereo encoders only, so multichannel
//! audio is carried the way multistream Opus defines it (RFC 6716 §B,
//! RFC 7845 §5.1.1): the channels are split across several elementary
//! mono/stereo streams per the channel-mapping-family-1 table, each stream
//! is encoded independently, and the per-stream packets are concatenated
//! into one multistream packet with every stream except the last in
//! self-delimited framing.
//!
//! On the wire this is the `audio/multiopus` codec (the convention browsers
//! use for >2-channel Opus over WebRTC); the mapping rides in the fmtp line.

use bytes::Bytes;

use crate::protocol_constants::OPUS_SAMPLE_RATE;

use super::SenderError;

/// MIME type advertised for multistream Opus tracks.
pub const MIME_TYPE_MULTIOPUS: &str = "audio/multiopus";

/// Self-delimited framing can express frame lengths up to this bound
/// (RFC 6716 §3.2.1).
const MAX_SELF_DELIMITED_LEN: usize = 1275;

/// Channel-mapping family 1: how `channels` interleaved channels spread
/// across elementary streams.
///
/// `mapping[c]` is the decoder-side channel index of input channel `c`:
/// indices below `2 * coupled` address a coupled stereo stream (even =
/// left, odd = right), the rest address mono streams in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMapping {
    pub channels: u16,
    pub streams: u8,
    pub coupled: u8,
    pub mapping: Vec<u8>,
}

impl ChannelMapping {
    /// The fixed family-1 table (Vorbis channel order), defined for 1..=8
    /// channels.
    pub fn family1(channels: u16) -> Option<Self> {
        let (streams, coupled, mapping): (u8, u8, &[u8]) = match channels {
            1 => (1, 0, &[0]),
            2 => (1, 1, &[0, 1]),
            3 => (2, 1, &[0, 2, 1]),
            4 => (2, 2, &[0, 1, 2, 3]),
            5 => (3, 2, &[0, 4, 1, 2, 3]),
            6 => (4, 2, &[0, 4, 1, 2, 3, 5]),
            7 => (5, 2, &[0, 4, 1, 2, 3, 5, 6]),
            8 => (5, 3, &[0, 6, 1, 2, 3, 4, 5, 7]),
            _ => return None,
        };
        Some(Self {
            channels,
            streams,
            coupled,
            mapping: mapping.to_vec(),
        })
    }

    /// fmtp attribute carrying the mapping, as multiopus offers spell it.
    pub fn fmtp(&self) -> String {
        let mapping = self
            .mapping
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "channel_mapping={mapping};num_streams={};coupled_streams={}",
            self.streams, self.coupled
        )
    }
}

/// Encodes N-channel frames into multistream Opus packets.
pub struct MultistreamEncoder {
    mapping: ChannelMapping,
    /// Coupled stereo streams first, then mono, matching the mapping's
    /// stream index space.
    encoders: Vec<opus::Encoder>,
    stream_bufs: Vec<Vec<f32>>,
    packet_buf: Vec<u8>,
}

impl MultistreamEncoder {
    pub fn new(mapping: ChannelMapping) -> Result<Self, SenderError> {
        let mut encoders = Vec::with_capacity(mapping.streams as usize);
        for stream in 0..mapping.streams {
            let channels = if stream < mapping.coupled {
                opus::Channels::Stereo
            } else {
                opus::Channels::Mono
            };
            encoders.push(
                opus::Encoder::new(OPUS_SAMPLE_RATE, channels, opus::Application::Audio)
                    .map_err(|e| SenderError::Encode(format!("opus encoder: {e}")))?,
            );
        }

        Ok(Self {
            encoders,
            stream_bufs: Vec::new(),
            packet_buf: vec![0u8; 1500],
            mapping,
        })
    }

    pub fn mapping(&self) -> &ChannelMapping {
        &self.mapping
    }

    /// Encodes one frame of `frame_samples` per channel, interleaved at the
    /// mapping's channel count, into a single multistream packet.
    pub fn encode(&mut self, interleaved: &[f32], frame_samples: usize) -> Result<Bytes, SenderError> {
        let channels = self.mapping.channels as usize;
        if interleaved.len() != frame_samples * channels {
            return Err(SenderError::Encode(format!(
                "expected {} samples, got {}",
                frame_samples * channels,
                interleaved.len()
            )));
        }

        // Size the per-stream buffers: coupled streams take stereo frames,
        // unreferenced slots stay silent
        let coupled = self.mapping.coupled as usize;
        self.stream_bufs.clear();
        for stream in 0..self.mapping.streams as usize {
            let width = if stream < coupled { 2 } else { 1 };
            self.stream_bufs.push(vec![0.0; frame_samples * width]);
        }

        // Demux input channels into their streams per the mapping
        for (channel, &decoder_index) in self.mapping.mapping.iter().enumerate() {
            let decoder_index = decoder_index as usize;
            let (stream, slot, width) = if decoder_index < 2 * coupled {
                (decoder_index / 2, decoder_index % 2, 2)
            } else {
                (coupled + (decoder_index - 2 * coupled), 0, 1)
            };
            let buf = &mut self.stream_bufs[stream];
            for frame in 0..frame_samples {
                buf[frame * width + slot] = interleaved[frame * channels + channel];
            }
        }

        // Encode each stream; all but the last go in self-delimited framing
        let mut out: Vec<u8> = Vec::new();
        let last = self.encoders.len() - 1;
        for (stream, encoder) in self.encoders.iter_mut().enumerate() {
            let written = encoder
                .encode_float(&self.stream_bufs[stream], &mut self.packet_buf)
                .map_err(|e| SenderError::Encode(e.to_string()))?;
            let packet = &self.packet_buf[..written];
            if stream < last {
                push_self_delimited(&mut out, packet)?;
            } else {
                out.extend_from_slice(packet);
            }
        }
        Ok(Bytes::from(out))
    }
}

/// Appends a single-frame Opus packet in self-delimited form: TOC byte,
/// explicit frame length, frame data (RFC 6716 §B).
fn push_self_delimited(out: &mut Vec<u8>, packet: &[u8]) -> Result<(), SenderError> {
    let Some((&toc, frame)) = packet.split_first() else {
        return Err(SenderError::Encode("empty opus packet".into()));
    };
    // One 2.5ms frame per packet means frame-count code 0; anything else
    // would need the general repacketizer
    if toc & 0x03 != 0 {
        return Err(SenderError::Encode("expected single-frame opus packet".into()));
    }

    out.push(toc);
    push_frame_length(out, frame.len())?;
    out.extend_from_slice(frame);
    Ok(())
}

/// Frame length encoding shared with internal framing (RFC 6716 §3.2.1):
/// one byte up to 251, two bytes up to 1275.
fn push_frame_length(out: &mut Vec<u8>, len: usize) -> Result<(), SenderError> {
    if len <= 251 {
        out.push(len as u8);
    } else if len <= MAX_SELF_DELIMITED_LEN {
        let first = 252 + (len % 4) as u8;
        let second = ((len - first as usize) / 4) as u8;
        out.push(first);
        out.push(second);
    } else {
        return Err(SenderError::Encode(format!("opus frame too long: {len}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_constants::OPUS_FRAME_SAMPLES;

    /// Decodes a self-delimited length, returning (length, bytes consumed).
    fn read_frame_length(data: &[u8]) -> (usize, usize) {
        let first = data[0] as usize;
        if first <= 251 {
            (first, 1)
        } else {
            (data[1] as usize * 4 + first, 2)
        }
    }

    #[test]
    fn family1_table_matches_vorbis_layouts() {
        let m = ChannelMapping::family1(6).unwrap();
        assert_eq!(m.streams, 4);
        assert_eq!(m.coupled, 2);
        assert_eq!(m.mapping, vec![0, 4, 1, 2, 3, 5]);

        let m = ChannelMapping::family1(8).unwrap();
        assert_eq!(m.streams, 5);
        assert_eq!(m.coupled, 3);

        assert!(ChannelMapping::family1(9).is_none());
        assert!(ChannelMapping::family1(0).is_none());
    }

    #[test]
    fn fmtp_spells_out_the_mapping() {
        let m = ChannelMapping::family1(6).unwrap();
        assert_eq!(
            m.fmtp(),
            "channel_mapping=0,4,1,2,3,5;num_streams=4;coupled_streams=2"
        );
    }

    #[test]
    fn frame_length_round_trips() {
        for len in [0usize, 1, 10, 251, 252, 253, 300, 1000, 1275] {
            let mut out = Vec::new();
            push_frame_length(&mut out, len).unwrap();
            let (decoded, consumed) = read_frame_length(&out);
            assert_eq!(decoded, len, "length {len}");
            assert_eq!(consumed, out.len());
        }
        let mut out = Vec::new();
        assert!(push_frame_length(&mut out, 1276).is_err());
    }

    #[test]
    fn encode_produces_walkable_multistream_packet() {
        let mapping = ChannelMapping::family1(6).unwrap();
        let streams = mapping.streams as usize;
        let mut encoder = MultistreamEncoder::new(mapping).unwrap();

        // One 2.5ms frame of a quiet ramp across all 6 channels
        let interleaved: Vec<f32> = (0..OPUS_FRAME_SAMPLES * 6)
            .map(|i| (i as f32 / (OPUS_FRAME_SAMPLES * 6) as f32) * 0.1)
            .collect();
        let packet = encoder.encode(&interleaved, OPUS_FRAME_SAMPLES).unwrap();

        // Walk the self-delimited prefix streams; the remainder is the last
        // stream's standard packet
        let mut offset = 0usize;
        for _ in 0..streams - 1 {
            offset += 1; // TOC
            let (len, consumed) = read_frame_length(&packet[offset..]);
            offset += consumed + len;
            assert!(offset < packet.len(), "prefix stream overruns the packet");
        }
        assert!(packet.len() - offset > 1, "last stream packet is present");
    }

    #[test]
    fn encode_rejects_wrong_sample_count() {
        let mapping = ChannelMapping::family1(4).unwrap();
        let mut encoder = MultistreamEncoder::new(mapping).unwrap();
        assert!(encoder.encode(&[0.0; 100], OPUS_FRAME_SAMPLES).is_err());
    }
}
