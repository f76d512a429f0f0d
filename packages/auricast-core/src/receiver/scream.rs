//! Legacy Scream wire variant: 5-byte format header + 1152 bytes PCM.

use std::net::SocketAddr;
use tokio::time::Instant;

use bytes::Bytes;

use crate::packet::{ip_source_tag, parse_scream_header, PacketError, TaggedAudioPacket};
use crate::protocol_constants::{SCREAM_HEADER_SIZE, SCREAM_PACKET_SIZE};

use super::DatagramParser;

/// Parser for legacy 1157-byte Scream datagrams.
pub struct ScreamParser;

impl DatagramParser for ScreamParser {
    fn name(&self) -> &'static str {
        "scream"
    }

    fn is_valid_packet_structure(&self, datagram: &[u8]) -> bool {
        datagram.len() == SCREAM_PACKET_SIZE
    }

    fn parse(
        &self,
        datagram: &[u8],
        peer: SocketAddr,
        received_time: Instant,
    ) -> Result<Vec<TaggedAudioPacket>, PacketError> {
        let format = parse_scream_header(&datagram[..SCREAM_HEADER_SIZE])?;
        let packet = TaggedAudioPacket {
            source_tag: ip_source_tag(&peer.ip()),
            received_time,
            // Scream has no wire timestamp; the pacing stage synthesizes one
            rtp_timestamp: None,
            format,
            audio_data: Bytes::copy_from_slice(&datagram[SCREAM_HEADER_SIZE..]),
        };
        packet.validate()?;
        Ok(vec![packet])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(header: [u8; 5]) -> Vec<u8> {
        let mut d = vec![0u8; SCREAM_PACKET_SIZE];
        d[..5].copy_from_slice(&header);
        for (i, b) in d[5..].iter_mut().enumerate() {
            *b = (i % 2) as u8;
        }
        d
    }

    #[test]
    fn parses_valid_datagram() {
        let parser = ScreamParser;
        let d = datagram([0x01, 16, 2, 0x03, 0x00]);
        assert!(parser.is_valid_packet_structure(&d));

        let peer: SocketAddr = "192.168.1.2:9999".parse().unwrap();
        let packets = parser.parse(&d, peer, Instant::now()).unwrap();
        assert_eq!(packets.len(), 1);
        let p = &packets[0];
        assert_eq!(p.source_tag, "192.168.1.2    ");
        assert_eq!(p.format.sample_rate, 48000);
        assert_eq!(p.format.channels, 2);
        assert_eq!(p.audio_data.len(), 1152);
        assert_eq!(&p.audio_data[..4], &[0, 1, 0, 1]);
        assert_eq!(p.rtp_timestamp, None);
    }

    #[test]
    fn gates_on_exact_size() {
        let parser = ScreamParser;
        assert!(!parser.is_valid_packet_structure(&[0u8; SCREAM_PACKET_SIZE - 1]));
        assert!(!parser.is_valid_packet_structure(&[0u8; SCREAM_PACKET_SIZE + 1]));
    }

    #[test]
    fn rejects_bogus_format() {
        let parser = ScreamParser;
        let d = datagram([0x01, 13, 2, 0, 0]);
        let peer: SocketAddr = "10.0.0.1:1".parse().unwrap();
        assert!(parser.parse(&d, peer, Instant::now()).is_err());
    }
}
