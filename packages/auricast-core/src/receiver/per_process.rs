//! Per-process Scream variant: 30-byte program tag + Scream datagram.
//!
//! The composite source tag is the sender IP padded to 15 chars followed by
//! the trimmed program name, so one machine contributes a distinct stream
//! per program.

use std::net::SocketAddr;
use tokio::time::Instant;

use bytes::Bytes;

use crate::packet::{
    ip_source_tag, parse_program_tag, parse_scream_header, PacketError, TaggedAudioPacket,
};
use crate::protocol_constants::{PER_PROCESS_PACKET_SIZE, PROGRAM_TAG_SIZE, SCREAM_HEADER_SIZE};

use super::DatagramParser;

/// Parser for 1187-byte per-process Scream datagrams.
pub struct PerProcessScreamParser;

impl DatagramParser for PerProcessScreamParser {
    fn name(&self) -> &'static str {
        "scream-per-process"
    }

    fn is_valid_packet_structure(&self, datagram: &[u8]) -> bool {
        datagram.len() == PER_PROCESS_PACKET_SIZE
    }

    fn parse(
        &self,
        datagram: &[u8],
        peer: SocketAddr,
        received_time: Instant,
    ) -> Result<Vec<TaggedAudioPacket>, PacketError> {
        let program = parse_program_tag(&datagram[..PROGRAM_TAG_SIZE]);
        let header_start = PROGRAM_TAG_SIZE;
        let payload_start = header_start + SCREAM_HEADER_SIZE;
        let format = parse_scream_header(&datagram[header_start..payload_start])?;

        let packet = TaggedAudioPacket {
            source_tag: format!("{}{}", ip_source_tag(&peer.ip()), program),
            received_time,
            rtp_timestamp: None,
            format,
            audio_data: Bytes::copy_from_slice(&datagram[payload_start..]),
        };
        packet.validate()?;
        Ok(vec![packet])
    }
}
