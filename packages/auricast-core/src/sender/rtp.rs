//! RTP UDP sender (RFC 3550).
//!
//! Sequence numbers increment per packet; the timestamp is the cumulative
//! sample count at the sink's output rate; the SSRC is fixed at session
//! creation. Contributing-source identifiers from the mixer ride in the
//! CSRC list so receivers can attribute the mix.
//!
//! The MP3 side stream shares the socket but transmits as its own RTP
//! stream: the sink-configured MP3 payload type, its own sequence/timestamp
//! counters, and the marker bit set on the first packet of each frame
//! (frames longer than one MTU fragment into unmarked continuation
//! packets).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::util::Marshal;

use crate::protocol_constants::{MP3_RTP_MAX_PAYLOAD, MP3_SAMPLES_PER_FRAME};

use super::{NetworkSender, SenderError, WirePayload};

/// RTP allows at most 15 CSRC entries (4-bit count).
const MAX_CSRCS: usize = 15;

struct RtpState {
    sequence_number: u16,
    timestamp: u32,
    first_packet: bool,
}

pub struct RtpSender {
    dest: SocketAddr,
    payload_type: u8,
    mp3_payload_type: u8,
    ssrc: u32,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    state: Mutex<RtpState>,
    /// Separate counters for the MP3 side stream (distinct SSRC).
    mp3_state: Mutex<RtpState>,
    closed: AtomicBool,
}

impl RtpSender {
    /// Creates a sender with a fresh random SSRC. `mp3_payload_type` is the
    /// sink-configured payload type of the MP3 side stream.
    pub fn new(dest: SocketAddr, payload_type: u8, mp3_payload_type: u8) -> Self {
        // uuid is the crate's randomness source; fold it into 32 bits
        let ssrc = uuid::Uuid::new_v4().as_u128() as u32;
        Self {
            dest,
            payload_type,
            mp3_payload_type,
            ssrc,
            socket: Mutex::new(None),
            state: Mutex::new(RtpState {
                sequence_number: 0,
                timestamp: 0,
                first_packet: true,
            }),
            mp3_state: Mutex::new(RtpState {
                sequence_number: 0,
                timestamp: 0,
                first_packet: true,
            }),
            closed: AtomicBool::new(false),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Transmits one complete MP3 frame.
    ///
    /// The first packet of the frame carries the marker bit; a frame longer
    /// than the MTU budget continues in unmarked packets sharing the frame's
    /// timestamp. The timestamp advances one MP3 frame of samples per call,
    /// on the sink's output sample-rate clock.
    pub async fn send_mp3_frame(&self, frame: &[u8]) -> Result<(), SenderError> {
        if self.is_closed() {
            return Err(SenderError::Closed);
        }
        if frame.is_empty() {
            return Ok(());
        }
        let socket = self
            .socket
            .lock()
            .clone()
            .ok_or_else(|| SenderError::Socket("not set up".into()))?;

        // Reserve the frame's header fields up front so fragments stay
        // contiguous in sequence space
        let fragments = frame.chunks(MP3_RTP_MAX_PAYLOAD).count() as u16;
        let (mut sequence_number, timestamp) = {
            let mut state = self.mp3_state.lock();
            let reserved = (state.sequence_number, state.timestamp);
            state.sequence_number = state.sequence_number.wrapping_add(fragments);
            state.timestamp = state.timestamp.wrapping_add(MP3_SAMPLES_PER_FRAME);
            reserved
        };

        for (index, fragment) in frame.chunks(MP3_RTP_MAX_PAYLOAD).enumerate() {
            let packet = Packet {
                header: Header {
                    version: 2,
                    marker: index == 0,
                    payload_type: self.mp3_payload_type,
                    sequence_number,
                    timestamp,
                    ssrc: self.ssrc.wrapping_add(1),
                    ..Default::default()
                },
                payload: Bytes::copy_from_slice(fragment),
            };
            sequence_number = sequence_number.wrapping_add(1);
            let raw = packet
                .marshal()
                .map_err(|e| SenderError::Encode(e.to_string()))?;
            socket
                .send(&raw)
                .await
                .map_err(|e| SenderError::Socket(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkSender for RtpSender {
    async fn setup(&self) -> Result<(), SenderError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| SenderError::Socket(e.to_string()))?;
        socket
            .connect(self.dest)
            .await
            .map_err(|e| SenderError::Socket(e.to_string()))?;
        *self.socket.lock() = Some(Arc::new(socket));
        log::info!(
            "[RtpSender] Sending to {} (pt={}, ssrc={:08x})",
            self.dest,
            self.payload_type,
            self.ssrc
        );
        Ok(())
    }

    async fn send_payload(&self, payload: WirePayload<'_>) -> Result<(), SenderError> {
        if self.is_closed() {
            return Err(SenderError::Closed);
        }
        let socket = self
            .socket
            .lock()
            .clone()
            .ok_or_else(|| SenderError::Socket("not set up".into()))?;

        let frames = payload.bytes.len() / payload.format.bytes_per_frame().max(1);
        let header = {
            let mut state = self.state.lock();
            let header = Header {
                version: 2,
                marker: state.first_packet,
                payload_type: self.payload_type,
                sequence_number: state.sequence_number,
                timestamp: state.timestamp,
                ssrc: self.ssrc,
                csrc: payload.csrcs.iter().take(MAX_CSRCS).copied().collect(),
                ..Default::default()
            };
            state.first_packet = false;
            state.sequence_number = state.sequence_number.wrapping_add(1);
            state.timestamp = state.timestamp.wrapping_add(frames as u32);
            header
        };

        let packet = Packet {
            header,
            payload: Bytes::copy_from_slice(payload.bytes),
        };
        let raw = packet
            .marshal()
            .map_err(|e| SenderError::Encode(e.to_string()))?;
        socket
            .send(&raw)
            .await
            .map_err(|e| SenderError::Socket(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        *self.socket.lock() = None;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
