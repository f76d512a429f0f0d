//! RTP ingest with SAP/SDP session discovery.
//!
//! RTP streams are announced over SAP (RFC 2974) on UDP 9875; the SDP body
//! maps a dynamic payload type to `{codec, sample rate, channels}`. The
//! [`SapListener`] maintains that table, and the [`RtpParser`] uses it to
//! decode RTP datagrams, re-chunking payloads into the engine's fixed chunk
//! size per SSRC. RTP packets carry a wire timestamp, so unlike the Scream
//! variants they bypass the pacing stage and go straight to the timeshift
//! manager.

use std::io::Cursor;
use std::net::SocketAddr;
use tokio::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use rtp_rs::RtpReader;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use webrtc::sdp::SessionDescription;

use crate::format::AudioFormat;
use crate::packet::{PacketError, TaggedAudioPacket};
use crate::protocol_constants::{RTP_DEFAULT_PCM_PAYLOAD_TYPE, RTP_HEADER_SIZE};

use super::{bind_udp, DatagramParser, ReceiverConfig};

// ─────────────────────────────────────────────────────────────────────────────
// Session Table
// ─────────────────────────────────────────────────────────────────────────────

/// One announced RTP session.
#[derive(Debug, Clone)]
pub struct RtpSession {
    pub name: String,
    pub payload_type: u8,
    pub format: AudioFormat,
}

/// Payload-type -> session mapping maintained from SAP announcements.
#[derive(Default)]
pub struct RtpSessionTable {
    by_payload_type: DashMap<u8, RtpSession>,
}

impl RtpSessionTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn announce(&self, session: RtpSession) {
        log::info!(
            "[SAP] Session '{}': pt={} {}",
            session.name,
            session.payload_type,
            session.format
        );
        self.by_payload_type.insert(session.payload_type, session);
    }

    pub fn delete(&self, name: &str) {
        self.by_payload_type.retain(|_, s| {
            if s.name == name {
                log::info!("[SAP] Session '{name}' deleted");
                false
            } else {
                true
            }
        });
    }

    /// Resolves a payload type. The default PCM payload type always works,
    /// mapped to L16/48k/stereo, so un-announced senders are usable.
    pub fn lookup(&self, payload_type: u8) -> Option<RtpSession> {
        if let Some(session) = self.by_payload_type.get(&payload_type) {
            return Some(session.clone());
        }
        (payload_type == RTP_DEFAULT_PCM_PAYLOAD_TYPE).then(|| RtpSession {
            name: String::new(),
            payload_type,
            format: AudioFormat::new(48000, 2, 16),
        })
    }

    pub fn len(&self) -> usize {
        self.by_payload_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_payload_type.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SAP Parsing
// ─────────────────────────────────────────────────────────────────────────────

struct SapMessage<'a> {
    deletion: bool,
    sdp: &'a [u8],
}

/// Strips the SAP framing (RFC 2974) off a datagram, yielding the SDP body.
fn parse_sap(datagram: &[u8]) -> Option<SapMessage<'_>> {
    if datagram.len() < 8 {
        return None;
    }
    let flags = datagram[0];
    let ipv6_origin = flags & 0x10 != 0;
    let deletion = flags & 0x04 != 0;
    let encrypted = flags & 0x02 != 0;
    let compressed = flags & 0x01 != 0;
    if encrypted || compressed {
        // Neither is used for LAN audio announcements
        return None;
    }

    let auth_len = datagram[1] as usize * 4;
    let origin_len = if ipv6_origin { 16 } else { 4 };
    let offset = 4 + origin_len + auth_len;
    if datagram.len() <= offset {
        return None;
    }

    let rest = &datagram[offset..];
    let sdp = if rest.starts_with(b"v=") {
        rest
    } else {
        // Optional MIME payload type, NUL-terminated
        let nul = rest.iter().position(|&b| b == 0)?;
        &rest[nul + 1..]
    };
    Some(SapMessage { deletion, sdp })
}

/// Parses an SDP body into a session entry.
///
/// Requires an `m=audio` section; the codec comes from its `rtpmap`
/// attribute (`L16`/`L24`/`L8` PCM variants only).
fn parse_sdp_session(sdp: &[u8]) -> Option<RtpSession> {
    let mut cursor = Cursor::new(sdp.to_vec());
    let session = SessionDescription::unmarshal(&mut cursor).ok()?;

    let media = session
        .media_descriptions
        .iter()
        .find(|m| m.media_name.media == "audio")?;
    let payload_type: u8 = media.media_name.formats.first()?.parse().ok()?;

    let rtpmap = media.attributes.iter().find_map(|a| {
        let value = a.value.as_deref()?;
        (a.key == "rtpmap" && value.starts_with(&payload_type.to_string())).then_some(value)
    })?;

    // "96 L24/48000/2"
    let codec_spec = rtpmap.split_whitespace().nth(1)?;
    let mut parts = codec_spec.split('/');
    let codec = parts.next()?;
    let sample_rate: u32 = parts.next()?.parse().ok()?;
    let channels: u16 = parts.next().map_or(1, |c| c.parse().unwrap_or(1));

    let bit_depth = match codec {
        "L8" => 8,
        "L16" => 16,
        "L24" => 24,
        other => {
            log::debug!("[SAP] Ignoring session with unsupported codec '{other}'");
            return None;
        }
    };

    let format = AudioFormat::new(sample_rate, channels, bit_depth);
    format.validate().ok()?;
    Some(RtpSession {
        name: session.session_name.clone(),
        payload_type,
        format,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// SAP Listener
// ─────────────────────────────────────────────────────────────────────────────

/// Background task receiving SAP announcements into an [`RtpSessionTable`].
pub struct SapListener {
    config: ReceiverConfig,
    table: Arc<RtpSessionTable>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl SapListener {
    pub fn new(config: ReceiverConfig, table: Arc<RtpSessionTable>) -> Self {
        Self {
            config,
            table,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn start(&self) -> crate::error::RouteResult<()> {
        let socket = bind_udp(self.config.bind_addr, self.config.multicast_group)
            .map_err(|e| crate::error::RouteError::Network(format!("SAP bind failed: {e}")))?;
        log::info!("[SAP] Listening on {}", self.config.bind_addr);

        let table = Arc::clone(&self.table);
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = socket.recv_from(&mut buf) => {
                        let Ok((len, _peer)) = result else { continue };
                        let Some(message) = parse_sap(&buf[..len]) else { continue };
                        if message.deletion {
                            if let Some(session) = parse_sdp_session(message.sdp) {
                                table.delete(&session.name);
                            }
                        } else if let Some(session) = parse_sdp_session(message.sdp) {
                            table.announce(session);
                        }
                    }
                }
            }
        });
        Ok(())
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RTP Parser
// ─────────────────────────────────────────────────────────────────────────────

struct SsrcState {
    format: AudioFormat,
    source_tag: String,
    pending: Vec<u8>,
    next_rtp_timestamp: Option<u32>,
}

/// Decodes RTP datagrams against the session table, re-chunking per SSRC to
/// the engine's fixed chunk size.
pub struct RtpParser {
    sessions: Arc<RtpSessionTable>,
    chunk_size: usize,
    streams: DashMap<u32, SsrcState>,
}

impl RtpParser {
    pub fn new(sessions: Arc<RtpSessionTable>, chunk_size: usize) -> Self {
        Self {
            sessions,
            chunk_size,
            streams: DashMap::new(),
        }
    }
}

impl DatagramParser for RtpParser {
    fn name(&self) -> &'static str {
        "rtp"
    }

    fn receive_buffer_size(&self) -> usize {
        4096
    }

    fn is_valid_packet_structure(&self, datagram: &[u8]) -> bool {
        datagram.len() > RTP_HEADER_SIZE && datagram[0] >> 6 == 2
    }

    fn parse(
        &self,
        datagram: &[u8],
        _peer: SocketAddr,
        received_time: Instant,
    ) -> Result<Vec<TaggedAudioPacket>, PacketError> {
        let reader = RtpReader::new(datagram).map_err(|_| PacketError::TooShort {
            got: datagram.len(),
            need: RTP_HEADER_SIZE,
        })?;

        let payload_type = reader.payload_type();
        let session = self
            .sessions
            .lookup(payload_type)
            .ok_or(PacketError::UnknownPayloadType(payload_type))?;

        let ssrc = reader.ssrc();
        let mut state = self.streams.entry(ssrc).or_insert_with(|| {
            let source_tag = if session.name.is_empty() {
                format!("rtp-{ssrc:08x}")
            } else {
                format!("{}-{ssrc:08x}", session.name)
            };
            SsrcState {
                format: session.format,
                source_tag,
                pending: Vec::new(),
                next_rtp_timestamp: None,
            }
        });

        // Session re-announced with a new format: restart accumulation
        if state.format != session.format {
            state.format = session.format;
            state.pending.clear();
            state.next_rtp_timestamp = None;
        }

        if state.next_rtp_timestamp.is_none() {
            state.next_rtp_timestamp = Some(reader.timestamp());
        }
        state.pending.extend_from_slice(reader.payload());

        // Emit whole chunks; the remainder stays for the next datagram
        let frames_per_chunk = (self.chunk_size / state.format.bytes_per_frame()) as u32;
        let mut packets = Vec::new();
        while state.pending.len() >= self.chunk_size {
            let chunk: Vec<u8> = state.pending.drain(..self.chunk_size).collect();
            let rtp_timestamp = state.next_rtp_timestamp;
            state.next_rtp_timestamp =
                rtp_timestamp.map(|t| t.wrapping_add(frames_per_chunk));
            packets.push(TaggedAudioPacket {
                source_tag: state.source_tag.clone(),
                received_time,
                rtp_timestamp,
                format: state.format,
                audio_data: Bytes::from(chunk),
            });
        }
        Ok(packets)
    }
}
