//! Wire-level egress.
//!
//! Every sink drives exactly one [`NetworkSender`]. Senders are
//! fire-and-forget: a failed send is logged and dropped (UDP semantics), a
//! failed session enters a terminal state and asks the engine for cleanup.

pub mod opus_ms;
pub mod rtp;
pub mod scream;
pub mod webrtc;

pub use opus_ms::{ChannelMapping, MultistreamEncoder};
pub use rtp::RtpSender;
pub use scream::ScreamSender;
pub use webrtc::{WebRtcSender, WebRtcSenderCallbacks};

use async_trait::async_trait;
use thiserror::Error;

use crate::format::AudioFormat;

/// Errors produced by wire senders.
#[derive(Debug, Error)]
pub enum SenderError {
    /// Socket creation or transmit failure.
    #[error("socket error: {0}")]
    Socket(String),

    /// The sender was closed; payloads are discarded.
    #[error("sender is closed")]
    Closed,

    /// Payload could not be encoded for the wire (Opus, RTP marshal).
    #[error("encode error: {0}")]
    Encode(String),

    /// Session-level failure (WebRTC negotiation, terminal peer state).
    #[error("session error: {0}")]
    Session(String),
}

/// One mixed chunk as handed from a mixer to its sender.
///
/// Carries both renditions of the same audio so every sender variant finds
/// what it needs: `bytes` is sink wire format (big-endian PCM at the sink
/// bit depth) for the datagram senders, `pcm` is the full-scale 32-bit
/// buffer the Opus path encodes from.
pub struct WirePayload<'a> {
    pub bytes: &'a [u8],
    pub pcm: &'a [i32],
    pub format: AudioFormat,
    /// Contributing-source identifiers, carried as RTP CSRCs.
    pub csrcs: &'a [u32],
}

/// Uniform interface over the Scream, RTP and WebRTC transmit paths.
#[async_trait]
pub trait NetworkSender: Send + Sync {
    /// Binds sockets / creates the session. Must be called once before
    /// `send_payload`.
    async fn setup(&self) -> Result<(), SenderError>;

    /// Transmits one chunk. Fire-and-forget; errors are for accounting.
    async fn send_payload(&self, payload: WirePayload<'_>) -> Result<(), SenderError>;

    /// Tears the session down. Idempotent.
    async fn close(&self);

    fn is_closed(&self) -> bool;

    /// True when the sender sat in a terminal state long enough that the
    /// engine should reap it.
    fn should_cleanup_due_to_timeout(&self) -> bool {
        false
    }
}
