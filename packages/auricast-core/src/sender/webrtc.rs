//! WebRTC sender: Opus over an ordered media track.
//!
//! Owns one `RTCPeerConnection`. Signaling is out-of-band: the embedder
//! routes the opaque SDP/ICE strings through callbacks and feeds the remote
//! offer back in through [`WebRtcSender::handle_remote_offer`]. The track
//! carries 2.5 ms Opus frames; the underlying track handles RTP
//! packetization.
//!
//! Sinks up to stereo ride a plain Opus track. Wider sinks (3..=8 channels)
//! use multistream Opus with the channel-mapping-family-1 table, advertised
//! as `audio/multiopus` with the mapping in the fmtp line; when multichannel
//! operation is disabled they fall back to a stereo downmix.
//!
//! Session states follow the peer connection:
//! `New -> Connecting -> Connected -> (Disconnected | Failed | Closed)`.
//! A terminal state arms a one-shot cleanup timer; after the cleanup
//! timeout the embedder-supplied callback is invoked exactly once with the
//! sink id so the engine can reap the sender.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::dsp::{apply_matrix, default_matrix};
use crate::error::{RouteError, RouteResult};
use crate::protocol_constants::{
    OPUS_FRAME_SAMPLES, OPUS_SAMPLE_RATE, WEBRTC_CLEANUP_TIMEOUT_SECS,
};

use super::opus_ms::{ChannelMapping, MultistreamEncoder, MIME_TYPE_MULTIOPUS};
use super::{NetworkSender, SenderError, WirePayload};

/// Dynamic payload type registered for `audio/multiopus`.
const MULTIOPUS_PAYLOAD_TYPE: u8 = 121;

/// Signaling and lifecycle callbacks supplied by the embedder.
pub struct WebRtcSenderCallbacks {
    /// Local SDP (the answer) ready to ferry to the remote peer.
    pub on_local_description: Box<dyn Fn(String) + Send + Sync>,
    /// Local ICE candidate: `(candidate, mid)`.
    pub on_ice_candidate: Box<dyn Fn(String, String) + Send + Sync>,
    /// The session sat in a terminal state past the cleanup timeout; the
    /// engine should remove this sender. Carries the sink id.
    pub on_cleanup_request: Box<dyn Fn(String) + Send + Sync>,
}

/// Session state, mirrored from the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    New = 0,
    Connecting = 1,
    Connected = 2,
    Disconnected = 3,
    Failed = 4,
    Closed = 5,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Disconnected,
            4 => Self::Failed,
            5 => Self::Closed,
            _ => Self::New,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

enum OpusPath {
    /// Mono/stereo sink, or a wider sink with multichannel disabled
    /// (downmixed ahead of the encoder).
    Single {
        encoder: opus::Encoder,
        channels: u16,
        downmix: Option<Vec<Vec<f32>>>,
    },
    /// 3..=8 channel sink: one elementary encoder per mapped stream,
    /// packetized as a single multistream packet per 2.5 ms frame.
    Multistream(MultistreamEncoder),
}

impl OpusPath {
    /// Channel count the pending buffer accumulates at.
    fn channels(&self) -> usize {
        match self {
            Self::Single { channels, .. } => *channels as usize,
            Self::Multistream(encoder) => encoder.mapping().channels as usize,
        }
    }
}

struct OpusState {
    path: OpusPath,
    /// Interleaved f32 at the path's channel count, accumulated to whole
    /// 2.5 ms frames.
    pending: Vec<f32>,
    scratch: Vec<f32>,
}

pub struct WebRtcSender {
    sink_id: String,
    peer: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticSample>,
    opus: Mutex<OpusState>,
    state: Arc<AtomicU8>,
    cleanup_fired: Arc<AtomicBool>,
    callbacks: Arc<WebRtcSenderCallbacks>,
}

impl WebRtcSender {
    /// Creates the peer connection and audio track.
    ///
    /// `sink_channels` is the sink's configured width. Up to stereo (or
    /// whenever `multichannel` is off) the track is plain Opus; 3..=8
    /// channels with `multichannel` on negotiate a family-1 multistream
    /// track. The sink sample rate must be 48 kHz (the Opus track rate).
    pub async fn new(
        sink_id: String,
        sink_channels: u16,
        multichannel: bool,
        callbacks: WebRtcSenderCallbacks,
    ) -> RouteResult<Self> {
        let multistream_mapping = if multichannel && sink_channels > 2 {
            Some(ChannelMapping::family1(sink_channels).ok_or_else(|| {
                RouteError::InvalidState(format!(
                    "WebRTC sink '{sink_id}' has {sink_channels} channels; \
                     multistream Opus covers at most 8"
                ))
            })?)
        } else {
            None
        };

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| RouteError::WebRtc(e.to_string()))?;

        // The track's codec capability; multistream advertises multiopus
        // with the channel mapping in the fmtp line
        let capability = match &multistream_mapping {
            Some(mapping) => {
                let capability = RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_MULTIOPUS.to_owned(),
                    clock_rate: OPUS_SAMPLE_RATE,
                    channels: sink_channels,
                    sdp_fmtp_line: mapping.fmtp(),
                    ..Default::default()
                };
                media_engine
                    .register_codec(
                        RTCRtpCodecParameters {
                            capability: capability.clone(),
                            payload_type: MULTIOPUS_PAYLOAD_TYPE,
                            ..Default::default()
                        },
                        RTPCodecType::Audio,
                    )
                    .map_err(|e| RouteError::WebRtc(e.to_string()))?;
                capability
            }
            None => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: OPUS_SAMPLE_RATE,
                channels: 2,
                ..Default::default()
            },
        };

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| RouteError::WebRtc(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .map_err(|e| RouteError::WebRtc(e.to_string()))?,
        );

        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            "audio".to_owned(),
            format!("auricast-{sink_id}"),
        ));
        peer.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| RouteError::WebRtc(e.to_string()))?;

        let path = match multistream_mapping {
            Some(mapping) => OpusPath::Multistream(
                MultistreamEncoder::new(mapping)
                    .map_err(|e| RouteError::WebRtc(e.to_string()))?,
            ),
            None => {
                let encoder_channels = sink_channels.clamp(1, 2);
                let opus_channels = if encoder_channels == 1 {
                    opus::Channels::Mono
                } else {
                    opus::Channels::Stereo
                };
                let encoder = opus::Encoder::new(
                    OPUS_SAMPLE_RATE,
                    opus_channels,
                    opus::Application::Audio,
                )
                .map_err(|e| RouteError::WebRtc(format!("opus encoder: {e}")))?;
                OpusPath::Single {
                    encoder,
                    channels: encoder_channels,
                    downmix: (sink_channels > 2).then(|| {
                        default_matrix(sink_channels as usize, encoder_channels as usize)
                    }),
                }
            }
        };

        let callbacks = Arc::new(callbacks);
        let state = Arc::new(AtomicU8::new(SessionState::New as u8));
        let cleanup_fired = Arc::new(AtomicBool::new(false));

        let sender = Self {
            sink_id,
            peer,
            track,
            opus: Mutex::new(OpusState {
                path,
                pending: Vec::new(),
                scratch: Vec::new(),
            }),
            state,
            cleanup_fired,
            callbacks,
        };
        sender.install_handlers();
        Ok(sender)
    }

    /// True when this sender encodes family-1 multistream Opus.
    pub fn is_multistream(&self) -> bool {
        matches!(self.opus.lock().path, OpusPath::Multistream(_))
    }

    fn install_handlers(&self) {
        let callbacks = Arc::clone(&self.callbacks);
        self.peer
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let callbacks = Arc::clone(&callbacks);
                Box::pin(async move {
                    if let Some(candidate) = candidate {
                        match candidate.to_json() {
                            Ok(init) => (callbacks.on_ice_candidate)(
                                init.candidate,
                                init.sdp_mid.unwrap_or_default(),
                            ),
                            Err(err) => {
                                log::warn!("[WebRtcSender] ICE candidate serialize: {err}")
                            }
                        }
                    }
                })
            }));

        let state = Arc::clone(&self.state);
        let cleanup_fired = Arc::clone(&self.cleanup_fired);
        let callbacks = Arc::clone(&self.callbacks);
        let sink_id = self.sink_id.clone();
        self.peer.on_peer_connection_state_change(Box::new(
            move |peer_state: RTCPeerConnectionState| {
                let session_state = match peer_state {
                    RTCPeerConnectionState::New => SessionState::New,
                    RTCPeerConnectionState::Connecting => SessionState::Connecting,
                    RTCPeerConnectionState::Connected => SessionState::Connected,
                    RTCPeerConnectionState::Disconnected => SessionState::Disconnected,
                    RTCPeerConnectionState::Failed => SessionState::Failed,
                    RTCPeerConnectionState::Closed => SessionState::Closed,
                    _ => SessionState::New,
                };
                apply_state_transition(
                    session_state,
                    &state,
                    &cleanup_fired,
                    &callbacks,
                    &sink_id,
                );
                Box::pin(async {})
            },
        ));
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Forces a state transition. Exposed for the engine's session plumbing
    /// and for tests; normal transitions come from the peer connection.
    pub fn transition_state(&self, new_state: SessionState) {
        apply_state_transition(
            new_state,
            &self.state,
            &self.cleanup_fired,
            &self.callbacks,
            &self.sink_id,
        );
    }

    /// Applies a remote SDP offer and returns the local answer.
    ///
    /// The answer is also delivered through `on_local_description` once ICE
    /// gathering completes, with candidates inline.
    pub async fn handle_remote_offer(&self, offer_sdp: String) -> RouteResult<String> {
        let offer = RTCSessionDescription::offer(offer_sdp)
            .map_err(|e| RouteError::WebRtc(format!("bad offer: {e}")))?;
        self.peer
            .set_remote_description(offer)
            .await
            .map_err(|e| RouteError::WebRtc(e.to_string()))?;

        let answer = self
            .peer
            .create_answer(None)
            .await
            .map_err(|e| RouteError::WebRtc(e.to_string()))?;

        let mut gathering_done = self.peer.gathering_complete_promise().await;
        self.peer
            .set_local_description(answer)
            .await
            .map_err(|e| RouteError::WebRtc(e.to_string()))?;
        let _ = gathering_done.recv().await;

        let local = self
            .peer
            .local_description()
            .await
            .ok_or_else(|| RouteError::WebRtc("no local description".into()))?;
        (self.callbacks.on_local_description)(local.sdp.clone());
        Ok(local.sdp)
    }
}

/// Shared state-transition logic: records the state and arms the one-shot
/// cleanup timer on entering a terminal state.
fn apply_state_transition(
    new_state: SessionState,
    state: &Arc<AtomicU8>,
    cleanup_fired: &Arc<AtomicBool>,
    callbacks: &Arc<WebRtcSenderCallbacks>,
    sink_id: &str,
) {
    let previous = SessionState::from_u8(state.swap(new_state as u8, Ordering::AcqRel));
    if previous == new_state {
        return;
    }
    log::info!("[WebRtcSender] {sink_id}: {previous:?} -> {new_state:?}");

    if new_state.is_terminal() && !previous.is_terminal() {
        let state = Arc::clone(state);
        let cleanup_fired = Arc::clone(cleanup_fired);
        let callbacks = Arc::clone(callbacks);
        let sink_id = sink_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(WEBRTC_CLEANUP_TIMEOUT_SECS)).await;
            let still_terminal = SessionState::from_u8(state.load(Ordering::Acquire)).is_terminal();
            if still_terminal && !cleanup_fired.swap(true, Ordering::AcqRel) {
                log::info!("[WebRtcSender] {sink_id}: requesting cleanup");
                (callbacks.on_cleanup_request)(sink_id.clone());
            }
        });
    }
}

#[async_trait]
impl NetworkSender for WebRtcSender {
    async fn setup(&self) -> Result<(), SenderError> {
        // The peer connection is created in `new`; the session starts when
        // the remote offer arrives.
        Ok(())
    }

    async fn send_payload(&self, payload: WirePayload<'_>) -> Result<(), SenderError> {
        if self.is_closed() {
            return Err(SenderError::Closed);
        }
        if self.state() != SessionState::Connected {
            // Drop quietly until the peer is up; not an error
            return Ok(());
        }

        let mut encoded_frames: Vec<Bytes> = Vec::new();
        {
            let mut opus = self.opus.lock();
            let opus = &mut *opus;
            let frame_samples = OPUS_FRAME_SAMPLES * opus.path.channels();

            // Full-scale i32 to f32, downmixed only on the fallback path
            opus.scratch.clear();
            opus
                .scratch
                .extend(payload.pcm.iter().map(|&s| s as f32 / 2147483648.0));
            match &opus.path {
                OpusPath::Single {
                    downmix: Some(downmix),
                    ..
                } => {
                    let mut mixed = Vec::new();
                    apply_matrix(
                        downmix,
                        &opus.scratch,
                        payload.format.channels as usize,
                        &mut mixed,
                    );
                    opus.pending.extend_from_slice(&mixed);
                }
                _ => {
                    let scratch = &opus.scratch;
                    opus.pending.extend_from_slice(scratch);
                }
            }

            let mut packet = vec![0u8; 1500];
            while opus.pending.len() >= frame_samples {
                let rest = opus.pending.split_off(frame_samples);
                let frame: Vec<f32> = std::mem::replace(&mut opus.pending, rest);
                let encoded = match &mut opus.path {
                    OpusPath::Single { encoder, .. } => {
                        let written = encoder
                            .encode_float(&frame, &mut packet)
                            .map_err(|e| SenderError::Encode(e.to_string()))?;
                        Bytes::copy_from_slice(&packet[..written])
                    }
                    OpusPath::Multistream(encoder) => {
                        encoder.encode(&frame, OPUS_FRAME_SAMPLES)?
                    }
                };
                encoded_frames.push(encoded);
            }
        }

        for data in encoded_frames {
            self.track
                .write_sample(&Sample {
                    data,
                    duration: Duration::from_micros(2500),
                    ..Default::default()
                })
                .await
                .map_err(|e| SenderError::Session(e.to_string()))?;
        }
        Ok(())
    }

    async fn close(&self) {
        if self.is_closed() {
            return;
        }
        if let Err(err) = self.peer.close().await {
            log::warn!("[WebRtcSender] {}: close: {err}", self.sink_id);
        }
        self.transition_state(SessionState::Closed);
    }

    fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    fn should_cleanup_due_to_timeout(&self) -> bool {
        self.cleanup_fired.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn callbacks(cleanups: Arc<AtomicUsize>) -> WebRtcSenderCallbacks {
        WebRtcSenderCallbacks {
            on_local_description: Box::new(|_| {}),
            on_ice_candidate: Box::new(|_, _| {}),
            on_cleanup_request: Box::new(move |_| {
                cleanups.fetch_add(1, Ordering::SeqCst);
            }),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_session_requests_cleanup_exactly_once() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let sender = WebRtcSender::new("sink-x".into(), 2, true, callbacks(Arc::clone(&cleanups)))
            .await
            .expect("peer connection");

        sender.transition_state(SessionState::Failed);
        // A second terminal transition must not arm a second timer fire
        sender.transition_state(SessionState::Disconnected);

        tokio::time::advance(Duration::from_secs(WEBRTC_CLEANUP_TIMEOUT_SECS + 1)).await;
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert!(sender.should_cleanup_due_to_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn recovered_session_cancels_cleanup() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let sender = WebRtcSender::new("sink-y".into(), 2, true, callbacks(Arc::clone(&cleanups)))
            .await
            .expect("peer connection");

        sender.transition_state(SessionState::Disconnected);
        tokio::time::advance(Duration::from_secs(5)).await;
        sender.transition_state(SessionState::Connected);

        tokio::time::advance(Duration::from_secs(WEBRTC_CLEANUP_TIMEOUT_SECS)).await;
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wide_sinks_negotiate_multistream() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let sender = WebRtcSender::new("sink-6ch".into(), 6, true, callbacks(cleanups))
            .await
            .expect("peer connection");
        assert!(sender.is_multistream());
        sender.close().await;
    }

    #[tokio::test]
    async fn multichannel_off_falls_back_to_stereo_downmix() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let sender = WebRtcSender::new("sink-6dm".into(), 6, false, callbacks(cleanups))
            .await
            .expect("peer connection");
        assert!(!sender.is_multistream());
        sender.close().await;
    }

    #[tokio::test]
    async fn more_than_eight_channels_is_rejected() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let result = WebRtcSender::new("sink-wide".into(), 10, true, callbacks(cleanups)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn payloads_before_connection_are_dropped_quietly() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let sender = WebRtcSender::new("sink-z".into(), 2, true, callbacks(cleanups))
            .await
            .expect("peer connection");

        let result = sender
            .send_payload(WirePayload {
                bytes: &[],
                pcm: &[0i32; 576],
                format: crate::format::AudioFormat::new(48000, 2, 16),
                csrcs: &[],
            })
            .await;
        assert!(result.is_ok());
        sender.close().await;
        assert!(sender.is_closed());
    }
}
