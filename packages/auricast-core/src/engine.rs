//! The audio engine facade.
//!
//! Exclusively owns every live component: receivers, the pacing stage, the
//! timeshift manager, source processors, sink mixers and their senders. The
//! reconciler mutates the engine through the add/remove/update/connect
//! operations here while the data plane keeps running.
//!
//! Shutdown is top-down in reverse dependency order: sinks (mixers, then
//! senders) -> processors -> timeshift -> pacing -> clocks -> receivers. Every
//! component's `stop()` is idempotent, and `stop()` here is too.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use bytes::Bytes;
use tokio_util::task::TaskTracker;

use crate::clock::ClockManager;
use crate::error::{RouteError, RouteResult};
use crate::mixer::{Mp3Encoder, MixerConfig, SinkMixer};
use crate::processor::{ProcessedChunk, ProcessorConfig, SourceProcessor};
use crate::protocol_constants::{
    MIXER_QUEUE_CAPACITY, PROCESSOR_QUEUE_CAPACITY, RTP_DEFAULT_PCM_PAYLOAD_TYPE,
    SAP_MULTICAST_ADDR, SAP_PORT,
};
use crate::queue::BoundedQueue;
use crate::receiver::{
    PacedDispatcher, PacketDispatch, PerProcessScreamParser, ReceiverConfig, RtpParser,
    RtpSessionTable, SapListener, ScreamParser, UdpReceiver,
};
use crate::sender::{
    NetworkSender, RtpSender, ScreamSender, WebRtcSender, WebRtcSenderCallbacks,
};
use crate::state::{EngineTuning, SinkProtocol, SinkSpec, SourceParameterUpdates, SourcePathSpec};
use crate::stats::EngineStats;
use crate::sync::{SinkSyncCoordinator, SyncConfig};
use crate::timeshift::{SharedPacket, TimeshiftConfig, TimeshiftManager};

/// Ingest socket configuration. A `None` port disables that receiver.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tuning: EngineTuning,
    pub bind_ip: IpAddr,
    pub scream_port: Option<u16>,
    pub per_process_port: Option<u16>,
    pub rtp_port: Option<u16>,
    /// Listen for SAP announcements (only meaningful with an RTP port).
    pub sap_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tuning: EngineTuning::default(),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            scream_port: Some(crate::protocol_constants::DEFAULT_SCREAM_PORT),
            per_process_port: Some(crate::protocol_constants::DEFAULT_PER_PROCESS_PORT),
            rtp_port: Some(crate::protocol_constants::DEFAULT_RTP_PORT),
            sap_enabled: true,
        }
    }
}

struct ProcessorEntry {
    processor: Arc<SourceProcessor>,
    output_queue: Arc<BoundedQueue<ProcessedChunk>>,
    input_queue: Arc<BoundedQueue<SharedPacket>>,
    target_sink_id: String,
}

struct SinkEntry {
    mixer: Arc<SinkMixer>,
    sender: Arc<dyn NetworkSender>,
    webrtc: Option<Arc<WebRtcSender>>,
    /// MP3 side-stream fan-out task, when the sink transports one.
    mp3_tasks: TaskTracker,
}

/// Owns and wires the whole pipeline.
pub struct AudioEngine {
    config: EngineConfig,
    clocks: Arc<ClockManager>,
    timeshift: Arc<TimeshiftManager>,
    paced: Arc<PacedDispatcher>,
    rtp_sessions: Arc<RtpSessionTable>,
    receivers: Mutex<Vec<UdpReceiver>>,
    sap: Mutex<Option<SapListener>>,
    processors: DashMap<String, ProcessorEntry>,
    sinks: DashMap<String, SinkEntry>,
    /// Shared tick barrier, present when multi-sink sync is enabled.
    sink_sync: Option<Arc<SinkSyncCoordinator>>,
    /// Sink ids whose WebRTC sender requested cleanup; drained by the
    /// reconciler at the start of each apply cycle.
    cleanup_requests: Arc<Mutex<Vec<String>>>,
    stopped: AtomicBool,
}

impl AudioEngine {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let clocks = Arc::new(ClockManager::new(config.tuning.chunk_size_bytes));
        let timeshift = TimeshiftManager::new(TimeshiftConfig::from(&config.tuning));
        let paced = PacedDispatcher::new(
            Arc::clone(&clocks),
            Arc::clone(&timeshift) as Arc<dyn PacketDispatch>,
        );
        let sink_sync = config
            .tuning
            .enable_multi_sink_sync
            .then(|| SinkSyncCoordinator::new(SyncConfig::from(&config.tuning)));

        Arc::new(Self {
            config,
            clocks,
            timeshift,
            paced,
            rtp_sessions: RtpSessionTable::new(),
            receivers: Mutex::new(Vec::new()),
            sap: Mutex::new(None),
            processors: DashMap::new(),
            sinks: DashMap::new(),
            sink_sync,
            cleanup_requests: Arc::new(Mutex::new(Vec::new())),
            stopped: AtomicBool::new(false),
        })
    }

    /// Starts the dispatch loop and all configured receivers.
    pub fn start(&self) -> RouteResult<()> {
        self.timeshift.start();

        let mut receivers = self.receivers.lock();
        if let Some(port) = self.config.scream_port {
            let receiver = UdpReceiver::new(
                ReceiverConfig {
                    bind_addr: SocketAddr::new(self.config.bind_ip, port),
                    multicast_group: None,
                },
                Arc::new(ScreamParser),
                Arc::clone(&self.paced) as Arc<dyn PacketDispatch>,
            );
            receiver.start()?;
            receivers.push(receiver);
        }
        if let Some(port) = self.config.per_process_port {
            let receiver = UdpReceiver::new(
                ReceiverConfig {
                    bind_addr: SocketAddr::new(self.config.bind_ip, port),
                    multicast_group: None,
                },
                Arc::new(PerProcessScreamParser),
                Arc::clone(&self.paced) as Arc<dyn PacketDispatch>,
            );
            receiver.start()?;
            receivers.push(receiver);
        }
        if let Some(port) = self.config.rtp_port {
            let receiver = UdpReceiver::new(
                ReceiverConfig {
                    bind_addr: SocketAddr::new(self.config.bind_ip, port),
                    multicast_group: None,
                },
                Arc::new(RtpParser::new(
                    Arc::clone(&self.rtp_sessions),
                    self.config.tuning.chunk_size_bytes,
                )),
                Arc::clone(&self.timeshift) as Arc<dyn PacketDispatch>,
            );
            receiver.start()?;
            receivers.push(receiver);

            if self.config.sap_enabled {
                let listener = SapListener::new(
                    ReceiverConfig {
                        bind_addr: SocketAddr::new(self.config.bind_ip, SAP_PORT),
                        multicast_group: SAP_MULTICAST_ADDR.parse().ok(),
                    },
                    Arc::clone(&self.rtp_sessions),
                );
                listener.start()?;
                *self.sap.lock() = Some(listener);
            }
        }
        Ok(())
    }

    pub fn tuning(&self) -> &EngineTuning {
        &self.config.tuning
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sinks
    // ─────────────────────────────────────────────────────────────────────

    /// Creates a sink's sender and mixer and starts the mix loop.
    pub async fn add_sink(self: &Arc<Self>, spec: &SinkSpec) -> RouteResult<()> {
        if self.sinks.contains_key(&spec.sink_id) {
            return Err(RouteError::InvalidState(format!(
                "sink '{}' already exists",
                spec.sink_id
            )));
        }
        let format = spec.output_format();
        format.validate()?;

        let mut webrtc = None;
        let mut rtp: Option<Arc<RtpSender>> = None;
        let sender: Arc<dyn NetworkSender> = match spec.protocol {
            SinkProtocol::LegacyScream => {
                let dest = self.sink_dest(spec)?;
                Arc::new(ScreamSender::new(dest, &format))
            }
            SinkProtocol::Rtp | SinkProtocol::SipManaged => {
                let dest = self.sink_dest(spec)?;
                let sender = Arc::new(RtpSender::new(
                    dest,
                    RTP_DEFAULT_PCM_PAYLOAD_TYPE,
                    spec.mp3_payload_type,
                ));
                rtp = Some(Arc::clone(&sender));
                sender
            }
            SinkProtocol::Webrtc => {
                if format.sample_rate != crate::protocol_constants::OPUS_SAMPLE_RATE {
                    return Err(RouteError::InvalidState(format!(
                        "WebRTC sink '{}' must run at 48000 Hz",
                        spec.sink_id
                    )));
                }
                let sender = Arc::new(
                    WebRtcSender::new(
                        spec.sink_id.clone(),
                        spec.channels,
                        self.config.tuning.webrtc_multichannel_enabled,
                        self.webrtc_callbacks(&spec.sink_id),
                    )
                    .await?,
                );
                webrtc = Some(Arc::clone(&sender));
                sender
            }
        };
        sender.setup().await?;

        let frames_per_chunk = self.config.tuning.chunk_size_bytes / format.bytes_per_frame();
        let mixer = Arc::new(SinkMixer::new(
            MixerConfig::from_tuning(
                spec.sink_id.clone(),
                format,
                frames_per_chunk,
                spec.mp3_enabled,
                &self.config.tuning,
            ),
            Arc::clone(&sender),
            self.sink_sync.clone(),
        ));
        mixer.start();

        // MP3 side stream: drain the broadcast queue into the RTP sender,
        // which applies the sink's MP3 payload type and per-frame marker
        let mp3_tasks = TaskTracker::new();
        match (mixer.mp3_stream(), rtp) {
            (Some(queue), Some(rtp)) => {
                let sink_id = spec.sink_id.clone();
                mp3_tasks.spawn(async move {
                    log::info!("[Engine] MP3 side stream active for sink '{sink_id}'");
                    while let Some(frame) = queue.pop().await {
                        if let Err(err) = rtp.send_mp3_frame(&frame).await {
                            log::debug!("[Engine] {sink_id}: MP3 send failed: {err}");
                        }
                    }
                });
            }
            (Some(_), None) => {
                // Non-RTP sinks have no wire transport for the side stream;
                // the queue stays reachable through `mp3_stream`
                log::info!(
                    "[Engine] Sink '{}' has MP3 enabled without an RTP                      transport; the stream is consumer-driven",
                    spec.sink_id
                );
            }
            _ => {}
        }
        mp3_tasks.close();

        log::info!(
            "[Engine] Added sink '{}' ({:?}, {format})",
            spec.sink_id,
            spec.protocol
        );
        self.sinks.insert(
            spec.sink_id.clone(),
            SinkEntry {
                mixer,
                sender,
                webrtc,
                mp3_tasks,
            },
        );
        Ok(())
    }

    /// Stops a sink's mixer, then closes its sender. After return no
    /// further `send_payload` is invoked on the sender.
    pub async fn remove_sink(&self, sink_id: &str) -> RouteResult<()> {
        let (_, entry) = self
            .sinks
            .remove(sink_id)
            .ok_or_else(|| RouteError::SinkNotFound(sink_id.to_string()))?;
        entry.mixer.stop().await;
        if let Some(queue) = entry.mixer.mp3_stream() {
            queue.stop();
        }
        entry.mp3_tasks.wait().await;
        entry.sender.close().await;
        log::info!("[Engine] Removed sink '{sink_id}'");
        Ok(())
    }

    /// Installs the embedder's MP3 encoder on a sink with MP3 enabled.
    ///
    /// The codec itself is outside the engine; once installed, the mixer
    /// feeds it every tick and the sink's transport drains the resulting
    /// frames.
    pub fn install_mp3_encoder(
        &self,
        sink_id: &str,
        encoder: Box<dyn Mp3Encoder>,
    ) -> RouteResult<()> {
        let sink = self
            .sinks
            .get(sink_id)
            .ok_or_else(|| RouteError::SinkNotFound(sink_id.to_string()))?;
        if sink.mixer.mp3_stream().is_none() {
            return Err(RouteError::InvalidState(format!(
                "sink '{sink_id}' does not have MP3 enabled"
            )));
        }
        sink.mixer.set_mp3_encoder(encoder);
        Ok(())
    }

    /// The MP3 broadcast queue of a sink, for embedder-driven consumption
    /// on sinks whose wire protocol does not carry the side stream.
    pub fn mp3_stream(
        &self,
        sink_id: &str,
    ) -> RouteResult<Arc<crate::queue::BoundedQueue<Bytes>>> {
        let sink = self
            .sinks
            .get(sink_id)
            .ok_or_else(|| RouteError::SinkNotFound(sink_id.to_string()))?;
        sink.mixer.mp3_stream().ok_or_else(|| {
            RouteError::InvalidState(format!("sink '{sink_id}' does not have MP3 enabled"))
        })
    }

    fn sink_dest(&self, spec: &SinkSpec) -> RouteResult<SocketAddr> {
        let ip: IpAddr = spec
            .ip
            .parse()
            .map_err(|_| RouteError::InvalidState(format!("sink '{}': bad ip", spec.sink_id)))?;
        Ok(SocketAddr::new(ip, spec.port))
    }

    fn webrtc_callbacks(self: &Arc<Self>, sink_id: &str) -> WebRtcSenderCallbacks {
        let requests = Arc::clone(&self.cleanup_requests);
        let id_for_sdp = sink_id.to_string();
        let id_for_ice = sink_id.to_string();
        WebRtcSenderCallbacks {
            // Signaling strings also surface through the control API reply;
            // these callbacks are the push-style channel for embedders
            on_local_description: Box::new(move |sdp| {
                log::debug!("[Engine] {id_for_sdp}: local description ({} bytes)", sdp.len());
            }),
            on_ice_candidate: Box::new(move |candidate, mid| {
                log::debug!("[Engine] {id_for_ice}: ICE candidate mid={mid}: {candidate}");
            }),
            on_cleanup_request: Box::new(move |sink_id| {
                requests.lock().push(sink_id);
            }),
        }
    }

    /// Applies a remote WebRTC offer to a sink and returns the local answer.
    pub async fn handle_webrtc_offer(&self, sink_id: &str, offer: String) -> RouteResult<String> {
        let sender = self
            .sinks
            .get(sink_id)
            .ok_or_else(|| RouteError::SinkNotFound(sink_id.to_string()))?
            .webrtc
            .clone()
            .ok_or_else(|| {
                RouteError::InvalidRequest(format!("sink '{sink_id}' is not a WebRTC sink"))
            })?;
        sender.handle_remote_offer(offer).await
    }

    /// Sink ids whose senders asked to be reaped; drained by the reconciler.
    pub fn drain_cleanup_requests(&self) -> Vec<String> {
        std::mem::take(&mut *self.cleanup_requests.lock())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Source paths
    // ─────────────────────────────────────────────────────────────────────

    /// Creates a processor for a path and registers it with the timeshift
    /// manager. Returns the minted instance id.
    ///
    /// `frames_per_chunk` is dictated by the target sink's wire format; the
    /// caller (reconciler) computes it from the desired sink spec so a path
    /// can be created before its sink exists.
    pub fn add_source_path(
        self: &Arc<Self>,
        spec: &SourcePathSpec,
        frames_per_chunk: usize,
    ) -> RouteResult<String> {
        if self.processors.contains_key(&spec.path_id) {
            return Err(RouteError::InvalidState(format!(
                "source path '{}' already exists",
                spec.path_id
            )));
        }

        let instance_id = uuid::Uuid::new_v4().to_string();
        let input_queue = Arc::new(BoundedQueue::new(PROCESSOR_QUEUE_CAPACITY));
        let output_queue = Arc::new(BoundedQueue::new(MIXER_QUEUE_CAPACITY));

        let processor = Arc::new(SourceProcessor::spawn(
            ProcessorConfig {
                instance_id: instance_id.clone(),
                spec: spec.clone(),
                frames_per_chunk,
                volume_smoothing_factor: self.config.tuning.volume_smoothing_factor,
            },
            Arc::clone(&input_queue),
            Arc::clone(&output_queue),
            Arc::downgrade(&self.timeshift),
        ));

        self.timeshift.register_processor(
            &instance_id,
            &spec.source_tag,
            Arc::clone(&input_queue),
            spec.delay_ms as f64,
            spec.timeshift_sec as f64,
        );

        log::info!(
            "[Engine] Added source path '{}' ({} -> {}), instance {instance_id}",
            spec.path_id,
            spec.source_tag,
            spec.target_sink_id
        );
        self.processors.insert(
            spec.path_id.clone(),
            ProcessorEntry {
                processor,
                output_queue,
                input_queue,
                target_sink_id: spec.target_sink_id.clone(),
            },
        );
        Ok(instance_id)
    }

    /// Unregisters, stops and removes a path's processor.
    pub async fn remove_source_path(&self, path_id: &str) -> RouteResult<()> {
        let (_, entry) = self
            .processors
            .remove(path_id)
            .ok_or_else(|| RouteError::PathNotFound(path_id.to_string()))?;

        if let Some(sink) = self.sinks.get(&entry.target_sink_id) {
            sink.mixer.disconnect(path_id);
        }
        self.timeshift.unregister_processor(
            entry.processor.instance_id(),
            entry.processor.source_tag(),
        );
        entry.input_queue.stop();
        entry.processor.stop().await;
        log::info!("[Engine] Removed source path '{path_id}'");
        Ok(())
    }

    /// Pushes a parameter update to a running processor.
    pub fn update_source_path(
        &self,
        path_id: &str,
        updates: SourceParameterUpdates,
    ) -> RouteResult<()> {
        let entry = self
            .processors
            .get(path_id)
            .ok_or_else(|| RouteError::PathNotFound(path_id.to_string()))?;
        entry.processor.send_update(updates);
        Ok(())
    }

    /// Instance id of a live path, if any.
    pub fn path_instance_id(&self, path_id: &str) -> Option<String> {
        self.processors
            .get(path_id)
            .map(|e| e.processor.instance_id().to_string())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Connections
    // ─────────────────────────────────────────────────────────────────────

    /// Attaches a path's output to a sink's mixer. Idempotent. A path only
    /// ever feeds its target sink; its output queue has one consumer.
    pub fn connect(&self, path_id: &str, sink_id: &str) -> RouteResult<()> {
        let entry = self
            .processors
            .get(path_id)
            .ok_or_else(|| RouteError::PathNotFound(path_id.to_string()))?;
        if entry.target_sink_id != sink_id {
            return Err(RouteError::InvalidState(format!(
                "path '{path_id}' targets sink '{}', not '{sink_id}'",
                entry.target_sink_id
            )));
        }
        let sink = self
            .sinks
            .get(sink_id)
            .ok_or_else(|| RouteError::SinkNotFound(sink_id.to_string()))?;
        sink.mixer.connect(path_id, Arc::clone(&entry.output_queue));
        Ok(())
    }

    /// Detaches a path from a sink's mixer.
    pub fn disconnect(&self, path_id: &str, sink_id: &str) -> RouteResult<()> {
        let sink = self
            .sinks
            .get(sink_id)
            .ok_or_else(|| RouteError::SinkNotFound(sink_id.to_string()))?;
        sink.mixer.disconnect(path_id);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Introspection / shutdown
    // ─────────────────────────────────────────────────────────────────────

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            receivers: self.receivers.lock().iter().map(|r| r.stats()).collect(),
            streams: self.timeshift.stats(),
            sinks: self.sinks.iter().map(|s| s.mixer.stats()).collect(),
        }
    }

    /// Full teardown in reverse dependency order. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("[Engine] Stopping");

        // Sinks first: no further sends once mixers stop
        let sink_ids: Vec<String> = self.sinks.iter().map(|e| e.key().clone()).collect();
        for sink_id in sink_ids {
            if let Some((_, entry)) = self.sinks.remove(&sink_id) {
                entry.mixer.stop().await;
                if let Some(queue) = entry.mixer.mp3_stream() {
                    queue.stop();
                }
                entry.mp3_tasks.wait().await;
                entry.sender.close().await;
            }
        }

        // Processors
        let path_ids: Vec<String> = self.processors.iter().map(|e| e.key().clone()).collect();
        for path_id in path_ids {
            if let Some((_, entry)) = self.processors.remove(&path_id) {
                self.timeshift.unregister_processor(
                    entry.processor.instance_id(),
                    entry.processor.source_tag(),
                );
                entry.input_queue.stop();
                entry.processor.stop().await;
            }
        }

        self.timeshift.stop().await;
        self.paced.stop().await;
        self.clocks.stop().await;

        // Guards must not live across await points
        let receivers: Vec<UdpReceiver> = std::mem::take(&mut *self.receivers.lock());
        futures::future::join_all(receivers.iter().map(|r| r.stop())).await;
        let sap = self.sap.lock().take();
        if let Some(sap) = sap {
            sap.stop().await;
        }
        log::info!("[Engine] Stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_constants::EQ_BANDS;
    use std::collections::HashMap;

    fn test_engine() -> Arc<AudioEngine> {
        AudioEngine::new(EngineConfig {
            tuning: EngineTuning::default(),
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            scream_port: None,
            per_process_port: None,
            rtp_port: None,
            sap_enabled: false,
        })
    }

    fn sink_spec(id: &str) -> SinkSpec {
        SinkSpec {
            sink_id: id.into(),
            protocol: SinkProtocol::LegacyScream,
            ip: "127.0.0.1".into(),
            port: 14010,
            samplerate: 48000,
            bitdepth: 16,
            channels: 2,
            chlayout1: 0,
            chlayout2: 0,
            mp3_enabled: false,
            mp3_payload_type: 14,
            connected_source_path_ids: vec![],
        }
    }

    fn path_spec(id: &str, sink: &str) -> SourcePathSpec {
        SourcePathSpec {
            path_id: id.into(),
            source_tag: "10.0.0.1      ".into(),
            target_sink_id: sink.into(),
            volume: 1.0,
            eq_values: [1.0; EQ_BANDS],
            eq_normalization: false,
            volume_normalization: false,
            delay_ms: 0,
            timeshift_sec: 0.0,
            speaker_layouts_map: HashMap::new(),
            target_output_channels: 2,
            target_output_samplerate: 48000,
        }
    }

    #[tokio::test]
    async fn sink_and_path_lifecycle() {
        let engine = test_engine();
        engine.start().unwrap();

        engine.add_sink(&sink_spec("s1")).await.unwrap();
        assert!(engine.add_sink(&sink_spec("s1")).await.is_err(), "dup sink");

        let instance = engine.add_source_path(&path_spec("p1", "s1"), 288).unwrap();
        assert_eq!(engine.path_instance_id("p1").unwrap(), instance);
        engine.connect("p1", "s1").unwrap();

        assert_eq!(engine.stats().sinks.len(), 1);
        assert_eq!(engine.stats().sinks[0].connected_paths, 1);

        engine.remove_source_path("p1").await.unwrap();
        assert!(engine.remove_source_path("p1").await.is_err());
        engine.remove_sink("s1").await.unwrap();

        engine.stop().await;
        engine.stop().await; // idempotent
    }

    #[tokio::test]
    async fn connect_requires_both_ends() {
        let engine = test_engine();
        engine.start().unwrap();
        engine.add_sink(&sink_spec("s1")).await.unwrap();

        assert!(matches!(
            engine.connect("nope", "s1"),
            Err(RouteError::PathNotFound(_))
        ));
        engine.add_source_path(&path_spec("p1", "s1"), 288).unwrap();
        assert!(matches!(
            engine.connect("p1", "nope"),
            Err(RouteError::SinkNotFound(_))
        ));
        engine.stop().await;
    }

    #[tokio::test]
    async fn mp3_side_stream_rides_the_rtp_sender() {
        use crate::format::AudioFormat;
        use tokio::net::UdpSocket;
        use tokio::time::{timeout, Duration};

        /// Encoder double: one recognizable frame per mixed chunk.
        struct FixedFrameEncoder;
        impl Mp3Encoder for FixedFrameEncoder {
            fn encode(&mut self, _pcm: &[i32], _format: &AudioFormat) -> Vec<Bytes> {
                vec![Bytes::from_static(&[0xFF, 0xFB, 0x90, 0x00, 0xAA, 0xBB])]
            }
        }

        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = listener.local_addr().unwrap();

        let engine = test_engine();
        engine.start().unwrap();
        let mut spec = sink_spec("mp3-sink");
        spec.protocol = SinkProtocol::Rtp;
        spec.ip = "127.0.0.1".into();
        spec.port = dest.port();
        spec.mp3_enabled = true;
        spec.mp3_payload_type = 99;
        engine.add_sink(&spec).await.unwrap();
        engine
            .install_mp3_encoder("mp3-sink", Box::new(FixedFrameEncoder))
            .unwrap();

        // The mixer ticks on its own (silence); every tick feeds the
        // encoder, whose frames must egress under the MP3 payload type
        // with the marker bit set
        let mut buf = vec![0u8; 4096];
        let found = timeout(Duration::from_secs(2), async {
            loop {
                let (len, _) = listener.recv_from(&mut buf).await.unwrap();
                let packet = rtp_rs::RtpReader::new(&buf[..len]).unwrap();
                if packet.payload_type() == 99 {
                    assert!(packet.mark(), "frame start must carry the marker");
                    assert_eq!(&packet.payload()[..2], &[0xFF, 0xFB]);
                    break;
                }
            }
        })
        .await;
        assert!(found.is_ok(), "MP3 frames must egress over RTP");

        engine.stop().await;
    }

    #[tokio::test]
    async fn mp3_hooks_require_an_mp3_sink() {
        struct NopEncoder;
        impl Mp3Encoder for NopEncoder {
            fn encode(&mut self, _pcm: &[i32], _format: &crate::format::AudioFormat) -> Vec<Bytes> {
                Vec::new()
            }
        }

        let engine = test_engine();
        engine.start().unwrap();
        engine.add_sink(&sink_spec("plain")).await.unwrap();

        assert!(engine
            .install_mp3_encoder("missing", Box::new(NopEncoder))
            .is_err());
        assert!(engine
            .install_mp3_encoder("plain", Box::new(NopEncoder))
            .is_err(), "mp3 disabled on this sink");
        assert!(engine.mp3_stream("plain").is_err());

        engine.stop().await;
    }

    #[tokio::test]
    async fn webrtc_sink_requires_48k() {
        let engine = test_engine();
        let mut spec = sink_spec("w1");
        spec.protocol = SinkProtocol::Webrtc;
        spec.samplerate = 44100;
        assert!(engine.add_sink(&spec).await.is_err());
        engine.stop().await;
    }
}
