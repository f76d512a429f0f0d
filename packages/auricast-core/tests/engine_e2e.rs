//! End-to-end pipeline tests over real UDP sockets.
//!
//! These drive the whole chain - Scream ingest, pacing, timeshift, DSP,
//! mixing, egress - with a live engine on loopback.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use auricast_core::{
    AudioEngine, DesiredEngineState, EngineConfig, EngineTuning, Reconciler, SinkProtocol,
    SinkSpec, SourcePathSpec,
};
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Grabs a free UDP port on loopback.
async fn free_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.local_addr().unwrap().port()
}

fn sink_spec(id: &str, port: u16, paths: &[&str]) -> SinkSpec {
    SinkSpec {
        sink_id: id.into(),
        protocol: SinkProtocol::LegacyScream,
        ip: "127.0.0.1".into(),
        port,
        samplerate: 48000,
        bitdepth: 16,
        channels: 2,
        chlayout1: 0,
        chlayout2: 0,
        mp3_enabled: false,
        mp3_payload_type: 14,
        connected_source_path_ids: paths.iter().map(|s| s.to_string()).collect(),
    }
}

fn path_spec(id: &str, source_tag: &str, sink: &str) -> SourcePathSpec {
    SourcePathSpec {
        path_id: id.into(),
        source_tag: source_tag.into(),
        target_sink_id: sink.into(),
        volume: 1.0,
        eq_values: [1.0; 18],
        eq_normalization: false,
        volume_normalization: false,
        delay_ms: 0,
        timeshift_sec: 0.0,
        speaker_layouts_map: HashMap::new(),
        target_output_channels: 2,
        target_output_samplerate: 48000,
    }
}

async fn start_engine(scream_port: u16) -> Arc<AudioEngine> {
    let engine = AudioEngine::new(EngineConfig {
        tuning: EngineTuning::default(),
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        scream_port: Some(scream_port),
        per_process_port: None,
        rtp_port: None,
        sap_enabled: false,
    });
    engine.start().unwrap();
    engine
}

/// Scream loopback: a 48kHz/16-bit/stereo packet ingested on the Scream
/// port egresses to the sink byte-identical, header included.
#[tokio::test]
async fn scream_loopback_preserves_header_and_payload() {
    let ingest_port = free_port().await;
    let egress = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let egress_port = egress.local_addr().unwrap().port();

    let engine = start_engine(ingest_port).await;
    let reconciler = Reconciler::new(Arc::clone(&engine));

    // Loopback sender's tag: loopback IP padded to 15 chars
    let report = reconciler
        .apply_state(DesiredEngineState {
            sinks: vec![sink_spec("out", egress_port, &["p1"])],
            source_paths: vec![path_spec("p1", "127.0.0.1      ", "out")],
        })
        .await
        .unwrap();
    assert!(report.ops.iter().all(|op| op.success), "{:?}", report.ops);

    // Inject a known vector: header [0x01, 16, 2, 0, 0] + 1152 bytes of
    // alternating 0x00 0x01
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut datagram = vec![0u8; 1157];
    datagram[..5].copy_from_slice(&[0x01, 16, 2, 0x00, 0x00]);
    for (i, byte) in datagram[5..].iter_mut().enumerate() {
        *byte = (i % 2) as u8;
    }
    sender
        .send_to(&datagram, ("127.0.0.1", ingest_port))
        .await
        .unwrap();

    // The mixer emits continuously (silence around our payload); hunt for
    // the packet carrying the injected bytes
    let expected_payload = &datagram[5..];
    let mut buf = vec![0u8; 2048];
    let found = timeout(Duration::from_secs(1), async {
        loop {
            let (len, _) = egress.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 1157, "egress must be whole Scream datagrams");
            assert_eq!(
                &buf[..5],
                &datagram[..5],
                "egress header must decode to the sink format"
            );
            if &buf[5..len] == expected_payload {
                break;
            }
        }
    })
    .await;
    assert!(found.is_ok(), "loopback packet did not egress within 1s");

    engine.stop().await;
}

/// Removing one sink stops its egress while the other keeps flowing.
#[tokio::test]
async fn sink_removal_stops_only_that_sink() {
    let ingest_port = free_port().await;
    let egress_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let egress_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port_a = egress_a.local_addr().unwrap().port();
    let port_b = egress_b.local_addr().unwrap().port();

    let engine = start_engine(ingest_port).await;
    let reconciler = Reconciler::new(Arc::clone(&engine));

    reconciler
        .apply_state(DesiredEngineState {
            sinks: vec![
                sink_spec("a", port_a, &["pa"]),
                sink_spec("b", port_b, &["pb"]),
            ],
            source_paths: vec![
                path_spec("pa", "127.0.0.1      ", "a"),
                path_spec("pb", "127.0.0.1      ", "b"),
            ],
        })
        .await
        .unwrap();

    // Feed the source so both sinks are live
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut datagram = vec![1u8; 1157];
    datagram[..5].copy_from_slice(&[0x01, 16, 2, 0, 0]);
    sender
        .send_to(&datagram, ("127.0.0.1", ingest_port))
        .await
        .unwrap();

    let mut buf = vec![0u8; 2048];
    timeout(Duration::from_secs(1), egress_b.recv_from(&mut buf))
        .await
        .expect("sink b should emit before removal")
        .unwrap();

    // Drop sink b; after apply returns its sender sees no further payloads
    reconciler
        .apply_state(DesiredEngineState {
            sinks: vec![sink_spec("a", port_a, &["pa"])],
            source_paths: vec![
                path_spec("pa", "127.0.0.1      ", "a"),
                path_spec("pb", "127.0.0.1      ", "b"),
            ],
        })
        .await
        .unwrap();

    // Drain whatever was already in flight, then expect silence on b
    while timeout(Duration::from_millis(100), egress_b.recv_from(&mut buf))
        .await
        .is_ok()
    {}
    let after = timeout(Duration::from_millis(300), egress_b.recv_from(&mut buf)).await;
    assert!(after.is_err(), "sink b must stop transmitting after removal");

    // Sink a is uninterrupted
    timeout(Duration::from_secs(1), egress_a.recv_from(&mut buf))
        .await
        .expect("sink a must keep transmitting")
        .unwrap();

    engine.stop().await;
}

/// After a full stop the engine holds no sockets: the ingest port can be
/// rebound immediately.
#[tokio::test]
async fn stop_releases_all_sockets() {
    let ingest_port = free_port().await;
    let engine = start_engine(ingest_port).await;
    engine.stop().await;

    let rebind = UdpSocket::bind(("127.0.0.1", ingest_port)).await;
    assert!(rebind.is_ok(), "ingest port must be free after stop");
}
