//! UDP ingest.
//!
//! All three wire variants (Scream, per-process Scream, RTP) share one
//! receive loop that owns the socket, applies the variant's fixed-size gate,
//! and hands parsed [`TaggedAudioPacket`]s to a [`PacketDispatch`]. Scream
//! variants dispatch through the clock-paced staging stage in
//! [`pacing`]; RTP dispatches straight into the timeshift manager.
//!
//! Socket errors re-open the socket with linear backoff; stream state lives
//! downstream, so senders that reconnect resume transparently.

pub mod pacing;
pub mod per_process;
pub mod rtp;
pub mod scream;

pub use pacing::PacedDispatcher;
pub use per_process::PerProcessScreamParser;
pub use rtp::{RtpParser, RtpSessionTable, SapListener};
pub use scream::ScreamParser;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{RouteError, RouteResult};
use crate::packet::{PacketError, TaggedAudioPacket};
use crate::protocol_constants::{SOCKET_REOPEN_BACKOFF_MAX_MS, SOCKET_REOPEN_BACKOFF_MS};
use crate::stats::ReceiverStats;

/// Downstream of a receiver: either the paced staging stage or the timeshift
/// manager directly.
pub trait PacketDispatch: Send + Sync {
    fn dispatch_ready_packet(&self, packet: TaggedAudioPacket);
}

/// Per-variant wire knowledge: the fixed-size gate and payload parsing.
pub trait DatagramParser: Send + Sync {
    fn name(&self) -> &'static str;

    /// Receive buffer size; must exceed the largest valid datagram.
    fn receive_buffer_size(&self) -> usize {
        2048
    }

    /// Cheap structural gate applied before parsing.
    fn is_valid_packet_structure(&self, datagram: &[u8]) -> bool;

    /// Parses one datagram into zero or more tagged packets.
    ///
    /// Variants that re-chunk (RTP) may buffer internally and emit several
    /// packets, or none, per datagram.
    fn parse(
        &self,
        datagram: &[u8],
        peer: SocketAddr,
        received_time: Instant,
    ) -> Result<Vec<TaggedAudioPacket>, PacketError>;
}

/// Ingest counters, updated lock-free on the receive path.
#[derive(Default)]
pub struct ReceiverCounters {
    pub packets_received: AtomicU64,
    pub packets_malformed: AtomicU64,
    pub socket_reopens: AtomicU64,
}

/// Binds a UDP socket with `SO_REUSEADDR`, optionally joining a multicast
/// group, and hands it to tokio.
pub(crate) fn bind_udp(
    addr: SocketAddr,
    multicast_group: Option<Ipv4Addr>,
) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    if let Some(group) = multicast_group {
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    }
    UdpSocket::from_std(socket.into())
}

/// Configuration of one receiver socket.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub bind_addr: SocketAddr,
    /// Multicast group to join (SAP/RTP variants).
    pub multicast_group: Option<Ipv4Addr>,
}

/// One UDP ingest socket driving a [`DatagramParser`].
pub struct UdpReceiver {
    config: ReceiverConfig,
    parser: Arc<dyn DatagramParser>,
    dispatch: Arc<dyn PacketDispatch>,
    counters: Arc<ReceiverCounters>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl UdpReceiver {
    pub fn new(
        config: ReceiverConfig,
        parser: Arc<dyn DatagramParser>,
        dispatch: Arc<dyn PacketDispatch>,
    ) -> Self {
        Self {
            config,
            parser,
            dispatch,
            counters: Arc::new(ReceiverCounters::default()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Binds the socket and spawns the receive loop.
    ///
    /// Binding happens here (not in the loop) so a bad configuration fails
    /// fast; later socket errors re-open with backoff instead.
    pub fn start(&self) -> RouteResult<()> {
        let socket = bind_udp(self.config.bind_addr, self.config.multicast_group)
            .map_err(|e| {
                RouteError::Network(format!(
                    "bind {} for {} failed: {e}",
                    self.config.bind_addr,
                    self.parser.name()
                ))
            })?;

        log::info!(
            "[Receiver] {} listening on {}",
            self.parser.name(),
            self.config.bind_addr
        );

        let config = self.config.clone();
        let parser = Arc::clone(&self.parser);
        let dispatch = Arc::clone(&self.dispatch);
        let counters = Arc::clone(&self.counters);
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            run_receive_loop(socket, config, parser, dispatch, counters, cancel).await;
        });
        Ok(())
    }

    /// Snapshot of the ingest counters.
    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            name: self.parser.name().to_string(),
            port: self.config.bind_addr.port(),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            packets_malformed: self.counters.packets_malformed.load(Ordering::Relaxed),
            socket_reopens: self.counters.socket_reopens.load(Ordering::Relaxed),
        }
    }

    /// Stops the receive loop and waits for it. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn run_receive_loop(
    socket: UdpSocket,
    config: ReceiverConfig,
    parser: Arc<dyn DatagramParser>,
    dispatch: Arc<dyn PacketDispatch>,
    counters: Arc<ReceiverCounters>,
    cancel: CancellationToken,
) {
    let mut socket = Some(socket);
    let mut reopen_attempts: u64 = 0;
    let mut buf = vec![0u8; parser.receive_buffer_size()];
    // Rate limit for malformed-packet warnings (max one per second)
    let mut last_malformed_warn: Option<Instant> = None;

    'reopen: loop {
        let sock = match socket.take() {
            Some(sock) => sock,
            None => {
                // Linear backoff before re-opening
                reopen_attempts += 1;
                counters.socket_reopens.fetch_add(1, Ordering::Relaxed);
                let delay = Duration::from_millis(
                    (SOCKET_REOPEN_BACKOFF_MS * reopen_attempts).min(SOCKET_REOPEN_BACKOFF_MAX_MS),
                );
                tokio::select! {
                    _ = cancel.cancelled() => break 'reopen,
                    _ = tokio::time::sleep(delay) => {}
                }
                match bind_udp(config.bind_addr, config.multicast_group) {
                    Ok(sock) => {
                        log::info!(
                            "[Receiver] {} re-opened socket on {}",
                            parser.name(),
                            config.bind_addr
                        );
                        reopen_attempts = 0;
                        sock
                    }
                    Err(err) => {
                        log::warn!(
                            "[Receiver] {} re-open failed (attempt {reopen_attempts}): {err}",
                            parser.name()
                        );
                        continue 'reopen;
                    }
                }
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break 'reopen,
                result = sock.recv_from(&mut buf) => match result {
                    Ok((len, peer)) => {
                        counters.packets_received.fetch_add(1, Ordering::Relaxed);
                        handle_datagram(
                            &buf[..len],
                            peer,
                            parser.as_ref(),
                            dispatch.as_ref(),
                            &counters,
                            &mut last_malformed_warn,
                        );
                    }
                    Err(err) => {
                        log::warn!(
                            "[Receiver] {} socket error: {err}; re-opening",
                            parser.name()
                        );
                        continue 'reopen;
                    }
                }
            }
        }
    }
    log::info!("[Receiver] {} stopped", parser.name());
}

fn handle_datagram(
    datagram: &[u8],
    peer: SocketAddr,
    parser: &dyn DatagramParser,
    dispatch: &dyn PacketDispatch,
    counters: &ReceiverCounters,
    last_malformed_warn: &mut Option<Instant>,
) {
    let warn_limited = |last: &mut Option<Instant>, message: &str| {
        let now = Instant::now();
        if last.map_or(true, |t| now.duration_since(t).as_secs() >= 1) {
            log::warn!("[Receiver] {message}");
            *last = Some(now);
        }
    };

    if !parser.is_valid_packet_structure(datagram) {
        counters.packets_malformed.fetch_add(1, Ordering::Relaxed);
        warn_limited(
            last_malformed_warn,
            &format!(
                "{}: dropped malformed datagram of {} bytes from {peer}",
                parser.name(),
                datagram.len()
            ),
        );
        return;
    }

    match parser.parse(datagram, peer, Instant::now()) {
        Ok(packets) => {
            for packet in packets {
                dispatch.dispatch_ready_packet(packet);
            }
        }
        Err(err) => {
            counters.packets_malformed.fetch_add(1, Ordering::Relaxed);
            warn_limited(
                last_malformed_warn,
                &format!("{}: dropped datagram from {peer}: {err}", parser.name()),
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// Dispatch target that records everything it receives.
    #[derive(Default)]
    pub struct RecordingDispatch {
        pub packets: Mutex<Vec<TaggedAudioPacket>>,
    }

    impl PacketDispatch for RecordingDispatch {
        fn dispatch_ready_packet(&self, packet: TaggedAudioPacket) {
            self.packets.lock().push(packet);
        }
    }
}
