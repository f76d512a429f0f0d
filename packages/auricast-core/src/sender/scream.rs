//! Legacy Scream UDP sender: 5-byte format header + PCM payload.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;

use crate::format::AudioFormat;
use crate::packet::encode_scream_header;
use crate::protocol_constants::SCREAM_HEADER_SIZE;

use super::{NetworkSender, SenderError, WirePayload};

/// Stateless datagram sender with a precomputed header.
pub struct ScreamSender {
    dest: SocketAddr,
    header: [u8; SCREAM_HEADER_SIZE],
    socket: Mutex<Option<Arc<UdpSocket>>>,
    closed: AtomicBool,
}

impl ScreamSender {
    pub fn new(dest: SocketAddr, format: &AudioFormat) -> Self {
        Self {
            dest,
            header: encode_scream_header(format),
            socket: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, SenderError> {
        if self.is_closed() {
            return Err(SenderError::Closed);
        }
        self.socket
            .lock()
            .clone()
            .ok_or_else(|| SenderError::Socket("not set up".into()))
    }
}

#[async_trait]
impl NetworkSender for ScreamSender {
    async fn setup(&self) -> Result<(), SenderError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| SenderError::Socket(e.to_string()))?;
        socket
            .connect(self.dest)
            .await
            .map_err(|e| SenderError::Socket(e.to_string()))?;
        *self.socket.lock() = Some(Arc::new(socket));
        log::info!("[ScreamSender] Sending to {}", self.dest);
        Ok(())
    }

    async fn send_payload(&self, payload: WirePayload<'_>) -> Result<(), SenderError> {
        // Scream carries no timestamps and no CSRCs
        let socket = self.socket()?;
        let mut datagram = Vec::with_capacity(SCREAM_HEADER_SIZE + payload.bytes.len());
        datagram.extend_from_slice(&self.header);
        datagram.extend_from_slice(payload.bytes);
        socket
            .send(&datagram)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::parse_scream_header;

    #[tokio::test]
    async fn datagram_carries_decodable_header_and_payload() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = receiver.local_addr().unwrap();

        let format = AudioFormat::new(48000, 2, 16);
        let sender = ScreamSender::new(dest, &format);
        sender.setup().await.unwrap();

        let payload_bytes: Vec<u8> = (0..1152).map(|i| (i % 2) as u8).collect();
        sender
            .send_payload(WirePayload {
                bytes: &payload_bytes,
                pcm: &[],
                format,
                csrcs: &[],
            })
            .await
            .unwrap();

        let mut buf = vec![0u8; 2048];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, 1157);

        // Property: header bytes decode back to the sink's configured format
        let decoded = parse_scream_header(&buf[..5]).unwrap();
        assert_eq!(decoded, format);
        assert_eq!(&buf[5..len], &payload_bytes[..]);
    }

    #[tokio::test]
    async fn closed_sender_rejects_payloads() {
        let format = AudioFormat::new(48000, 2, 16);
        let sender = ScreamSender::new("127.0.0.1:9".parse().unwrap(), &format);
        sender.setup().await.unwrap();
        sender.close().await;
        sender.close().await; // idempotent

        assert!(sender.is_closed());
        let result = sender
            .send_payload(WirePayload {
                bytes: &[0u8; 4],
                pcm: &[],
                format,
                csrcs: &[],
            })
            .await;
        assert!(matches!(result, Err(SenderError::Closed)));
    }
}
