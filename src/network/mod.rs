//! Network subsystem
//!
//! The mixing engine never touches sockets. Outbound packets go through a
//! [`Transport`] registered per member; inbound datagrams are handed to
//! [`Conference::receive`](crate::conference::Conference::receive) by
//! whatever owns the socket, normally [`udp::UdpTransport`].

pub mod udp;

pub use udp::UdpTransport;

use bytes::Bytes;
use dashmap::DashMap;

use crate::conference::CallId;
use crate::error::NetworkError;

/// Outbound packet delivery for members
pub trait Transport: Send + Sync {
    /// Send one RTP packet to a member
    fn send(&self, call_id: &CallId, packet: Bytes) -> Result<(), NetworkError>;

    /// Send a comfort noise packet, marking the start of a silence period
    fn send_comfort_noise(&self, call_id: &CallId, packet: Bytes) -> Result<(), NetworkError>;
}

/// Per-member packet encryption
pub trait PacketCipher: Send + Sync {
    fn encrypt(&self, packet: &[u8]) -> Result<Vec<u8>, NetworkError>;

    fn decrypt(&self, packet: &[u8]) -> Result<Vec<u8>, NetworkError>;
}

/// Packets sent to one call
#[derive(Debug, Clone, Default)]
pub struct SentPackets {
    pub media: Vec<Bytes>,
    pub comfort_noise: Vec<Bytes>,
}

/// Transport that keeps packets in memory, for loopback use and tests
#[derive(Default)]
pub struct MemoryTransport {
    sent: DashMap<CallId, SentPackets>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take everything sent to `call_id` so far
    pub fn take(&self, call_id: &CallId) -> SentPackets {
        self.sent
            .get_mut(call_id)
            .map(|mut sent| std::mem::take(&mut *sent))
            .unwrap_or_default()
    }

    pub fn media_count(&self, call_id: &CallId) -> usize {
        self.sent.get(call_id).map(|s| s.media.len()).unwrap_or(0)
    }

    pub fn comfort_noise_count(&self, call_id: &CallId) -> usize {
        self.sent.get(call_id).map(|s| s.comfort_noise.len()).unwrap_or(0)
    }
}

impl Transport for MemoryTransport {
    fn send(&self, call_id: &CallId, packet: Bytes) -> Result<(), NetworkError> {
        self.sent.entry(call_id.clone()).or_default().media.push(packet);
        Ok(())
    }

    fn send_comfort_noise(&self, call_id: &CallId, packet: Bytes) -> Result<(), NetworkError> {
        self.sent
            .entry(call_id.clone())
            .or_default()
            .comfort_noise
            .push(packet);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_transport_take() {
        let transport = MemoryTransport::new();
        let a = CallId::from("a");
        transport.send(&a, Bytes::from_static(b"x")).unwrap();
        transport.send_comfort_noise(&a, Bytes::from_static(b"cn")).unwrap();
        assert_eq!(transport.media_count(&a), 1);

        let sent = transport.take(&a);
        assert_eq!(sent.media.len(), 1);
        assert_eq!(sent.comfort_noise.len(), 1);
        assert_eq!(transport.media_count(&a), 0);
        assert!(transport.take(&CallId::from("b")).media.is_empty());
    }
}
