//! UDP transport
//!
//! One socket carries RTP for every member. Inbound datagrams are routed
//! by remote address to the member registered for it; outbound packets
//! are sent to the address registered for the call.

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::Transport;
use crate::conference::{CallId, ConferenceRegistry};
use crate::config::NetworkConfig;
use crate::constants::MAX_PACKET_SIZE;
use crate::error::NetworkError;

#[derive(Debug, Clone)]
struct Route {
    conference: String,
    call_id: CallId,
}

#[derive(Debug, Default)]
struct UdpCounters {
    received: AtomicU64,
    unrouted: AtomicU64,
    sent: AtomicU64,
    send_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct UdpStats {
    pub received: u64,
    pub unrouted: u64,
    pub sent: u64,
    pub send_errors: u64,
}

pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    routes: DashMap<SocketAddr, Route>,
    addresses: DashMap<CallId, SocketAddr>,
    should_close: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    counters: UdpCounters,
}

impl UdpTransport {
    /// Bind the RTP socket
    pub fn bind(config: &NetworkConfig) -> Result<Self, NetworkError> {
        let addr: SocketAddr = format!("{}:{}", config.bind_address, config.rtp_port)
            .parse()
            .map_err(|e| NetworkError::BindFailed(format!("{}: {}", config.bind_address, e)))?;

        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        if let Err(e) = socket.set_recv_buffer_size(config.recv_buffer_size) {
            tracing::warn!("Failed to set receive buffer size: {}. Packets may be lost under load.", e);
        }
        if let Err(e) = socket.set_send_buffer_size(config.send_buffer_size) {
            tracing::warn!("Failed to set send buffer size: {}", e);
        }

        socket
            .bind(&addr.into())
            .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;
        socket
            .set_read_timeout(Some(Duration::from_millis(50)))
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        let socket = UdpSocket::from(socket);
        let local_addr = socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        tracing::info!("RTP socket bound to {}", local_addr);

        Ok(Self {
            socket,
            local_addr,
            routes: DashMap::new(),
            addresses: DashMap::new(),
            should_close: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
            counters: UdpCounters::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Route packets from `addr` to `call_id`, and send its mix there
    pub fn register(&self, conference: &str, call_id: &CallId, addr: SocketAddr) {
        if let Some((_, old)) = self.addresses.remove(call_id) {
            self.routes.remove(&old);
        }
        self.routes.insert(
            addr,
            Route {
                conference: conference.to_string(),
                call_id: call_id.clone(),
            },
        );
        self.addresses.insert(call_id.clone(), addr);
        tracing::debug!("Call {} in {} registered at {}", call_id, conference, addr);
    }

    /// Follow a call into another conference
    pub fn move_call(&self, call_id: &CallId, conference: &str) {
        if let Some(addr) = self.addresses.get(call_id).map(|a| *a) {
            self.register(conference, call_id, addr);
        }
    }

    pub fn unregister(&self, call_id: &CallId) {
        if let Some((_, addr)) = self.addresses.remove(call_id) {
            self.routes.remove(&addr);
            tracing::debug!("Call {} unregistered from {}", call_id, addr);
        }
    }

    /// Start the reader thread feeding `registry`
    pub fn start(self: &Arc<Self>, registry: Arc<ConferenceRegistry>) -> Result<(), NetworkError> {
        let mut reader = self.reader.lock();
        if reader.is_some() {
            return Ok(());
        }

        let transport = self.clone();
        let handle = thread::Builder::new()
            .name("rtp-udp-reader".to_string())
            .spawn(move || {
                transport.run_reader(&registry);
                tracing::debug!("RTP reader thread stopped");
            })
            .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;
        *reader = Some(handle);
        Ok(())
    }

    fn run_reader(&self, registry: &ConferenceRegistry) {
        let mut buffer = BytesMut::zeroed(65536);

        while !self.should_close.load(Ordering::Relaxed) {
            let (len, from) = match self.socket.recv_from(&mut buffer) {
                Ok(received) => received,
                Err(e) => match e.kind() {
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => continue,
                    _ => {
                        tracing::error!("Error while receiving UDP packet: {}", e);
                        continue;
                    }
                },
            };
            self.counters.received.fetch_add(1, Ordering::Relaxed);

            let Some(route) = self.routes.get(&from).map(|r| r.clone()) else {
                let unrouted = self.counters.unrouted.fetch_add(1, Ordering::Relaxed);
                if unrouted % 1000 == 0 {
                    tracing::debug!("Packet from unknown address {}", from);
                }
                continue;
            };

            let delivered = registry
                .find(&route.conference)
                .and_then(|c| c.receive(&route.call_id, &buffer[..len]));
            if let Err(e) = delivered {
                tracing::debug!("Dropping packet for {}: {}", route.call_id, e);
            }
        }
    }

    pub fn stop(&self) {
        self.should_close.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn stats(&self) -> UdpStats {
        UdpStats {
            received: self.counters.received.load(Ordering::Relaxed),
            unrouted: self.counters.unrouted.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
            send_errors: self.counters.send_errors.load(Ordering::Relaxed),
        }
    }

    fn send_to(&self, call_id: &CallId, packet: &[u8]) -> Result<(), NetworkError> {
        if packet.len() > MAX_PACKET_SIZE {
            return Err(NetworkError::PacketTooLarge(packet.len()));
        }
        let addr = self
            .addresses
            .get(call_id)
            .map(|a| *a)
            .ok_or_else(|| NetworkError::NotRegistered(call_id.to_string()))?;

        match self.socket.send_to(packet, addr) {
            Ok(_) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(NetworkError::SendFailed(format!("{}: {}", addr, e)))
            }
        }
    }
}

impl Transport for UdpTransport {
    fn send(&self, call_id: &CallId, packet: Bytes) -> Result<(), NetworkError> {
        self.send_to(call_id, &packet)
    }

    fn send_comfort_noise(&self, call_id: &CallId, packet: Bytes) -> Result<(), NetworkError> {
        self.send_to(call_id, &packet)
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.should_close.store(true, Ordering::Relaxed);
    }
}
