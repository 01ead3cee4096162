//! Outbound transport seam
//!
//! The mixer never touches sockets. It asks the transport whether a peer can
//! currently be reached and hands it finished packets. `LoopbackTransport`
//! is the in-process implementation used by the binary's simulated crowd and
//! by tests: it records every packet per destination.

use std::net::SocketAddr;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::net::peer::PeerId;
use crate::net::protocol::{encode, EncodeError, OutboundPacket};

/// Errors surfaced by a transport send
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("No active address for peer {0}")]
    NoActiveAddress(PeerId),
    #[error("Transport closed")]
    Closed,
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Delivery collaborator used by the broadcast scheduler
pub trait Transport: Send + Sync {
    /// Whether `peer` currently has a send address
    fn has_active_address(&self, peer: PeerId) -> bool;

    /// Hand a packet to the transport. Returns the bytes queued.
    fn send(&self, destination: PeerId, packet: OutboundPacket) -> Result<usize, TransportError>;
}

/// A packet captured by the loopback transport
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub packet: OutboundPacket,
    pub bytes: usize,
}

#[derive(Debug, Default)]
struct PeerLink {
    address: Option<SocketAddr>,
    sent: Vec<SentPacket>,
    bytes_sent: u64,
}

/// In-process transport that keeps everything it is given
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    links: RwLock<HashMap<PeerId, PeerLink>>,
    /// Drop recorded packets after this many per peer (0 = unbounded)
    history_limit: usize,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` packets per peer; older ones are discarded
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            links: RwLock::new(HashMap::new()),
            history_limit: limit,
        }
    }

    pub fn set_address(&self, peer: PeerId, address: Option<SocketAddr>) {
        self.links.write().entry(peer).or_default().address = address;
    }

    pub fn forget(&self, peer: PeerId) {
        self.links.write().remove(&peer);
    }

    /// Everything sent to `peer`, oldest first
    pub fn sent_to(&self, peer: PeerId) -> Vec<SentPacket> {
        self.links
            .read()
            .get(&peer)
            .map(|link| link.sent.clone())
            .unwrap_or_default()
    }

    pub fn bytes_sent_to(&self, peer: PeerId) -> u64 {
        self.links.read().get(&peer).map_or(0, |link| link.bytes_sent)
    }

    pub fn clear_history(&self) {
        for link in self.links.write().values_mut() {
            link.sent.clear();
        }
    }
}

impl Transport for LoopbackTransport {
    fn has_active_address(&self, peer: PeerId) -> bool {
        self.links
            .read()
            .get(&peer)
            .is_some_and(|link| link.address.is_some())
    }

    fn send(&self, destination: PeerId, packet: OutboundPacket) -> Result<usize, TransportError> {
        let bytes = encode(&packet)?.len();

        let mut links = self.links.write();
        let link = links
            .get_mut(&destination)
            .filter(|link| link.address.is_some())
            .ok_or(TransportError::NoActiveAddress(destination))?;

        link.bytes_sent += bytes as u64;
        link.sent.push(SentPacket { packet, bytes });
        if self.history_limit > 0 && link.sent.len() > self.history_limit {
            let excess = link.sent.len() - self.history_limit;
            link.sent.drain(..excess);
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::{AvatarBatch, KillAvatarReason};
    use uuid::Uuid;

    fn addr() -> SocketAddr {
        "127.0.0.1:40102".parse().unwrap()
    }

    #[test]
    fn test_send_requires_address() {
        let transport = LoopbackTransport::new();
        let peer = Uuid::new_v4();

        assert!(!transport.has_active_address(peer));
        let result = transport.send(peer, OutboundPacket::BulkAvatarData(AvatarBatch::new()));
        assert!(matches!(result, Err(TransportError::NoActiveAddress(_))));

        transport.set_address(peer, Some(addr()));
        assert!(transport.has_active_address(peer));
        let bytes = transport
            .send(peer, OutboundPacket::BulkAvatarData(AvatarBatch::new()))
            .unwrap();
        assert!(bytes > 0);
        assert_eq!(transport.sent_to(peer).len(), 1);
        assert_eq!(transport.bytes_sent_to(peer), bytes as u64);
    }

    #[test]
    fn test_history_limit() {
        let transport = LoopbackTransport::with_history_limit(2);
        let peer = Uuid::new_v4();
        transport.set_address(peer, Some(addr()));

        for _ in 0..5 {
            transport
                .send(
                    peer,
                    OutboundPacket::KillAvatar {
                        avatar_id: Uuid::new_v4(),
                        reason: KillAvatarReason::AvatarDisconnected,
                    },
                )
                .unwrap();
        }
        assert_eq!(transport.sent_to(peer).len(), 2);
    }
}
