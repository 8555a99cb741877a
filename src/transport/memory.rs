//! In-process network for multi-peer tests
//!
//! Every endpoint gets a synthetic loopback address. Messages still pass
//! through the JSON envelope encoding so tests exercise the wire format.
//! Peers can be killed and revived at any point to simulate crashes.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{reject_error_reply, RequestHandler, Transport};
use crate::dht::{Contact, PeerId};
use crate::error::{Error, Result};
use crate::protocol::{MessageEnvelope, PeerMessage};

const BASE_PORT: u16 = 10_000;

struct Endpoint {
    contact: Contact,
    handler: Option<Arc<dyn RequestHandler>>,
    alive: bool,
    delay: Duration,
}

/// Shared in-process network
#[derive(Default)]
pub struct MemoryNetwork {
    endpoints: RwLock<HashMap<SocketAddr, Endpoint>>,
    next_port: AtomicU16,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a new peer and return its transport
    pub fn transport(self: &Arc<Self>, peer_id: PeerId) -> Arc<MemoryTransport> {
        let port = BASE_PORT + self.next_port.fetch_add(1, Ordering::SeqCst);
        let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port);
        let contact = Contact::new(peer_id, addr);

        self.endpoints.write().insert(
            addr,
            Endpoint {
                contact,
                handler: None,
                alive: true,
                delay: Duration::ZERO,
            },
        );

        Arc::new(MemoryTransport {
            network: Arc::clone(self),
            local: contact,
        })
    }

    /// Simulate a crash: the peer neither sends nor answers
    pub fn kill(&self, peer_id: &PeerId) {
        self.set_alive(peer_id, false);
    }

    /// Bring a killed peer back
    pub fn revive(&self, peer_id: &PeerId) {
        self.set_alive(peer_id, true);
    }

    /// Delay every reply from this peer
    pub fn set_delay(&self, peer_id: &PeerId, delay: Duration) {
        for endpoint in self.endpoints.write().values_mut() {
            if endpoint.contact.peer_id == *peer_id {
                endpoint.delay = delay;
            }
        }
    }

    fn set_alive(&self, peer_id: &PeerId, alive: bool) {
        for endpoint in self.endpoints.write().values_mut() {
            if endpoint.contact.peer_id == *peer_id {
                endpoint.alive = alive;
            }
        }
    }

    fn is_alive(&self, addr: &SocketAddr) -> bool {
        self.endpoints
            .read()
            .get(addr)
            .map(|e| e.alive)
            .unwrap_or(false)
    }

    async fn deliver(&self, to: SocketAddr, request: MessageEnvelope) -> Result<MessageEnvelope> {
        let (contact, handler, delay) = {
            let endpoints = self.endpoints.read();
            let endpoint = endpoints
                .get(&to)
                .filter(|e| e.alive)
                .ok_or_else(|| Error::connection_failed(to, "connection refused"))?;
            let handler = endpoint
                .handler
                .clone()
                .ok_or_else(|| Error::connection_failed(to, "peer is not serving"))?;
            (endpoint.contact, handler, endpoint.delay)
        };

        // Encode and decode like a real hop
        let request: MessageEnvelope = serde_json::from_slice(&serde_json::to_vec(&request)?)?;

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let payload = handler.handle(request.sender, request.payload).await;

        // A peer killed while handling never answers
        if !self.is_alive(&to) {
            return Err(Error::connection_failed(to, "connection reset"));
        }

        let reply = MessageEnvelope::reply(request.id, contact, payload);
        Ok(serde_json::from_slice(&serde_json::to_vec(&reply)?)?)
    }
}

/// Transport handle of one in-process peer
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    local: Contact,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_contact(&self) -> Contact {
        self.local
    }

    async fn call(
        &self,
        addr: SocketAddr,
        message: PeerMessage,
        timeout: Duration,
    ) -> Result<(Contact, PeerMessage)> {
        if !self.network.is_alive(&self.local.addr) {
            return Err(Error::connection_failed(addr, "local peer is down"));
        }

        let request = MessageEnvelope::new(self.local, message);
        let reply = tokio::time::timeout(timeout, self.network.deliver(addr, request))
            .await
            .map_err(|_| Error::connection_timeout(addr, timeout.as_millis() as u64))??;

        let payload = reject_error_reply(addr, reply.payload)?;
        Ok((reply.sender, payload))
    }

    fn serve(&self, handler: Arc<dyn RequestHandler>) -> Result<()> {
        let mut endpoints = self.network.endpoints.write();
        let endpoint = endpoints
            .get_mut(&self.local.addr)
            .ok_or_else(|| Error::Internal("endpoint vanished from network".to_string()))?;
        if endpoint.handler.is_some() {
            return Err(Error::Internal("transport is already serving".to_string()));
        }
        endpoint.handler = Some(handler);
        Ok(())
    }
}
