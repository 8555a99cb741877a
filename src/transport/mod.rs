//! Request/response transport between peers
//!
//! Provides the addressing collaborator the directory service and the
//! averaging engine talk through:
//! - `TcpTransport`: length-prefixed JSON frames over TCP
//! - `MemoryTransport`: in-process network with fault injection, for tests
//!
//! Every exchange is a single request answered by a single reply, bounded
//! by an explicit timeout.

pub mod memory;
pub mod tcp;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::dht::Contact;
use crate::error::{Error, Result};
use crate::protocol::PeerMessage;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::{TcpTransport, MAX_MESSAGE_SIZE};

/// Serves inbound requests
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Produce the reply for one request
    async fn handle(&self, sender: Contact, message: PeerMessage) -> PeerMessage;
}

/// Outbound requests and inbound dispatch
#[async_trait]
pub trait Transport: Send + Sync {
    /// Contact this transport advertises to others
    fn local_contact(&self) -> Contact;

    /// Send a request to an address and wait for the reply
    ///
    /// Returns the responder's contact alongside its reply.
    async fn call(
        &self,
        addr: SocketAddr,
        message: PeerMessage,
        timeout: Duration,
    ) -> Result<(Contact, PeerMessage)>;

    /// Start dispatching inbound requests to `handler`
    fn serve(&self, handler: Arc<dyn RequestHandler>) -> Result<()>;

    /// Send a request to a known contact, checking the responder identity
    async fn call_peer(
        &self,
        to: &Contact,
        message: PeerMessage,
        timeout: Duration,
    ) -> Result<PeerMessage> {
        let (responder, reply) = self.call(to.addr, message, timeout).await?;
        if responder.peer_id != to.peer_id {
            return Err(Error::connection_failed(
                to.addr,
                format!(
                    "expected peer {} but {} answered",
                    to.peer_id.short(),
                    responder.peer_id.short()
                ),
            ));
        }
        Ok(reply)
    }
}

/// Map an `ERROR` reply onto a connection failure
pub(crate) fn reject_error_reply(addr: SocketAddr, reply: PeerMessage) -> Result<PeerMessage> {
    match reply {
        PeerMessage::Error { code, message } => Err(Error::connection_failed(
            addr,
            format!("peer refused request: [{}] {}", code, message),
        )),
        other => Ok(other),
    }
}
