//! TCP transport between peers
//!
//! One connection per request: dial, send one frame, read one frame, close.
//! Uses length-prefixed JSON framing over TCP.
//!
//! Wire format:  [4-byte big-endian length][JSON envelope]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use super::{reject_error_reply, RequestHandler, Transport};
use crate::dht::{Contact, PeerId};
use crate::error::{Error, Result};
use crate::protocol::{MessageEnvelope, PeerMessage, PROTOCOL_VERSION};

/// How long an inbound connection may take to deliver its request
const INBOUND_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP implementation of [`Transport`]
pub struct TcpTransport {
    local: Contact,
    listener: Mutex<Option<TcpListener>>,
}

impl TcpTransport {
    /// Bind the listener
    ///
    /// `announce` overrides the advertised address (NAT / tunnel setups).
    /// Without it, an unspecified bind IP is advertised as loopback.
    pub async fn bind(
        peer_id: PeerId,
        bind_addr: SocketAddr,
        announce: Option<SocketAddr>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            Error::connection_failed(bind_addr, format!("failed to bind listener: {}", e))
        })?;
        let bound = listener.local_addr()?;

        let advertised = match announce {
            Some(addr) => addr,
            None if bound.ip().is_unspecified() => {
                warn!(
                    bound = %bound,
                    "Listening on an unspecified address without announce_addr; advertising loopback"
                );
                SocketAddr::new(std::net::Ipv4Addr::LOCALHOST.into(), bound.port())
            }
            None => bound,
        };

        info!(bound = %bound, advertised = %advertised, "Peer transport listening");

        Ok(Self {
            local: Contact::new(peer_id, advertised),
            listener: Mutex::new(Some(listener)),
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_contact(&self) -> Contact {
        self.local
    }

    async fn call(
        &self,
        addr: SocketAddr,
        message: PeerMessage,
        timeout: Duration,
    ) -> Result<(Contact, PeerMessage)> {
        let request = MessageEnvelope::new(self.local, message);
        let request_id = request.id;

        let exchange = async {
            let mut stream = TcpStream::connect(addr).await?;
            write_framed_message(&mut stream, &request).await?;
            read_framed_message(&mut stream).await
        };

        let reply = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| Error::connection_timeout(addr, timeout.as_millis() as u64))?
            .map_err(|e| Error::connection_failed(addr, e.to_string()))?;

        if reply.id != request_id {
            return Err(Error::ProtocolMalformed {
                message: format!("reply id {} does not match request {}", reply.id, request_id),
            });
        }

        let payload = reject_error_reply(addr, reply.payload)?;
        Ok((reply.sender, payload))
    }

    fn serve(&self, handler: Arc<dyn RequestHandler>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| Error::Internal("transport is already serving".to_string()))?;

        let local = self.local;
        tokio::spawn(async move {
            accept_loop(listener, local, handler).await;
        });

        Ok(())
    }
}

/// Accept incoming connections, one task per connection
async fn accept_loop(listener: TcpListener, local: Contact, handler: Arc<dyn RequestHandler>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    if let Err(e) = handle_inbound(stream, local, handler).await {
                        debug!(remote = %remote, error = %e, "Inbound request failed");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Serve a single request on an inbound connection
async fn handle_inbound(
    mut stream: TcpStream,
    local: Contact,
    handler: Arc<dyn RequestHandler>,
) -> anyhow::Result<()> {
    let request = tokio::time::timeout(INBOUND_READ_TIMEOUT, read_framed_message(&mut stream))
        .await
        .map_err(|_| anyhow::anyhow!("request read timeout"))??;

    let payload = match PROTOCOL_VERSION.ensure_compatible(&request.version) {
        Ok(()) => handler.handle(request.sender, request.payload).await,
        Err(e) => {
            warn!(peer = %request.sender, error = %e, "Refusing request from incompatible peer");
            PeerMessage::Error {
                code: e.code().as_str(),
                message: e.to_string(),
            }
        }
    };

    let reply = MessageEnvelope::reply(request.id, local, payload);
    write_framed_message(&mut stream, &reply).await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// Wire protocol: length-prefixed JSON framing
// ─────────────────────────────────────────────────────────────────

/// Largest frame either side accepts
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024; // 64 MB (for tensor data)

/// Read a length-prefixed JSON envelope from a stream
async fn read_framed_message<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> anyhow::Result<MessageEnvelope> {
    let len = reader.read_u32().await?;
    if len > MAX_MESSAGE_SIZE {
        return Err(anyhow::anyhow!(
            "Message too large: {} bytes (max {})",
            len,
            MAX_MESSAGE_SIZE
        ));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;

    Ok(serde_json::from_slice(&buf)?)
}

/// Write a length-prefixed JSON envelope to a stream
async fn write_framed_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg: &MessageEnvelope,
) -> anyhow::Result<()> {
    let json = serde_json::to_vec(msg)?;
    let len = u32::try_from(json.len())
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_SIZE)
        .ok_or_else(|| anyhow::anyhow!("Message too large: {} bytes", json.len()))?;

    writer.write_u32(len).await?;
    writer.write_all(&json).await?;
    writer.flush().await?;

    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
