//! Inbound request routing
//!
//! One transport serves the directory, the averaging engine and the model
//! state store; this handler sends each request to the component that owns
//! it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::averaging::AllReduceEngine;
use crate::coordinator::StateSync;
use crate::dht::{Contact, DhtNode};
use crate::error::ErrorCode;
use crate::protocol::PeerMessage;
use crate::transport::RequestHandler;

/// Routes requests to the component serving them
pub struct PeerService {
    dht: Arc<DhtNode>,
    averaging: Option<Arc<AllReduceEngine>>,
    state: Option<Arc<StateSync>>,
}

impl PeerService {
    /// Serve directory, averaging and model state traffic
    pub fn new(
        dht: Arc<DhtNode>,
        averaging: Arc<AllReduceEngine>,
        state: Arc<StateSync>,
    ) -> Arc<Self> {
        Arc::new(Self {
            dht,
            averaging: Some(averaging),
            state: Some(state),
        })
    }

    /// Serve directory traffic only (monitor role)
    pub fn directory_only(dht: Arc<DhtNode>) -> Arc<Self> {
        Arc::new(Self {
            dht,
            averaging: None,
            state: None,
        })
    }
}

#[async_trait]
impl RequestHandler for PeerService {
    async fn handle(&self, sender: Contact, message: PeerMessage) -> PeerMessage {
        trace!(from = %sender, message = message.type_name(), "Inbound request");

        if message.is_directory() {
            return self.dht.handle_request(sender, message);
        }
        match (&self.averaging, &self.state) {
            (Some(engine), _) if message.is_averaging() => engine.handle_request(sender, message),
            (_, Some(state)) if message.is_state_sync() => state.handle_request(sender, message),
            _ => PeerMessage::Error {
                code: ErrorCode::ProtocolUnexpected.as_str(),
                message: format!("{} is not served by this peer", message.type_name()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::averaging::EngineConfig;
    use crate::coordinator::{Tensor, TensorSet};
    use crate::dht::{DhtConfig, PeerId};
    use crate::transport::{MemoryNetwork, Transport};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_routes_by_message_kind() {
        let net = MemoryNetwork::new();
        let server = net.transport(PeerId::random());
        let dht = DhtNode::new(server.clone(), DhtConfig::default());
        let engine = AllReduceEngine::new(server.clone(), EngineConfig::default());
        let state = StateSync::new(server.clone(), Duration::from_millis(100));
        state.publish(4, TensorSet::new(vec![Tensor::zeros("w", vec![2])]));
        server.serve(PeerService::new(dht, engine, state)).unwrap();

        let client = net.transport(PeerId::random());
        let to = server.local_contact();
        let timeout = Duration::from_millis(100);

        let pong = client.call_peer(&to, PeerMessage::Ping { nonce: 3 }, timeout).await.unwrap();
        assert_eq!(pong, PeerMessage::Pong { nonce: 3 });

        let report = PeerMessage::ReducerReport {
            group_id: Uuid::new_v4(),
            received_from: vec![],
        };
        assert_eq!(client.call_peer(&to, report, timeout).await.unwrap(), PeerMessage::ack());

        match client.call_peer(&to, PeerMessage::StateRequest {}, timeout).await.unwrap() {
            PeerMessage::StateResponse { step, tensors } => {
                assert_eq!(step, 4);
                assert_eq!(tensors.len(), 1);
            }
            other => panic!("expected STATE_RESPONSE, got {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_monitor_refuses_averaging_traffic() {
        let net = MemoryNetwork::new();
        let server = net.transport(PeerId::random());
        let dht = DhtNode::new(server.clone(), DhtConfig::default());
        server.serve(PeerService::directory_only(dht)).unwrap();

        let client = net.transport(PeerId::random());
        let report = PeerMessage::ReducerReport {
            group_id: Uuid::new_v4(),
            received_from: vec![],
        };
        let result = client
            .call_peer(&server.local_contact(), report, Duration::from_millis(100))
            .await;
        assert!(result.is_err());

        let to = server.local_contact();
        let state = client
            .call_peer(&to, PeerMessage::StateRequest {}, Duration::from_millis(100))
            .await;
        assert!(state.is_err());
    }
}
