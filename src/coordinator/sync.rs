//! Model state exchange for late joiners
//!
//! Every training peer keeps a copy of its parameters as of the end of its
//! last completed step and serves it on `STATE_REQUEST`. A peer that finds
//! the collaboration ahead of it downloads parameters from a peer at that
//! step before adopting it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::tensor::{Tensor, TensorSet};
use crate::dht::Contact;
use crate::error::{Error, ErrorCode, Result};
use crate::protocol::{PeerMessage, TensorPayload, WireTensor};
use crate::transport::Transport;

/// Parameters as of the end of a step
#[derive(Debug, Clone, PartialEq)]
pub struct ModelState {
    pub step: u64,
    pub tensors: TensorSet,
}

impl ModelState {
    fn to_wire(&self) -> Vec<WireTensor> {
        self.tensors
            .tensors()
            .iter()
            .map(|t| WireTensor {
                name: t.name.clone(),
                shape: t.shape.clone(),
                data: TensorPayload::from_slice(&t.data),
            })
            .collect()
    }

    fn from_wire(step: u64, wire: Vec<WireTensor>) -> Result<Self> {
        let tensors = wire
            .into_iter()
            .map(|t| Tensor::new(t.name, t.shape, t.data.into_inner()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            step,
            tensors: TensorSet::new(tensors),
        })
    }
}

/// Serves the local parameters and fetches a peer's
pub struct StateSync {
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
    latest: RwLock<Option<ModelState>>,
}

impl StateSync {
    pub fn new(transport: Arc<dyn Transport>, request_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            transport,
            request_timeout,
            latest: RwLock::new(None),
        })
    }

    /// Replace the parameters served to other peers
    pub fn publish(&self, step: u64, tensors: TensorSet) {
        *self.latest.write() = Some(ModelState { step, tensors });
    }

    /// Step of the parameters currently served
    pub fn served_step(&self) -> Option<u64> {
        self.latest.read().as_ref().map(|s| s.step)
    }

    /// Answer a `STATE_REQUEST`
    pub fn handle_request(&self, sender: Contact, message: PeerMessage) -> PeerMessage {
        match message {
            PeerMessage::StateRequest {} => match self.latest.read().as_ref() {
                Some(state) => {
                    debug!(to = %sender, step = state.step, "Serving model state");
                    PeerMessage::StateResponse {
                        step: state.step,
                        tensors: state.to_wire(),
                    }
                }
                None => PeerMessage::Error {
                    code: ErrorCode::ProtocolUnexpected.as_str(),
                    message: "no model state to serve yet".to_string(),
                },
            },
            other => PeerMessage::Error {
                code: ErrorCode::ProtocolUnexpected.as_str(),
                message: format!("{} is not a state request", other.type_name()),
            },
        }
    }

    /// Fetch parameters from one peer
    pub async fn fetch(&self, source: &Contact) -> Result<ModelState> {
        let reply = self
            .transport
            .call_peer(source, PeerMessage::StateRequest {}, self.request_timeout)
            .await?;
        match reply {
            PeerMessage::StateResponse { step, tensors } => ModelState::from_wire(step, tensors),
            other => Err(Error::unexpected_reply("STATE_RESPONSE", other.type_name())),
        }
    }

    /// Fetch from the first source that serves state at `min_step` or later
    ///
    /// Sources are tried in order; `None` when none of them could.
    pub async fn download(&self, sources: &[Contact], min_step: u64) -> Option<ModelState> {
        for source in sources {
            match self.fetch(source).await {
                Ok(state) if state.step >= min_step => return Some(state),
                Ok(state) => debug!(
                    from = %source,
                    step = state.step,
                    wanted = min_step,
                    "Peer served stale model state"
                ),
                Err(e) => warn!(from = %source, error = %e, "Model state download failed"),
            }
        }
        None
    }
}
