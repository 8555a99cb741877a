//! Protocol message definitions
//!
//! All message types for peer-to-peer communication.
//! Messages are serialized as JSON with a type discriminator.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use super::ProtocolVersion;
use crate::dht::{Contact, DhtKey, NodeId, PeerId};

// ─────────────────────────────────────────────────────────────────
// Message Envelope
// ─────────────────────────────────────────────────────────────────

/// Wrapper for every frame on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique message ID (replies echo the request ID)
    pub id: Uuid,

    /// Message timestamp
    pub timestamp: DateTime<Utc>,

    /// Protocol version of the sender
    pub version: ProtocolVersion,

    /// Contact of the sender, as the sender advertises itself
    pub sender: Contact,

    /// The actual message payload
    #[serde(flatten)]
    pub payload: PeerMessage,
}

impl MessageEnvelope {
    /// Create a new request envelope
    pub fn new(sender: Contact, payload: PeerMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            version: ProtocolVersion::default(),
            sender,
            payload,
        }
    }

    /// Create the reply to a request, echoing its ID
    pub fn reply(request_id: Uuid, sender: Contact, payload: PeerMessage) -> Self {
        Self {
            id: request_id,
            timestamp: Utc::now(),
            version: ProtocolVersion::default(),
            sender,
            payload,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Message Types (Discriminated Union)
// ─────────────────────────────────────────────────────────────────

/// All peer messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerMessage {
    // ─── Directory service ──────────────────────────────────────
    /// Liveness check
    Ping { nonce: u64 },

    /// Liveness reply
    Pong { nonce: u64 },

    /// Store one subkey under a key on the receiving replica
    Store {
        key: DhtKey,
        subkey: String,
        #[serde(with = "base64_bytes")]
        value: Vec<u8>,
        expiration: DateTime<Utc>,
    },

    /// Store reply; `stored` is false when a newer value was kept
    StoreAck { stored: bool },

    /// Ask for the contacts closest to a target
    FindNode { target: NodeId },

    /// Closest known contacts
    Nodes { contacts: Vec<Contact> },

    /// Ask for the entries stored under a key
    FindValue { key: DhtKey },

    /// Stored entries plus closer contacts
    Value {
        entries: Vec<WireEntry>,
        contacts: Vec<Contact>,
    },

    // ─── Averaging engine ───────────────────────────────────────
    /// A member's slice of one tensor part, sent to the part owner
    Contribution {
        group_id: Uuid,
        part: usize,
        weight: f64,
        data: TensorPayload,
    },

    /// An owner's list of members whose contributions it fully received
    ReducerReport {
        group_id: Uuid,
        received_from: Vec<PeerId>,
    },

    /// Reduced part, stamped with the exact contributor set
    AveragedPart {
        group_id: Uuid,
        part: usize,
        contributors: Vec<PeerId>,
        data: TensorPayload,
    },

    /// Owners whose reduced parts a member is still missing after the gather
    GatherReport {
        group_id: Uuid,
        missing: Vec<PeerId>,
    },

    // ─── State sync ─────────────────────────────────────────────
    /// Ask a peer for its latest model parameters
    StateRequest {},

    /// Parameters as of the end of `step`
    StateResponse { step: u64, tensors: Vec<WireTensor> },

    // ─── Generic replies ────────────────────────────────────────
    /// Generic acknowledgment
    Ack {
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Request could not be served
    Error { code: String, message: String },
}

impl PeerMessage {
    /// Get the message type name
    pub fn type_name(&self) -> &'static str {
        match self {
            PeerMessage::Ping { .. } => "PING",
            PeerMessage::Pong { .. } => "PONG",
            PeerMessage::Store { .. } => "STORE",
            PeerMessage::StoreAck { .. } => "STORE_ACK",
            PeerMessage::FindNode { .. } => "FIND_NODE",
            PeerMessage::Nodes { .. } => "NODES",
            PeerMessage::FindValue { .. } => "FIND_VALUE",
            PeerMessage::Value { .. } => "VALUE",
            PeerMessage::Contribution { .. } => "CONTRIBUTION",
            PeerMessage::ReducerReport { .. } => "REDUCER_REPORT",
            PeerMessage::AveragedPart { .. } => "AVERAGED_PART",
            PeerMessage::GatherReport { .. } => "GATHER_REPORT",
            PeerMessage::StateRequest { .. } => "STATE_REQUEST",
            PeerMessage::StateResponse { .. } => "STATE_RESPONSE",
            PeerMessage::Ack { .. } => "ACK",
            PeerMessage::Error { .. } => "ERROR",
        }
    }

    /// Messages served by the directory service
    pub fn is_directory(&self) -> bool {
        matches!(
            self,
            PeerMessage::Ping { .. }
                | PeerMessage::Store { .. }
                | PeerMessage::FindNode { .. }
                | PeerMessage::FindValue { .. }
        )
    }

    /// Messages served by the averaging engine
    pub fn is_averaging(&self) -> bool {
        matches!(
            self,
            PeerMessage::Contribution { .. }
                | PeerMessage::ReducerReport { .. }
                | PeerMessage::AveragedPart { .. }
                | PeerMessage::GatherReport { .. }
        )
    }

    /// Messages served by the model state store
    pub fn is_state_sync(&self) -> bool {
        matches!(self, PeerMessage::StateRequest { .. })
    }

    /// Positive acknowledgment
    pub fn ack() -> Self {
        PeerMessage::Ack {
            accepted: true,
            reason: None,
        }
    }

    /// Negative acknowledgment with a reason
    pub fn reject(reason: impl Into<String>) -> Self {
        PeerMessage::Ack {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

/// One directory entry as carried on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEntry {
    pub subkey: String,
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
    pub expiration: DateTime<Utc>,
}

/// One named parameter tensor as carried on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: TensorPayload,
}

// ─────────────────────────────────────────────────────────────────
// Binary payload encoding
// ─────────────────────────────────────────────────────────────────

/// Flat `f32` buffer, encoded as base64 of little-endian bytes
#[derive(Clone, PartialEq, Default)]
pub struct TensorPayload(pub Vec<f32>);

impl TensorPayload {
    /// Wrap a buffer
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    /// Copy a slice into a payload
    pub fn from_slice(values: &[f32]) -> Self {
        Self(values.to_vec())
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Base64 characters needed to carry `elements` values
    pub fn encoded_len(elements: usize) -> usize {
        (elements.saturating_mul(4) / 3 + 1).saturating_mul(4)
    }

    /// Take the inner buffer
    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }
}

impl fmt::Debug for TensorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TensorPayload({} elements)", self.0.len())
    }
}

impl Serialize for TensorPayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut bytes = Vec::with_capacity(self.0.len() * 4);
        for value in &self.0 {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        serializer.serialize_str(&STANDARD.encode(bytes))
    }
}

impl<'de> Deserialize<'de> for TensorPayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(encoded).map_err(serde::de::Error::custom)?;
        if bytes.len() % 4 != 0 {
            return Err(serde::de::Error::custom(format!(
                "tensor payload length {} is not a multiple of 4",
                bytes.len()
            )));
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self(values))
    }
}

/// Serde adapter for `Vec<u8>` fields carried as base64 strings
mod base64_bytes {
    use super::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
