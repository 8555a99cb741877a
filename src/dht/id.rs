//! 160-bit identifiers, XOR distance and peer contacts

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Identifier width in bytes
pub const ID_BYTES: usize = 20;

/// Identifier width in bits (and number of routing buckets)
pub const ID_BITS: usize = ID_BYTES * 8;

/// A point in the 160-bit key space
///
/// Peers and directory keys share the same space so that a key is stored
/// on the peers whose identifiers are closest to it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; ID_BYTES]);

/// Identity of a participant, stable for the process lifetime
pub type PeerId = NodeId;

/// Hashed directory key
pub type DhtKey = NodeId;

impl NodeId {
    /// Build from raw bytes
    pub const fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Generate a uniformly random identifier
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Hash an application key name into the key space
    pub fn from_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&digest[..ID_BYTES]);
        Self(bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// Full lowercase hex form (used as directory subkey)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex characters, for logs
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// XOR distance to another identifier
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Routing bucket for `other`: index of the highest differing bit
    ///
    /// Returns `None` when the identifiers are equal.
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        let leading = self.distance(other).leading_zeros();
        if leading == ID_BITS {
            None
        } else {
            Some(ID_BITS - 1 - leading)
        }
    }

    /// Random identifier that falls into bucket `index` relative to self
    pub fn random_in_bucket(&self, index: usize) -> NodeId {
        let index = index.min(ID_BITS - 1);
        let flip = ID_BITS - 1 - index;
        let mut id = NodeId::random();
        for bit in 0..flip {
            id.set_bit(bit, self.bit(bit));
        }
        id.set_bit(flip, !self.bit(flip));
        id
    }

    fn bit(&self, position: usize) -> bool {
        self.0[position / 8] & (0x80 >> (position % 8)) != 0
    }

    fn set_bit(&mut self, position: usize, value: bool) {
        let mask = 0x80 >> (position % 8);
        if value {
            self.0[position / 8] |= mask;
        } else {
            self.0[position / 8] &= !mask;
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl FromStr for NodeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim()).map_err(|e| format!("invalid identifier '{}': {}", s, e))?;
        let bytes: [u8; ID_BYTES] = raw
            .try_into()
            .map_err(|_| format!("identifier '{}' must be {} hex characters", s, ID_BYTES * 2))?;
        Ok(Self(bytes))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// XOR distance, ordered numerically
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance([u8; ID_BYTES]);

impl Distance {
    /// Number of leading zero bits
    pub fn leading_zeros(&self) -> usize {
        let mut zeros = 0;
        for byte in self.0 {
            if byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros() as usize;
                break;
            }
        }
        zeros
    }
}

// ─────────────────────────────────────────────────────────────────
// Contacts
// ─────────────────────────────────────────────────────────────────

/// Reachable endpoint of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    /// Peer identifier
    pub peer_id: PeerId,

    /// Address other peers dial
    pub addr: SocketAddr,
}

impl Contact {
    /// Create a contact
    pub fn new(peer_id: PeerId, addr: SocketAddr) -> Self {
        Self { peer_id, addr }
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.peer_id.short(), self.addr)
    }
}

/// Bootstrap entry: an address with an optional expected identifier
///
/// Parsed from `"<peer_id_hex>@host:port"` or `"host:port"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapPeer {
    /// Expected identifier, verified against the handshake when present
    pub peer_id: Option<PeerId>,

    /// Address to dial
    pub addr: SocketAddr,
}

impl FromStr for BootstrapPeer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (peer_id, addr) = match s.split_once('@') {
            Some((id, addr)) => (Some(id.parse::<PeerId>()?), addr),
            None => (None, s),
        };
        let addr = addr
            .trim()
            .parse::<SocketAddr>()
            .map_err(|e| format!("invalid peer address '{}': {}", addr, e))?;
        Ok(Self { peer_id, addr })
    }
}

impl From<Contact> for BootstrapPeer {
    fn from(contact: Contact) -> Self {
        Self {
            peer_id: Some(contact.peer_id),
            addr: contact.addr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip_and_display() {
        let id = NodeId::random();
        let parsed: NodeId = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.to_string().len(), 40);
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn test_from_name_is_deterministic() {
        assert_eq!(NodeId::from_name("run_progress"), NodeId::from_name("run_progress"));
        assert_ne!(NodeId::from_name("run_progress"), NodeId::from_name("run_matchmaking_0"));
    }

    #[test]
    fn test_distance_properties() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a).leading_zeros(), ID_BITS);
        assert!(a.distance(&a) < a.distance(&b) || a == b);
    }

    #[test]
    fn test_bucket_index() {
        let zero = NodeId::from_bytes([0u8; ID_BYTES]);
        let mut top = [0u8; ID_BYTES];
        top[0] = 0x80;
        let mut bottom = [0u8; ID_BYTES];
        bottom[ID_BYTES - 1] = 0x01;

        assert_eq!(zero.bucket_index(&NodeId::from_bytes(top)), Some(ID_BITS - 1));
        assert_eq!(zero.bucket_index(&NodeId::from_bytes(bottom)), Some(0));
        assert_eq!(zero.bucket_index(&zero), None);
    }

    #[test]
    fn test_random_in_bucket() {
        let me = NodeId::random();
        for index in [0, 7, 8, 100, ID_BITS - 1] {
            let id = me.random_in_bucket(index);
            assert_eq!(me.bucket_index(&id), Some(index));
        }
    }

    #[test]
    fn test_parse_bootstrap_peer() {
        let plain: BootstrapPeer = "127.0.0.1:4000".parse().unwrap();
        assert!(plain.peer_id.is_none());
        assert_eq!(plain.addr.port(), 4000);

        let id = NodeId::random();
        let with_id: BootstrapPeer = format!("{}@10.0.0.2:31337", id).parse().unwrap();
        assert_eq!(with_id.peer_id, Some(id));

        assert!("nonsense".parse::<BootstrapPeer>().is_err());
        assert!("abc@127.0.0.1:1".parse::<BootstrapPeer>().is_err());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let id = NodeId::random();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
