//! Distributed key-value directory
//!
//! A Kademlia-style DHT with per-entry expiry:
//! - Identifiers and keys share a 160-bit XOR space
//! - Each key holds many subkeys, one per writer
//! - Entries expire and must be re-stored by their owner

mod id;
mod node;
mod routing;
mod storage;

pub use id::{BootstrapPeer, Contact, DhtKey, Distance, NodeId, PeerId, ID_BITS, ID_BYTES};
pub use node::{DhtConfig, DhtNode, Record};
pub use routing::{InsertOutcome, RoutingTable};
pub use storage::{LocalStorage, StoreOutcome, StoredValue};
